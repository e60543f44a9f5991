//! Inbound frame processing
//!
//! Every variant of [`Inbound`] runs through the same `process` contract:
//! validate, persist, fan out. Failures surface as an `error` frame with a
//! stable code; the connection itself always survives a bad frame.

use serde_json::Value;

use crate::db::{groups, messages, read_state};
use crate::error::ApiError;
use crate::models::{parse_message_type, ConversationId, MessageRecord};
use crate::validation::trim_and_limit;
use crate::ws::envelope::{
    AckPayload, ChatPayload, DeliveryPayload, GroupReadPayload, Inbound, ReadPayload, SyncPayload,
    TypingPayload,
};
use crate::ws::fanout;
use crate::AppState;

/// Dependencies for one frame: the authenticated connection owner plus the
/// process-wide state.
pub struct WsContext {
    pub user_id: i64,
    pub state: AppState,
}

impl WsContext {
    /// Reply on the caller's own channel, via the hub so writes stay
    /// serialized with concurrent fan-out.
    async fn reply(&self, event: &Value) {
        if let Err(e) = self.state.hub.send_to_user(self.user_id, event).await {
            tracing::debug!("reply to user {} failed: {}", self.user_id, e);
        }
    }
}

impl Inbound {
    pub async fn process(self, ctx: &WsContext) -> Result<(), ApiError> {
        match self {
            Inbound::Sync(p) => process_sync(ctx, p).await,
            Inbound::Chat(p) => process_chat(ctx, p).await,
            Inbound::Ack(p) => process_ack(ctx, p).await,
            Inbound::Typing(p) => process_typing(ctx, p).await,
            Inbound::Read(p) => process_read(ctx, p).await,
            Inbound::GroupRead(p) => process_group_read(ctx, p).await,
            Inbound::Delivery(p) => process_delivery(ctx, p).await,
            Inbound::Ping => {
                ctx.reply(&serde_json::json!({ "type": "pong" })).await;
                Ok(())
            }
            // App-level pong; latency tracking only, nothing to do.
            Inbound::Pong => Ok(()),
        }
    }
}

fn ack_frame(message: &MessageRecord) -> Value {
    serde_json::json!({
        "type": "ack",
        "client_id": message.client_id,
        "server_id": message.id,
        "status": message.status,
    })
}

/// Idempotent chat ingest.
///
/// A duplicate `(client_id, sender_id)` — whether a resend over the same
/// connection, a retry across a reconnect, or the loser of a concurrent
/// race — always re-acks the originally persisted message.
async fn process_chat(ctx: &WsContext, payload: ChatPayload) -> Result<(), ApiError> {
    let state = &ctx.state;
    let sender_id = ctx.user_id;

    let client_id = payload.client_id.trim().to_string();
    if client_id.is_empty() {
        return Err(ApiError::bad_request("missing_client_id", "client_id is required"));
    }

    let content = trim_and_limit(&payload.content, state.config.max_message_length);
    if content.is_empty() {
        return Err(ApiError::bad_request("missing_content", "Content is required"));
    }

    let target = match (payload.recipient_id, payload.group_id) {
        (Some(recipient), None) if recipient > 0 => ConversationId::user(recipient),
        (None, Some(group)) if group > 0 => ConversationId::group(group),
        _ => {
            return Err(ApiError::bad_request(
                "invalid_target",
                "Exactly one of recipient_id and group_id is required",
            ))
        }
    };

    if let ConversationId::Group(group_id) = target {
        let member = groups::is_member(&state.db, group_id, sender_id)
            .await
            .map_err(|_| ApiError::internal("check_membership_failed"))?;
        if !member {
            return Err(ApiError::forbidden("not_group_member", "Not a group member"));
        }
    }

    // Short-circuit retries before touching the store.
    if let Some(existing) = messages::find_by_client_id(&state.db, &client_id, sender_id)
        .await
        .map_err(|_| ApiError::internal("get_message_failed"))?
    {
        state.metrics.incr_duplicates();
        ctx.reply(&ack_frame(&existing)).await;
        return Ok(());
    }

    let message_type = parse_message_type(payload.message_type.as_deref().unwrap_or(""));
    let (recipient_id, group_id) = match target {
        ConversationId::User(id) => (Some(id), None),
        ConversationId::Group(id) => (None, Some(id)),
    };

    let message = match messages::create(
        &state.db,
        sender_id,
        &client_id,
        recipient_id,
        group_id,
        &content,
        message_type,
    )
    .await
    .map_err(|_| ApiError::internal("send_message_failed"))?
    {
        messages::CreateOutcome::Created(message) => message,
        messages::CreateOutcome::DuplicateClientId => {
            // Lost the insert race: the winner's row is the message.
            let existing = messages::find_by_client_id(&state.db, &client_id, sender_id)
                .await
                .map_err(|_| ApiError::internal("get_message_failed"))?
                .ok_or_else(|| ApiError::internal("get_message_failed"))?;
            state.metrics.incr_duplicates();
            ctx.reply(&ack_frame(&existing)).await;
            return Ok(());
        }
        messages::CreateOutcome::NotGroupMember => {
            return Err(ApiError::forbidden("not_group_member", "Not a group member"));
        }
    };

    ctx.reply(&ack_frame(&message)).await;

    match target {
        ConversationId::User(_) => fanout::push_direct(state, &message).await,
        ConversationId::Group(group_id) => fanout::push_group(state, group_id, &message).await,
    }
    Ok(())
}

/// Explicit status transition from the receiving client.
async fn process_ack(ctx: &WsContext, payload: AckPayload) -> Result<(), ApiError> {
    match payload.status.as_deref().unwrap_or("delivered") {
        "delivered" => process_delivery(ctx, DeliveryPayload { message_id: payload.message_id }).await,
        "read" => process_read(ctx, ReadPayload { message_id: payload.message_id }).await,
        other => Err(ApiError::bad_request(
            "invalid_status",
            format!("Unsupported ack status: {}", other),
        )),
    }
}

/// Mark a direct message read and propagate the read-update to its sender.
async fn process_read(ctx: &WsContext, payload: ReadPayload) -> Result<(), ApiError> {
    let state = &ctx.state;

    let message = messages::find_by_id(&state.db, payload.message_id)
        .await
        .map_err(|_| ApiError::internal("get_message_failed"))?
        .ok_or_else(|| ApiError::not_found("invalid_message_id", "Message not found"))?;

    // Only the recipient reads a direct message; groups use the cursor.
    if message.recipient_id != Some(ctx.user_id) {
        return Err(ApiError::forbidden("not_recipient", "Not the message recipient"));
    }

    messages::mark_read(&state.db, message.id)
        .await
        .map_err(|_| ApiError::internal("mark_read_failed"))?;

    fanout::push_read_update(state, ctx.user_id, message.sender_id, message.id).await;
    Ok(())
}

/// Mark a message delivered to this user.
async fn process_delivery(ctx: &WsContext, payload: DeliveryPayload) -> Result<(), ApiError> {
    let state = &ctx.state;

    let message = messages::find_by_id(&state.db, payload.message_id)
        .await
        .map_err(|_| ApiError::internal("get_message_failed"))?
        .ok_or_else(|| ApiError::not_found("invalid_message_id", "Message not found"))?;

    let allowed = match message.group_id {
        Some(group_id) => groups::is_member(&state.db, group_id, ctx.user_id)
            .await
            .map_err(|_| ApiError::internal("check_membership_failed"))?,
        None => message.recipient_id == Some(ctx.user_id),
    };
    if !allowed {
        return Err(ApiError::forbidden("not_recipient", "Not the message recipient"));
    }

    messages::mark_delivered(&state.db, message.id)
        .await
        .map_err(|_| ApiError::internal("mark_delivered_failed"))?;
    Ok(())
}

/// Forward a typing notice. Ephemeral end to end: never persisted, never
/// queued for offline peers.
async fn process_typing(ctx: &WsContext, payload: TypingPayload) -> Result<(), ApiError> {
    let state = &ctx.state;

    match (payload.recipient_id, payload.group_id) {
        (Some(recipient), None) if recipient > 0 => {
            let event = serde_json::json!({
                "type": "typing",
                "sender_id": ctx.user_id,
                "recipient_id": recipient,
                "is_typing": payload.is_typing,
            });
            let _ = state.hub.send_to_user(recipient, &event).await;
            Ok(())
        }
        (None, Some(group_id)) if group_id > 0 => {
            let member = groups::is_member(&state.db, group_id, ctx.user_id)
                .await
                .map_err(|_| ApiError::internal("check_membership_failed"))?;
            if !member {
                return Err(ApiError::forbidden("not_group_member", "Not a group member"));
            }
            let others: Vec<i64> = groups::member_ids(&state.db, group_id)
                .await
                .map_err(|_| ApiError::internal("get_members_failed"))?
                .into_iter()
                .filter(|id| *id != ctx.user_id)
                .collect();
            let event = serde_json::json!({
                "type": "typing",
                "sender_id": ctx.user_id,
                "group_id": group_id,
                "is_typing": payload.is_typing,
            });
            state.hub.broadcast_to_users(&others, &event).await;
            Ok(())
        }
        _ => Err(ApiError::bad_request(
            "invalid_target",
            "Exactly one of recipient_id and group_id is required",
        )),
    }
}

/// Monotonic group read-cursor update plus fan-out to the other members.
async fn process_group_read(ctx: &WsContext, payload: GroupReadPayload) -> Result<(), ApiError> {
    let state = &ctx.state;
    let group_id = payload.group_id;

    let member = groups::is_member(&state.db, group_id, ctx.user_id)
        .await
        .map_err(|_| ApiError::internal("check_membership_failed"))?;
    if !member {
        return Err(ApiError::forbidden("not_group_member", "Not a group member"));
    }

    if payload.last_read_message_id > 0 {
        let belongs =
            messages::is_message_in_group(&state.db, payload.last_read_message_id, group_id)
                .await
                .map_err(|_| ApiError::internal("validate_message_failed"))?;
        if !belongs {
            return Err(ApiError::bad_request(
                "invalid_message_id",
                "Message does not belong to group",
            ));
        }
    }

    let latest = messages::latest_group_id(&state.db, group_id)
        .await
        .map_err(|_| ApiError::internal("latest_message_failed"))?;
    let last_read = payload.last_read_message_id.min(latest);

    read_state::upsert_monotonic(&state.db, group_id, ctx.user_id, last_read)
        .await
        .map_err(|_| ApiError::internal("mark_group_read_failed"))?;

    state.message_cache.invalidate_conversation_list(ctx.user_id).await;
    fanout::push_group_read_update(state, group_id, ctx.user_id, last_read).await;
    Ok(())
}

/// Sync Responder: one `sync_response` frame per requested conversation.
async fn process_sync(ctx: &WsContext, payload: SyncPayload) -> Result<(), ApiError> {
    if payload.conversations.is_empty() {
        return Err(ApiError::bad_request("missing_conversations", "conversations is required"));
    }

    let limit = payload.limit.unwrap_or(100);
    for conversation in &payload.conversations {
        let entry = fanout::sync_conversation(
            &ctx.state,
            ctx.user_id,
            &conversation.conversation_id,
            conversation.last_message_id,
            limit,
        )
        .await?;

        let mut frame = entry.to_json();
        frame["type"] = "sync_response".into();
        ctx.reply(&frame).await;
    }
    Ok(())
}
