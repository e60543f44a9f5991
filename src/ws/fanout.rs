//! Fan-out and sync cores shared by the socket dispatch and the HTTP send
//! paths.

use serde_json::Value;

use crate::db::{groups, messages};
use crate::error::ApiError;
use crate::models::{ConversationId, MessageRecord};
use crate::AppState;

/// Push a freshly persisted direct message to its recipient (queued when
/// offline, anchored on the durable message id) and invalidate the caches
/// the write made stale.
pub async fn push_direct(state: &AppState, message: &MessageRecord) {
    let Some(recipient_id) = message.recipient_id else { return };
    let sender_id = message.sender_id;

    state.message_cache.invalidate_conversation(sender_id, recipient_id).await;
    state.message_cache.invalidate_conversation_list(sender_id).await;
    state.message_cache.invalidate_conversation_list(recipient_id).await;
    state.message_cache.invalidate_unread(recipient_id, sender_id).await;

    let event = serde_json::json!({
        "type": "message",
        "message": message.to_response(),
    });
    if let Err(e) = state.hub.send_to_user_with_id(recipient_id, message.id, &event).await {
        tracing::error!("Failed to route message {} to user {}: {}", message.id, recipient_id, e);
    }
}

/// Push a freshly persisted group message to every other member.
/// Per-recipient ordering holds because each member's channel (or queue)
/// receives messages in store-id order.
pub async fn push_group(state: &AppState, group_id: i64, message: &MessageRecord) {
    state.message_cache.invalidate_group_conversation(group_id).await;
    state.message_cache.invalidate_conversation_list(message.sender_id).await;

    let members = match groups::member_ids(&state.db, group_id).await {
        Ok(members) => members,
        Err(e) => {
            tracing::error!("Failed to load members of group {}: {}", group_id, e);
            return;
        }
    };

    let event = serde_json::json!({
        "type": "message",
        "message": message.to_response(),
    });
    for member in members {
        if member == message.sender_id {
            continue;
        }
        if let Err(e) = state.hub.send_to_user_with_id(member, message.id, &event).await {
            tracing::error!("Failed to route message {} to user {}: {}", message.id, member, e);
        }
        state.message_cache.invalidate_conversation_list(member).await;
    }
}

/// Notify the original sender that the recipient has read up to `message_id`,
/// and drop their stale conversation-list entry. Ephemeral: an offline sender
/// recovers the state from the message flags on the next sync.
pub async fn push_read_update(state: &AppState, reader_id: i64, sender_id: i64, message_id: i64) {
    let event = serde_json::json!({
        "type": "read_update",
        "conversation_id": ConversationId::user(reader_id).to_string(),
        "user_id": reader_id,
        "last_read_message_id": message_id,
    });
    if let Err(e) = state.hub.send_to_user(sender_id, &event).await {
        tracing::debug!("read_update to user {} not delivered: {}", sender_id, e);
    }
    state.message_cache.invalidate_conversation_list(sender_id).await;
    state.message_cache.invalidate_unread(reader_id, sender_id).await;
}

/// Broadcast a member's new group read cursor to the other members.
pub async fn push_group_read_update(
    state: &AppState,
    group_id: i64,
    user_id: i64,
    last_read_message_id: i64,
) {
    let members = match groups::member_ids(&state.db, group_id).await {
        Ok(members) => members,
        Err(e) => {
            tracing::error!("Failed to load members of group {}: {}", group_id, e);
            return;
        }
    };
    let others: Vec<i64> = members.into_iter().filter(|id| *id != user_id).collect();

    let event = serde_json::json!({
        "type": "group_read_update",
        "group_id": group_id,
        "user_id": user_id,
        "last_read_message_id": last_read_message_id,
    });
    state.hub.broadcast_to_users(&others, &event).await;
}

/// One sync entry: the forward delta for a single conversation.
#[derive(Debug)]
pub struct SyncEntry {
    pub conversation_id: String,
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
    pub next_cursor: Option<i64>,
}

impl SyncEntry {
    pub fn to_json(&self) -> Value {
        let responses: Vec<Value> = self
            .messages
            .iter()
            .map(|m| serde_json::to_value(m.to_response()).unwrap_or(Value::Null))
            .collect();
        let mut entry = serde_json::json!({
            "conversation_id": self.conversation_id,
            "messages": responses,
            "has_more": self.has_more,
        });
        if let Some(cursor) = self.next_cursor {
            entry["next_cursor"] = cursor.into();
        }
        entry
    }
}

/// Sync Responder core: resolve one `{conversation_id, last_message_id}`
/// tuple into its forward-delta batch.
pub async fn sync_conversation(
    state: &AppState,
    user_id: i64,
    conversation_id: &str,
    last_message_id: i64,
    limit: i64,
) -> Result<SyncEntry, ApiError> {
    let conversation: ConversationId = conversation_id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid_conversation_id", "Invalid conversation_id"))?;

    let limit = if (1..=200).contains(&limit) { limit } else { 100 };

    let messages =
        messages::find_messages_since(&state.db, user_id, conversation, last_message_id, limit)
            .await
            .map_err(|e| {
                tracing::error!("sync query failed for {}: {}", conversation_id, e);
                ApiError::internal("sync_failed")
            })?;

    let has_more = messages.len() as i64 == limit;
    let next_cursor = messages.last().map(|m| m.id);
    Ok(SyncEntry {
        conversation_id: conversation_id.to_string(),
        messages,
        has_more,
        next_cursor,
    })
}
