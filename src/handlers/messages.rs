//! Direct-message endpoints and bulk sync

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::db::messages;
use crate::error::ApiError;
use crate::models::parse_message_type;
use crate::validation::trim_and_limit;
use crate::ws::fanout;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub recipient_id: Option<i64>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GetMessagesQuery {
    pub recipient_id: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyncConversationState {
    pub conversation_id: String,
    #[serde(default)]
    pub last_message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SyncMessagesRequest {
    #[serde(default)]
    pub conversations: Vec<SyncConversationState>,
    #[serde(default)]
    pub limit: i64,
}

pub(crate) fn parse_limit(raw: Option<&str>, default: i64, max: i64) -> i64 {
    raw.and_then(|s| s.parse::<i64>().ok())
        .filter(|l| *l > 0 && *l <= max)
        .unwrap_or(default)
}

fn parse_id(raw: Option<&str>, code: &'static str, what: &str) -> Result<i64, ApiError> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::bad_request(code, format!("Invalid {}", what)))
}

/// POST /api/messages — synchronous direct send.
///
/// `client_id` is optional here; a server-generated token keeps the
/// idempotency key invariant for clients that do not retry.
pub async fn send_message(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let content = trim_and_limit(&input.content, state.config.max_message_length);
    if content.is_empty() {
        return Err(ApiError::bad_request("missing_content", "Content is required"));
    }
    let recipient_id = input
        .recipient_id
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::bad_request("missing_recipient", "recipient_id is required"))?;

    let client_id = {
        let trimmed = input.client_id.trim();
        if trimmed.is_empty() {
            let mut token = [0u8; 32];
            OsRng.fill_bytes(&mut token);
            hex::encode(token)
        } else {
            trimmed.to_string()
        }
    };

    let message = match messages::create(
        &state.db,
        user.user_id,
        &client_id,
        Some(recipient_id),
        None,
        &content,
        parse_message_type(&input.message_type),
    )
    .await
    .map_err(|_| ApiError::internal("send_message_failed"))?
    {
        messages::CreateOutcome::Created(message) => message,
        messages::CreateOutcome::DuplicateClientId => {
            // Idempotent retry: hand back the original row.
            state.metrics.incr_duplicates();
            messages::find_by_client_id(&state.db, &client_id, user.user_id)
                .await
                .map_err(|_| ApiError::internal("get_message_failed"))?
                .ok_or_else(|| ApiError::internal("get_message_failed"))?
        }
        messages::CreateOutcome::NotGroupMember => {
            return Err(ApiError::internal("send_message_failed"))
        }
    };

    fanout::push_direct(&state, &message).await;

    Ok((StatusCode::CREATED, Json(json!(message.to_response()))))
}

/// GET /api/messages?recipient_id=&cursor=&limit= — direct conversation
/// window, newest first. The cursorless page is served from cache when warm.
pub async fn get_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<GetMessagesQuery>,
) -> Result<Json<Value>, ApiError> {
    let recipient_id = parse_id(query.recipient_id.as_deref(), "missing_recipient", "recipient_id")?;
    let limit = parse_limit(query.limit.as_deref(), 50, 100);

    let records = if let Some(cursor_raw) = query.cursor.as_deref() {
        let cursor = cursor_raw
            .parse::<i64>()
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| ApiError::bad_request("invalid_cursor", "Invalid cursor"))?;
        messages::find_conversation_cursor(&state.db, user.user_id, recipient_id, cursor, limit)
            .await
            .map_err(|_| ApiError::internal("fetch_messages_failed"))?
    } else if let Some(mut cached) = state
        .message_cache
        .get_conversation(user.user_id, recipient_id)
        .await
        .filter(|m| !m.is_empty())
    {
        cached.truncate(limit as usize);
        cached
    } else {
        let fetched =
            messages::find_conversation_cursor(&state.db, user.user_id, recipient_id, 0, limit)
                .await
                .map_err(|_| ApiError::internal("fetch_messages_failed"))?;
        if !fetched.is_empty() {
            state
                .message_cache
                .set_conversation(user.user_id, recipient_id, &fetched)
                .await;
        }
        fetched
    };

    let responses: Vec<Value> = records.iter().map(|m| json!(m.to_response())).collect();
    let mut result = json!({
        "messages": responses,
        "count": records.len(),
    });
    if let Some(oldest) = records.last() {
        // Newest-first page: the oldest element is the cursor for the next one.
        result["next_cursor"] = oldest.id.into();
    }
    Ok(Json(result))
}

/// POST /api/messages/sync — REST incremental sync for background polling.
pub async fn sync_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<SyncMessagesRequest>,
) -> Result<Json<Value>, ApiError> {
    if input.conversations.is_empty() {
        return Err(ApiError::bad_request("missing_conversations", "conversations is required"));
    }

    let mut results = Vec::with_capacity(input.conversations.len());
    for conversation in &input.conversations {
        if conversation.conversation_id.trim().is_empty() {
            return Err(ApiError::bad_request(
                "invalid_conversation_id",
                "conversation_id is required",
            ));
        }
        let entry = fanout::sync_conversation(
            &state,
            user.user_id,
            &conversation.conversation_id,
            conversation.last_message_id,
            input.limit,
        )
        .await?;
        results.push(entry.to_json());
    }

    Ok(Json(json!({
        "results": results,
        "count": results.len(),
    })))
}
