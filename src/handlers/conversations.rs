//! Unified conversation list, bulk read, recent peers

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::db::{conversations, messages};
use crate::error::ApiError;
use crate::handlers::messages::parse_limit;
use crate::models::{rfc3339, ConversationId, ConversationRow};
use crate::ws::fanout;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConversationsQuery {
    pub cursor_created_at: Option<String>,
    pub cursor_message_id: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PeersQuery {
    pub limit: Option<String>,
}

/// Accept the cursor timestamp as RFC3339 (what we emit) or raw unix seconds.
fn parse_cursor_created_at(raw: &str) -> Option<i64> {
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp());
    }
    raw.parse::<i64>().ok().filter(|v| *v > 0)
}

fn row_to_json(row: &ConversationRow) -> Value {
    let conversation_id = match (row.conversation_type.as_str(), row.group_id, row.peer_id) {
        ("group", Some(group_id), _) => ConversationId::group(group_id).to_string(),
        (_, _, Some(peer_id)) => ConversationId::user(peer_id).to_string(),
        _ => String::new(),
    };

    let peer = row.peer_id.map(|peer_id| {
        json!({
            "id": peer_id,
            "username": row.peer_username.clone().unwrap_or_default(),
            "email": row.peer_email.clone().unwrap_or_default(),
            "is_online": row.peer_is_online.unwrap_or(false),
            "last_seen": row.peer_last_seen.map(rfc3339),
        })
    });

    let group = row.group_id.map(|group_id| {
        json!({
            "id": group_id,
            "name": row.group_name.clone().unwrap_or_default(),
            "icon": row.group_icon.clone().unwrap_or_default(),
            "member_count": row.member_count.unwrap_or(0),
        })
    });

    json!({
        "conversation_id": conversation_id,
        "peer": peer,
        "group": group,
        "unread_count": row.unread_count,
        "last_activity": rfc3339(row.last_activity),
        "last_message": {
            "id": row.message_id,
            "client_id": row.message_client_id,
            "sender_id": row.message_sender_id,
            "sender": {
                "id": row.sender_id,
                "username": row.sender_username,
                "email": row.sender_email,
                "is_online": row.sender_is_online,
                "last_seen": row.sender_last_seen.map(rfc3339),
            },
            "recipient_id": row.message_recipient_id,
            "group_id": row.message_group_id,
            "content": row.message_content,
            "message_type": row.message_type,
            "status": row.message_status,
            "is_delivered": row.message_is_delivered,
            "is_read": row.message_is_read,
            "created_at": rfc3339(row.message_created_at),
            "created_at_unix": row.message_created_at,
        },
    })
}

/// GET /api/conversations — the unified DM + group list with keyset
/// pagination. The first page is cached per user.
pub async fn get_conversations(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ConversationsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = parse_limit(query.limit.as_deref(), 50, 100);

    let cursor = match query.cursor_created_at.as_deref() {
        Some(raw) if !raw.is_empty() => {
            let created_at = parse_cursor_created_at(raw).ok_or_else(|| {
                ApiError::bad_request("invalid_cursor_created_at", "Invalid cursor_created_at")
            })?;
            let message_id = query
                .cursor_message_id
                .as_deref()
                .and_then(|s| s.parse::<i64>().ok())
                .filter(|id| *id > 0)
                .ok_or_else(|| {
                    ApiError::bad_request("invalid_cursor_message_id", "Invalid cursor_message_id")
                })?;
            Some((created_at, message_id))
        }
        _ => None,
    };

    if cursor.is_none() {
        if let Some(cached) = state.message_cache.get_conversation_list(user.user_id).await {
            return Ok(Json(cached));
        }
    }

    let rows = conversations::list_unified(&state.db, user.user_id, cursor, limit + 1)
        .await
        .map_err(|_| ApiError::internal("fetch_conversations_failed"))?;

    let has_more = rows.len() as i64 > limit;
    let page = &rows[..rows.len().min(limit as usize)];

    let conversations: Vec<Value> = page.iter().map(row_to_json).collect();
    let mut result = json!({
        "conversations": conversations,
        "count": conversations.len(),
    });
    if has_more {
        if let Some(last) = page.last() {
            result["next_cursor_created_at"] = rfc3339(last.last_activity).into();
            result["next_cursor_message_id"] = last.message_id.into();
        }
    }

    if cursor.is_none() {
        state.message_cache.set_conversation_list(user.user_id, &result).await;
    }

    Ok(Json(result))
}

/// POST /api/conversations/:peer_id/read — bulk-mark a direct conversation
/// read and push the read cursor to the peer.
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    user: AuthUser,
    Path(peer_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if peer_id <= 0 {
        return Err(ApiError::bad_request("invalid_peer_id", "Invalid peer_id"));
    }

    let cleared = messages::mark_conversation_read(&state.db, user.user_id, peer_id)
        .await
        .map_err(|_| ApiError::internal("mark_conversation_read_failed"))?;

    let last_read = messages::latest_direct_id(&state.db, user.user_id, peer_id)
        .await
        .map_err(|_| ApiError::internal("latest_message_failed"))?;
    if last_read > 0 {
        fanout::push_read_update(&state, user.user_id, peer_id, last_read).await;
    }
    state.message_cache.invalidate_conversation_list(user.user_id).await;

    Ok(Json(json!({
        "ok": true,
        "cleared": cleared,
    })))
}

/// GET /api/conversations/peers — recent DM peers for seeding the list after
/// a reinstall.
pub async fn get_recent_peers(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<PeersQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = parse_limit(query.limit.as_deref(), 50, 100);

    let rows = conversations::recent_peers(&state.db, user.user_id, limit)
        .await
        .map_err(|_| ApiError::internal("fetch_recent_peers_failed"))?;

    let peers: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "peer": {
                    "id": row.peer_id,
                    "username": row.peer_username,
                    "email": row.peer_email,
                    "is_online": row.peer_is_online,
                    "last_seen": row.peer_last_seen.map(rfc3339),
                },
                "last_message_id": row.message_id,
                "last_activity": rfc3339(row.last_activity),
            })
        })
        .collect();

    Ok(Json(json!({
        "peers": peers,
        "count": peers.len(),
    })))
}
