//! Group endpoints: conversation windows, idempotent send, read cursors,
//! membership lifecycle and invite links

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::db::{groups, messages, now_unix, read_state, users};
use crate::error::ApiError;
use crate::handlers::messages::parse_limit;
use crate::models::parse_message_type;
use crate::validation::{normalize_handle, trim_and_limit, valid_group_handle};
use crate::ws::fanout;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub is_public: bool,
    pub handle: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendGroupMessageRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkGroupReadRequest {
    #[serde(default)]
    pub last_read_message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateInviteLinkRequest {
    /// Shorthand for `max_uses = 1`.
    #[serde(default)]
    pub single_use: bool,
    pub max_uses: Option<i64>,
    /// Seconds from now; None = never expires.
    pub expires_in_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub cursor: Option<String>,
    pub limit: Option<String>,
}

fn validate_group_id(id: i64) -> Result<i64, ApiError> {
    if id <= 0 {
        return Err(ApiError::bad_request("invalid_group_id", "Invalid group id"));
    }
    Ok(id)
}

async fn require_member(state: &AppState, group_id: i64, user_id: i64) -> Result<(), ApiError> {
    let member = groups::is_member(&state.db, group_id, user_id)
        .await
        .map_err(|_| ApiError::internal("check_membership_failed"))?;
    if !member {
        return Err(ApiError::forbidden("not_group_member", "Not a group member"));
    }
    Ok(())
}

/// POST /api/groups — create a group. Public groups need a handle that
/// collides with neither an existing handle nor any username.
pub async fn create_group(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let name = trim_and_limit(&input.name, 120);
    if name.is_empty() {
        return Err(ApiError::bad_request("missing_name", "Group name is required"));
    }

    let handle = match (&input.handle, input.is_public) {
        (Some(raw), _) => {
            let handle = normalize_handle(raw);
            if !valid_group_handle(&handle) {
                return Err(ApiError::bad_request("invalid_handle", "Invalid group handle"));
            }
            if groups::handle_taken(&state.db, &handle)
                .await
                .map_err(|_| ApiError::internal("create_group_failed"))?
                || users::username_taken(&state.db, &handle)
                    .await
                    .map_err(|_| ApiError::internal("create_group_failed"))?
            {
                return Err(ApiError::bad_request("handle_taken", "Handle already in use"));
            }
            Some(handle)
        }
        (None, true) => {
            return Err(ApiError::bad_request(
                "missing_handle",
                "Public groups require a handle",
            ))
        }
        (None, false) => None,
    };

    let group = groups::create(
        &state.db,
        &name,
        &trim_and_limit(&input.description, 500),
        input.icon.trim(),
        user.user_id,
        input.is_public,
        handle.as_deref(),
    )
    .await
    .map_err(|_| ApiError::internal("create_group_failed"))?;

    Ok((StatusCode::CREATED, Json(json!(group.to_response()))))
}

/// POST /api/groups/:id/join — join a public group directly.
pub async fn join_group(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let group_id = validate_group_id(group_id)?;
    let group = groups::find_by_id(&state.db, group_id)
        .await
        .map_err(|_| ApiError::internal("get_group_failed"))?
        .ok_or_else(|| ApiError::not_found("group_not_found", "Group not found"))?;

    if !group.is_public {
        return Err(ApiError::forbidden("invite_required", "This group is invite-only"));
    }

    groups::add_member(&state.db, group_id, user.user_id, "member")
        .await
        .map_err(|_| ApiError::internal("join_group_failed"))?;
    state.message_cache.invalidate_conversation_list(user.user_id).await;

    Ok(Json(json!({ "ok": true, "group": group.to_response() })))
}

/// GET /api/groups/public/search?q=&limit= — discover public groups by
/// handle or name substring.
pub async fn search_public_groups(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let q = query.q.as_deref().unwrap_or("").trim().to_string();
    if q.is_empty() {
        return Err(ApiError::bad_request("missing_query", "Search query is required"));
    }
    let limit = parse_limit(query.limit.as_deref(), 20, 50);

    let found = groups::search_public(&state.db, &q, limit)
        .await
        .map_err(|_| ApiError::internal("search_groups_failed"))?;
    let found: Vec<Value> = found.iter().map(|g| json!(g.to_response())).collect();

    Ok(Json(json!({ "groups": found })))
}

/// GET /api/groups/handle/:handle — resolve a public group by handle.
pub async fn get_public_group_by_handle(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(handle): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let handle = normalize_handle(&handle);
    if !valid_group_handle(&handle) {
        return Err(ApiError::bad_request("invalid_handle", "Invalid group handle"));
    }

    let group = groups::find_public_by_handle(&state.db, &handle)
        .await
        .map_err(|_| ApiError::internal("get_group_failed"))?
        .ok_or_else(|| ApiError::not_found("group_not_found", "Group not found"))?;

    Ok(Json(json!(group.to_response())))
}

/// POST /api/groups/handle/:handle/join — join a public group by handle.
pub async fn join_public_group_by_handle(
    State(state): State<AppState>,
    user: AuthUser,
    Path(handle): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let handle = normalize_handle(&handle);
    if !valid_group_handle(&handle) {
        return Err(ApiError::bad_request("invalid_handle", "Invalid group handle"));
    }

    let group = groups::find_public_by_handle(&state.db, &handle)
        .await
        .map_err(|_| ApiError::internal("get_group_failed"))?
        .ok_or_else(|| ApiError::not_found("group_not_found", "Group not found"))?;

    groups::add_member(&state.db, group.id, user.user_id, "member")
        .await
        .map_err(|_| ApiError::internal("join_group_failed"))?;
    state.message_cache.invalidate_conversation_list(user.user_id).await;

    Ok(Json(json!({ "ok": true, "group": group.to_response() })))
}

/// POST /api/groups/:id/leave
pub async fn leave_group(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let group_id = validate_group_id(group_id)?;
    require_member(&state, group_id, user.user_id).await?;

    groups::remove_member(&state.db, group_id, user.user_id)
        .await
        .map_err(|_| ApiError::internal("leave_group_failed"))?;
    state.message_cache.invalidate_conversation_list(user.user_id).await;

    Ok(Json(json!({ "ok": true })))
}

/// GET /api/groups/:id/members — open for public groups, member-only
/// otherwise.
pub async fn get_group_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let group_id = validate_group_id(group_id)?;
    let group = groups::find_by_id(&state.db, group_id)
        .await
        .map_err(|_| ApiError::internal("get_group_failed"))?
        .ok_or_else(|| ApiError::not_found("group_not_found", "Group not found"))?;
    if !group.is_public {
        require_member(&state, group_id, user.user_id).await?;
    }

    let members = groups::members(&state.db, group_id)
        .await
        .map_err(|_| ApiError::internal("get_members_failed"))?;
    let members: Vec<Value> = members.iter().map(|m| json!(m.to_response())).collect();

    Ok(Json(json!({
        "members": members,
        "count": members.len(),
    })))
}

/// POST /api/groups/:id/invite-links — mint an invite token. The response
/// carries a ready-to-share join path, and the absolute URL when
/// `PUBLIC_JOIN_BASE_URL` is configured.
pub async fn create_invite_link(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
    Json(input): Json<CreateInviteLinkRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let group_id = validate_group_id(group_id)?;
    require_member(&state, group_id, user.user_id).await?;

    let max_uses = if input.single_use { Some(1) } else { input.max_uses };
    if let Some(max_uses) = max_uses {
        if max_uses <= 0 {
            return Err(ApiError::bad_request("invalid_max_uses", "max_uses must be positive"));
        }
    }
    let expires_at = match input.expires_in_seconds {
        Some(secs) if secs <= 0 => {
            return Err(ApiError::bad_request(
                "invalid_expires_in_seconds",
                "expires_in_seconds must be positive",
            ))
        }
        Some(secs) => Some(now_unix() + secs),
        None => None,
    };

    let link = groups::create_invite_link(&state.db, group_id, user.user_id, max_uses, expires_at)
        .await
        .map_err(|_| ApiError::internal("create_invite_failed"))?;

    let join_path = format!("/join/{}", link.token);
    let join_url = state
        .config
        .public_join_base_url
        .as_deref()
        .map(|base| format!("{}{}", base, join_path))
        .unwrap_or_default();

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token": link.token,
            "group_id": link.group_id,
            "join_path": join_path,
            "join_url": join_url,
            "max_uses": link.max_uses,
            "expires_at": link.expires_at,
        })),
    ))
}

/// POST /api/join/:token — join via a usable invite link.
pub async fn join_by_invite_link(
    State(state): State<AppState>,
    user: AuthUser,
    Path(token): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let link = groups::find_invite_by_token(&state.db, token.trim())
        .await
        .map_err(|_| ApiError::internal("get_invite_failed"))?
        .ok_or_else(|| ApiError::not_found("invite_not_found", "Invite link not found"))?;

    if !link.is_usable(now_unix()) {
        return Err(ApiError::forbidden("invite_unusable", "Invite link is no longer usable"));
    }

    let already_member = groups::is_member(&state.db, link.group_id, user.user_id)
        .await
        .map_err(|_| ApiError::internal("check_membership_failed"))?;

    if !already_member {
        // Guarded increment: a concurrent joiner cannot overshoot the cap.
        let consumed = groups::increment_invite_use(&state.db, link.id)
            .await
            .map_err(|_| ApiError::internal("join_group_failed"))?;
        if !consumed {
            return Err(ApiError::forbidden("invite_unusable", "Invite link is no longer usable"));
        }
        groups::add_member(&state.db, link.group_id, user.user_id, "member")
            .await
            .map_err(|_| ApiError::internal("join_group_failed"))?;
        state.message_cache.invalidate_conversation_list(user.user_id).await;
    }

    let group = groups::find_by_id(&state.db, link.group_id)
        .await
        .map_err(|_| ApiError::internal("get_group_failed"))?
        .ok_or_else(|| ApiError::not_found("group_not_found", "Group not found"))?;

    Ok(Json(json!({ "ok": true, "group": group.to_response() })))
}

/// GET /api/join/:token — preview the group behind an invite link before
/// committing to it. Unauthenticated: the preview gates on the token alone
/// and exposes no membership or creator details.
pub async fn get_invite_preview(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::bad_request("invalid_token", "Invalid token"));
    }

    let link = groups::find_invite_by_token(&state.db, token)
        .await
        .map_err(|_| ApiError::internal("get_invite_failed"))?
        .ok_or_else(|| ApiError::not_found("invite_not_found", "Invite link not found"))?;

    if !link.is_usable(now_unix()) {
        return Err(ApiError::forbidden("invite_unusable", "Invite link is no longer usable"));
    }

    let group = groups::find_by_id(&state.db, link.group_id)
        .await
        .map_err(|_| ApiError::internal("get_group_failed"))?
        .ok_or_else(|| ApiError::not_found("group_not_found", "Group not found"))?;

    Ok(Json(json!({
        "group": {
            "id": group.id,
            "name": group.name,
            "description": group.description,
            "icon": group.icon,
            "is_public": group.is_public,
            "handle": group.handle,
        },
        "expires_at": link.expires_at,
        "max_uses": link.max_uses,
        "used_count": link.used_count,
        "requires_auth": true,
    })))
}

/// GET /api/groups/:id/messages — member-only window, newest first.
pub async fn get_group_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, ApiError> {
    let group_id = validate_group_id(group_id)?;
    require_member(&state, group_id, user.user_id).await?;

    let limit = parse_limit(query.limit.as_deref(), 50, 100);

    let records = if let Some(cursor_raw) = query.cursor.as_deref() {
        let cursor = cursor_raw
            .parse::<i64>()
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| ApiError::bad_request("invalid_cursor", "Invalid cursor"))?;
        messages::find_group_messages(&state.db, group_id, cursor, limit)
            .await
            .map_err(|_| ApiError::internal("fetch_messages_failed"))?
    } else if let Some(mut cached) = state
        .message_cache
        .get_group_conversation(group_id)
        .await
        .filter(|m| !m.is_empty())
    {
        cached.truncate(limit as usize);
        cached
    } else {
        let fetched = messages::find_group_messages(&state.db, group_id, 0, limit)
            .await
            .map_err(|_| ApiError::internal("fetch_messages_failed"))?;
        if !fetched.is_empty() {
            state.message_cache.set_group_conversation(group_id, &fetched).await;
        }
        fetched
    };

    let responses: Vec<Value> = records.iter().map(|m| json!(m.to_response())).collect();
    let mut result = json!({
        "messages": responses,
        "count": records.len(),
    });
    if let Some(oldest) = records.last() {
        result["next_cursor"] = oldest.id.into();
    }
    Ok(Json(result))
}

/// POST /api/groups/:id/messages — idempotent group send by client_id.
pub async fn send_group_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
    Json(input): Json<SendGroupMessageRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let group_id = validate_group_id(group_id)?;
    require_member(&state, group_id, user.user_id).await?;

    let client_id = input.client_id.trim().to_string();
    if client_id.is_empty() {
        return Err(ApiError::bad_request("missing_client_id", "client_id is required"));
    }
    let content = trim_and_limit(&input.content, state.config.max_message_length);
    if content.is_empty() {
        return Err(ApiError::bad_request("missing_content", "Content is required"));
    }

    // Idempotent send by client_id.
    if let Some(existing) = messages::find_by_client_id(&state.db, &client_id, user.user_id)
        .await
        .map_err(|_| ApiError::internal("get_message_failed"))?
    {
        if existing.group_id == Some(group_id) {
            state.metrics.incr_duplicates();
            return Ok((StatusCode::CREATED, Json(json!(existing.to_response()))));
        }
        return Err(ApiError::bad_request("client_id_conflict", "client_id already used"));
    }

    let message = match messages::create(
        &state.db,
        user.user_id,
        &client_id,
        None,
        Some(group_id),
        &content,
        parse_message_type(&input.message_type),
    )
    .await
    .map_err(|_| ApiError::internal("send_message_failed"))?
    {
        messages::CreateOutcome::Created(message) => message,
        messages::CreateOutcome::DuplicateClientId => {
            let existing = messages::find_by_client_id(&state.db, &client_id, user.user_id)
                .await
                .map_err(|_| ApiError::internal("get_message_failed"))?
                .ok_or_else(|| ApiError::internal("get_message_failed"))?;
            state.metrics.incr_duplicates();
            return Ok((StatusCode::CREATED, Json(json!(existing.to_response()))));
        }
        messages::CreateOutcome::NotGroupMember => {
            return Err(ApiError::forbidden("not_group_member", "Not a group member"))
        }
    };

    fanout::push_group(&state, group_id, &message).await;

    Ok((StatusCode::CREATED, Json(json!(message.to_response()))))
}

/// POST /api/groups/:id/read — monotonic cursor update plus fan-out.
pub async fn mark_group_read(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
    Json(input): Json<MarkGroupReadRequest>,
) -> Result<Json<Value>, ApiError> {
    let group_id = validate_group_id(group_id)?;
    require_member(&state, group_id, user.user_id).await?;

    if input.last_read_message_id > 0 {
        let belongs =
            messages::is_message_in_group(&state.db, input.last_read_message_id, group_id)
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
    let last_read = input.last_read_message_id.min(latest);

    read_state::upsert_monotonic(&state.db, group_id, user.user_id, last_read)
        .await
        .map_err(|_| ApiError::internal("mark_group_read_failed"))?;

    state.message_cache.invalidate_conversation_list(user.user_id).await;
    fanout::push_group_read_update(&state, group_id, user.user_id, last_read).await;

    Ok(Json(json!({
        "ok": true,
        "last_read_message_id": last_read,
        "latest_group_message_id": latest,
    })))
}

/// GET /api/groups/:id/read-state — caller's cursor plus every member's.
pub async fn get_group_read_state(
    State(state): State<AppState>,
    user: AuthUser,
    Path(group_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let group_id = validate_group_id(group_id)?;
    require_member(&state, group_id, user.user_id).await?;

    let mine = read_state::get(&state.db, group_id, user.user_id)
        .await
        .map_err(|_| ApiError::internal("get_read_state_failed"))?
        .map(|s| s.last_read_message_id)
        .unwrap_or(0);

    let states = read_state::list_by_group(&state.db, group_id)
        .await
        .map_err(|_| ApiError::internal("get_read_state_failed"))?;
    let members: Vec<Value> = states
        .iter()
        .map(|s| {
            json!({
                "user_id": s.user_id,
                "last_read_message_id": s.last_read_message_id,
            })
        })
        .collect();

    Ok(Json(json!({
        "my_last_read_message_id": mine,
        "members": members,
    })))
}
