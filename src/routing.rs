//! HTTP routing configuration

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::CsrfMode;
use crate::db::pending;
use crate::error::ApiError;
use crate::handlers::{conversations, groups, messages};
use crate::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.allowed_origins);

    let api = Router::new()
        .route("/messages", post(messages::send_message).get(messages::get_messages))
        .route("/messages/sync", post(messages::sync_messages))
        .route("/conversations", get(conversations::get_conversations))
        .route("/conversations/peers", get(conversations::get_recent_peers))
        .route("/conversations/:peer_id/read", post(conversations::mark_conversation_read))
        .route("/groups", post(groups::create_group))
        .route("/groups/public/search", get(groups::search_public_groups))
        .route("/groups/handle/:handle", get(groups::get_public_group_by_handle))
        .route("/groups/handle/:handle/join", post(groups::join_public_group_by_handle))
        .route("/groups/:id/join", post(groups::join_group))
        .route("/groups/:id/leave", post(groups::leave_group))
        .route("/groups/:id/members", get(groups::get_group_members))
        .route("/groups/:id/invite-links", post(groups::create_invite_link))
        .route("/groups/:id/messages", get(groups::get_group_messages).post(groups::send_group_message))
        .route("/groups/:id/read", post(groups::mark_group_read))
        .route("/groups/:id/read-state", get(groups::get_group_read_state))
        // Preview is public; joining requires the authenticated caller.
        .route("/join/:token", get(groups::get_invite_preview).post(groups::join_by_invite_link));

    let mut router = Router::new()
        .nest("/api", api)
        .route("/ws", get(crate::ws::handle_websocket))
        .route("/health", get(health_check));

    // Only mount the stats endpoint if a token is configured
    if state.config.admin_token.is_some() {
        router = router.route("/admin/stats", get(admin_stats));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), enforce_origin))
        .with_state(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Build CORS layer from config. Permissive when no origins are configured.
fn build_cors_layer(origins: &Option<String>) -> CorsLayer {
    match origins {
        Some(list) if !list.is_empty() => {
            let parsed: Vec<_> = list
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_credentials(true)
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        }
        _ => CorsLayer::permissive(),
    }
}

/// Reject browser requests from origins outside the allow-list. Requests
/// without an Origin header (native clients, curl) pass through; CSRF token
/// checking is the external middleware's job.
async fn enforce_origin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.csrf_mode == CsrfMode::Off {
        return next.run(request).await;
    }

    let allowlist = state.config.origin_allowlist();
    if allowlist.is_empty() {
        return next.run(request).await;
    }

    if let Some(origin) = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
    {
        let origin = origin.trim_end_matches('/');
        if !allowlist.iter().any(|allowed| allowed == origin) {
            return ApiError::forbidden("forbidden_origin", "Origin not allowed").into_response();
        }
    }

    next.run(request).await
}

/// Health check — no sensitive data
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
    }))
}

/// Operator stats — protected by bearer token
async fn admin_stats(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let expected = state.config.admin_token.as_deref().ok_or(StatusCode::NOT_FOUND)?;

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Constant-time comparison to prevent timing attacks
    use subtle::ConstantTimeEq;
    if expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() != 1 {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let queue_depth = pending::depth(&state.db).await.unwrap_or(-1);
    Ok(Json(serde_json::json!({
        "hub": {
            "connected": state.hub.count().await,
        },
        "queue": {
            "depth": queue_depth,
            "retries": state.metrics.retries(),
        },
        "ingest": {
            "duplicates": state.metrics.duplicates(),
        },
        "fanout": {
            "failed": state.metrics.fanout_failures(),
        },
    })))
}
