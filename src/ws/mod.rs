//! WebSocket endpoint
//!
//! Upgrade, compression negotiation, the per-connection read loop and the
//! register → flush → read → unregister lifecycle.

pub mod envelope;
pub mod fanout;
pub mod process;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::auth::AuthUser;
use crate::compress::gzip_decompress;
use crate::db::users;
use crate::ws::envelope::error_frame;
use crate::ws::process::WsContext;
use crate::AppState;

/// Compression is negotiated at handshake time only — a query flag or a
/// header, never per-frame sniffing.
fn negotiate_gzip(params: &HashMap<String, String>, headers: &HeaderMap) -> bool {
    if params.get("gzip").map(|v| v == "1").unwrap_or(false) {
        return true;
    }
    headers
        .get("x-supports-gzip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// `GET /ws` — authenticated upgrade.
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let supports_gzip = negotiate_gzip(&params, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, user.user_id, supports_gzip))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64, supports_gzip: bool) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));

    state.hub.clone().register(user_id, sink.clone(), supports_gzip).await;

    if let Err(e) = users::set_online(&state.db, user_id).await {
        error!("Failed to mark user {} online: {}", user_id, e);
    }
    state.user_cache.set_user_online(user_id).await;

    // Drain the offline queue before processing anything new, so the client
    // observes backlog before fresh traffic.
    if let Err(e) = state.hub.flush_pending_messages(user_id).await {
        error!("Failed to flush pending messages for user {}: {}", user_id, e);
    }

    let ctx = WsContext {
        user_id,
        state: state.clone(),
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&ctx, &text).await,
            Ok(Message::Binary(data)) => {
                // Negotiated-compression path: binary frames are gzip JSON.
                match gzip_decompress(&data) {
                    Ok(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => dispatch(&ctx, &text).await,
                        Err(_) => {
                            let frame = error_frame("invalid_envelope", "Frame is not UTF-8 JSON");
                            let _ = state.hub.send_to_user(user_id, &frame).await;
                        }
                    },
                    Err(e) => {
                        debug!("Failed to decompress frame from user {}: {}", user_id, e);
                        let frame = error_frame("invalid_envelope", "Failed to decompress frame");
                        let _ = state.hub.send_to_user(user_id, &frame).await;
                    }
                }
            }
            Ok(Message::Pong(_)) => {
                state.hub.touch_pong(user_id).await;
                state.user_cache.refresh_user_online(user_id).await;
            }
            Ok(Message::Ping(_)) => { /* the transport answers pings itself */ }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("WebSocket error from user {}: {}", user_id, e);
                break;
            }
        }
    }

    state.hub.unregister_if_current(user_id, &sink).await;

    if !state.hub.is_online(user_id).await {
        if let Err(e) = users::set_offline(&state.db, user_id).await {
            error!("Failed to mark user {} offline: {}", user_id, e);
        }
        state.user_cache.set_user_offline(user_id).await;
    }
}

/// Decode one text frame and run it. A bad frame answers with an `error`
/// frame; the connection always survives.
async fn dispatch(ctx: &WsContext, text: &str) {
    let inbound = match envelope::decode(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!("Undecodable frame from user {}: {}", ctx.user_id, e);
            let frame = error_frame(e.code(), &e.to_string());
            let _ = ctx.state.hub.send_to_user(ctx.user_id, &frame).await;
            return;
        }
    };

    if let Err(e) = inbound.process(ctx).await {
        let _ = ctx.state.hub.send_to_user(ctx.user_id, &e.ws_frame()).await;
    }
}
