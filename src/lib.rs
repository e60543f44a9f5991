//! RelayChat server core: connection hub, at-least-once delivery pipeline,
//! conversation indexing and read-state propagation.

pub mod auth;
pub mod cache;
pub mod compress;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod routing;
pub mod validation;
pub mod ws;

use std::sync::Arc;

use crate::cache::{MessageCache, UserCache};
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::metrics::Metrics;

/// Shared application state handed to every handler and the socket loop.
#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Arc<ServerConfig>,
    pub hub: Arc<Hub>,
    pub message_cache: MessageCache,
    pub user_cache: UserCache,
    pub metrics: Arc<Metrics>,
}
