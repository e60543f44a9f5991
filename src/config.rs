//! Server configuration

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;

/// How cross-site request forgery is policed for browser clients.
///
/// `Token` is enforced by the external auth middleware; this core only acts
/// on `Origin` (Origin-header allow-list) and `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CsrfMode {
    Token,
    Origin,
    Off,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL
    pub database_url: String,
    /// HS256 secret for bearer-token verification (required)
    pub jwt_secret: String,
    /// Comma-separated list of allowed origins (empty = permissive)
    pub allowed_origins: Option<String>,
    /// CSRF policing mode
    pub csrf_mode: CsrfMode,
    /// Redis address, e.g. "127.0.0.1:6379" (None = run without cache)
    pub redis_addr: Option<String>,
    /// Redis password
    pub redis_password: Option<String>,
    /// Redis logical database
    pub redis_db: i64,
    /// Maximum message content length in characters
    pub max_message_length: usize,
    /// Minimum password length for the account endpoints sharing this config
    pub password_min_length: usize,
    /// Base URL prefixed to invite-link join paths, e.g. "https://chat.example.com"
    pub public_join_base_url: Option<String>,
    /// Bearer token for /admin/stats (None = endpoint hidden)
    pub admin_token: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET is required")?;
        if jwt_secret.is_empty() {
            bail!("JWT_SECRET is required");
        }

        let csrf_mode = match env::var("CSRF_MODE")
            .unwrap_or_else(|_| "origin".to_string())
            .to_lowercase()
            .as_str()
        {
            "token" => CsrfMode::Token,
            "origin" => CsrfMode::Origin,
            "off" => CsrfMode::Off,
            other => bail!("Invalid CSRF_MODE: {}", other),
        };

        let password_min_length: usize = env::var("PASSWORD_MIN_LENGTH")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid PASSWORD_MIN_LENGTH")?;
        if password_min_length < 8 {
            bail!("PASSWORD_MIN_LENGTH must be at least 8");
        }

        let config = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid PORT")?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/relaychat.db".to_string()),
            jwt_secret,
            allowed_origins: env::var("ALLOWED_ORIGINS").ok().filter(|s| !s.is_empty()),
            csrf_mode,
            redis_addr: env::var("REDIS_ADDR").ok().filter(|s| !s.is_empty()),
            redis_password: env::var("REDIS_PASSWORD").ok().filter(|s| !s.is_empty()),
            redis_db: env::var("REDIS_DB")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid REDIS_DB")?,
            max_message_length: env::var("MAX_MESSAGE_LENGTH")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()
                .context("Invalid MAX_MESSAGE_LENGTH")?,
            password_min_length,
            public_join_base_url: env::var("PUBLIC_JOIN_BASE_URL")
                .ok()
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            admin_token: env::var("ADMIN_TOKEN").ok().filter(|s| !s.is_empty()),
        };

        Ok(config)
    }

    /// Origins allowed to open browser connections. Empty = permissive.
    pub fn origin_allowlist(&self) -> Vec<String> {
        self.allowed_origins
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
