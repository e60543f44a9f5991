//! Configuration loading
//!
//! One test function: the scenarios mutate process-wide environment
//! variables and must not interleave.

use std::env;

use relaychat_server::config::{CsrfMode, ServerConfig};

fn clear_env() {
    for key in [
        "JWT_SECRET",
        "HOST",
        "PORT",
        "DATABASE_URL",
        "ALLOWED_ORIGINS",
        "CSRF_MODE",
        "REDIS_ADDR",
        "REDIS_PASSWORD",
        "REDIS_DB",
        "MAX_MESSAGE_LENGTH",
        "PASSWORD_MIN_LENGTH",
        "PUBLIC_JOIN_BASE_URL",
        "ADMIN_TOKEN",
    ] {
        env::remove_var(key);
    }
}

#[test]
fn config_from_env() {
    // Missing secret is fatal.
    clear_env();
    assert!(ServerConfig::from_env().is_err());

    // Defaults with only the secret set.
    clear_env();
    env::set_var("JWT_SECRET", "s3cret");
    let config = ServerConfig::from_env().expect("defaults");
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 8080);
    assert_eq!(config.csrf_mode, CsrfMode::Origin);
    assert_eq!(config.max_message_length, 4000);
    assert_eq!(config.password_min_length, 10);
    assert!(config.redis_addr.is_none());
    assert!(config.public_join_base_url.is_none());
    assert!(config.origin_allowlist().is_empty());

    // Full override.
    env::set_var("HOST", "127.0.0.1");
    env::set_var("PORT", "9001");
    env::set_var("ALLOWED_ORIGINS", "https://app.example.com, https://beta.example.com/");
    env::set_var("CSRF_MODE", "off");
    env::set_var("REDIS_ADDR", "127.0.0.1:6379");
    env::set_var("REDIS_DB", "3");
    env::set_var("MAX_MESSAGE_LENGTH", "1000");
    env::set_var("PASSWORD_MIN_LENGTH", "12");
    env::set_var("PUBLIC_JOIN_BASE_URL", "https://chat.example.com/");
    let config = ServerConfig::from_env().expect("overrides");
    assert_eq!(config.port, 9001);
    assert_eq!(config.csrf_mode, CsrfMode::Off);
    assert_eq!(config.redis_db, 3);
    assert_eq!(config.max_message_length, 1000);
    // Trailing slash is trimmed so join paths concatenate cleanly.
    assert_eq!(config.public_join_base_url.as_deref(), Some("https://chat.example.com"));
    assert_eq!(
        config.origin_allowlist(),
        vec!["https://app.example.com".to_string(), "https://beta.example.com".to_string()],
    );

    // Invalid values are rejected, not defaulted.
    env::set_var("CSRF_MODE", "sometimes");
    assert!(ServerConfig::from_env().is_err());
    env::set_var("CSRF_MODE", "origin");

    env::set_var("PASSWORD_MIN_LENGTH", "6");
    assert!(ServerConfig::from_env().is_err(), "below the floor of 8");
    env::set_var("PASSWORD_MIN_LENGTH", "10");

    env::set_var("PORT", "not-a-port");
    assert!(ServerConfig::from_env().is_err());

    clear_env();
}
