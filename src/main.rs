use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use relaychat_server::cache::{MessageCache, RedisCache, UserCache};
use relaychat_server::config::ServerConfig;
use relaychat_server::hub::Hub;
use relaychat_server::metrics::Metrics;
use relaychat_server::{db, retry, routing, AppState};

// Use jemalloc on Linux for reduced fragmentation and better throughput
// on long-running server processes.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaychat_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting RelayChat server");

    let config = Arc::new(ServerConfig::from_env()?);
    info!("Configuration loaded");

    let db_pool = db::init(&config.database_url).await?;
    info!("Database initialized");

    let redis = match config.redis_addr.as_deref() {
        Some(addr) => {
            match RedisCache::connect(addr, config.redis_password.as_deref(), config.redis_db).await
            {
                Ok(cache) => {
                    info!("Redis cache connected");
                    Some(cache)
                }
                Err(e) => {
                    warn!("Redis connection failed: {}. Running without cache.", e);
                    None
                }
            }
        }
        None => {
            info!("No REDIS_ADDR configured, running without cache");
            None
        }
    };

    let metrics = Arc::new(Metrics::new());
    let hub = Arc::new(Hub::new(db_pool.clone(), Arc::clone(&metrics)));

    let state = AppState {
        db: db_pool.clone(),
        config: Arc::clone(&config),
        hub: Arc::clone(&hub),
        message_cache: MessageCache::new(redis.clone()),
        user_cache: UserCache::new(redis),
        metrics: Arc::clone(&metrics),
    };

    // Background workers: retry scan, queue eviction, channel health.
    tokio::spawn(retry::run(Arc::clone(&hub), db_pool.clone(), Arc::clone(&metrics)));
    tokio::spawn(retry::run_cleanup(db_pool.clone()));
    tokio::spawn(Arc::clone(&hub).run_health_checker());
    info!("Background workers started");

    let app = routing::create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining connections...");
    };

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Checkpoint SQLite WAL before exit
    info!("Checkpointing SQLite WAL...");
    if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&db_pool)
        .await
    {
        warn!("WAL checkpoint failed: {}", e);
    }

    info!("Server stopped cleanly");
    Ok(())
}
