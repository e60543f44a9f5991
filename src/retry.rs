//! Retry Worker
//!
//! Periodic scan of the pending queue. Offline recipients push the row's
//! backoff deadline out exponentially; online recipients get one direct
//! write attempt. Capped retries never drop a row — they park it for an
//! hour. Only the cleanup task permanently evicts ancient rows.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{Pool, Sqlite};
use tracing::{error, info, warn};

use crate::db::{now_unix, pending};
use crate::hub::Hub;
use crate::metrics::Metrics;

const TICK_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_BATCH: i64 = 100;
const MAX_RETRIES: i64 = 5;
const BASE_RETRY_DELAY_SECS: i64 = 2;
const PARK_SECS: i64 = 3600;

/// How long undeliverable rows survive before eviction, and how often the
/// cleanup runs.
const CLEANUP_HORIZON_SECS: i64 = 7 * 24 * 3600;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Seconds until the next attempt for a row that just failed its
/// `attempts`-th delivery (post-increment). Doubles from the 2 s base and
/// parks at one hour once the retry cap is reached.
pub fn backoff_secs(attempts: i64) -> i64 {
    if attempts >= MAX_RETRIES {
        PARK_SECS
    } else {
        BASE_RETRY_DELAY_SECS << attempts
    }
}

/// 5-second scan loop. Runs until the process exits.
pub async fn run(hub: Arc<Hub>, pool: Pool<Sqlite>, metrics: Arc<Metrics>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        ticker.tick().await;

        let retryable = match pending::get_retryable(&pool, RETRY_BATCH).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Error fetching retryable messages: {}", e);
                continue;
            }
        };

        for pm in retryable {
            if !hub.is_online(pm.user_id).await {
                // Still offline: extend the cooldown, keep the row.
                let attempts = pm.attempts + 1;
                let next_retry = now_unix() + backoff_secs(attempts);
                if let Err(e) = pending::mark_attempted(&pool, pm.id, attempts, next_retry).await {
                    error!("Error marking attempt for pending message {}: {}", pm.id, e);
                }
                continue;
            }

            let data = match serde_json::from_str::<serde_json::Value>(&pm.payload) {
                Ok(value) => value,
                Err(e) => {
                    error!("Error decoding pending message {} for retry: {}", pm.id, e);
                    continue;
                }
            };

            metrics.incr_retries();
            match hub.try_deliver(pm.user_id, &data).await {
                Ok(()) => {
                    info!("Delivered pending message {} to user {}", pm.id, pm.user_id);
                    if let Err(e) = pending::delete(&pool, pm.id).await {
                        error!("Error deleting pending message {}: {}", pm.id, e);
                    }
                }
                Err(e) => {
                    warn!("Retry delivery failed for user {}: {}", pm.user_id, e);
                    let attempts = pm.attempts + 1;
                    let next_retry = now_unix() + backoff_secs(attempts);
                    if let Err(e) = pending::mark_attempted(&pool, pm.id, attempts, next_retry).await
                    {
                        error!("Error marking attempt for pending message {}: {}", pm.id, e);
                    }
                }
            }
        }
    }
}

/// Daily eviction of rows that outlived the delivery horizon.
pub async fn run_cleanup(pool: Pool<Sqlite>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        ticker.tick().await;
        match pending::cleanup_old(&pool, CLEANUP_HORIZON_SECS).await {
            Ok(0) => {}
            Ok(n) => info!("Pending-queue cleanup: evicted {} undeliverable rows", n),
            Err(e) => warn!("Pending-queue cleanup error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_parks() {
        // attempts counter is post-increment: first failed attempt = 1.
        assert_eq!(backoff_secs(1), 4);
        assert_eq!(backoff_secs(2), 8);
        assert_eq!(backoff_secs(3), 16);
        assert_eq!(backoff_secs(4), 32);
        // At the cap the row is parked, not dropped.
        assert_eq!(backoff_secs(5), 3600);
        assert_eq!(backoff_secs(6), 3600);
    }
}
