//! Cache layer
//!
//! TTL-bounded memoisation over Redis. Strictly optional: construction may
//! yield `None`, every getter treats an error as a miss, and every
//! setter/invalidation is best-effort. Correctness never depends on the
//! cache — the TTLs are the safety net when an invalidation is lost.

mod message_cache;
mod user_cache;

pub use message_cache::MessageCache;
pub use user_cache::UserCache;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;

/// Thin wrapper over a multiplexed async Redis connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

impl RedisCache {
    /// Connect and ping. Callers degrade to cacheless operation on error.
    pub async fn connect(addr: &str, password: Option<&str>, db: i64) -> Result<Self> {
        let url = match password {
            Some(pw) => format!("redis://:{}@{}/{}", pw, addr, db),
            None => format!("redis://{}/{}", addr, db),
        };
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let cache = RedisCache {
            conn: Arc::new(Mutex::new(conn)),
        };
        cache.ping().await?;
        Ok(cache)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.lock().await;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut *conn).await?;
        Ok(count > 0)
    }

    pub async fn set_add(&self, key: &str, member: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn set_remove(&self, key: &str, member: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock().await;
        let members: Vec<i64> = redis::cmd("SMEMBERS").arg(key).query_async(&mut *conn).await?;
        Ok(members)
    }
}

/// Log-and-swallow helper for the best-effort write paths.
pub(crate) fn best_effort(op: &'static str, result: Result<()>) {
    if let Err(e) = result {
        debug!("cache {} failed: {}", op, e);
    }
}
