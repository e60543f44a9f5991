//! Online-presence cache
//!
//! `online:users` set plus a per-user marker whose 90 s TTL matches the
//! hub's pong timeout, so a crashed process cannot leave users marked online
//! forever.

use super::{best_effort, RedisCache};

const ONLINE_MARKER_TTL: u64 = 90;

#[derive(Clone)]
pub struct UserCache {
    redis: Option<RedisCache>,
}

impl UserCache {
    pub fn new(redis: Option<RedisCache>) -> Self {
        UserCache { redis }
    }

    pub fn disabled() -> Self {
        UserCache { redis: None }
    }

    pub async fn set_user_online(&self, user_id: i64) {
        let Some(redis) = self.redis.as_ref() else { return };
        best_effort("online set add", redis.set_add("online:users", user_id).await);
        best_effort(
            "online marker",
            redis.set(&format!("online:{}", user_id), b"1", ONLINE_MARKER_TTL).await,
        );
    }

    pub async fn set_user_offline(&self, user_id: i64) {
        let Some(redis) = self.redis.as_ref() else { return };
        best_effort("online set remove", redis.set_remove("online:users", user_id).await);
        best_effort("online marker delete", redis.delete(&format!("online:{}", user_id)).await);
    }

    /// Extend the marker; called from the heartbeat path.
    pub async fn refresh_user_online(&self, user_id: i64) {
        let Some(redis) = self.redis.as_ref() else { return };
        best_effort(
            "online marker refresh",
            redis.set(&format!("online:{}", user_id), b"1", ONLINE_MARKER_TTL).await,
        );
    }

    pub async fn is_user_online(&self, user_id: i64) -> bool {
        let Some(redis) = self.redis.as_ref() else { return false };
        redis.exists(&format!("online:{}", user_id)).await.unwrap_or(false)
    }

    pub async fn online_users(&self) -> Vec<i64> {
        let Some(redis) = self.redis.as_ref() else { return Vec::new() };
        redis.set_members("online:users").await.unwrap_or_default()
    }
}
