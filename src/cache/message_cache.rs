//! Message-related cache keys
//!
//! | key                      | value                         | TTL   |
//! |--------------------------|-------------------------------|-------|
//! | `conv:<min>:<max>`       | recent direct messages        | 5 min |
//! | `group:<g>`              | recent group messages         | 5 min |
//! | `convlist:<u>`           | conversation list payload     | 2 min |
//! | `unread:<u>:<peer>`      | unread counter                | 1 min |
//!
//! Values are MessagePack. Any write that changes the underlying data must
//! attempt the matching delete; the TTL covers a lost invalidation.

use super::{best_effort, RedisCache};
use crate::models::MessageRecord;

const CONVERSATION_TTL: u64 = 5 * 60;
const CONV_LIST_TTL: u64 = 2 * 60;
const UNREAD_TTL: u64 = 60;

#[derive(Clone)]
pub struct MessageCache {
    redis: Option<RedisCache>,
}

/// Smaller id first so both directions of a pair share one key.
fn conversation_key(user_a: i64, user_b: i64) -> String {
    let (lo, hi) = if user_a <= user_b { (user_a, user_b) } else { (user_b, user_a) };
    format!("conv:{}:{}", lo, hi)
}

impl MessageCache {
    pub fn new(redis: Option<RedisCache>) -> Self {
        MessageCache { redis }
    }

    pub fn disabled() -> Self {
        MessageCache { redis: None }
    }

    pub async fn get_conversation(&self, user_a: i64, user_b: i64) -> Option<Vec<MessageRecord>> {
        let redis = self.redis.as_ref()?;
        let data = redis.get(&conversation_key(user_a, user_b)).await.ok()??;
        rmp_serde::from_slice(&data).ok()
    }

    pub async fn set_conversation(&self, user_a: i64, user_b: i64, messages: &[MessageRecord]) {
        let Some(redis) = self.redis.as_ref() else { return };
        let Ok(data) = rmp_serde::to_vec(messages) else { return };
        best_effort(
            "set conversation",
            redis.set(&conversation_key(user_a, user_b), &data, CONVERSATION_TTL).await,
        );
    }

    pub async fn invalidate_conversation(&self, user_a: i64, user_b: i64) {
        let Some(redis) = self.redis.as_ref() else { return };
        best_effort(
            "invalidate conversation",
            redis.delete(&conversation_key(user_a, user_b)).await,
        );
    }

    pub async fn get_group_conversation(&self, group_id: i64) -> Option<Vec<MessageRecord>> {
        let redis = self.redis.as_ref()?;
        let data = redis.get(&format!("group:{}", group_id)).await.ok()??;
        rmp_serde::from_slice(&data).ok()
    }

    pub async fn set_group_conversation(&self, group_id: i64, messages: &[MessageRecord]) {
        let Some(redis) = self.redis.as_ref() else { return };
        let Ok(data) = rmp_serde::to_vec(messages) else { return };
        best_effort(
            "set group conversation",
            redis.set(&format!("group:{}", group_id), &data, CONVERSATION_TTL).await,
        );
    }

    pub async fn invalidate_group_conversation(&self, group_id: i64) {
        let Some(redis) = self.redis.as_ref() else { return };
        best_effort(
            "invalidate group conversation",
            redis.delete(&format!("group:{}", group_id)).await,
        );
    }

    /// Cached first page of the conversation list, cursor fields included.
    pub async fn get_conversation_list(&self, user_id: i64) -> Option<serde_json::Value> {
        let redis = self.redis.as_ref()?;
        let data = redis.get(&format!("convlist:{}", user_id)).await.ok()??;
        rmp_serde::from_slice(&data).ok()
    }

    pub async fn set_conversation_list(&self, user_id: i64, payload: &serde_json::Value) {
        let Some(redis) = self.redis.as_ref() else { return };
        let Ok(data) = rmp_serde::to_vec(payload) else { return };
        best_effort(
            "set conversation list",
            redis.set(&format!("convlist:{}", user_id), &data, CONV_LIST_TTL).await,
        );
    }

    pub async fn invalidate_conversation_list(&self, user_id: i64) {
        let Some(redis) = self.redis.as_ref() else { return };
        best_effort(
            "invalidate conversation list",
            redis.delete(&format!("convlist:{}", user_id)).await,
        );
    }

    pub async fn invalidate_unread(&self, user_id: i64, peer_id: i64) {
        let Some(redis) = self.redis.as_ref() else { return };
        best_effort(
            "invalidate unread",
            redis.delete(&format!("unread:{}:{}", user_id, peer_id)).await,
        );
    }
}
