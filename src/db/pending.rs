//! Pending queue
//!
//! Durable per-user outbox of undelivered payloads. A row is removed only
//! after the recipient's live channel has accepted the payload; capped
//! retries extend the cooldown, they never drop the row.

use anyhow::Result;
use sqlx::{Pool, Sqlite};

use crate::models::PendingRecord;

/// Queue a serialized envelope for later delivery. Only valid for payloads
/// anchored to a durable message id.
pub async fn enqueue(
    pool: &Pool<Sqlite>,
    user_id: i64,
    message_id: i64,
    payload: &str,
    priority: i64,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO pending_messages (user_id, message_id, payload, priority)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(user_id)
    .bind(message_id)
    .bind(payload)
    .bind(priority)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Pending rows for one user: higher priority first, then oldest first.
pub async fn get_pending_for_user(
    pool: &Pool<Sqlite>,
    user_id: i64,
    limit: i64,
) -> Result<Vec<PendingRecord>> {
    let rows = sqlx::query_as::<_, PendingRecord>(
        r#"
        SELECT id, user_id, message_id, payload, priority, attempts,
               last_attempt, next_retry, created_at
        FROM pending_messages
        WHERE user_id = ?1
        ORDER BY priority DESC, created_at ASC, id ASC
        LIMIT ?2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Rows whose backoff deadline has passed (or that were never attempted).
pub async fn get_retryable(pool: &Pool<Sqlite>, limit: i64) -> Result<Vec<PendingRecord>> {
    let rows = sqlx::query_as::<_, PendingRecord>(
        r#"
        SELECT id, user_id, message_id, payload, priority, attempts,
               last_attempt, next_retry, created_at
        FROM pending_messages
        WHERE next_retry IS NULL OR next_retry <= strftime('%s', 'now')
        ORDER BY priority DESC, next_retry ASC, id ASC
        LIMIT ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Record an attempt: bump the counter and push out the backoff deadline.
/// Does not delete.
pub async fn mark_attempted(
    pool: &Pool<Sqlite>,
    id: i64,
    attempts: i64,
    next_retry: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pending_messages
        SET attempts = ?2,
            last_attempt = strftime('%s', 'now'),
            next_retry = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(attempts)
    .bind(next_retry)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove a row after confirmed delivery.
pub async fn delete(pool: &Pool<Sqlite>, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM pending_messages WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a batch of delivered rows.
/// SQLite caps bound parameters; chunk large batches.
pub async fn delete_batch(pool: &Pool<Sqlite>, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    for chunk in ids.chunks(500) {
        let placeholders: String = chunk
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("DELETE FROM pending_messages WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        query.execute(pool).await?;
    }
    Ok(())
}

pub async fn count_for_user(pool: &Pool<Sqlite>, user_id: i64) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_messages WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn depth(pool: &Pool<Sqlite>) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_messages")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Evict rows older than `older_than_secs`. The only path that permanently
/// drops an undelivered payload.
pub async fn cleanup_old(pool: &Pool<Sqlite>, older_than_secs: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM pending_messages
        WHERE created_at < (strftime('%s', 'now') - ?1)
        "#,
    )
    .bind(older_than_secs)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
