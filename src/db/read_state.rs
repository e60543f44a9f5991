//! Group read-state store
//!
//! Per-(group, user) monotonic cursor. The upsert takes
//! `MAX(existing, proposed)` atomically so concurrent updates from two
//! devices of the same user can never move the cursor backwards.

use anyhow::Result;
use sqlx::{Pool, Sqlite};

use crate::models::GroupReadStateRecord;

/// Create the zero row on join. No-op if it already exists.
pub async fn ensure_for_member(pool: &Pool<Sqlite>, group_id: i64, user_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO group_read_states (group_id, user_id, last_read_message_id)
        VALUES (?1, ?2, 0)
        ON CONFLICT(group_id, user_id) DO NOTHING
        "#,
    )
    .bind(group_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove the row on leave.
pub async fn delete_for_member(pool: &Pool<Sqlite>, group_id: i64, user_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM group_read_states WHERE group_id = ?1 AND user_id = ?2")
        .bind(group_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Monotonic upsert: `new_value := max(existing, proposed)`.
pub async fn upsert_monotonic(
    pool: &Pool<Sqlite>,
    group_id: i64,
    user_id: i64,
    last_read_message_id: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO group_read_states (group_id, user_id, last_read_message_id, updated_at)
        VALUES (?1, ?2, ?3, strftime('%s', 'now'))
        ON CONFLICT(group_id, user_id) DO UPDATE
        SET last_read_message_id = MAX(group_read_states.last_read_message_id, excluded.last_read_message_id),
            updated_at = strftime('%s', 'now')
        "#,
    )
    .bind(group_id)
    .bind(user_id)
    .bind(last_read_message_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(
    pool: &Pool<Sqlite>,
    group_id: i64,
    user_id: i64,
) -> Result<Option<GroupReadStateRecord>> {
    let row = sqlx::query_as::<_, GroupReadStateRecord>(
        r#"
        SELECT group_id, user_id, last_read_message_id, updated_at
        FROM group_read_states
        WHERE group_id = ?1 AND user_id = ?2
        "#,
    )
    .bind(group_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_by_group(
    pool: &Pool<Sqlite>,
    group_id: i64,
) -> Result<Vec<GroupReadStateRecord>> {
    let rows = sqlx::query_as::<_, GroupReadStateRecord>(
        r#"
        SELECT group_id, user_id, last_read_message_id, updated_at
        FROM group_read_states
        WHERE group_id = ?1
        ORDER BY user_id ASC
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
