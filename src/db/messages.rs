//! Message store
//!
//! Append-only store keyed by a monotonically increasing id. `(client_id,
//! sender_id)` is the idempotency key; `id` is the canonical cursor.

use anyhow::Result;
use sqlx::{Pool, Sqlite};

use crate::models::{ConversationId, MessageRecord};

const SELECT_WITH_SENDER: &str = r#"
SELECT m.id, m.client_id, m.sender_id, m.recipient_id, m.group_id,
       m.content, m.message_type, m.status, m.is_delivered, m.is_read,
       m.delivered_at, m.read_at, m.created_at,
       u.username AS sender_username, u.email AS sender_email,
       u.is_online AS sender_is_online, u.last_seen AS sender_last_seen
FROM messages m
JOIN users u ON u.id = m.sender_id
"#;

/// Outcome of an insert attempt under the idempotency constraint.
pub enum CreateOutcome {
    Created(MessageRecord),
    /// The `(client_id, sender_id)` pair already exists; the caller re-reads
    /// the winner.
    DuplicateClientId,
    /// Group insert rejected: the sender's membership was gone at insert
    /// time (revoked between the caller's check and the write).
    NotGroupMember,
}

/// Persist a new message. Exactly one of `recipient_id` / `group_id` must be
/// set (callers validate the shape). Group inserts are gated on membership in
/// the statement itself so a revocation racing the caller's check still
/// fails cleanly.
pub async fn create(
    pool: &Pool<Sqlite>,
    sender_id: i64,
    client_id: &str,
    recipient_id: Option<i64>,
    group_id: Option<i64>,
    content: &str,
    message_type: &str,
) -> Result<CreateOutcome> {
    let result = if let Some(group_id) = group_id {
        sqlx::query(
            r#"
            INSERT INTO messages (client_id, sender_id, recipient_id, group_id, content, message_type, status)
            SELECT ?1, ?2, NULL, ?3, ?4, ?5, 'sent'
            WHERE EXISTS (
                SELECT 1 FROM group_members WHERE group_id = ?3 AND user_id = ?2
            )
            "#,
        )
        .bind(client_id)
        .bind(sender_id)
        .bind(group_id)
        .bind(content)
        .bind(message_type)
        .execute(pool)
        .await
    } else {
        sqlx::query(
            r#"
            INSERT INTO messages (client_id, sender_id, recipient_id, group_id, content, message_type, status)
            VALUES (?1, ?2, ?3, NULL, ?4, ?5, 'sent')
            "#,
        )
        .bind(client_id)
        .bind(sender_id)
        .bind(recipient_id)
        .bind(content)
        .bind(message_type)
        .execute(pool)
        .await
    };

    match result {
        Ok(r) => {
            if r.rows_affected() == 0 {
                return Ok(CreateOutcome::NotGroupMember);
            }
            let message = find_by_id(pool, r.last_insert_rowid())
                .await?
                .ok_or_else(|| anyhow::anyhow!("inserted message vanished"))?;
            Ok(CreateOutcome::Created(message))
        }
        Err(e) => {
            let unique = e
                .as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false);
            if unique {
                Ok(CreateOutcome::DuplicateClientId)
            } else {
                Err(e.into())
            }
        }
    }
}

pub async fn find_by_id(pool: &Pool<Sqlite>, id: i64) -> Result<Option<MessageRecord>> {
    let row = sqlx::query_as::<_, MessageRecord>(
        &format!("{} WHERE m.id = ?1", SELECT_WITH_SENDER),
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Idempotency probe: the message previously persisted for this client token.
pub async fn find_by_client_id(
    pool: &Pool<Sqlite>,
    client_id: &str,
    sender_id: i64,
) -> Result<Option<MessageRecord>> {
    let row = sqlx::query_as::<_, MessageRecord>(
        &format!("{} WHERE m.client_id = ?1 AND m.sender_id = ?2", SELECT_WITH_SENDER),
    )
    .bind(client_id)
    .bind(sender_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

fn clamp_limit(limit: i64, max: i64) -> i64 {
    limit.clamp(1, max)
}

/// Direct messages between a pair, newest first. `cursor = 0` means newest.
pub async fn find_conversation_cursor(
    pool: &Pool<Sqlite>,
    user_a: i64,
    user_b: i64,
    cursor: i64,
    limit: i64,
) -> Result<Vec<MessageRecord>> {
    let limit = clamp_limit(limit, 100);
    let sql = format!(
        r#"{}
        WHERE m.group_id IS NULL
          AND ((m.sender_id = ?1 AND m.recipient_id = ?2)
            OR (m.sender_id = ?2 AND m.recipient_id = ?1))
          AND (?3 = 0 OR m.id < ?3)
        ORDER BY m.id DESC
        LIMIT ?4
        "#,
        SELECT_WITH_SENDER
    );
    let rows = sqlx::query_as::<_, MessageRecord>(&sql)
        .bind(user_a)
        .bind(user_b)
        .bind(cursor)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Group messages, newest first, same cursor shape as the direct window.
pub async fn find_group_messages(
    pool: &Pool<Sqlite>,
    group_id: i64,
    cursor: i64,
    limit: i64,
) -> Result<Vec<MessageRecord>> {
    let limit = clamp_limit(limit, 100);
    let sql = format!(
        r#"{}
        WHERE m.group_id = ?1
          AND (?2 = 0 OR m.id < ?2)
        ORDER BY m.id DESC
        LIMIT ?3
        "#,
        SELECT_WITH_SENDER
    );
    let rows = sqlx::query_as::<_, MessageRecord>(&sql)
        .bind(group_id)
        .bind(cursor)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Forward delta for sync: everything after `last_message_id`, ascending.
///
/// For group conversations membership is enforced in the query itself; a
/// non-member reads nothing. For user conversations the window is restricted
/// to the pair in either direction.
pub async fn find_messages_since(
    pool: &Pool<Sqlite>,
    requesting_user: i64,
    conversation: ConversationId,
    last_message_id: i64,
    limit: i64,
) -> Result<Vec<MessageRecord>> {
    let limit = clamp_limit(limit, 200);

    let rows = match conversation {
        ConversationId::User(peer) => {
            let sql = format!(
                r#"{}
                WHERE m.id > ?1
                  AND m.group_id IS NULL
                  AND ((m.sender_id = ?2 AND m.recipient_id = ?3)
                    OR (m.sender_id = ?3 AND m.recipient_id = ?2))
                ORDER BY m.id ASC
                LIMIT ?4
                "#,
                SELECT_WITH_SENDER
            );
            sqlx::query_as::<_, MessageRecord>(&sql)
                .bind(last_message_id)
                .bind(requesting_user)
                .bind(peer)
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
        ConversationId::Group(group_id) => {
            let sql = format!(
                r#"{}
                JOIN group_members gm ON gm.group_id = m.group_id AND gm.user_id = ?2
                WHERE m.id > ?1
                  AND m.group_id = ?3
                ORDER BY m.id ASC
                LIMIT ?4
                "#,
                SELECT_WITH_SENDER
            );
            sqlx::query_as::<_, MessageRecord>(&sql)
                .bind(last_message_id)
                .bind(requesting_user)
                .bind(group_id)
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows)
}

/// Mark a message delivered. Idempotent; never regresses `read`.
pub async fn mark_delivered(pool: &Pool<Sqlite>, message_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE messages
        SET is_delivered = 1,
            delivered_at = COALESCE(delivered_at, strftime('%s', 'now')),
            status = CASE WHEN status = 'read' THEN 'read' ELSE 'delivered' END
        WHERE id = ?1
        "#,
    )
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a message read. Read implies delivered.
pub async fn mark_read(pool: &Pool<Sqlite>, message_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE messages
        SET is_read = 1,
            is_delivered = 1,
            read_at = COALESCE(read_at, strftime('%s', 'now')),
            delivered_at = COALESCE(delivered_at, strftime('%s', 'now')),
            status = 'read'
        WHERE id = ?1
        "#,
    )
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Bulk-mark every unread direct message from `peer` to `user`.
/// Returns the number of rows cleared.
pub async fn mark_conversation_read(
    pool: &Pool<Sqlite>,
    user_id: i64,
    peer_id: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE messages
        SET is_read = 1,
            is_delivered = 1,
            read_at = strftime('%s', 'now'),
            delivered_at = COALESCE(delivered_at, strftime('%s', 'now')),
            status = 'read'
        WHERE group_id IS NULL
          AND recipient_id = ?1
          AND sender_id = ?2
          AND is_read = 0
        "#,
    )
    .bind(user_id)
    .bind(peer_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Latest direct-message id between a pair (0 if none).
pub async fn latest_direct_id(pool: &Pool<Sqlite>, user_a: i64, user_b: i64) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(MAX(id), 0) FROM messages
        WHERE group_id IS NULL
          AND ((sender_id = ?1 AND recipient_id = ?2)
            OR (sender_id = ?2 AND recipient_id = ?1))
        "#,
    )
    .bind(user_a)
    .bind(user_b)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Latest message id in a group (0 if none).
pub async fn latest_group_id(pool: &Pool<Sqlite>, group_id: i64) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(id), 0) FROM messages WHERE group_id = ?1",
    )
    .bind(group_id)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn is_message_in_group(
    pool: &Pool<Sqlite>,
    message_id: i64,
    group_id: i64,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE id = ?1 AND group_id = ?2",
    )
    .bind(message_id)
    .bind(group_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}
