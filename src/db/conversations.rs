//! Conversation indexer
//!
//! One windowed aggregation produces the unified DM + group conversation
//! list: within each partition (peer pair for DMs, group for groups) only the
//! newest row survives, with the unread count summed over the whole partition
//! before the filter. Empty groups are synthesised so a freshly created group
//! appears before its first message. Pagination is a strict keyset cursor on
//! `(last_activity, message_id)`.

use anyhow::Result;
use sqlx::{Pool, Sqlite};

use crate::models::{ConversationRow, RecentPeerRow};

const UNIFIED_QUERY: &str = r#"
WITH dm_ranked AS (
    SELECT
        'dm' AS conversation_type,
        CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END AS peer_id,
        peer.username AS peer_username,
        peer.email AS peer_email,
        peer.is_online AS peer_is_online,
        peer.last_seen AS peer_last_seen,
        NULL AS group_id,
        NULL AS group_name,
        NULL AS group_icon,
        NULL AS member_count,
        SUM(CASE WHEN m.recipient_id = ?1 AND m.is_read = 0 THEN 1 ELSE 0 END) OVER (
            PARTITION BY CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END
        ) AS unread_count,
        m.id AS message_id,
        m.client_id AS message_client_id,
        m.sender_id AS message_sender_id,
        m.recipient_id AS message_recipient_id,
        NULL AS message_group_id,
        m.content AS message_content,
        m.message_type AS message_type,
        m.status AS message_status,
        m.is_delivered AS message_is_delivered,
        m.is_read AS message_is_read,
        m.created_at AS message_created_at,
        m.created_at AS last_activity,
        sender.id AS sender_id,
        sender.username AS sender_username,
        sender.email AS sender_email,
        sender.is_online AS sender_is_online,
        sender.last_seen AS sender_last_seen,
        ROW_NUMBER() OVER (
            PARTITION BY CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END
            ORDER BY m.created_at DESC, m.id DESC
        ) AS rn
    FROM messages m
    JOIN users peer ON peer.id = CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END
    JOIN users sender ON sender.id = m.sender_id
    WHERE m.group_id IS NULL
      AND m.recipient_id IS NOT NULL
      AND (m.sender_id = ?1 OR m.recipient_id = ?1)
),
group_ranked AS (
    SELECT
        'group' AS conversation_type,
        NULL AS peer_id,
        NULL AS peer_username,
        NULL AS peer_email,
        NULL AS peer_is_online,
        NULL AS peer_last_seen,
        g.id AS group_id,
        g.name AS group_name,
        g.icon AS group_icon,
        (SELECT COUNT(*) FROM group_members gm2 WHERE gm2.group_id = g.id) AS member_count,
        SUM(CASE WHEN m.id > COALESCE(grs.last_read_message_id, 0) THEN 1 ELSE 0 END) OVER (
            PARTITION BY m.group_id
        ) AS unread_count,
        m.id AS message_id,
        m.client_id AS message_client_id,
        m.sender_id AS message_sender_id,
        NULL AS message_recipient_id,
        m.group_id AS message_group_id,
        m.content AS message_content,
        m.message_type AS message_type,
        m.status AS message_status,
        m.is_delivered AS message_is_delivered,
        m.is_read AS message_is_read,
        m.created_at AS message_created_at,
        m.created_at AS last_activity,
        sender.id AS sender_id,
        sender.username AS sender_username,
        sender.email AS sender_email,
        sender.is_online AS sender_is_online,
        sender.last_seen AS sender_last_seen,
        ROW_NUMBER() OVER (
            PARTITION BY m.group_id
            ORDER BY m.created_at DESC, m.id DESC
        ) AS rn
    FROM messages m
    JOIN group_members gm ON gm.group_id = m.group_id AND gm.user_id = ?1
    JOIN groups g ON g.id = m.group_id
    LEFT JOIN group_read_states grs ON grs.group_id = m.group_id AND grs.user_id = ?1
    JOIN users sender ON sender.id = m.sender_id
    WHERE m.group_id IS NOT NULL
),
group_empty AS (
    SELECT
        'group' AS conversation_type,
        NULL AS peer_id,
        NULL AS peer_username,
        NULL AS peer_email,
        NULL AS peer_is_online,
        NULL AS peer_last_seen,
        g.id AS group_id,
        g.name AS group_name,
        g.icon AS group_icon,
        (SELECT COUNT(*) FROM group_members gm2 WHERE gm2.group_id = g.id) AS member_count,
        0 AS unread_count,
        0 AS message_id,
        '' AS message_client_id,
        0 AS message_sender_id,
        NULL AS message_recipient_id,
        NULL AS message_group_id,
        '' AS message_content,
        '' AS message_type,
        '' AS message_status,
        0 AS message_is_delivered,
        0 AS message_is_read,
        g.updated_at AS message_created_at,
        g.updated_at AS last_activity,
        0 AS sender_id,
        '' AS sender_username,
        '' AS sender_email,
        0 AS sender_is_online,
        NULL AS sender_last_seen,
        1 AS rn
    FROM group_members gm
    JOIN groups g ON g.id = gm.group_id
    WHERE gm.user_id = ?1
      AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.group_id = g.id)
),
combined AS (
    SELECT * FROM dm_ranked WHERE rn = 1
    UNION ALL
    SELECT * FROM group_ranked WHERE rn = 1
    UNION ALL
    SELECT * FROM group_empty WHERE rn = 1
)
SELECT * FROM combined c
WHERE (?2 = 0 OR c.last_activity < ?2 OR (c.last_activity = ?2 AND c.message_id < ?3))
ORDER BY c.last_activity DESC, c.message_id DESC
LIMIT ?4
"#;

/// Unified conversation list for `user_id`. Pass `cursor = None` for the
/// first page. The caller asks for `limit + 1` rows to detect `has_more`;
/// this function only clamps.
pub async fn list_unified(
    pool: &Pool<Sqlite>,
    user_id: i64,
    cursor: Option<(i64, i64)>,
    limit: i64,
) -> Result<Vec<ConversationRow>> {
    let limit = limit.clamp(1, 101);
    let (cursor_activity, cursor_message_id) = cursor.unwrap_or((0, 0));

    let rows = sqlx::query_as::<_, ConversationRow>(UNIFIED_QUERY)
        .bind(user_id)
        .bind(cursor_activity)
        .bind(cursor_message_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Recent DM peers, newest conversation first. Seeds the conversation list
/// after a reinstall, before any sync state exists.
pub async fn recent_peers(
    pool: &Pool<Sqlite>,
    user_id: i64,
    limit: i64,
) -> Result<Vec<RecentPeerRow>> {
    let limit = limit.clamp(1, 100);
    let rows = sqlx::query_as::<_, RecentPeerRow>(
        r#"
        WITH ranked AS (
            SELECT
                CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END AS peer_id,
                peer.username AS peer_username,
                peer.email AS peer_email,
                peer.is_online AS peer_is_online,
                peer.last_seen AS peer_last_seen,
                m.id AS message_id,
                m.created_at AS last_activity,
                ROW_NUMBER() OVER (
                    PARTITION BY CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END
                    ORDER BY m.created_at DESC, m.id DESC
                ) AS rn
            FROM messages m
            JOIN users peer ON peer.id = CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END
            WHERE m.group_id IS NULL
              AND m.recipient_id IS NOT NULL
              AND (m.sender_id = ?1 OR m.recipient_id = ?1)
        )
        SELECT peer_id, peer_username, peer_email, peer_is_online, peer_last_seen,
               message_id, last_activity
        FROM ranked
        WHERE rn = 1
        ORDER BY last_activity DESC, message_id DESC
        LIMIT ?2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
