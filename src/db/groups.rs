//! Groups, membership and invite links

use anyhow::Result;
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::{Pool, Sqlite};

use crate::db::read_state;
use crate::models::{GroupRecord, InviteLinkRecord, UserRecord};

const SELECT_GROUP: &str = r#"
SELECT id, name, description, icon, creator_id, is_public, handle, created_at, updated_at
FROM groups
"#;

/// Create a group and add the creator as its first (admin) member.
pub async fn create(
    pool: &Pool<Sqlite>,
    name: &str,
    description: &str,
    icon: &str,
    creator_id: i64,
    is_public: bool,
    handle: Option<&str>,
) -> Result<GroupRecord> {
    let result = sqlx::query(
        r#"
        INSERT INTO groups (name, description, icon, creator_id, is_public, handle)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(name)
    .bind(description)
    .bind(icon)
    .bind(creator_id)
    .bind(is_public)
    .bind(handle)
    .execute(pool)
    .await?;
    let group_id = result.last_insert_rowid();

    add_member(pool, group_id, creator_id, "admin").await?;

    find_by_id(pool, group_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("created group vanished"))
}

pub async fn find_by_id(pool: &Pool<Sqlite>, id: i64) -> Result<Option<GroupRecord>> {
    let row = sqlx::query_as::<_, GroupRecord>(&format!("{} WHERE id = ?1", SELECT_GROUP))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Resolve a public group by its handle, case-insensitively. Private groups
/// are invisible to handle lookups.
pub async fn find_public_by_handle(
    pool: &Pool<Sqlite>,
    handle: &str,
) -> Result<Option<GroupRecord>> {
    let row = sqlx::query_as::<_, GroupRecord>(&format!(
        "{} WHERE handle = ?1 COLLATE NOCASE AND is_public = 1",
        SELECT_GROUP
    ))
    .bind(handle)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Substring search over public groups, matching handle or name.
pub async fn search_public(
    pool: &Pool<Sqlite>,
    query: &str,
    limit: i64,
) -> Result<Vec<GroupRecord>> {
    let limit = limit.clamp(1, 50);
    let pattern = format!("%{}%", query);
    let rows = sqlx::query_as::<_, GroupRecord>(&format!(
        r#"{}
        WHERE is_public = 1
          AND (handle LIKE ?1 OR name LIKE ?1)
        ORDER BY name COLLATE NOCASE ASC, id ASC
        LIMIT ?2
        "#,
        SELECT_GROUP
    ))
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn handle_taken(pool: &Pool<Sqlite>, handle: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM groups WHERE handle = ?1 COLLATE NOCASE",
    )
    .bind(handle)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Add a member and create their zero read-state row.
pub async fn add_member(
    pool: &Pool<Sqlite>,
    group_id: i64,
    user_id: i64,
    role: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO group_members (group_id, user_id, role)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(group_id, user_id) DO NOTHING
        "#,
    )
    .bind(group_id)
    .bind(user_id)
    .bind(role)
    .execute(pool)
    .await?;

    read_state::ensure_for_member(pool, group_id, user_id).await?;
    Ok(())
}

/// Remove a member and their read-state row.
pub async fn remove_member(pool: &Pool<Sqlite>, group_id: i64, user_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2")
        .bind(group_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    read_state::delete_for_member(pool, group_id, user_id).await?;
    Ok(())
}

pub async fn is_member(pool: &Pool<Sqlite>, group_id: i64, user_id: i64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
    )
    .bind(group_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn members(pool: &Pool<Sqlite>, group_id: i64) -> Result<Vec<UserRecord>> {
    let rows = sqlx::query_as::<_, UserRecord>(
        r#"
        SELECT u.id, u.username, u.email, u.role, u.is_online, u.last_seen
        FROM users u
        JOIN group_members gm ON gm.user_id = u.id
        WHERE gm.group_id = ?1
        ORDER BY u.id ASC
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn member_ids(pool: &Pool<Sqlite>, group_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id ASC",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

// ---------------------------------------------------------------------------
// Invite links
// ---------------------------------------------------------------------------

/// Mint an invite link with a random 32-byte token.
pub async fn create_invite_link(
    pool: &Pool<Sqlite>,
    group_id: i64,
    created_by: i64,
    max_uses: Option<i64>,
    expires_at: Option<i64>,
) -> Result<InviteLinkRecord> {
    let mut token_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut token_bytes);
    let token = hex::encode(token_bytes);

    let result = sqlx::query(
        r#"
        INSERT INTO group_invite_links (token, group_id, created_by, max_uses, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&token)
    .bind(group_id)
    .bind(created_by)
    .bind(max_uses)
    .bind(expires_at)
    .execute(pool)
    .await?;

    Ok(InviteLinkRecord {
        id: result.last_insert_rowid(),
        token,
        group_id,
        created_by,
        expires_at,
        max_uses,
        used_count: 0,
        revoked_at: None,
    })
}

pub async fn find_invite_by_token(
    pool: &Pool<Sqlite>,
    token: &str,
) -> Result<Option<InviteLinkRecord>> {
    let row = sqlx::query_as::<_, InviteLinkRecord>(
        r#"
        SELECT id, token, group_id, created_by, expires_at, max_uses, used_count, revoked_at
        FROM group_invite_links
        WHERE token = ?1
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Consume one use of a link, guarded so a concurrent joiner cannot push the
/// counter past the cap. Returns false when the link was exhausted meanwhile.
pub async fn increment_invite_use(pool: &Pool<Sqlite>, id: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE group_invite_links
        SET used_count = used_count + 1
        WHERE id = ?1
          AND revoked_at IS NULL
          AND (max_uses IS NULL OR used_count < max_uses)
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn revoke_invite(pool: &Pool<Sqlite>, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE group_invite_links SET revoked_at = strftime('%s', 'now') WHERE id = ?1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
