//! User lookups and hub online-transitions
//!
//! Registration and profile editing live in the external auth service; the
//! core reads profiles for responses and owns the online flag.

use anyhow::Result;
use sqlx::{Pool, Sqlite};

use crate::models::UserRecord;

const SELECT_USER: &str =
    "SELECT id, username, email, role, is_online, last_seen FROM users";

pub async fn find_by_id(pool: &Pool<Sqlite>, id: i64) -> Result<Option<UserRecord>> {
    let row = sqlx::query_as::<_, UserRecord>(&format!("{} WHERE id = ?1", SELECT_USER))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn exists(pool: &Pool<Sqlite>, id: i64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?1")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// Case-insensitive username probe, used when validating public group handles.
pub async fn username_taken(pool: &Pool<Sqlite>, name: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM users WHERE username = ?1 COLLATE NOCASE",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Hub register transition.
pub async fn set_online(pool: &Pool<Sqlite>, user_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE users SET is_online = 1, last_seen = strftime('%s', 'now') WHERE id = ?1",
    )
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Hub unregister transition.
pub async fn set_offline(pool: &Pool<Sqlite>, user_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE users SET is_online = 0, last_seen = strftime('%s', 'now') WHERE id = ?1",
    )
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert a user row. The registration endpoint proper is external; this is
/// the seam it writes through, and what tests use to seed fixtures.
pub async fn create(
    pool: &Pool<Sqlite>,
    username: &str,
    email: &str,
    password_hash: &str,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO users (username, email, password_hash)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}
