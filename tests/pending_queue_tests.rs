//! Pending queue integration tests
//!
//! Ordering, the retryable scan, backoff bookkeeping (including the one-hour
//! park) and eviction.

use sqlx::SqlitePool;

use relaychat_server::db::{self, messages, now_unix, pending, users};
use relaychat_server::db::messages::CreateOutcome;
use relaychat_server::retry::backoff_secs;

async fn setup_test_db() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create test database");
    db::run_migrations(&pool).await.expect("migrations");
    pool
}

/// Seed a sender, a recipient and one durable message; returns
/// (recipient_id, message_id).
async fn seed(pool: &SqlitePool) -> (i64, i64) {
    let alice = users::create(pool, "alice", "alice@example.com", "x").await.unwrap();
    let bob = users::create(pool, "bob", "bob@example.com", "x").await.unwrap();
    let id = match messages::create(pool, alice, "c-1", Some(bob), None, "hi", "text")
        .await
        .unwrap()
    {
        CreateOutcome::Created(m) => m.id,
        _ => panic!("expected insert"),
    };
    (bob, id)
}

#[tokio::test]
async fn pending_rows_drain_by_priority_then_age() {
    let pool = setup_test_db().await;
    let (bob, message_id) = seed(&pool).await;

    let low_1 = pending::enqueue(&pool, bob, message_id, r#"{"type":"message"}"#, 0).await.unwrap();
    let low_2 = pending::enqueue(&pool, bob, message_id, r#"{"type":"message"}"#, 0).await.unwrap();
    let high = pending::enqueue(&pool, bob, message_id, r#"{"type":"message"}"#, 5).await.unwrap();

    let rows = pending::get_pending_for_user(&pool, bob, 50).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![high, low_1, low_2]);

    // Other users see nothing.
    let rows = pending::get_pending_for_user(&pool, bob + 100, 50).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn retryable_scan_honours_the_backoff_deadline() {
    let pool = setup_test_db().await;
    let (bob, message_id) = seed(&pool).await;

    let id = pending::enqueue(&pool, bob, message_id, r#"{"type":"message"}"#, 0).await.unwrap();

    // Never attempted: immediately eligible.
    let rows = pending::get_retryable(&pool, 100).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempts, 0);

    // Deadline in the future: skipped.
    pending::mark_attempted(&pool, id, 1, now_unix() + 60).await.unwrap();
    let rows = pending::get_retryable(&pool, 100).await.unwrap();
    assert!(rows.is_empty());

    // Deadline passed: eligible again, attempts preserved.
    pending::mark_attempted(&pool, id, 2, now_unix() - 1).await.unwrap();
    let rows = pending::get_retryable(&pool, 100).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempts, 2);
    assert!(rows[0].last_attempt.is_some());
}

#[tokio::test]
async fn capped_retries_park_the_row_instead_of_dropping_it() {
    let pool = setup_test_db().await;
    let (bob, message_id) = seed(&pool).await;

    let id = pending::enqueue(&pool, bob, message_id, r#"{"type":"message"}"#, 0).await.unwrap();

    // Walk the worker's backoff sequence: each offline tick bumps attempts
    // and pushes the deadline out by base * 2^attempts.
    let mut attempts = 0;
    for expected in [4, 8, 16, 32] {
        attempts += 1;
        assert_eq!(backoff_secs(attempts), expected);
        pending::mark_attempted(&pool, id, attempts, now_unix() + backoff_secs(attempts))
            .await
            .unwrap();
    }

    // Fifth failure parks for an hour; the row survives.
    attempts += 1;
    assert_eq!(backoff_secs(attempts), 3600);
    pending::mark_attempted(&pool, id, attempts, now_unix() + backoff_secs(attempts))
        .await
        .unwrap();

    let rows = pending::get_retryable(&pool, 100).await.unwrap();
    assert!(rows.is_empty(), "parked row must be skipped until the hour elapses");
    assert_eq!(pending::count_for_user(&pool, bob).await.unwrap(), 1);
}

#[tokio::test]
async fn delete_and_delete_batch_remove_confirmed_rows() {
    let pool = setup_test_db().await;
    let (bob, message_id) = seed(&pool).await;

    let a = pending::enqueue(&pool, bob, message_id, "{}", 0).await.unwrap();
    let b = pending::enqueue(&pool, bob, message_id, "{}", 0).await.unwrap();
    let c = pending::enqueue(&pool, bob, message_id, "{}", 0).await.unwrap();

    pending::delete(&pool, a).await.unwrap();
    assert_eq!(pending::count_for_user(&pool, bob).await.unwrap(), 2);

    pending::delete_batch(&pool, &[b, c]).await.unwrap();
    assert_eq!(pending::count_for_user(&pool, bob).await.unwrap(), 0);

    // Empty batch is a no-op.
    pending::delete_batch(&pool, &[]).await.unwrap();
}

#[tokio::test]
async fn cleanup_evicts_only_ancient_rows() {
    let pool = setup_test_db().await;
    let (bob, message_id) = seed(&pool).await;

    let old = pending::enqueue(&pool, bob, message_id, "{}", 0).await.unwrap();
    let fresh = pending::enqueue(&pool, bob, message_id, "{}", 0).await.unwrap();

    sqlx::query("UPDATE pending_messages SET created_at = created_at - 864000 WHERE id = ?1")
        .bind(old)
        .execute(&pool)
        .await
        .unwrap();

    let evicted = pending::cleanup_old(&pool, 7 * 24 * 3600).await.unwrap();
    assert_eq!(evicted, 1);

    let rows = pending::get_pending_for_user(&pool, bob, 50).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, fresh);
}
