//! Group read-state tests: monotonic cursor, membership lifecycle.

use sqlx::SqlitePool;

use relaychat_server::db::{self, groups, read_state, users};

async fn setup_test_db() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create test database");
    db::run_migrations(&pool).await.expect("migrations");
    pool
}

async fn seed_user(pool: &SqlitePool, name: &str) -> i64 {
    users::create(pool, name, &format!("{}@example.com", name), "x").await.unwrap()
}

#[tokio::test]
async fn cursor_never_decreases() {
    let pool = setup_test_db().await;
    let user = seed_user(&pool, "u").await;

    // An older device reporting a stale cursor must not move it backwards.
    read_state::upsert_monotonic(&pool, 1, user, 25).await.unwrap();
    read_state::upsert_monotonic(&pool, 1, user, 20).await.unwrap();
    let state = read_state::get(&pool, 1, user).await.unwrap().unwrap();
    assert_eq!(state.last_read_message_id, 25);

    read_state::upsert_monotonic(&pool, 1, user, 30).await.unwrap();
    let state = read_state::get(&pool, 1, user).await.unwrap().unwrap();
    assert_eq!(state.last_read_message_id, 30);
}

#[tokio::test]
async fn concurrent_devices_converge_on_the_max() {
    let pool = setup_test_db().await;
    let user = seed_user(&pool, "u").await;

    let mut handles = Vec::new();
    for proposed in [5i64, 40, 12, 33, 40, 7] {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            read_state::upsert_monotonic(&pool, 9, user, proposed).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let state = read_state::get(&pool, 9, user).await.unwrap().unwrap();
    assert_eq!(state.last_read_message_id, 40);
}

#[tokio::test]
async fn join_creates_zero_row_and_leave_removes_it() {
    let pool = setup_test_db().await;
    let creator = seed_user(&pool, "creator").await;
    let member = seed_user(&pool, "member").await;

    let group = groups::create(&pool, "team", "", "", creator, false, None).await.unwrap();
    groups::add_member(&pool, group.id, member, "member").await.unwrap();

    let state = read_state::get(&pool, group.id, member).await.unwrap().unwrap();
    assert_eq!(state.last_read_message_id, 0);

    // Re-joining must not reset an advanced cursor.
    read_state::upsert_monotonic(&pool, group.id, member, 17).await.unwrap();
    groups::add_member(&pool, group.id, member, "member").await.unwrap();
    let state = read_state::get(&pool, group.id, member).await.unwrap().unwrap();
    assert_eq!(state.last_read_message_id, 17);

    groups::remove_member(&pool, group.id, member).await.unwrap();
    assert!(read_state::get(&pool, group.id, member).await.unwrap().is_none());

    let remaining = read_state::list_by_group(&pool, group.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].user_id, creator);
}
