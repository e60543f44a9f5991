//! Message store integration tests
//!
//! Covers idempotent ingest at the store boundary, cursor windows, forward
//! deltas with membership enforcement, and the forward-only status ladder.

use sqlx::SqlitePool;

use relaychat_server::db::{self, groups, messages, users};
use relaychat_server::db::messages::CreateOutcome;
use relaychat_server::models::ConversationId;

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
    users::create(pool, name, &format!("{}@example.com", name), "x")
        .await
        .expect("create user")
}

async fn send_direct(pool: &SqlitePool, sender: i64, recipient: i64, client_id: &str) -> i64 {
    match messages::create(pool, sender, client_id, Some(recipient), None, "hello", "text")
        .await
        .expect("create message")
    {
        CreateOutcome::Created(m) => m.id,
        _ => panic!("expected fresh insert for {}", client_id),
    }
}

#[tokio::test]
async fn duplicate_client_id_is_rejected_at_the_store() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let bob = seed_user(&pool, "bob").await;

    let first = send_direct(&pool, alice, bob, "c-1").await;

    let outcome = messages::create(&pool, alice, "c-1", Some(bob), None, "again", "text")
        .await
        .unwrap();
    assert!(matches!(outcome, CreateOutcome::DuplicateClientId));

    // Exactly one persisted message, retrievable by the idempotency key.
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE sender_id = ?1")
        .bind(alice)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let existing = messages::find_by_client_id(&pool, "c-1", alice).await.unwrap().unwrap();
    assert_eq!(existing.id, first);

    // The same client_id from a different sender is a different key.
    let outcome = messages::create(&pool, bob, "c-1", Some(alice), None, "mine", "text")
        .await
        .unwrap();
    assert!(matches!(outcome, CreateOutcome::Created(_)));
}

#[tokio::test]
async fn send_then_window_returns_newest_first() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let bob = seed_user(&pool, "bob").await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(send_direct(&pool, alice, bob, &format!("c-{}", i)).await);
    }

    let window = messages::find_conversation_cursor(&pool, bob, alice, 0, 10)
        .await
        .unwrap();
    assert_eq!(window.len(), 5);
    // Newest element first — the round-trip law for SendMessage/GetMessages.
    assert_eq!(window[0].id, *ids.last().unwrap());
    let returned: Vec<i64> = window.iter().map(|m| m.id).collect();
    let mut expected = ids.clone();
    expected.reverse();
    assert_eq!(returned, expected);

    // Cursor excludes the cursor row and everything newer.
    let older = messages::find_conversation_cursor(&pool, bob, alice, ids[2], 10)
        .await
        .unwrap();
    let older_ids: Vec<i64> = older.iter().map(|m| m.id).collect();
    assert_eq!(older_ids, vec![ids[1], ids[0]]);
}

#[tokio::test]
async fn conversation_window_is_scoped_to_the_pair() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let bob = seed_user(&pool, "bob").await;
    let carol = seed_user(&pool, "carol").await;

    send_direct(&pool, alice, bob, "ab-1").await;
    send_direct(&pool, bob, alice, "ba-1").await;
    send_direct(&pool, alice, carol, "ac-1").await;

    let window = messages::find_conversation_cursor(&pool, alice, bob, 0, 10)
        .await
        .unwrap();
    assert_eq!(window.len(), 2);
    assert!(window.iter().all(|m| {
        (m.sender_id == alice && m.recipient_id == Some(bob))
            || (m.sender_id == bob && m.recipient_id == Some(alice))
    }));
}

#[tokio::test]
async fn messages_since_returns_forward_delta_in_order() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let bob = seed_user(&pool, "bob").await;

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(send_direct(&pool, alice, bob, &format!("c-{}", i)).await);
    }

    let delta = messages::find_messages_since(
        &pool,
        bob,
        ConversationId::user(alice),
        ids[1],
        100,
    )
    .await
    .unwrap();
    let delta_ids: Vec<i64> = delta.iter().map(|m| m.id).collect();
    assert_eq!(delta_ids, vec![ids[2], ids[3]]);
}

#[tokio::test]
async fn group_sync_requires_membership() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let outsider = seed_user(&pool, "mallory").await;

    let group = groups::create(&pool, "team", "", "", alice, false, None).await.unwrap();
    match messages::create(&pool, alice, "g-1", None, Some(group.id), "hi team", "text")
        .await
        .unwrap()
    {
        CreateOutcome::Created(_) => {}
        _ => panic!("expected insert"),
    }

    let member_view =
        messages::find_messages_since(&pool, alice, ConversationId::group(group.id), 0, 100)
            .await
            .unwrap();
    assert_eq!(member_view.len(), 1);

    let outsider_view =
        messages::find_messages_since(&pool, outsider, ConversationId::group(group.id), 0, 100)
            .await
            .unwrap();
    assert!(outsider_view.is_empty());
}

#[tokio::test]
async fn group_insert_fails_cleanly_after_membership_revocation() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let bob = seed_user(&pool, "bob").await;

    let group = groups::create(&pool, "team", "", "", alice, false, None).await.unwrap();
    groups::add_member(&pool, group.id, bob, "member").await.unwrap();
    groups::remove_member(&pool, group.id, bob).await.unwrap();

    let outcome = messages::create(&pool, bob, "g-1", None, Some(group.id), "late", "text")
        .await
        .unwrap();
    assert!(matches!(outcome, CreateOutcome::NotGroupMember));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE group_id = ?1")
        .bind(group.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn mark_read_sets_flags_and_never_regresses() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let bob = seed_user(&pool, "bob").await;
    let id = send_direct(&pool, alice, bob, "c-1").await;

    messages::mark_read(&pool, id).await.unwrap();

    let m = messages::find_by_id(&pool, id).await.unwrap().unwrap();
    assert!(m.is_read);
    assert!(m.is_delivered, "read implies delivered");
    assert_eq!(m.status, "read");
    assert!(m.read_at.is_some());

    // A late delivery receipt must not pull the status back down.
    messages::mark_delivered(&pool, id).await.unwrap();
    let m = messages::find_by_id(&pool, id).await.unwrap().unwrap();
    assert_eq!(m.status, "read");
    assert!(m.is_read);

    // Marking read twice is idempotent; read_at keeps its first value.
    let first_read_at = m.read_at;
    messages::mark_read(&pool, id).await.unwrap();
    let m = messages::find_by_id(&pool, id).await.unwrap().unwrap();
    assert_eq!(m.read_at, first_read_at);
}

#[tokio::test]
async fn mark_conversation_read_clears_only_unread_from_peer() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let bob = seed_user(&pool, "bob").await;

    let m1 = send_direct(&pool, alice, bob, "c-1").await;
    let m2 = send_direct(&pool, alice, bob, "c-2").await;
    let mine = send_direct(&pool, bob, alice, "c-3").await;
    messages::mark_read(&pool, m1).await.unwrap();

    let cleared = messages::mark_conversation_read(&pool, bob, alice).await.unwrap();
    assert_eq!(cleared, 1, "only the still-unread inbound message counts");

    let m = messages::find_by_id(&pool, m2).await.unwrap().unwrap();
    assert!(m.is_read);
    // Bob's own outbound message is untouched.
    let m = messages::find_by_id(&pool, mine).await.unwrap().unwrap();
    assert!(!m.is_read);

    let again = messages::mark_conversation_read(&pool, bob, alice).await.unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn latest_id_probes() {
    let pool = setup_test_db().await;
    let alice = seed_user(&pool, "alice").await;
    let bob = seed_user(&pool, "bob").await;

    assert_eq!(messages::latest_direct_id(&pool, alice, bob).await.unwrap(), 0);

    send_direct(&pool, alice, bob, "c-1").await;
    let newest = send_direct(&pool, bob, alice, "c-2").await;
    assert_eq!(messages::latest_direct_id(&pool, alice, bob).await.unwrap(), newest);

    let group = groups::create(&pool, "team", "", "", alice, false, None).await.unwrap();
    assert_eq!(messages::latest_group_id(&pool, group.id).await.unwrap(), 0);
    let gid = match messages::create(&pool, alice, "g-1", None, Some(group.id), "x", "text")
        .await
        .unwrap()
    {
        CreateOutcome::Created(m) => m.id,
        _ => panic!("expected insert"),
    };
    assert_eq!(messages::latest_group_id(&pool, group.id).await.unwrap(), gid);
    assert!(messages::is_message_in_group(&pool, gid, group.id).await.unwrap());
    assert!(!messages::is_message_in_group(&pool, newest, group.id).await.unwrap());
}
