//! Ingest and fan-out through the real frame-processing path
//!
//! Drives `Inbound::process` against an offline hub: acks and ephemeral
//! events vanish, durable fan-out lands in the pending queue, and the
//! idempotency guarantees hold end to end.

use std::sync::Arc;

use sqlx::SqlitePool;

use relaychat_server::cache::{MessageCache, UserCache};
use relaychat_server::config::{CsrfMode, ServerConfig};
use relaychat_server::db::{self, groups, messages, pending, read_state, users};
use relaychat_server::hub::Hub;
use relaychat_server::metrics::Metrics;
use relaychat_server::ws::envelope::{
    ChatPayload, GroupReadPayload, Inbound, ReadPayload, SyncConversationState, SyncPayload,
};
use relaychat_server::ws::fanout;
use relaychat_server::ws::process::WsContext;
use relaychat_server::AppState;

async fn setup_state() -> AppState {
    let pool: SqlitePool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create test database");
    db::run_migrations(&pool).await.expect("migrations");

    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        database_url: ":memory:".into(),
        jwt_secret: "test-secret".into(),
        allowed_origins: None,
        csrf_mode: CsrfMode::Off,
        redis_addr: None,
        redis_password: None,
        redis_db: 0,
        max_message_length: 4000,
        password_min_length: 10,
        public_join_base_url: None,
        admin_token: None,
    };

    let metrics = Arc::new(Metrics::new());
    AppState {
        db: pool.clone(),
        config: Arc::new(config),
        hub: Arc::new(Hub::new(pool, Arc::clone(&metrics))),
        message_cache: MessageCache::disabled(),
        user_cache: UserCache::disabled(),
        metrics,
    }
}

async fn seed_user(state: &AppState, name: &str) -> i64 {
    users::create(&state.db, name, &format!("{}@example.com", name), "x").await.unwrap()
}

fn ctx(state: &AppState, user_id: i64) -> WsContext {
    WsContext { user_id, state: state.clone() }
}

fn chat(client_id: &str, recipient: Option<i64>, group: Option<i64>, content: &str) -> Inbound {
    Inbound::Chat(ChatPayload {
        client_id: client_id.into(),
        recipient_id: recipient,
        group_id: group,
        content: content.into(),
        message_type: None,
    })
}

#[tokio::test]
async fn chat_frames_with_the_same_client_id_persist_one_message() {
    let state = setup_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;

    chat("c-1", Some(bob), None, "hi").process(&ctx(&state, alice)).await.unwrap();
    chat("c-1", Some(bob), None, "hi").process(&ctx(&state, alice)).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE sender_id = ?1")
        .bind(alice)
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(state.metrics.duplicates(), 1);

    // The offline recipient got exactly one queued copy.
    assert_eq!(pending::count_for_user(&state.db, bob).await.unwrap(), 1);
}

#[tokio::test]
async fn chat_validation_codes() {
    let state = setup_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;

    let err = chat("", Some(bob), None, "hi").process(&ctx(&state, alice)).await.unwrap_err();
    assert_eq!(err.code(), "missing_client_id");

    let err = chat("c-1", Some(bob), None, "   ").process(&ctx(&state, alice)).await.unwrap_err();
    assert_eq!(err.code(), "missing_content");

    let err = chat("c-1", Some(bob), Some(9), "hi").process(&ctx(&state, alice)).await.unwrap_err();
    assert_eq!(err.code(), "invalid_target");

    let err = chat("c-1", None, None, "hi").process(&ctx(&state, alice)).await.unwrap_err();
    assert_eq!(err.code(), "invalid_target");

    let err = chat("c-1", None, Some(404), "hi").process(&ctx(&state, alice)).await.unwrap_err();
    assert_eq!(err.code(), "not_group_member");
}

#[tokio::test]
async fn group_chat_fans_out_to_every_other_member() {
    let state = setup_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;
    let carol = seed_user(&state, "carol").await;

    let group = groups::create(&state.db, "team", "", "", alice, false, None).await.unwrap();
    groups::add_member(&state.db, group.id, bob, "member").await.unwrap();
    groups::add_member(&state.db, group.id, carol, "member").await.unwrap();

    chat("g-1", None, Some(group.id), "hi team").process(&ctx(&state, alice)).await.unwrap();

    // One queued copy per offline member, none for the sender.
    assert_eq!(pending::count_for_user(&state.db, bob).await.unwrap(), 1);
    assert_eq!(pending::count_for_user(&state.db, carol).await.unwrap(), 1);
    assert_eq!(pending::count_for_user(&state.db, alice).await.unwrap(), 0);

    let rows = pending::get_pending_for_user(&state.db, bob, 50).await.unwrap();
    let payload: serde_json::Value = serde_json::from_str(&rows[0].payload).unwrap();
    assert_eq!(payload["type"], "message");
    assert_eq!(payload["message"]["client_id"], "g-1");
}

#[tokio::test]
async fn read_frame_marks_and_is_recipient_only() {
    let state = setup_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;

    chat("c-1", Some(bob), None, "hi").process(&ctx(&state, alice)).await.unwrap();
    let message = messages::find_by_client_id(&state.db, "c-1", alice).await.unwrap().unwrap();

    // The sender cannot mark their own message read.
    let err = Inbound::Read(ReadPayload { message_id: message.id })
        .process(&ctx(&state, alice))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_recipient");

    Inbound::Read(ReadPayload { message_id: message.id })
        .process(&ctx(&state, bob))
        .await
        .unwrap();

    let message = messages::find_by_id(&state.db, message.id).await.unwrap().unwrap();
    assert!(message.is_read);
    assert_eq!(message.status, "read");

    let err = Inbound::Read(ReadPayload { message_id: 9999 })
        .process(&ctx(&state, bob))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_message_id");
}

#[tokio::test]
async fn group_read_frames_keep_the_cursor_monotonic() {
    let state = setup_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;

    let group = groups::create(&state.db, "team", "", "", alice, false, None).await.unwrap();
    groups::add_member(&state.db, group.id, bob, "member").await.unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        chat(&format!("g-{}", i), None, Some(group.id), "msg")
            .process(&ctx(&state, alice))
            .await
            .unwrap();
        let m = messages::find_by_client_id(&state.db, &format!("g-{}", i), alice)
            .await
            .unwrap()
            .unwrap();
        ids.push(m.id);
    }

    let post = |id: i64| Inbound::GroupRead(GroupReadPayload { group_id: group.id, last_read_message_id: id });

    post(ids[1]).process(&ctx(&state, bob)).await.unwrap();
    // An older device reporting a stale cursor is absorbed.
    post(ids[0]).process(&ctx(&state, bob)).await.unwrap();
    let s = read_state::get(&state.db, group.id, bob).await.unwrap().unwrap();
    assert_eq!(s.last_read_message_id, ids[1]);

    post(ids[2]).process(&ctx(&state, bob)).await.unwrap();
    let s = read_state::get(&state.db, group.id, bob).await.unwrap().unwrap();
    assert_eq!(s.last_read_message_id, ids[2]);

    // A cursor naming a foreign message is rejected.
    let err = post(ids[2] + 100).process(&ctx(&state, bob)).await.unwrap_err();
    assert_eq!(err.code(), "invalid_message_id");

    // Non-members cannot move cursors.
    let outsider = seed_user(&state, "outsider").await;
    let err = post(ids[2]).process(&ctx(&state, outsider)).await.unwrap_err();
    assert_eq!(err.code(), "not_group_member");
}

#[tokio::test]
async fn sync_core_pages_forward_deltas() {
    let state = setup_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;

    for i in 0..5 {
        chat(&format!("c-{}", i), Some(bob), None, "msg")
            .process(&ctx(&state, alice))
            .await
            .unwrap();
    }

    let entry = fanout::sync_conversation(&state, bob, &format!("user_{}", alice), 0, 3)
        .await
        .unwrap();
    assert_eq!(entry.messages.len(), 3);
    assert!(entry.has_more, "a full page signals more");
    let cursor = entry.next_cursor.unwrap();

    let entry = fanout::sync_conversation(&state, bob, &format!("user_{}", alice), cursor, 3)
        .await
        .unwrap();
    assert_eq!(entry.messages.len(), 2);
    assert!(!entry.has_more);

    let err = fanout::sync_conversation(&state, bob, "carrier_7", 0, 3).await.unwrap_err();
    assert_eq!(err.code(), "invalid_conversation_id");

    // Sync frames with no conversations are rejected up front.
    let err = Inbound::Sync(SyncPayload { conversations: vec![], limit: None })
        .process(&ctx(&state, bob))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "missing_conversations");

    // A well-formed sync frame processes cleanly (replies are ephemeral).
    Inbound::Sync(SyncPayload {
        conversations: vec![SyncConversationState {
            conversation_id: format!("user_{}", alice),
            last_message_id: 0,
        }],
        limit: Some(10),
    })
    .process(&ctx(&state, bob))
    .await
    .unwrap();
}
