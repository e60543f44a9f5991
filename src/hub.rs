//! Connection Hub
//!
//! Registry of live per-user channels. One channel per user; re-registration
//! tears down the stale channel. All registry access goes through a single
//! readers-writer lock with short critical sections — the send path snapshots
//! the connection under the reader lock and releases it before any transport
//! write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use sqlx::{Pool, Sqlite};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::compress::{gzip_compress, COMPRESS_THRESHOLD};
use crate::db::pending;
use crate::metrics::Metrics;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(90);
const PING_WRITE_DEADLINE: Duration = Duration::from_secs(10);
const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const FLUSH_BATCH_SIZE: i64 = 50;
const FLUSH_BATCH_PAUSE: Duration = Duration::from_millis(100);

pub type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// State for one live channel.
#[derive(Clone)]
struct ClientConnection {
    sink: WsSink,
    last_pong: Instant,
    supports_gzip: bool,
    /// Close signal observed by the per-connection ping task.
    close_tx: watch::Sender<bool>,
}

enum SendStatus {
    Sent,
    Offline,
    Failed,
}

pub struct Hub {
    clients: RwLock<HashMap<i64, ClientConnection>>,
    pool: Pool<Sqlite>,
    metrics: Arc<Metrics>,
}

impl Hub {
    pub fn new(pool: Pool<Sqlite>, metrics: Arc<Metrics>) -> Self {
        Hub {
            clients: RwLock::new(HashMap::new()),
            pool,
            metrics,
        }
    }

    /// Register a channel and start its heartbeat. Any prior channel for the
    /// same user is torn down first.
    pub async fn register(self: Arc<Self>, user_id: i64, sink: WsSink, supports_gzip: bool) {
        let (close_tx, close_rx) = watch::channel(false);
        let conn = ClientConnection {
            sink: sink.clone(),
            last_pong: Instant::now(),
            supports_gzip,
            close_tx,
        };

        let (replaced, total) = {
            let mut clients = self.clients.write().await;
            let replaced = clients.insert(user_id, conn);
            (replaced, clients.len())
        };

        if let Some(old) = replaced {
            let _ = old.close_tx.send(true);
            tokio::spawn(async move {
                let _ = old.sink.lock().await.close().await;
            });
        }

        let hub = Arc::clone(&self);
        tokio::spawn(async move {
            hub.ping_routine(user_id, sink, close_rx).await;
        });

        info!("User {} connected to hub (total: {}, gzip: {})", user_id, total, supports_gzip);
    }

    /// Remove a channel, stop its heartbeat and close the transport.
    /// Idempotent.
    pub async fn unregister(&self, user_id: i64) {
        let (removed, total) = {
            let mut clients = self.clients.write().await;
            let removed = clients.remove(&user_id);
            (removed, clients.len())
        };

        if let Some(conn) = removed {
            let _ = conn.close_tx.send(true);
            tokio::spawn(async move {
                let _ = conn.sink.lock().await.close().await;
            });
            info!("User {} disconnected from hub (total: {})", user_id, total);
        }
    }

    /// Unregister only if `sink` is still the registered channel. Lets a
    /// closing socket loop clean up without tearing down a replacement
    /// connection that registered meanwhile.
    pub async fn unregister_if_current(&self, user_id: i64, sink: &WsSink) {
        let current = {
            let clients = self.clients.read().await;
            clients
                .get(&user_id)
                .map(|c| Arc::ptr_eq(&c.sink, sink))
                .unwrap_or(false)
        };
        if current {
            self.unregister(user_id).await;
        }
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.clients.read().await.contains_key(&user_id)
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn online_users(&self) -> Vec<i64> {
        self.clients.read().await.keys().copied().collect()
    }

    /// Record a pong from the peer.
    pub async fn touch_pong(&self, user_id: i64) {
        let mut clients = self.clients.write().await;
        if let Some(conn) = clients.get_mut(&user_id) {
            conn.last_pong = Instant::now();
        }
    }

    /// One transport write. The frame is gzip-compressed when the peer
    /// negotiated support, the payload clears the threshold and compression
    /// actually shrinks it; compressed frames go out as binary.
    async fn write_json(&self, conn: &ClientConnection, data: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(data)?;
        let frame = if conn.supports_gzip && json.len() > COMPRESS_THRESHOLD {
            match gzip_compress(json.as_bytes()) {
                Ok(compressed) if compressed.len() < json.len() => Message::Binary(compressed),
                _ => Message::Text(json),
            }
        } else {
            Message::Text(json)
        };
        conn.sink.lock().await.send(frame).await?;
        Ok(())
    }

    async fn try_send(&self, user_id: i64, data: &serde_json::Value) -> SendStatus {
        let conn = {
            let clients = self.clients.read().await;
            clients.get(&user_id).cloned()
        };

        let Some(conn) = conn else {
            return SendStatus::Offline;
        };

        if let Err(e) = self.write_json(&conn, data).await {
            warn!("Error sending message to user {}: {}", user_id, e);
            // Connection is dead: tear it down so the payload can be queued.
            self.unregister(user_id).await;
            return SendStatus::Failed;
        }
        SendStatus::Sent
    }

    /// Send without a durable anchor. Offline recipients only receive this if
    /// the payload type is durable enough to queue — which, with message id 0,
    /// it never is (ephemeral policy).
    pub async fn send_to_user(&self, user_id: i64, data: &serde_json::Value) -> Result<()> {
        self.send_to_user_with_id(user_id, 0, data).await
    }

    /// Send with the durable message id used as the offline-queue anchor.
    /// Offline ⇒ enqueue; write failure ⇒ teardown + enqueue.
    pub async fn send_to_user_with_id(
        &self,
        user_id: i64,
        message_id: i64,
        data: &serde_json::Value,
    ) -> Result<()> {
        match self.try_send(user_id, data).await {
            SendStatus::Sent => Ok(()),
            SendStatus::Offline => self.queue_message(user_id, message_id, data, 0).await,
            SendStatus::Failed => {
                self.metrics.incr_fanout_failed();
                self.queue_message(user_id, message_id, data, 0).await
            }
        }
    }

    /// Store a payload for offline or failed delivery. Ephemeral events are
    /// never queued, and neither is anything without a durable message id.
    async fn queue_message(
        &self,
        user_id: i64,
        message_id: i64,
        data: &serde_json::Value,
        priority: i64,
    ) -> Result<()> {
        if let Some(kind) = data.get("type").and_then(|v| v.as_str()) {
            if matches!(kind, "typing" | "ping" | "pong") {
                return Ok(());
            }
        }

        if message_id == 0 {
            debug!("Skipping queue for user {}: no durable message id", user_id);
            return Ok(());
        }

        let payload = serde_json::to_string(data)?;
        pending::enqueue(&self.pool, user_id, message_id, &payload, priority).await?;
        Ok(())
    }

    /// Fire-and-forget fan-out to every connected user.
    pub async fn broadcast(&self, data: &serde_json::Value) {
        let conns: Vec<(i64, ClientConnection)> = {
            let clients = self.clients.read().await;
            clients.iter().map(|(id, c)| (*id, c.clone())).collect()
        };

        for (user_id, conn) in conns {
            if let Err(e) = self.write_json(&conn, data).await {
                warn!("Error broadcasting to user {}: {}", user_id, e);
                self.unregister(user_id).await;
            }
        }
    }

    /// Fire-and-forget fan-out to specific users. No queueing on failure.
    pub async fn broadcast_to_users(&self, user_ids: &[i64], data: &serde_json::Value) {
        let conns: Vec<(i64, ClientConnection)> = {
            let clients = self.clients.read().await;
            user_ids
                .iter()
                .filter_map(|id| clients.get(id).map(|c| (*id, c.clone())))
                .collect()
        };

        for (user_id, conn) in conns {
            if let Err(e) = self.write_json(&conn, data).await {
                warn!("Error sending to user {}: {}", user_id, e);
            }
        }
    }

    /// Drain the pending queue into a freshly registered channel.
    ///
    /// Batches of up to 50 rows go out as one `{type:"batch"}` envelope; rows
    /// are deleted only after the channel accepted the write. If the delete
    /// fails the rows are redelivered on the next drain and deduplicated by
    /// the client via `client_id` — at-least-once survives.
    pub async fn flush_pending_messages(&self, user_id: i64) -> Result<()> {
        loop {
            if !self.is_online(user_id).await {
                return Ok(());
            }

            let rows = pending::get_pending_for_user(&self.pool, user_id, FLUSH_BATCH_SIZE).await?;
            if rows.is_empty() {
                return Ok(());
            }

            info!("Flushing {} pending messages to user {}", rows.len(), user_id);

            let mut batch = Vec::with_capacity(rows.len());
            let mut delivered_ids = Vec::with_capacity(rows.len());
            for row in &rows {
                match serde_json::from_str::<serde_json::Value>(&row.payload) {
                    Ok(value) => {
                        batch.push(value);
                        delivered_ids.push(row.id);
                    }
                    Err(e) => {
                        error!("Error decoding pending message {}: {}", row.id, e);
                    }
                }
            }

            let envelope = serde_json::json!({
                "type": "batch",
                "messages": batch,
                "count": batch.len(),
            });

            match self.try_send(user_id, &envelope).await {
                SendStatus::Sent => {}
                // Channel gone: rows stay queued for the next drain.
                SendStatus::Offline | SendStatus::Failed => return Ok(()),
            }

            if let Err(e) = pending::delete_batch(&self.pool, &delivered_ids).await {
                error!("Error deleting delivered messages for user {}: {}", user_id, e);
                return Ok(());
            }

            if (rows.len() as i64) < FLUSH_BATCH_SIZE {
                return Ok(());
            }
            tokio::time::sleep(FLUSH_BATCH_PAUSE).await;
        }
    }

    /// Direct write used by the retry worker: no offline fallback, the caller
    /// owns the backoff bookkeeping.
    pub async fn try_deliver(&self, user_id: i64, data: &serde_json::Value) -> Result<()> {
        match self.try_send(user_id, data).await {
            SendStatus::Sent => Ok(()),
            SendStatus::Offline => anyhow::bail!("user {} offline", user_id),
            SendStatus::Failed => anyhow::bail!("write to user {} failed", user_id),
        }
    }

    /// Per-connection heartbeat: ping every 30 s with a 10 s write deadline.
    async fn ping_routine(
        self: Arc<Self>,
        user_id: i64,
        sink: WsSink,
        mut close_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                changed = close_rx.changed() => {
                    if changed.is_err() || *close_rx.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    // Connection may have been replaced; stop pinging a sink
                    // the registry no longer owns.
                    let current = {
                        let clients = self.clients.read().await;
                        clients.get(&user_id).map(|c| Arc::ptr_eq(&c.sink, &sink)).unwrap_or(false)
                    };
                    if !current {
                        return;
                    }

                    let write = async {
                        sink.lock().await.send(Message::Ping(Vec::new())).await
                    };
                    match tokio::time::timeout(PING_WRITE_DEADLINE, write).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!("Ping failed for user {}: {}", user_id, e);
                            self.unregister(user_id).await;
                            return;
                        }
                        Err(_) => {
                            warn!("Ping write deadline exceeded for user {}", user_id);
                            self.unregister(user_id).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Background sweep: unregister channels whose last pong is older than
    /// the pong timeout.
    pub async fn run_health_checker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEALTH_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;

            let dead: Vec<i64> = {
                let clients = self.clients.read().await;
                let now = Instant::now();
                clients
                    .iter()
                    .filter(|(_, conn)| now.duration_since(conn.last_pong) > PONG_TIMEOUT)
                    .map(|(id, _)| *id)
                    .collect()
            };

            for user_id in dead {
                warn!("Removing dead connection for user {} (no pong received)", user_id);
                self.unregister(user_id).await;
            }
        }
    }
}
