//! Process counters for operators
//!
//! Monotonic counters exposed through `/admin/stats`. Gauges (connected
//! channels, queue depth) are read live from the hub and the store.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    /// Pending-queue delivery attempts made by the retry worker.
    pub queue_retries: AtomicU64,
    /// Chat frames short-circuited by the idempotency probe.
    pub ingest_duplicates: AtomicU64,
    /// Fan-out sends that failed and fell back to the queue (or were dropped).
    pub fanout_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn incr_retries(&self) {
        self.queue_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_duplicates(&self) {
        self.ingest_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_fanout_failed(&self) {
        self.fanout_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u64 {
        self.queue_retries.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.ingest_duplicates.load(Ordering::Relaxed)
    }

    pub fn fanout_failures(&self) -> u64 {
        self.fanout_failed.load(Ordering::Relaxed)
    }
}
