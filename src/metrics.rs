//! Process-wide observability counters
//!
//! A plain struct of atomics, injected as `Arc<Metrics>` rather than read
//! through a global. Counters are monotonically increasing; gauges are
//! last-written values. The agent logs a summary on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the core subsystems.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Raw frames dropped at ingestion because no eviction could free room.
    pub raw_data_overflow: AtomicU64,
    /// Tier-two evictions: frame data freed while its handle was still
    /// referenced by a usage hint (the holder will see "missing" on borrow).
    pub raw_data_overwritten_with_used_handle: AtomicU64,
    /// Bytes currently resident in the raw-data buffer (gauge).
    pub raw_data_bytes_in_use: AtomicU64,
    /// Records appended to store-and-forward streams.
    pub stream_records_stored: AtomicU64,
    /// Bytes appended to store-and-forward streams.
    pub stream_bytes_stored: AtomicU64,
    /// Stream append failures.
    pub stream_store_errors: AtomicU64,
    /// Bytes pruned from streams by TTL eviction.
    pub stream_expired_bytes: AtomicU64,
    /// Uploads currently queued behind the concurrency limit (gauge).
    pub queued_uploads: AtomicU64,
    /// Uploads that failed after exhausting the retry budget.
    pub failed_uploads: AtomicU64,
}

impl Metrics {
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Emit all counters as one structured log line.
    pub fn log_summary(&self) {
        tracing::info!(
            raw_data_overflow = Self::get(&self.raw_data_overflow),
            raw_data_overwritten_with_used_handle =
                Self::get(&self.raw_data_overwritten_with_used_handle),
            raw_data_bytes_in_use = Self::get(&self.raw_data_bytes_in_use),
            stream_records_stored = Self::get(&self.stream_records_stored),
            stream_bytes_stored = Self::get(&self.stream_bytes_stored),
            stream_store_errors = Self::get(&self.stream_store_errors),
            stream_expired_bytes = Self::get(&self.stream_expired_bytes),
            failed_uploads = Self::get(&self.failed_uploads),
            "metrics summary"
        );
    }
}
