//! Database statistics.
//!
//! Counters for the persistence layer and the event dispatcher. All
//! counters are atomic and can be read while flushes are in progress.
//!
//! ```rust,ignore
//! let db = ResourceDb::open_in_memory(schema)?;
//! db.flush()?;
//! let stats = db.stats();
//! println!("flushes: {}, bytes: {}", stats.flushes, stats.bytes_written);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Persistence and dispatch counters.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    structure_generations: AtomicU64,
    compactions: AtomicU64,
    compacted_bytes: AtomicU64,
    recoveries: AtomicU64,
    transactions_executed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    events_dispatched: AtomicU64,
    listener_failures: AtomicU64,
}

impl DatabaseStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_flush(&self, records: u64, bytes: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(records, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_flush(&self) {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_structure_generation(&self, bytes: u64) {
        self.structure_generations.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self, reclaimed: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.compacted_bytes.fetch_add(reclaimed, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction(&self, rolled_back: bool) {
        if rolled_back {
            self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transactions_executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_events(&self, count: u64) {
        self.events_dispatched.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Flushes that failed and were retried later.
    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }

    /// Value records appended.
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Bytes written to both generation families.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Structure generations written.
    pub fn structure_generations(&self) -> u64 {
        self.structure_generations.load(Ordering::Relaxed)
    }

    /// Value compactions.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Listener callbacks that panicked.
    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flushes: self.flushes(),
            failed_flushes: self.failed_flushes(),
            records_written: self.records_written(),
            bytes_written: self.bytes_written(),
            structure_generations: self.structure_generations(),
            compactions: self.compactions(),
            compacted_bytes: self.compacted_bytes.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            transactions_executed: self.transactions_executed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            listener_failures: self.listener_failures(),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Completed flushes.
    pub flushes: u64,
    /// Failed flushes.
    pub failed_flushes: u64,
    /// Value records appended.
    pub records_written: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Structure generations written.
    pub structure_generations: u64,
    /// Value compactions.
    pub compactions: u64,
    /// Garbage bytes reclaimed by compaction.
    pub compacted_bytes: u64,
    /// Opens that recovered an existing store.
    pub recoveries: u64,
    /// Transactions executed.
    pub transactions_executed: u64,
    /// Transactions rolled back.
    pub transactions_rolled_back: u64,
    /// Events handed to listeners.
    pub events_dispatched: u64,
    /// Listener callbacks that panicked.
    pub listener_failures: u64,
}
