use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A snapshot of the ingest metrics.
/// Plain copies of every counter, safe to serialise or print.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IngestMetricsSnapshot {
    /// Head notifications received from the push feed
    pub heads_received: u64,
    /// Records committed to the sink by the flusher
    pub records_written: u64,
    /// Records fetched inline to close small gaps
    pub inline_backfilled: u64,
    /// Keys currently waiting in the missed set
    pub missed_pending: u64,
    /// Keys recovered from the missed set
    pub missed_recovered: u64,
    /// Frames skipped because they could not be decoded
    pub malformed_frames: u64,
    pub reconnects: u64,
    pub consecutive_flush_failures: u64,
    pub write_degraded: bool,
    /// Highest sequence number handed to the buffer
    pub latest_sequence_number: u64,
}

impl Display for IngestMetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Ingest Metrics Snapshot:")?;
        writeln!(f, "  Heads received: {}", self.heads_received)?;
        writeln!(f, "  Records written: {}", self.records_written)?;
        writeln!(f, "  Inline backfilled: {}", self.inline_backfilled)?;
        writeln!(f, "  Missed pending: {}", self.missed_pending)?;
        writeln!(f, "  Missed recovered: {}", self.missed_recovered)?;
        writeln!(f, "  Malformed frames: {}", self.malformed_frames)?;
        writeln!(f, "  Reconnects: {}", self.reconnects)?;
        writeln!(
            f,
            "  Consecutive flush failures: {}",
            self.consecutive_flush_failures
        )?;
        writeln!(f, "  Write degraded: {}", self.write_degraded)?;
        writeln!(
            f,
            "  Latest sequence number: {}",
            self.latest_sequence_number
        )
    }
}

/// Atomic counters shared by the ingest tasks.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    heads_received: AtomicU64,
    records_written: AtomicU64,
    inline_backfilled: AtomicU64,
    missed_pending: AtomicU64,
    missed_recovered: AtomicU64,
    malformed_frames: AtomicU64,
    reconnects: AtomicU64,
    consecutive_flush_failures: AtomicU64,
    write_degraded: AtomicBool,
    latest_sequence_number: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            heads_received: self.heads_received.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            inline_backfilled: self.inline_backfilled.load(Ordering::Relaxed),
            missed_pending: self.missed_pending.load(Ordering::Relaxed),
            missed_recovered: self.missed_recovered.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            consecutive_flush_failures: self.consecutive_flush_failures.load(Ordering::Relaxed),
            write_degraded: self.write_degraded.load(Ordering::Relaxed),
            latest_sequence_number: self.latest_sequence_number.load(Ordering::Relaxed),
        }
    }

    pub fn increment_heads_received(&self) {
        self.heads_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records_written(&self, count: u64) {
        self.records_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_inline_backfilled(&self) {
        self.inline_backfilled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_missed_pending(&self, count: u64) {
        self.missed_pending.store(count, Ordering::Relaxed);
    }

    pub fn increment_missed_recovered(&self) {
        self.missed_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_malformed_frames(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_consecutive_flush_failures(&self, count: u64) {
        self.consecutive_flush_failures
            .store(count, Ordering::Relaxed);
    }

    pub fn set_write_degraded(&self, degraded: bool) {
        self.write_degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn is_write_degraded(&self) -> bool {
        self.write_degraded.load(Ordering::Relaxed)
    }

    /// Keeps the maximum; late duplicates do not move it back.
    pub fn observe_sequence_number(&self, sequence_number: u64) {
        self.latest_sequence_number
            .fetch_max(sequence_number, Ordering::Relaxed);
    }
}

pub type SharedMetrics = Arc<IngestMetrics>;

pub fn create_shared_metrics() -> SharedMetrics {
    Arc::new(IngestMetrics::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = create_shared_metrics();
        metrics.increment_heads_received();
        metrics.increment_heads_received();
        metrics.add_records_written(10);
        metrics.observe_sequence_number(42);
        metrics.observe_sequence_number(41);
        metrics.set_write_degraded(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.heads_received, 2);
        assert_eq!(snapshot.records_written, 10);
        assert_eq!(snapshot.latest_sequence_number, 42);
        assert!(snapshot.write_degraded);
        assert!(snapshot.to_string().contains("Write degraded: true"));
    }
}
