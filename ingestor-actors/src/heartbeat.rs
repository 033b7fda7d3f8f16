use crate::buffer::SharedBuffer;
use crate::liveness::SharedLivenessPing;
use crate::metrics::{IngestMetricsSnapshot, SharedMetrics};
use futures_util::FutureExt;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Periodic liveness ping of the ingest path. Reports failure while sink
/// writes are degraded.
#[derive(bon::Builder)]
pub struct Heartbeat {
    ping: SharedLivenessPing,
    metrics: SharedMetrics,
    buffer: SharedBuffer,
    interval: Duration,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

impl Heartbeat {
    pub async fn task(mut self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = (&mut self.shutdown_rx).fuse() => {
                    info!("Heartbeat stopped");
                    return Ok(());
                }
                _ = ticker.tick() => self.beat().await,
            }
        }
    }

    pub async fn beat(&self) {
        let snapshot = self.metrics.snapshot();
        let success = !snapshot.write_degraded;
        let diagnostic = diagnostic(&snapshot, self.buffer.len());
        _ = self
            .ping
            .ping(success, diagnostic)
            .await
            .inspect_err(|err| warn!("Heartbeat ping failed: {err}"));
    }
}

fn diagnostic(snapshot: &IngestMetricsSnapshot, buffered: usize) -> String {
    format!(
        "{} latest={} heads={} written={} buffered={} missed={} flush_failures={} reconnects={}",
        if snapshot.write_degraded {
            "WRITE_DEGRADED"
        } else {
            "OK"
        },
        snapshot.latest_sequence_number,
        snapshot.heads_received,
        snapshot.records_written,
        buffered,
        snapshot.missed_pending,
        snapshot.consecutive_flush_failures,
        snapshot.reconnects,
    )
}
