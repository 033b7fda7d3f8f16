use crate::buffer::SharedBuffer;
use crate::metrics::SharedMetrics;
use futures_util::FutureExt;
use ingestor_db::{Record, SharedSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

pub const DEFAULT_SHUTDOWN_FLUSH_ATTEMPTS: u32 = 3;
const IMMEDIATE_RETRY_BASE: Duration = Duration::from_secs(1);
const IMMEDIATE_RETRY_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written(usize),
    /// The batch went back into the buffer.
    Requeued(usize),
}

/// Drains [`crate::buffer::RecordBuffer`] into the sink on a fixed period,
/// or after every append when the period is zero.
#[derive(bon::Builder)]
pub struct BatchFlusher {
    buffer: SharedBuffer,
    sink: SharedSink,
    metrics: SharedMetrics,
    interval: Duration,
    /// Consecutive failures before the degraded-write signal is raised.
    failure_threshold: u32,
    #[builder(default = DEFAULT_SHUTDOWN_FLUSH_ATTEMPTS)]
    shutdown_flush_attempts: u32,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    #[builder(skip)]
    consecutive_failures: u32,
}

impl BatchFlusher {
    pub async fn task(mut self) -> anyhow::Result<()> {
        let mut ticker = (!self.interval.is_zero()).then(|| {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        info!(interval = ?self.interval, "Batch flusher started");
        loop {
            let retry = self.immediate_retry();
            tokio::select! {
                biased;
                shutdown_result = (&mut self.shutdown_rx).fuse() => {
                    shutdown_result
                        .inspect(|_| info!("Shutdown signal received, flushing buffer"))
                        .inspect_err(|err| warn!("Shutdown receiver error: {}", err))
                        .ok();
                    break;
                }
                _ = next_flush(ticker.as_mut(), &self.buffer, retry) => {
                    self.flush().await;
                }
            }
        }
        self.final_flush().await
    }

    /// One drain and write. Never fails: a failed batch is requeued.
    pub async fn flush(&mut self) -> FlushOutcome {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        match self.write(&batch).await {
            Ok(()) => {
                self.on_success(&batch);
                FlushOutcome::Written(batch.len())
            }
            Err(err) => {
                let size = batch.len();
                self.buffer.requeue(batch);
                self.on_failure(size, &err);
                FlushOutcome::Requeued(size)
            }
        }
    }

    async fn write(&self, batch: &[Record]) -> anyhow::Result<()> {
        let sink = self.sink.clone();
        let records: Arc<[Record]> = batch.into();
        tokio::task::spawn_blocking(move || sink.insert_batch(&records))
            .await
            .inspect_err(|err| error!(records = batch.len(), "Sink write task failed: {err}"))??;
        Ok(())
    }

    /// Without a ticker a requeued batch would wait for the next append.
    fn immediate_retry(&self) -> Option<Duration> {
        if !self.interval.is_zero() || self.consecutive_failures == 0 || self.buffer.is_empty() {
            return None;
        }
        let exponent = (self.consecutive_failures - 1).min(5);
        Some(
            IMMEDIATE_RETRY_BASE
                .saturating_mul(1u32 << exponent)
                .min(IMMEDIATE_RETRY_CAP),
        )
    }

    fn on_success(&mut self, batch: &[Record]) {
        if self.consecutive_failures > 0 {
            info!(
                failures = self.consecutive_failures,
                "Sink writes recovered"
            );
        }
        self.consecutive_failures = 0;
        self.metrics.set_consecutive_flush_failures(0);
        self.metrics.set_write_degraded(false);
        self.metrics.add_records_written(batch.len() as u64);
    }

    fn on_failure(&mut self, size: usize, err: &anyhow::Error) {
        self.consecutive_failures += 1;
        self.metrics
            .set_consecutive_flush_failures(self.consecutive_failures as u64);
        warn!(
            records = size,
            failures = self.consecutive_failures,
            buffered = self.buffer.len(),
            "Sink write failed, batch requeued: {err}"
        );
        if self.consecutive_failures >= self.failure_threshold && !self.metrics.is_write_degraded()
        {
            error!(
                failures = self.consecutive_failures,
                "Sink writes degraded, retrying every flush"
            );
            self.metrics.set_write_degraded(true);
        }
    }

    /// Writes whatever is still buffered, retrying a bounded number of times.
    async fn final_flush(&mut self) -> anyhow::Result<()> {
        let attempts = self.shutdown_flush_attempts.max(1);
        for attempt in 1..=attempts {
            match self.flush().await {
                FlushOutcome::Empty => {
                    info!("Buffer empty, flusher stopped");
                    return Ok(());
                }
                FlushOutcome::Written(count) => {
                    info!(records = count, "Final flush written");
                    return Ok(());
                }
                FlushOutcome::Requeued(_) if attempt < attempts => {
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                FlushOutcome::Requeued(_) => {}
            }
        }
        let lost = self.buffer.len();
        error!(records = lost, "Final flush failed, records not written");
        anyhow::bail!("final flush failed with {lost} records unwritten")
    }
}

async fn next_flush(ticker: Option<&mut Interval>, buffer: &SharedBuffer, retry: Option<Duration>) {
    match (ticker, retry) {
        (Some(ticker), _) => {
            ticker.tick().await;
        }
        (None, Some(retry)) => {
            tokio::select! {
                _ = buffer.appended() => {}
                _ = tokio::time::sleep(retry) => {}
            }
        }
        (None, None) => buffer.appended().await,
    }
}
