use crate::buffer::SharedBuffer;
use crate::cursor::{CursorDecision, SequenceCursor};
use crate::metrics::SharedMetrics;
use crate::missed::MissedSequenceSet;
use crate::source::{BlockSource, RetryPolicy, fetch_with_retry};
use futures_util::FutureExt;
use ingestor_db::Record;
use protocol::PartialHeader;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Turns head notifications into full records in the buffer. Small gaps are
/// fetched inline before the head itself; larger ones go to the missed set and
/// are retried on `missed_retry_interval`.
#[derive(bon::Builder)]
pub struct StreamIngestor<S: BlockSource> {
    source: S,
    buffer: SharedBuffer,
    metrics: SharedMetrics,
    heads_rx: flume::Receiver<PartialHeader>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    fetch_policy: RetryPolicy,
    small_gap_threshold: u64,
    missed_retry_interval: Duration,
    missed_retry_batch: usize,
    #[builder(default)]
    cursor: SequenceCursor,
    #[builder(default)]
    missed: MissedSequenceSet,
}

impl<S: BlockSource> StreamIngestor<S> {
    pub async fn task(mut self) -> anyhow::Result<()> {
        let period = self.missed_retry_interval.max(Duration::from_secs(1));
        let mut retry_tick = tokio::time::interval_at(Instant::now() + period, period);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                shutdown_result = (&mut self.shutdown_rx).fuse() => {
                    shutdown_result
                        .inspect(|_| info!("Shutdown signal received, stopping ingestor"))
                        .inspect_err(|err| warn!("Shutdown receiver error: {}", err))
                        .ok();
                    break;
                }
                head = self.heads_rx.recv_async() => match head {
                    Ok(header) => self.handle_head(header).await,
                    Err(_) => {
                        info!("Head channel closed, stopping ingestor");
                        break;
                    }
                },
                _ = retry_tick.tick(), if !self.missed.is_empty() => {
                    self.retry_missed().await;
                }
            }
        }
        if !self.missed.is_empty() {
            warn!(
                pending = self.missed.len(),
                lowest = ?self.missed.lowest(1).first(),
                "Stopping with unresolved keys, the gap monitor will report them"
            );
        }
        Ok(())
    }

    pub async fn handle_head(&mut self, header: PartialHeader) {
        let sequence_number = header.number;
        let record = match fetch_with_retry(&self.source, sequence_number, self.fetch_policy).await
        {
            Ok(record) => record,
            Err(err) => {
                warn!(sequence_number, %err, "Fetch exhausted, queued for retry");
                self.missed.insert(sequence_number);
                self.update_missed_metric();
                return;
            }
        };
        match self.cursor.observe(sequence_number) {
            CursorDecision::First => info!(sequence_number, "Cursor seeded"),
            CursorDecision::InOrder => {}
            CursorDecision::Gap { start, end } => self.close_gap(start, end).await,
            CursorDecision::Behind => {
                debug!(sequence_number, "Duplicate or out-of-order head accepted")
            }
        }
        if self.missed.remove(sequence_number) {
            self.metrics.increment_missed_recovered();
        }
        self.push(record);
        self.update_missed_metric();
    }

    async fn close_gap(&mut self, start: u64, end: u64) {
        let size = end - start + 1;
        if size > self.small_gap_threshold {
            warn!(start, end, size, "Large gap, queued for retry");
            self.missed.insert_range(start, end);
            return;
        }
        info!(start, end, size, "Backfilling small gap inline");
        for sequence_number in start..=end {
            match fetch_with_retry(&self.source, sequence_number, self.fetch_policy).await {
                Ok(record) => {
                    self.metrics.increment_inline_backfilled();
                    self.missed.remove(sequence_number);
                    self.push(record);
                }
                Err(err) => {
                    warn!(sequence_number, %err, "Inline backfill exhausted, queued for retry");
                    self.missed.insert(sequence_number);
                }
            }
        }
    }

    /// One attempt for each of the lowest `missed_retry_batch` keys.
    pub async fn retry_missed(&mut self) {
        let keys = self.missed.lowest(self.missed_retry_batch);
        let mut recovered = 0usize;
        for sequence_number in keys.iter().copied() {
            match self.source.fetch_block(sequence_number).await {
                Ok(record) => {
                    self.missed.remove(sequence_number);
                    self.metrics.increment_missed_recovered();
                    self.push(record);
                    recovered += 1;
                }
                Err(err) => debug!(sequence_number, %err, "Missed key still unavailable"),
            }
        }
        if recovered > 0 {
            info!(
                recovered,
                attempted = keys.len(),
                pending = self.missed.len(),
                "Missed keys recovered"
            );
        }
        self.update_missed_metric();
    }

    fn push(&self, record: Record) {
        self.metrics.observe_sequence_number(record.sequence_number);
        self.buffer.append(record);
    }

    fn update_missed_metric(&self) {
        self.metrics.set_missed_pending(self.missed.len() as u64);
    }

    #[cfg(test)]
    pub fn cursor(&self) -> &SequenceCursor {
        &self.cursor
    }

    #[cfg(test)]
    pub fn missed(&self) -> &MissedSequenceSet {
        &self.missed
    }
}
