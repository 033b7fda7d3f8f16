use crate::alert::{Alert, Priority, SharedAlertChannel};
use fjall::TxKeyspace;
use ingestor_db::{DbError, GapRange, GapTrackingEntry, GapTrackingPartition};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub const PERSISTENT_GAP_TITLE: &str = "PERSISTENT GAP";
pub const GAP_RESOLVED_TITLE: &str = "GAP RESOLVED";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackOutcome {
    /// Ranges seen for the first time this cycle.
    pub new: usize,
    /// Ranges whose persistent alert was delivered this cycle.
    pub escalated: usize,
    /// Ranges present in the scan.
    pub open: usize,
    /// Tracked ranges that disappeared and were reported as resolved.
    pub resolved: usize,
    /// Open ranges older than the grace period, alerted or not.
    pub persistent_count: usize,
    /// Alerts the channel did not accept; retried next cycle.
    pub alert_failures: usize,
}

/// Persists the lifecycle of every scanned range and emits at most one
/// persistent and one resolved alert per range.
///
/// An entry is marked notified, or deleted, only after the channel accepted
/// the alert about it. Every change of a cycle lands in one write
/// transaction, committed once both alerts have been answered.
#[derive(bon::Builder)]
pub struct GapTracker {
    keyspace: TxKeyspace,
    partition: GapTrackingPartition,
    alerts: SharedAlertChannel,
    grace_period: Duration,
    /// Ranges listed per alert body; the rest are summarised.
    #[builder(default = 20)]
    report_limit: usize,
}

impl GapTracker {
    pub async fn track(
        &self,
        ranges: &[GapRange],
        now: OffsetDateTime,
    ) -> Result<TrackOutcome, DbError> {
        let tracked: BTreeMap<(u64, u64), GapTrackingEntry> = {
            let rtx = self.keyspace.read_tx();
            let tracked = self
                .partition
                .get_all_rtx(&rtx)
                .map(|entry| entry.map(|entry| (entry.key(), entry)))
                .collect::<Result<_, _>>()?;
            tracked
        };
        let scanned: BTreeSet<(u64, u64)> = ranges.iter().map(|r| (r.start, r.end)).collect();

        let mut outcome = TrackOutcome {
            open: scanned.len(),
            ..Default::default()
        };
        let mut upserts = Vec::with_capacity(ranges.len());
        let mut due = Vec::new();
        for range in ranges {
            match tracked.get(&(range.start, range.end)) {
                None => {
                    info!(start = range.start, end = range.end, size = range.size, "New gap, tracking");
                    upserts.push(GapTrackingEntry::opened(*range, now));
                    outcome.new += 1;
                }
                Some(entry) => {
                    let past_grace = now - entry.first_seen >= self.grace_period;
                    if past_grace {
                        outcome.persistent_count += 1;
                    }
                    let mut entry = *entry;
                    entry.last_seen = now;
                    if past_grace && !entry.notified {
                        due.push(entry);
                    } else {
                        debug!(start = entry.start, end = entry.end, notified = entry.notified, "Gap still open");
                        upserts.push(entry);
                    }
                }
            }
        }

        if !due.is_empty() {
            match self.alerts.send(self.persistent_alert(&due, now)).await {
                Ok(()) => {
                    for entry in &mut due {
                        entry.notified = true;
                    }
                    outcome.escalated = due.len();
                }
                Err(err) => {
                    error!(ranges = due.len(), "Persistent gap alert failed, retrying next cycle: {err}");
                    outcome.alert_failures += 1;
                }
            }
            upserts.append(&mut due);
        }

        let mut resolved = tracked
            .values()
            .filter(|entry| !scanned.contains(&entry.key()))
            .copied()
            .collect_vec();
        if !resolved.is_empty() {
            match self.alerts.send(self.resolved_alert(&resolved, now)).await {
                Ok(()) => {
                    for entry in &resolved {
                        info!(start = entry.start, end = entry.end, "Gap resolved");
                    }
                    outcome.resolved = resolved.len();
                }
                Err(err) => {
                    warn!(ranges = resolved.len(), "Resolved gap alert failed, retrying next cycle: {err}");
                    outcome.alert_failures += 1;
                    resolved.clear();
                }
            }
        }

        let mut wtx = self.keyspace.write_tx()?;
        for entry in &upserts {
            self.partition.upsert_wtx(&mut wtx, entry);
        }
        for entry in &resolved {
            self.partition.remove_wtx(&mut wtx, entry.start, entry.end);
        }
        wtx.commit()?.map_err(|_| DbError::Conflict)?;
        Ok(outcome)
    }

    fn persistent_alert(&self, entries: &[GapTrackingEntry], now: OffsetDateTime) -> Alert {
        let missing: u64 = entries.iter().map(|e| e.size).sum();
        let mut body = format!(
            "{} gap(s) open longer than {} minutes, {missing} records missing\n",
            entries.len(),
            self.grace_period.as_secs() / 60
        );
        for entry in entries.iter().take(self.report_limit) {
            _ = writeln!(
                body,
                "{}..={} ({} records, open {} min)",
                entry.start,
                entry.end,
                entry.size,
                (now - entry.first_seen).whole_minutes()
            );
        }
        self.append_overflow(&mut body, entries.len());
        body.push_str("Manual backfill needed");
        Alert::new(PERSISTENT_GAP_TITLE, body, Priority::Emergency)
    }

    fn resolved_alert(&self, entries: &[GapTrackingEntry], now: OffsetDateTime) -> Alert {
        let mut body = format!("{} tracked gap(s) filled\n", entries.len());
        for entry in entries.iter().take(self.report_limit) {
            _ = writeln!(
                body,
                "{}..={} ({} records) resolved after {} min",
                entry.start,
                entry.end,
                entry.size,
                (now - entry.first_seen).whole_minutes()
            );
        }
        self.append_overflow(&mut body, entries.len());
        Alert::new(GAP_RESOLVED_TITLE, body, Priority::Normal)
    }

    fn append_overflow(&self, body: &mut String, total: usize) {
        if total > self.report_limit {
            _ = writeln!(body, "... and {} more", total - self.report_limit);
        }
    }
}
