use crate::alert::{Alert, Priority, SharedAlertChannel};
use crate::gap_scanner::ScanReport;
use crate::gap_tracker::TrackOutcome;
use crate::liveness::SharedLivenessPing;
use crate::metrics::SharedMetrics;
use ingestor_db::{DbError, LatestRecord, MetadataPartition};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info, warn};

pub const DATA_STALE_TITLE: &str = "DATA STALE";
pub const WRITE_DEGRADED_TITLE: &str = "WRITE DEGRADED";
pub const SCAN_FAILED_TITLE: &str = "GAP SCAN FAILED";
pub const HEALTHY_TITLE: &str = "HEALTHY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    ScanFailed,
}

impl HealthStatus {
    pub fn status_code(self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Degraded => 500,
            HealthStatus::ScanFailed => 503,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::ScanFailed => "SCAN_FAILED",
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    Stale = 1,
    PersistentGaps = 1 << 1,
    WriteDegraded = 1 << 2,
    /// The sink holds no records at all.
    Empty = 1 << 3,
}

impl DegradedReason {
    pub const ALL: [DegradedReason; 4] = [
        DegradedReason::Stale,
        DegradedReason::PersistentGaps,
        DegradedReason::WriteDegraded,
        DegradedReason::Empty,
    ];

    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// Bit set of [`DegradedReason`], persisted between cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DegradedReasons(u8);

impl DegradedReasons {
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, reason: DegradedReason) {
        self.0 |= reason.bit();
    }

    pub fn contains(self, reason: DegradedReason) -> bool {
        self.0 & reason.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, reason: DegradedReason) -> Self {
        Self(self.0 & !reason.bit())
    }

    /// Reasons in `self` that are not in `previous`.
    pub fn entered_since(self, previous: Self) -> Self {
        Self(self.0 & !previous.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = DegradedReason> {
        DegradedReason::ALL
            .into_iter()
            .filter(move |reason| self.contains(*reason))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GapCounts {
    pub open: usize,
    pub new: usize,
    pub persistent: usize,
    pub escalated: usize,
    pub resolved: usize,
    pub missing_records: u64,
}

/// Result of one scan and health cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub status: HealthStatus,
    pub reasons: Vec<DegradedReason>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub latest_sequence_number: Option<u64>,
    pub latest_age_seconds: Option<u64>,
    pub record_count: Option<u64>,
    pub min_sequence_number: Option<u64>,
    pub max_sequence_number: Option<u64>,
    pub gaps: GapCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Verdict {
    pub fn status_code(&self) -> u16 {
        self.status.status_code()
    }

    pub fn reason_set(&self) -> DegradedReasons {
        let mut set = DegradedReasons::default();
        self.reasons.iter().for_each(|reason| set.insert(*reason));
        set
    }

    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Status: {}", self.status.as_str())?;
        if let Some(error) = &self.error {
            return writeln!(f, "Error: {error}");
        }
        match (self.latest_sequence_number, self.latest_age_seconds) {
            (Some(latest), Some(age)) => writeln!(f, "Latest: {latest} ({age}s old)")?,
            _ => writeln!(f, "Latest: none")?,
        }
        if !self.reasons.is_empty() {
            writeln!(f, "Reasons: {:?}", self.reasons)?;
        }
        writeln!(f, "New gaps: {}", self.gaps.new)?;
        writeln!(f, "Persistent gaps: {}", self.gaps.persistent)?;
        write!(f, "Resolved gaps: {}", self.gaps.resolved)
    }
}

/// Turns freshness and tracked gap state into a [`Verdict`], alerts when the
/// ingestor enters a degraded state and pings the monitor's liveness endpoint.
#[derive(bon::Builder)]
pub struct HealthReporter {
    metadata: MetadataPartition,
    alerts: SharedAlertChannel,
    liveness: SharedLivenessPing,
    staleness_threshold: Duration,
    /// Present when the reporter runs next to the ingest tasks.
    metrics: Option<SharedMetrics>,
}

impl HealthReporter {
    pub fn assess(
        &self,
        latest: Option<LatestRecord>,
        scan: &ScanReport,
        outcome: &TrackOutcome,
        now: OffsetDateTime,
    ) -> Verdict {
        let mut reasons = DegradedReasons::default();
        let age = latest.map(|latest| {
            let captured_at = i64::try_from(latest.captured_at).unwrap_or(i64::MAX);
            now.unix_timestamp().saturating_sub(captured_at).max(0) as u64
        });
        match age {
            None => reasons.insert(DegradedReason::Empty),
            Some(age) if age > self.staleness_threshold.as_secs() => {
                reasons.insert(DegradedReason::Stale)
            }
            Some(_) => {}
        }
        if outcome.persistent_count > 0 {
            reasons.insert(DegradedReason::PersistentGaps);
        }
        if self
            .metrics
            .as_ref()
            .is_some_and(|metrics| metrics.is_write_degraded())
        {
            reasons.insert(DegradedReason::WriteDegraded);
        }
        Verdict {
            status: if reasons.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            reasons: reasons.iter().collect(),
            checked_at: now,
            latest_sequence_number: latest.map(|l| l.sequence_number),
            latest_age_seconds: age,
            record_count: scan.bounds.map(|b| b.count),
            min_sequence_number: scan.bounds.map(|b| b.min),
            max_sequence_number: scan.bounds.map(|b| b.max),
            gaps: GapCounts {
                open: outcome.open,
                new: outcome.new,
                persistent: outcome.persistent_count,
                escalated: outcome.escalated,
                resolved: outcome.resolved,
                missing_records: scan.missing(),
            },
            error: None,
        }
    }

    /// Sends the transition alert, stores the reason mask and pings.
    ///
    /// Returning to healthy from an alerted reason sends a normal priority
    /// recovery alert. Persistent gaps recover through the resolved alert.
    pub async fn report(&self, verdict: &Verdict) -> Result<(), DbError> {
        let reasons = verdict.reason_set();
        let previous = DegradedReasons::from_bits(self.metadata.health_reasons()?);
        let entered = reasons
            .without(DegradedReason::PersistentGaps)
            .entered_since(previous);

        let mut stored = reasons;
        if !entered.is_empty() {
            let alert = transition_alert(entered, verdict);
            if let Err(err) = self.alerts.send(alert).await {
                error!("Degraded alert failed, retrying next cycle: {err}");
                stored = previous.intersection(reasons);
            }
        } else if reasons.is_empty() && !previous.is_empty() {
            info!("Health recovered");
            if !previous.without(DegradedReason::PersistentGaps).is_empty() {
                let alert = recovery_alert(verdict, self.staleness_threshold);
                if let Err(err) = self.alerts.send(alert).await {
                    error!("Recovery alert failed, retrying next cycle: {err}");
                    stored = previous;
                }
            }
        }
        self.metadata.set_health_reasons(stored.bits())?;
        self.ping(verdict.status == HealthStatus::Healthy, verdict.diagnostic())
            .await;
        Ok(())
    }

    /// Scan failures alert on every occurrence.
    pub async fn report_failure(&self, err: &anyhow::Error, now: OffsetDateTime) -> Verdict {
        error!("Gap scan failed: {err:#}");
        let verdict = Verdict {
            status: HealthStatus::ScanFailed,
            reasons: Vec::new(),
            checked_at: now,
            latest_sequence_number: None,
            latest_age_seconds: None,
            record_count: None,
            min_sequence_number: None,
            max_sequence_number: None,
            gaps: GapCounts::default(),
            error: Some(format!("{err:#}")),
        };
        _ = self
            .alerts
            .send(Alert::new(
                SCAN_FAILED_TITLE,
                verdict.diagnostic(),
                Priority::Emergency,
            ))
            .await
            .inspect_err(|err| error!("Scan failure alert failed: {err}"));
        self.ping(false, verdict.diagnostic()).await;
        verdict
    }

    async fn ping(&self, success: bool, diagnostic: String) {
        _ = self
            .liveness
            .ping(success, diagnostic)
            .await
            .inspect_err(|err| warn!("Liveness ping failed: {err}"));
    }
}

fn transition_alert(entered: DegradedReasons, verdict: &Verdict) -> Alert {
    let title = if entered.contains(DegradedReason::Stale) || entered.contains(DegradedReason::Empty)
    {
        DATA_STALE_TITLE
    } else {
        WRITE_DEGRADED_TITLE
    };
    Alert::new(title, verdict.diagnostic(), Priority::Emergency)
}

fn recovery_alert(verdict: &Verdict, staleness_threshold: Duration) -> Alert {
    let mut body = String::new();
    if let (Some(count), Some(min), Some(max)) = (
        verdict.record_count,
        verdict.min_sequence_number,
        verdict.max_sequence_number,
    ) {
        body.push_str(&format!("Records: {count} ({min}..={max})\n"));
    }
    if let (Some(latest), Some(age)) = (verdict.latest_sequence_number, verdict.latest_age_seconds)
    {
        let threshold = staleness_threshold.as_secs().max(1);
        body.push_str(&format!(
            "Latest: {latest} ({age}s old, {}% of {threshold}s)\n",
            age.saturating_mul(100) / threshold
        ));
    }
    body.push_str(&format!(
        "Gaps: {} new | {} tracked ({} open) | {} resolved",
        verdict.gaps.new, verdict.gaps.persistent, verdict.gaps.open, verdict.gaps.resolved
    ));
    Alert::new(HEALTHY_TITLE, body, Priority::Normal)
}
