use crate::gap_scanner::GapScanner;
use crate::gap_tracker::GapTracker;
use crate::health::{HealthReporter, Verdict};
use anyhow::Context;
use arc_swap::ArcSwapOption;
use futures_util::FutureExt;
use ingestor_db::SharedSink;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// One scan, track and report pipeline over the sink. Cycles never overlap.
pub struct GapMonitor {
    sink: SharedSink,
    scanner: GapScanner,
    tracker: GapTracker,
    reporter: HealthReporter,
    cycle_lock: tokio::sync::Mutex<()>,
    last_verdict: ArcSwapOption<Verdict>,
}

impl GapMonitor {
    pub fn new(sink: SharedSink, tracker: GapTracker, reporter: HealthReporter) -> Self {
        Self {
            scanner: GapScanner::new(sink.clone()),
            sink,
            tracker,
            reporter,
            cycle_lock: tokio::sync::Mutex::new(()),
            last_verdict: ArcSwapOption::empty(),
        }
    }

    pub async fn run_cycle(&self) -> Arc<Verdict> {
        self.run_cycle_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_cycle_at(&self, now: OffsetDateTime) -> Arc<Verdict> {
        let _guard = self.cycle_lock.lock().await;
        let verdict = match self.evaluate(now).await {
            Ok(verdict) => verdict,
            Err(err) => self.reporter.report_failure(&err, now).await,
        };
        info!(
            status = verdict.status.as_str(),
            open = verdict.gaps.open,
            persistent = verdict.gaps.persistent,
            resolved = verdict.gaps.resolved,
            "Monitor cycle finished"
        );
        let verdict = Arc::new(verdict);
        self.last_verdict.store(Some(verdict.clone()));
        verdict
    }

    async fn evaluate(&self, now: OffsetDateTime) -> anyhow::Result<Verdict> {
        let sink = self.sink.clone();
        let latest = tokio::task::spawn_blocking(move || sink.query_latest())
            .await?
            .context("latest record query failed")?;
        let scanner = self.scanner.clone();
        let scan = tokio::task::spawn_blocking(move || scanner.scan())
            .await?
            .context("gap scan failed")?;
        let outcome = self
            .tracker
            .track(&scan.ranges, now)
            .await
            .context("gap tracking failed")?;
        let verdict = self.reporter.assess(latest, &scan, &outcome, now);
        self.reporter
            .report(&verdict)
            .await
            .context("storing health state failed")?;
        Ok(verdict)
    }

    /// Verdict of the most recent cycle, if any ran.
    pub fn last_verdict(&self) -> Option<Arc<Verdict>> {
        self.last_verdict.load_full()
    }
}

pub type SharedMonitor = Arc<GapMonitor>;

/// Runs [`GapMonitor`] cycles on a fixed schedule. A zero interval disables
/// the schedule; on-demand cycles still work.
#[derive(bon::Builder)]
pub struct MonitorScheduler {
    monitor: SharedMonitor,
    interval: Duration,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

impl MonitorScheduler {
    pub async fn task(mut self) -> anyhow::Result<()> {
        if self.interval.is_zero() {
            info!("Scheduled monitor cycles disabled");
            _ = (&mut self.shutdown_rx)
                .await
                .inspect_err(|err| warn!("Shutdown receiver error: {}", err));
            return Ok(());
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = (&mut self.shutdown_rx).fuse() => {
                    info!("Monitor scheduler stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.monitor.run_cycle().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap_tracker::GAP_RESOLVED_TITLE;
    use crate::health::HealthStatus;
    use crate::test_util::{MemorySink, RecordingAlerts, RecordingPing, record};
    use ingestor_db::{BlockSink, Database, GapRange};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        db: Database,
        alerts: Arc<RecordingAlerts>,
        ping: Arc<RecordingPing>,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();
        Fixture {
            _temp_dir: temp_dir,
            db,
            alerts: Arc::new(RecordingAlerts::default()),
            ping: Arc::new(RecordingPing::default()),
        }
    }

    fn monitor(f: &Fixture, sink: SharedSink) -> GapMonitor {
        let tracker = GapTracker::builder()
            .keyspace(f.db.keyspace.clone())
            .partition(f.db.gap_tracking.clone())
            .alerts(f.alerts.clone())
            .grace_period(Duration::from_secs(1800))
            .build();
        let reporter = HealthReporter::builder()
            .metadata(f.db.metadata.clone())
            .alerts(f.alerts.clone())
            .liveness(f.ping.clone())
            .staleness_threshold(Duration::from_secs(960))
            .build();
        GapMonitor::new(sink, tracker, reporter)
    }

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(seconds).unwrap()
    }

    #[tokio::test]
    async fn test_detects_and_resolves_gap_end_to_end() {
        let f = fixture();
        let sink = Arc::new(f.db.sink());
        let holed = (1..=1000)
            .filter(|k| !(501..=510).contains(k))
            .map(record)
            .collect::<Vec<_>>();
        sink.insert_batch(&holed).unwrap();
        let monitor = monitor(&f, sink.clone());
        let now = record(1000).captured_at as i64 + 30;

        let first = monitor.run_cycle_at(at(now)).await;
        assert_eq!(first.status, HealthStatus::Healthy);
        assert_eq!(first.gaps.open, 1);
        assert_eq!(first.gaps.new, 1);
        assert_eq!(first.gaps.missing_records, 10);
        assert_eq!(
            f.db.gap_tracking
                .get_all()
                .unwrap()
                .iter()
                .map(|e| (e.key(), e.size))
                .collect::<Vec<_>>(),
            vec![((501, 510), GapRange::new(501, 510).size)]
        );
        assert!(f.alerts.sent().is_empty());

        sink.insert_batch(&(501..=510).map(record).collect::<Vec<_>>())
            .unwrap();
        let second = monitor.run_cycle_at(at(now + 60)).await;
        assert_eq!(second.gaps.open, 0);
        assert_eq!(second.gaps.resolved, 1);
        assert_eq!(f.alerts.titles(), vec![GAP_RESOLVED_TITLE]);

        let third = monitor.run_cycle_at(at(now + 120)).await;
        assert_eq!(third.gaps.resolved, 0);
        assert_eq!(f.alerts.sent().len(), 1);
        assert_eq!(monitor.last_verdict().unwrap().checked_at, at(now + 120));
        assert!(f.ping.pings().iter().all(|(ok, _)| *ok));
    }

    #[tokio::test]
    async fn test_empty_sink_is_degraded_not_failed() {
        let f = fixture();
        let monitor = monitor(&f, Arc::new(f.db.sink()));
        let verdict = monitor.run_cycle().await;
        assert_eq!(verdict.status, HealthStatus::Degraded);
        assert_eq!(verdict.status_code(), 500);
    }

    #[tokio::test]
    async fn test_scan_failure_yields_failed_verdict() {
        let f = fixture();
        let sink = Arc::new(MemorySink::default());
        sink.set_fail_reads(true);
        let monitor = monitor(&f, sink);
        let verdict = monitor.run_cycle().await;
        assert_eq!(verdict.status, HealthStatus::ScanFailed);
        assert_eq!(verdict.status_code(), 503);
        assert_eq!(f.ping.pings().len(), 1);
        assert!(!f.ping.pings()[0].0);
    }

    #[tokio::test]
    async fn test_scheduler_runs_first_cycle_immediately() {
        let f = fixture();
        let monitor = Arc::new(monitor(&f, Arc::new(f.db.sink())));
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(
            MonitorScheduler::builder()
                .monitor(monitor.clone())
                .interval(Duration::from_secs(3600))
                .shutdown_rx(shutdown_rx)
                .build()
                .task(),
        );
        while monitor.last_verdict().is_none() {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
