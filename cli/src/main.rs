use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Command, arg, command, value_parser};
use dotenv::dotenv;
use futures_util::future::join_all;
use ingestor_actors::alert::{LogAlertChannel, PushoverChannel, SharedAlertChannel};
use ingestor_actors::gap_tracker::GapTracker;
use ingestor_actors::health::{HealthReporter, HealthStatus};
use ingestor_actors::liveness::{HealthchecksPing, LogLivenessPing, SharedLivenessPing};
use ingestor_actors::monitor::GapMonitor;
use ingestor_actors::source::{BlockSource, JsonRpcBlockSource, RetryPolicy, fetch_with_retry};
use ingestor_db::{BlockSink, Database, SharedSink};
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{CliConfig, get_cli_config};

mod config;

const BACKFILL_CHUNK_SIZE: u64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // .env is optional at runtime
    dotenv()
        .inspect_err(|err| println!("[WARN] reading .env files is failed with err {err}"))
        .ok();

    let config = get_cli_config()?;

    // logs
    let (non_blocking_appender, _guard_stdout) = tracing_appender::non_blocking(std::io::stdout());
    let stdout_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_appender)
        .with_filter(config.rust_log);
    tracing_subscriber::registry()
        .with(stdout_subscriber)
        .init();

    let matches = command!() // requires `cargo` feature
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("check")
                .about("run one gap scan and health cycle; exit 0 healthy, 1 degraded, 2 failed"),
        )
        .subcommand(Command::new("gaps").about("list tracked gaps"))
        .subcommand(Command::new("stats").about("show record count, bounds and latest record"))
        .subcommand(
            Command::new("backfill")
                .about("fetch a range of records from the rpc endpoint into the sink")
                .arg(arg!(<START> "first sequence number").value_parser(value_parser!(u64)))
                .arg(arg!(<END> "last sequence number, inclusive").value_parser(value_parser!(u64))),
        )
        .get_matches();

    let db = Database::open(config.db_path())
        .with_context(|| format!("failed to open {}", config.db_path().display()))?;

    match matches.subcommand() {
        Some(("check", _)) => {
            let status = check(&config, &db).await?;
            return Ok(ExitCode::from(exit_code(status)));
        }
        Some(("gaps", _)) => gaps(&db)?,
        Some(("stats", _)) => stats(&db)?,
        Some(("backfill", sub_matches)) => {
            let (Some(start), Some(end)) = (
                sub_matches.get_one::<u64>("START").copied(),
                sub_matches.get_one::<u64>("END").copied(),
            ) else {
                bail!("START and END are required");
            };
            let url = config
                .feed_rpc_url
                .clone()
                .context("FEED_RPC_URL is required for backfill")?;
            let source = JsonRpcBlockSource::new(url)?;
            let policy = RetryPolicy {
                attempts: config.fetch_attempts,
                initial_backoff: config.fetch_backoff(),
            };
            let summary = backfill(&source, &db.sink(), start, end, policy).await?;
            println!(
                "backfilled {} of {} records, {} unavailable",
                summary.written,
                end.saturating_sub(start) + 1,
                summary.failed.len()
            );
            if !summary.failed.is_empty() {
                println!("unavailable: {:?}", summary.failed);
            }
        }
        _ => (),
    };

    Ok(ExitCode::SUCCESS)
}

fn exit_code(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::ScanFailed => 2,
    }
}

async fn check(config: &CliConfig, db: &Database) -> anyhow::Result<HealthStatus> {
    let alerts: SharedAlertChannel = match (&config.pushover_token, &config.pushover_user) {
        (Some(token), Some(user)) => Arc::new(PushoverChannel::new(token, user)?),
        _ => Arc::new(LogAlertChannel),
    };
    let liveness: SharedLivenessPing = match &config.healthchecks_ping_url {
        Some(url) => Arc::new(HealthchecksPing::new(url)?),
        None => Arc::new(LogLivenessPing),
    };
    let tracker = GapTracker::builder()
        .keyspace(db.keyspace.clone())
        .partition(db.gap_tracking.clone())
        .alerts(alerts.clone())
        .grace_period(Duration::from_secs(config.gap_grace_period_seconds))
        .report_limit(config.gap_report_limit)
        .build();
    let reporter = HealthReporter::builder()
        .metadata(db.metadata.clone())
        .alerts(alerts)
        .liveness(liveness)
        .staleness_threshold(Duration::from_secs(config.staleness_threshold_seconds))
        .build();
    let sink: SharedSink = Arc::new(db.sink());
    let verdict = GapMonitor::new(sink, tracker, reporter).run_cycle().await;
    println!("{}", serde_json::to_string_pretty(&*verdict)?);
    Ok(verdict.status)
}

fn gaps(db: &Database) -> anyhow::Result<()> {
    let entries = db.gap_tracking.get_all()?;
    if entries.is_empty() {
        println!("no tracked gaps");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}..={} size={} first_seen={} last_seen={} notified={}",
            entry.start,
            entry.end,
            entry.size,
            entry.first_seen.format(&Rfc3339)?,
            entry.last_seen.format(&Rfc3339)?,
            entry.notified
        );
    }
    Ok(())
}

fn stats(db: &Database) -> anyhow::Result<()> {
    let sink = db.sink();
    match sink.query_count_and_bounds()? {
        Some(bounds) => println!(
            "records={} min={} max={} expected={} missing={}",
            bounds.count,
            bounds.min,
            bounds.max,
            bounds.expected(),
            bounds.expected().saturating_sub(bounds.count)
        ),
        None => println!("sink is empty"),
    }
    if let Some(latest) = sink.query_latest()? {
        let captured_at = time::OffsetDateTime::from_unix_timestamp(latest.captured_at as i64)?;
        println!(
            "latest={} captured_at={}",
            latest.sequence_number,
            captured_at.format(&Rfc3339)?
        );
    }
    println!("tracked_gaps={}", db.gap_tracking.get_all()?.len());
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct BackfillSummary {
    written: usize,
    failed: Vec<u64>,
}

/// Fetches `start..=end` in chunks and writes each chunk as one batch.
async fn backfill<S: BlockSource>(
    source: &S,
    sink: &impl BlockSink,
    start: u64,
    end: u64,
    policy: RetryPolicy,
) -> anyhow::Result<BackfillSummary> {
    if start > end {
        bail!("START {start} is greater than END {end}");
    }
    let mut summary = BackfillSummary::default();
    let mut chunk_start = start;
    loop {
        let chunk_end = chunk_start.saturating_add(BACKFILL_CHUNK_SIZE - 1).min(end);
        let results = join_all(
            (chunk_start..=chunk_end)
                .map(|sequence_number| fetch_with_retry(source, sequence_number, policy)),
        )
        .await;
        let mut records = Vec::with_capacity(results.len());
        for (sequence_number, result) in (chunk_start..=chunk_end).zip(results) {
            match result {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(sequence_number, %err, "Backfill fetch failed");
                    summary.failed.push(sequence_number);
                }
            }
        }
        sink.insert_batch(&records)
            .with_context(|| format!("failed to write {chunk_start}..={chunk_end}"))?;
        summary.written += records.len();
        info!(
            from = chunk_start,
            to = chunk_end,
            written = records.len(),
            "Backfill chunk written"
        );
        if chunk_end == end {
            break;
        }
        chunk_start = chunk_end + 1;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestor_actors::source::FetchError;
    use ingestor_db::Record;
    use std::collections::BTreeSet;
    use std::future::Future;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RangeSource {
        missing: BTreeSet<u64>,
        calls: Mutex<Vec<u64>>,
    }

    impl BlockSource for RangeSource {
        fn fetch_block(
            &self,
            sequence_number: u64,
        ) -> impl Future<Output = Result<Record, FetchError>> + Send {
            self.calls.lock().unwrap().push(sequence_number);
            let result = if self.missing.contains(&sequence_number) {
                Err(FetchError::NotFound(sequence_number))
            } else {
                Ok(Record {
                    sequence_number,
                    captured_at: 1_700_000_000 + sequence_number,
                    gas_limit: 1,
                    gas_used: 1,
                    base_fee_per_gas: 1,
                    transaction_count: 1,
                    difficulty: 0,
                    total_difficulty: None,
                    size: 1,
                    blob_gas_used: None,
                    excess_blob_gas: None,
                })
            };
            futures_util::future::ready(result)
        }
    }

    #[tokio::test]
    async fn test_backfill_fills_range_in_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();
        let sink = db.sink();
        let source = RangeSource {
            missing: BTreeSet::from([150]),
            calls: Mutex::new(Vec::new()),
        };

        let summary = backfill(&source, &sink, 1, 250, RetryPolicy::single())
            .await
            .unwrap();
        assert_eq!(summary.written, 249);
        assert_eq!(summary.failed, vec![150]);
        assert_eq!(source.calls.lock().unwrap().len(), 250);

        let bounds = sink.query_count_and_bounds().unwrap().unwrap();
        assert_eq!((bounds.count, bounds.min, bounds.max), (249, 1, 250));
        assert_eq!(sink.query_gaps().unwrap().len(), 1);
    }

    #[test]
    fn test_exit_codes_follow_status() {
        assert_eq!(exit_code(HealthStatus::Healthy), 0);
        assert_eq!(exit_code(HealthStatus::Degraded), 1);
        assert_eq!(exit_code(HealthStatus::ScanFailed), 2);
    }

    #[tokio::test]
    async fn test_check_on_fresh_keyspace_returns_without_exiting() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();
        let config: CliConfig = envy::from_iter(Vec::<(String, String)>::new()).unwrap();

        let status = check(&config, &db).await.unwrap();
        assert_eq!(status, HealthStatus::Degraded);
        db.persist().unwrap();
    }

    #[tokio::test]
    async fn test_backfill_rejects_inverted_range() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();
        let source = RangeSource {
            missing: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        };
        assert!(
            backfill(&source, &db.sink(), 10, 9, RetryPolicy::single())
                .await
                .is_err()
        );
    }
}
