use std::future::Future;
use std::sync::Arc;

use dotenv::dotenv;
use ingestor_actors::alert::{LogAlertChannel, PushoverChannel, SharedAlertChannel};
use ingestor_actors::buffer::RecordBuffer;
use ingestor_actors::flusher::BatchFlusher;
use ingestor_actors::gap_tracker::GapTracker;
use ingestor_actors::health::HealthReporter;
use ingestor_actors::heartbeat::Heartbeat;
use ingestor_actors::ingestor::StreamIngestor;
use ingestor_actors::liveness::{HealthchecksPing, LogLivenessPing, SharedLivenessPing};
use ingestor_actors::metrics::create_shared_metrics;
use ingestor_actors::monitor::{GapMonitor, MonitorScheduler};
use ingestor_actors::source::{JsonRpcBlockSource, RetryPolicy};
use ingestor_actors::subscriber::FeedSubscriber;
use ingestor_actors::transport::WsTransport;
use ingestor_db::{Database, SharedSink};
use tracing::{error, info, warn};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::Api;
use crate::config::{IngestorConfig, get_ingestor_config};

mod api;
mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional at runtime
    dotenv()
        .inspect_err(|err| println!("[WARN] reading .env files is failed with err {err}"))
        .ok();

    let config = get_ingestor_config()?;

    // logs
    let file_appender = tracing_appender::rolling::daily(config.log_path(), "ingestor.log");
    let (non_blocking_file, _guard_file) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, _guard_stdout) = tracing_appender::non_blocking(std::io::stdout());
    let file_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_filter(config.rust_log);
    let stdout_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_stdout)
        .with_filter(config.rust_log);
    tracing_subscriber::registry()
        .with(stdout_subscriber)
        .with(file_subscriber)
        .init();

    info!(db = %config.db_path().display(), "Opening database");
    let db = Database::open(config.db_path())?;
    let sink: SharedSink = Arc::new(db.sink());
    let metrics = create_shared_metrics();
    let buffer = Arc::new(RecordBuffer::new());

    let alerts = create_alert_channel(&config)?;
    let monitor_liveness = create_liveness(config.healthchecks_ping_url.as_deref(), "monitor")?;
    let ingestor_liveness =
        create_liveness(config.ingestor_healthchecks_ping_url.as_deref(), "ingestor")?;

    let (heads_tx, heads_rx) = flume::bounded(1024);

    let (shutdown_subscriber_tx, shutdown_subscriber_rx) = tokio::sync::oneshot::channel();
    let subscriber = FeedSubscriber::builder()
        .transport(WsTransport::new(config.feed_ws_url.clone()))
        .heads_tx(heads_tx)
        .shutdown_rx(shutdown_subscriber_rx)
        .metrics(metrics.clone())
        .reconnect_attempts(config.reconnect_attempts)
        .reconnect_backoff_cap(config.reconnect_backoff_cap())
        .build();

    let (shutdown_ingestor_tx, shutdown_ingestor_rx) = tokio::sync::oneshot::channel();
    let ingestor = StreamIngestor::builder()
        .source(JsonRpcBlockSource::new(config.feed_rpc_url.clone())?)
        .buffer(buffer.clone())
        .metrics(metrics.clone())
        .heads_rx(heads_rx)
        .shutdown_rx(shutdown_ingestor_rx)
        .fetch_policy(RetryPolicy {
            attempts: config.fetch_attempts,
            initial_backoff: config.fetch_backoff(),
        })
        .small_gap_threshold(config.small_gap_threshold)
        .missed_retry_interval(config.missed_retry_interval())
        .missed_retry_batch(config.missed_retry_batch)
        .build();

    let (shutdown_flusher_tx, shutdown_flusher_rx) = tokio::sync::oneshot::channel();
    let flusher = BatchFlusher::builder()
        .buffer(buffer.clone())
        .sink(sink.clone())
        .metrics(metrics.clone())
        .interval(config.batch_interval())
        .failure_threshold(config.flush_failure_threshold)
        .shutdown_rx(shutdown_flusher_rx)
        .build();

    let (shutdown_heartbeat_tx, shutdown_heartbeat_rx) = tokio::sync::oneshot::channel();
    let heartbeat = Heartbeat::builder()
        .ping(ingestor_liveness)
        .metrics(metrics.clone())
        .buffer(buffer.clone())
        .interval(config.heartbeat_interval())
        .shutdown_rx(shutdown_heartbeat_rx)
        .build();

    let tracker = GapTracker::builder()
        .keyspace(db.keyspace.clone())
        .partition(db.gap_tracking.clone())
        .alerts(alerts.clone())
        .grace_period(config.gap_grace_period())
        .report_limit(config.gap_report_limit)
        .build();
    let reporter = HealthReporter::builder()
        .metadata(db.metadata.clone())
        .alerts(alerts)
        .liveness(monitor_liveness)
        .staleness_threshold(config.staleness_threshold())
        .metrics(metrics.clone())
        .build();
    let monitor = Arc::new(GapMonitor::new(sink, tracker, reporter));

    let (shutdown_scheduler_tx, shutdown_scheduler_rx) = tokio::sync::oneshot::channel();
    let scheduler = MonitorScheduler::builder()
        .monitor(monitor.clone())
        .interval(config.monitor_interval())
        .shutdown_rx(shutdown_scheduler_rx)
        .build();

    let (shutdown_api_tx, shutdown_api_rx) = tokio::sync::oneshot::channel();
    let api = Api::new(monitor, metrics.clone(), buffer.clone());
    let bind_address = config.api_bind_address.clone();

    let termination = termination_signal()?;

    // Spawn tasks
    let flusher_handle = tokio::spawn(flusher.task());
    let ingestor_handle = tokio::spawn(ingestor.task());
    let mut subscriber_handle = tokio::spawn(subscriber.task());
    let heartbeat_handle = tokio::spawn(heartbeat.task());
    let scheduler_handle = tokio::spawn(scheduler.task());
    let api_handle =
        tokio::spawn(async move { api.serve(&bind_address, shutdown_api_rx).await });

    let mut feed_failed = false;
    tokio::select! {
        signal = termination => {
            signal?;
            info!("Termination signal received. Shutting down...");
        }
        result = &mut subscriber_handle => {
            match result {
                Ok(Ok(())) => warn!("Feed subscriber stopped unexpectedly"),
                Ok(Err(err)) => error!("Feed subscriber failed: {err}"),
                Err(err) => error!("Feed subscriber panicked: {err}"),
            }
            feed_failed = true;
        }
    }

    // Stop intake first so the final flush sees everything
    if !feed_failed {
        _ = shutdown_subscriber_tx
            .send(())
            .inspect_err(|_err| error!("failed to shutdown subscriber"));
        _ = subscriber_handle
            .await
            .inspect(|_| info!("subscriber has stopped"))
            .inspect_err(|err| error!("subscriber task failed: {err}"));
    }
    _ = shutdown_ingestor_tx
        .send(())
        .inspect_err(|_err| error!("failed to shutdown ingestor"));
    _ = ingestor_handle
        .await
        .inspect(|_| info!("ingestor has stopped"))
        .inspect_err(|err| error!("ingestor task failed: {err}"));

    _ = shutdown_flusher_tx
        .send(())
        .inspect_err(|_err| error!("failed to shutdown flusher"));
    let flush_result = flusher_handle.await?;

    _ = shutdown_heartbeat_tx
        .send(())
        .inspect_err(|_err| error!("failed to shutdown heartbeat"));
    _ = shutdown_scheduler_tx
        .send(())
        .inspect_err(|_err| error!("failed to shutdown monitor scheduler"));
    _ = shutdown_api_tx
        .send(())
        .inspect_err(|_err| error!("failed to shutdown api"));
    _ = heartbeat_handle.await;
    _ = scheduler_handle.await;
    _ = api_handle
        .await?
        .inspect_err(|err| error!("api server failed: {err}"));

    db.persist()
        .inspect_err(|err| error!("failed to persist keyspace: {err}"))
        .ok();

    flush_result?;
    if feed_failed {
        anyhow::bail!("feed unavailable, exiting for supervisor restart");
    }
    info!("All tasks shut down.");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM. The SIGTERM handler is installed before
/// this returns, so a supervisor stop always reaches the final flush.
fn termination_signal() -> anyhow::Result<impl Future<Output = anyhow::Result<()>>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal?,
            _ = terminate.recv() => info!("SIGTERM received"),
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;
        Ok(())
    })
}

fn create_alert_channel(config: &IngestorConfig) -> anyhow::Result<SharedAlertChannel> {
    Ok(match config.pushover_credentials() {
        Some((token, user)) => Arc::new(PushoverChannel::new(token, user)?),
        None => {
            warn!("Pushover credentials not configured, alerts go to the log only");
            Arc::new(LogAlertChannel)
        }
    })
}

fn create_liveness(url: Option<&str>, name: &str) -> anyhow::Result<SharedLivenessPing> {
    Ok(match url {
        Some(url) => Arc::new(HealthchecksPing::new(url)?),
        None => {
            info!("{name} liveness url not configured, pings go to the log only");
            Arc::new(LogLivenessPing)
        }
    })
}
