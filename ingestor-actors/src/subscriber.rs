use crate::metrics::SharedMetrics;
use crate::transport::{FeedTransport, TransportError};
use futures_util::FutureExt;
use protocol::{FeedMessage, HeadNotification, PartialHeader, parse_feed_message};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SUBSCRIBE_REQUEST_ID: u64 = 1;

enum SessionEnd {
    Shutdown,
    IntakeClosed,
}

/// Capped exponential delay before reconnect number `attempt` (1-based).
pub fn reconnect_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(cap)
}

/// Owns the push connection: subscribes to new heads, forwards every decoded
/// head to the ingestor and reconnects on loss. Gives up after
/// `reconnect_attempts` consecutive failed sessions.
#[derive(bon::Builder)]
pub struct FeedSubscriber<T: FeedTransport> {
    transport: T,
    heads_tx: flume::Sender<PartialHeader>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    metrics: SharedMetrics,
    reconnect_attempts: u32,
    reconnect_backoff_cap: Duration,
    #[builder(default = Duration::from_secs(1))]
    reconnect_backoff_base: Duration,
    #[builder(skip)]
    subscribed: bool,
}

impl<T: FeedTransport> FeedSubscriber<T> {
    pub async fn task(mut self) -> anyhow::Result<()> {
        let mut failures = 0u32;
        loop {
            let result = self.session().await;
            self.transport.disconnect().await;
            if self.subscribed {
                failures = 0;
            }
            match result {
                Ok(SessionEnd::Shutdown) => {
                    info!("Feed subscriber stopped");
                    return Ok(());
                }
                Ok(SessionEnd::IntakeClosed) => {
                    warn!("Head intake closed, feed subscriber stopped");
                    return Ok(());
                }
                Err(err) => {
                    failures += 1;
                    if failures > self.reconnect_attempts {
                        error!(failures, "Feed reconnect attempts exhausted: {err}");
                        anyhow::bail!("feed unavailable after {failures} attempts: {err}");
                    }
                    let backoff = reconnect_backoff(
                        self.reconnect_backoff_base,
                        self.reconnect_backoff_cap,
                        failures,
                    );
                    warn!(attempt = failures, ?backoff, "Feed connection lost: {err}");
                    self.metrics.increment_reconnects();
                    tokio::select! {
                        biased;
                        _ = (&mut self.shutdown_rx).fuse() => {
                            info!("Shutdown during reconnect backoff");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn session(&mut self) -> Result<SessionEnd, TransportError> {
        self.subscribed = false;
        tokio::select! {
            biased;
            _ = (&mut self.shutdown_rx).fuse() => return Ok(SessionEnd::Shutdown),
            connected = self.transport.connect() => connected?,
        }
        self.transport
            .send_text(protocol::subscribe_new_heads_request(SUBSCRIBE_REQUEST_ID))
            .await?;
        loop {
            let frame = tokio::select! {
                biased;
                _ = (&mut self.shutdown_rx).fuse() => return Ok(SessionEnd::Shutdown),
                frame = self.transport.recv() => frame?,
            };
            match parse_feed_message(&frame) {
                Ok(FeedMessage::SubscriptionConfirmed { subscription, .. }) => {
                    info!(%subscription, "Subscribed to new heads");
                    self.subscribed = true;
                }
                Ok(FeedMessage::Head(HeadNotification { header, .. })) => {
                    self.metrics.increment_heads_received();
                    debug!(sequence_number = header.number, "Head received");
                    if self.heads_tx.send_async(header).await.is_err() {
                        return Ok(SessionEnd::IntakeClosed);
                    }
                }
                Ok(FeedMessage::RpcError { id, code, message })
                    if id == Some(SUBSCRIBE_REQUEST_ID) && !self.subscribed =>
                {
                    return Err(TransportError::Subscribe(format!("{code}: {message}")));
                }
                Ok(FeedMessage::RpcError { id, code, message }) => {
                    warn!(?id, code, %message, "Feed returned an rpc error");
                }
                Err(err) => {
                    self.metrics.increment_malformed_frames();
                    warn!(%err, "Skipping malformed feed frame");
                }
            }
        }
    }
}
