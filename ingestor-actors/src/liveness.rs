use crate::alert::NotifyError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dead-man switch. A missing or failed ping is what raises the outside alarm.
pub trait LivenessPing: Send + Sync + 'static {
    fn ping(&self, success: bool, diagnostic: String) -> BoxFuture<'_, Result<(), NotifyError>>;
}

pub type SharedLivenessPing = Arc<dyn LivenessPing>;

/// Healthchecks ping URL: POST to `<url>` on success, `<url>/fail` otherwise.
pub struct HealthchecksPing {
    client: reqwest::Client,
    url: String,
}

impl HealthchecksPing {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            url: url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn target(&self, success: bool) -> String {
        if success {
            self.url.clone()
        } else {
            format!("{}/fail", self.url)
        }
    }

    async fn post(&self, success: bool, diagnostic: String) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.target(success))
            .body(diagnostic)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        debug!(success, "Liveness ping sent");
        Ok(())
    }
}

impl LivenessPing for HealthchecksPing {
    fn ping(&self, success: bool, diagnostic: String) -> BoxFuture<'_, Result<(), NotifyError>> {
        self.post(success, diagnostic).boxed()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogLivenessPing;

impl LivenessPing for LogLivenessPing {
    fn ping(&self, success: bool, diagnostic: String) -> BoxFuture<'_, Result<(), NotifyError>> {
        if success {
            info!(%diagnostic, "Liveness ok");
        } else {
            warn!(%diagnostic, "Liveness failing");
        }
        futures_util::future::ready(Ok(())).boxed()
    }
}
