use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const PUSHOVER_MESSAGES_URL: &str = "https://api.pushover.net/1/messages.json";
/// Seconds between emergency re-notifications until acknowledged.
const EMERGENCY_RETRY_SECONDS: u32 = 60;
/// Seconds after which an unacknowledged emergency stops re-notifying.
const EMERGENCY_EXPIRE_SECONDS: u32 = 3600;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Quiet,
    Normal,
    High,
    /// Repeats until acknowledged.
    Emergency,
}

impl Priority {
    pub fn pushover_value(self) -> i8 {
        match self {
            Priority::Quiet => -1,
            Priority::Normal => 0,
            Priority::High => 1,
            Priority::Emergency => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    pub body: String,
    pub priority: Priority,
}

impl Alert {
    pub fn new(title: impl Into<String>, body: impl Into<String>, priority: Priority) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority,
        }
    }
}

pub trait AlertChannel: Send + Sync + 'static {
    /// `Ok` only once the channel accepted the message.
    fn send(&self, alert: Alert) -> BoxFuture<'_, Result<(), NotifyError>>;
}

pub type SharedAlertChannel = Arc<dyn AlertChannel>;

pub struct PushoverChannel {
    client: reqwest::Client,
    token: String,
    user: String,
}

#[derive(Serialize)]
struct PushoverMessage<'a> {
    token: &'a str,
    user: &'a str,
    title: &'a str,
    message: &'a str,
    priority: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expire: Option<u32>,
}

impl PushoverChannel {
    pub fn new(token: impl Into<String>, user: impl Into<String>) -> Result<Self, NotifyError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            token: token.into(),
            user: user.into(),
        })
    }

    async fn post(&self, alert: Alert) -> Result<(), NotifyError> {
        let emergency = alert.priority == Priority::Emergency;
        let message = PushoverMessage {
            token: &self.token,
            user: &self.user,
            title: &alert.title,
            message: &alert.body,
            priority: alert.priority.pushover_value(),
            retry: emergency.then_some(EMERGENCY_RETRY_SECONDS),
            expire: emergency.then_some(EMERGENCY_EXPIRE_SECONDS),
        };
        let response = self
            .client
            .post(PUSHOVER_MESSAGES_URL)
            .form(&message)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        info!(title = %alert.title, priority = ?alert.priority, "Alert delivered");
        Ok(())
    }
}

impl AlertChannel for PushoverChannel {
    fn send(&self, alert: Alert) -> BoxFuture<'_, Result<(), NotifyError>> {
        self.post(alert).boxed()
    }
}

/// Used when no alert endpoint is configured. Never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertChannel;

impl AlertChannel for LogAlertChannel {
    fn send(&self, alert: Alert) -> BoxFuture<'_, Result<(), NotifyError>> {
        match alert.priority {
            Priority::Emergency | Priority::High => {
                error!(title = %alert.title, body = %alert.body, "ALERT")
            }
            Priority::Normal => warn!(title = %alert.title, body = %alert.body, "ALERT"),
            Priority::Quiet => info!(title = %alert.title, body = %alert.body, "ALERT"),
        }
        futures_util::future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_mapping() {
        assert_eq!(Priority::Quiet.pushover_value(), -1);
        assert_eq!(Priority::Normal.pushover_value(), 0);
        assert_eq!(Priority::High.pushover_value(), 1);
        assert_eq!(Priority::Emergency.pushover_value(), 2);
    }

    #[tokio::test]
    async fn test_log_channel_accepts() {
        let channel: SharedAlertChannel = Arc::new(LogAlertChannel);
        channel
            .send(Alert::new("TEST", "body", Priority::Normal))
            .await
            .unwrap();
    }
}
