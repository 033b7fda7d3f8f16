use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use tracing::level_filters::LevelFilter;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct IngestorConfig {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_rust_log")]
    pub rust_log: LevelFilter,
    #[serde(default = "default_gapless_db_root")]
    pub gapless_db_root: PathBuf,
    pub feed_ws_url: String,
    pub feed_rpc_url: String,

    #[serde(default = "default_batch_interval_seconds")]
    pub batch_interval_seconds: u64,
    #[serde(default = "default_small_gap_threshold")]
    pub small_gap_threshold: u64,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_cap_seconds")]
    pub reconnect_backoff_cap_seconds: u64,
    #[serde(default = "default_flush_failure_threshold")]
    pub flush_failure_threshold: u32,
    #[serde(default = "default_missed_retry_interval_seconds")]
    pub missed_retry_interval_seconds: u64,
    #[serde(default = "default_missed_retry_batch")]
    pub missed_retry_batch: usize,
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,

    #[serde(default = "default_monitor_interval_seconds")]
    pub monitor_interval_seconds: u64,
    #[serde(default = "default_staleness_threshold_seconds")]
    pub staleness_threshold_seconds: u64,
    #[serde(default = "default_gap_grace_period_seconds")]
    pub gap_grace_period_seconds: u64,
    #[serde(default = "default_gap_report_limit")]
    pub gap_report_limit: usize,

    pub healthchecks_ping_url: Option<String>,
    pub ingestor_healthchecks_ping_url: Option<String>,
    pub pushover_token: Option<String>,
    pub pushover_user: Option<String>,

    #[serde(default = "default_api_bind_address")]
    pub api_bind_address: String,
}

impl IngestorConfig {
    pub fn db_path(&self) -> PathBuf {
        self.gapless_db_root.join("db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.gapless_db_root.join("app_logs")
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_seconds)
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }

    pub fn reconnect_backoff_cap(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_cap_seconds)
    }

    pub fn missed_retry_interval(&self) -> Duration {
        Duration::from_secs(self.missed_retry_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_seconds)
    }

    pub fn gap_grace_period(&self) -> Duration {
        Duration::from_secs(self.gap_grace_period_seconds)
    }

    /// Both halves of the Pushover credentials, if configured.
    pub fn pushover_credentials(&self) -> Option<(&str, &str)> {
        self.pushover_token
            .as_deref()
            .zip(self.pushover_user.as_deref())
    }
}

fn default_rust_log() -> LevelFilter {
    LevelFilter::INFO
}

fn default_gapless_db_root() -> PathBuf {
    std::env::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gapless-ingestor")
}

fn default_batch_interval_seconds() -> u64 {
    300
}

fn default_small_gap_threshold() -> u64 {
    5
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_fetch_backoff_ms() -> u64 {
    500
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_cap_seconds() -> u64 {
    60
}

fn default_flush_failure_threshold() -> u32 {
    3
}

fn default_missed_retry_interval_seconds() -> u64 {
    60
}

fn default_missed_retry_batch() -> usize {
    50
}

fn default_heartbeat_interval_seconds() -> u64 {
    300
}

fn default_monitor_interval_seconds() -> u64 {
    3 * 60 * 60
}

fn default_staleness_threshold_seconds() -> u64 {
    960
}

fn default_gap_grace_period_seconds() -> u64 {
    30 * 60
}

fn default_gap_report_limit() -> usize {
    20
}

fn default_api_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

pub fn get_ingestor_config() -> anyhow::Result<IngestorConfig> {
    Ok(envy::from_env::<IngestorConfig>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_apply() {
        let config: IngestorConfig = envy::from_iter(vars(&[
            ("FEED_WS_URL", "wss://node/ws"),
            ("FEED_RPC_URL", "https://node/rpc"),
        ]))
        .unwrap();
        assert_eq!(config.rust_log, LevelFilter::INFO);
        assert_eq!(config.batch_interval(), Duration::from_secs(300));
        assert_eq!(config.small_gap_threshold, 5);
        assert_eq!(config.monitor_interval(), Duration::from_secs(10800));
        assert_eq!(config.gap_grace_period(), Duration::from_secs(1800));
        assert_eq!(config.api_bind_address, "0.0.0.0:8080");
        assert!(config.pushover_credentials().is_none());
        assert!(config.db_path().ends_with(".gapless-ingestor/db"));
    }

    #[test]
    fn test_overrides_and_required_urls() {
        let config: IngestorConfig = envy::from_iter(vars(&[
            ("FEED_WS_URL", "wss://node/ws"),
            ("FEED_RPC_URL", "https://node/rpc"),
            ("RUST_LOG", "debug"),
            ("BATCH_INTERVAL_SECONDS", "0"),
            ("PUSHOVER_TOKEN", "t"),
            ("PUSHOVER_USER", "u"),
            ("GAPLESS_DB_ROOT", "/var/lib/gapless"),
        ]))
        .unwrap();
        assert_eq!(config.rust_log, LevelFilter::DEBUG);
        assert!(config.batch_interval().is_zero());
        assert_eq!(config.pushover_credentials(), Some(("t", "u")));
        assert_eq!(config.log_path(), PathBuf::from("/var/lib/gapless/app_logs"));

        let missing = envy::from_iter::<_, IngestorConfig>(vars(&[("FEED_RPC_URL", "x")]));
        assert!(missing.is_err());
    }
}
