use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use tracing::level_filters::LevelFilter;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct CliConfig {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_rust_log")]
    pub rust_log: LevelFilter,
    #[serde(default = "default_gapless_db_root")]
    pub gapless_db_root: PathBuf,
    /// Only `backfill` needs it.
    pub feed_rpc_url: Option<String>,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
    #[serde(default = "default_staleness_threshold_seconds")]
    pub staleness_threshold_seconds: u64,
    #[serde(default = "default_gap_grace_period_seconds")]
    pub gap_grace_period_seconds: u64,
    #[serde(default = "default_gap_report_limit")]
    pub gap_report_limit: usize,
    pub healthchecks_ping_url: Option<String>,
    pub pushover_token: Option<String>,
    pub pushover_user: Option<String>,
}

impl CliConfig {
    pub fn db_path(&self) -> PathBuf {
        self.gapless_db_root.join("db")
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
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

fn default_fetch_attempts() -> u32 {
    3
}

fn default_fetch_backoff_ms() -> u64 {
    500
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

pub fn get_cli_config() -> anyhow::Result<CliConfig> {
    Ok(envy::from_env::<CliConfig>()?)
}
