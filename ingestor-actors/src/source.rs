use ingestor_db::Record;
use protocol::{Block, ParseError, get_block_by_number_request, parse_block_response};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const MAX_FETCH_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("block {0} is not known upstream")]
    NotFound(u64),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(ParseError),
}

impl From<ParseError> for FetchError {
    fn from(value: ParseError) -> Self {
        match value {
            ParseError::Rpc { code, message } => FetchError::Rpc { code, message },
            other => FetchError::Malformed(other),
        }
    }
}

/// Pull side of the upstream feed.
pub trait BlockSource: Send + Sync + 'static {
    fn fetch_block(
        &self,
        sequence_number: u64,
    ) -> impl Future<Output = Result<Record, FetchError>> + Send;
}

pub fn block_to_record(block: Block) -> Record {
    Record {
        sequence_number: block.number,
        captured_at: block.timestamp,
        gas_limit: block.gas_limit,
        gas_used: block.gas_used,
        base_fee_per_gas: block.base_fee_per_gas,
        transaction_count: block.transaction_count,
        difficulty: block.difficulty,
        total_difficulty: block.total_difficulty,
        size: block.size,
        blob_gas_used: block.blob_gas_used,
        excess_blob_gas: block.excess_blob_gas,
    }
}

/// `eth_getBlockByNumber` over HTTP.
pub struct JsonRpcBlockSource {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
}

impl JsonRpcBlockSource {
    pub fn new(url: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            request_id: AtomicU64::new(1),
        })
    }
}

impl BlockSource for JsonRpcBlockSource {
    async fn fetch_block(&self, sequence_number: u64) -> Result<Record, FetchError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = self
            .client
            .post(&self.url)
            .json(&get_block_by_number_request(id, sequence_number))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_block_response(&body)?
            .map(block_to_record)
            .ok_or(FetchError::NotFound(sequence_number))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn single() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }
}

/// Fetches one key, sleeping with doubling backoff between attempts. The last
/// error is returned once the attempts are spent.
pub async fn fetch_with_retry<S: BlockSource>(
    source: &S,
    sequence_number: u64,
    policy: RetryPolicy,
) -> Result<Record, FetchError> {
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match source.fetch_block(sequence_number).await {
            Ok(record) => return Ok(record),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!(sequence_number, attempt, %err, ?backoff, "Fetch failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_FETCH_BACKOFF);
                attempt += 1;
            }
        }
    }
}
