use crate::message::{Block, FeedMessage, HeadNotification, PartialHeader};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid quantity in `{field}`: {value}")]
    Quantity { field: &'static str, value: String },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("unexpected message shape")]
    Unexpected,
}

impl From<serde_json::Error> for ParseError {
    fn from(value: serde_json::Error) -> Self {
        ParseError::Json(value.to_string())
    }
}

#[derive(Deserialize)]
struct RpcFrame {
    id: Option<u64>,
    method: Option<String>,
    params: Option<SubscriptionParams>,
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct SubscriptionParams {
    subscription: String,
    result: RawHeader,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeader {
    number: Option<String>,
    timestamp: Option<String>,
    gas_limit: Option<String>,
    gas_used: Option<String>,
    base_fee_per_gas: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    number: Option<String>,
    timestamp: Option<String>,
    gas_limit: Option<String>,
    gas_used: Option<String>,
    base_fee_per_gas: Option<String>,
    #[serde(default)]
    transactions: Vec<Value>,
    difficulty: Option<String>,
    total_difficulty: Option<String>,
    size: Option<String>,
    blob_gas_used: Option<String>,
    excess_blob_gas: Option<String>,
}

#[derive(Deserialize)]
struct BlockResponse {
    result: Option<RawBlock>,
    error: Option<RpcErrorBody>,
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_quantity(field: &'static str, value: &str) -> Result<u64, ParseError> {
    parse_quantity_u128(field, value).and_then(|v| {
        u64::try_from(v).map_err(|_| ParseError::Quantity {
            field,
            value: value.to_string(),
        })
    })
}

pub fn parse_quantity_u128(field: &'static str, value: &str) -> Result<u128, ParseError> {
    let invalid = || ParseError::Quantity {
        field,
        value: value.to_string(),
    };
    let digits = value.strip_prefix("0x").ok_or_else(invalid)?;
    if digits.is_empty() {
        return Err(invalid());
    }
    u128::from_str_radix(digits, 16).map_err(|_| invalid())
}

fn required(field: &'static str, value: Option<&str>) -> Result<u64, ParseError> {
    parse_quantity(field, value.ok_or(ParseError::MissingField(field))?)
}

fn optional(field: &'static str, value: Option<&str>) -> Result<Option<u64>, ParseError> {
    value.map(|v| parse_quantity(field, v)).transpose()
}

/// Decodes one frame received on the push subscription socket.
pub fn parse_feed_message(frame: &[u8]) -> Result<FeedMessage, ParseError> {
    let frame: RpcFrame = serde_json::from_slice(frame)?;

    if let Some(RpcErrorBody { code, message }) = frame.error {
        return Ok(FeedMessage::RpcError {
            id: frame.id,
            code,
            message,
        });
    }

    match (frame.method.as_deref(), frame.params, frame.result) {
        (Some("eth_subscription"), Some(params), _) => {
            let raw = params.result;
            let header = PartialHeader {
                number: required("number", raw.number.as_deref())?,
                timestamp: optional("timestamp", raw.timestamp.as_deref())?,
                gas_limit: optional("gasLimit", raw.gas_limit.as_deref())?,
                gas_used: optional("gasUsed", raw.gas_used.as_deref())?,
                base_fee_per_gas: optional("baseFeePerGas", raw.base_fee_per_gas.as_deref())?,
            };
            Ok(FeedMessage::Head(HeadNotification {
                subscription: params.subscription,
                header,
            }))
        }
        (None, None, Some(Value::String(subscription))) => {
            let id = frame.id.ok_or(ParseError::MissingField("id"))?;
            Ok(FeedMessage::SubscriptionConfirmed { id, subscription })
        }
        _ => Err(ParseError::Unexpected),
    }
}

/// Decodes an `eth_getBlockByNumber` response. `Ok(None)` means the node does
/// not know the block yet.
pub fn parse_block_response(body: &[u8]) -> Result<Option<Block>, ParseError> {
    let response: BlockResponse = serde_json::from_slice(body)?;
    if let Some(RpcErrorBody { code, message }) = response.error {
        return Err(ParseError::Rpc { code, message });
    }
    response.result.map(block_from_raw).transpose()
}

fn block_from_raw(raw: RawBlock) -> Result<Block, ParseError> {
    Ok(Block {
        number: required("number", raw.number.as_deref())?,
        timestamp: required("timestamp", raw.timestamp.as_deref())?,
        gas_limit: required("gasLimit", raw.gas_limit.as_deref())?,
        gas_used: required("gasUsed", raw.gas_used.as_deref())?,
        base_fee_per_gas: optional("baseFeePerGas", raw.base_fee_per_gas.as_deref())?
            .unwrap_or_default(),
        transaction_count: raw.transactions.len() as u64,
        difficulty: raw
            .difficulty
            .as_deref()
            .map(|v| parse_quantity_u128("difficulty", v))
            .transpose()?
            .unwrap_or_default(),
        total_difficulty: raw
            .total_difficulty
            .as_deref()
            .map(|v| parse_quantity_u128("totalDifficulty", v))
            .transpose()?,
        size: required("size", raw.size.as_deref())?,
        blob_gas_used: optional("blobGasUsed", raw.blob_gas_used.as_deref())?,
        excess_blob_gas: optional("excessBlobGas", raw.excess_blob_gas.as_deref())?,
    })
}

pub fn subscribe_new_heads_request(id: u64) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "eth_subscribe",
        "params": ["newHeads"],
    })
    .to_string()
}

pub fn get_block_by_number_request(id: u64, number: u64) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "eth_getBlockByNumber",
        "params": [format!("{number:#x}"), false],
    })
}
