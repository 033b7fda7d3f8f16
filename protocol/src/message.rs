/// Header fields carried by a `newHeads` push. Everything except the number
/// is optional because providers differ in what they include.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialHeader {
    pub number: u64,
    pub timestamp: Option<u64>,
    pub gas_limit: Option<u64>,
    pub gas_used: Option<u64>,
    pub base_fee_per_gas: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadNotification {
    pub subscription: String,
    pub header: PartialHeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Reply to our `eth_subscribe` request.
    SubscriptionConfirmed { id: u64, subscription: String },
    Head(HeadNotification),
    /// JSON-RPC error reply to one of our requests.
    RpcError {
        id: Option<u64>,
        code: i64,
        message: String,
    },
}

/// Fully resolved block as returned by `eth_getBlockByNumber`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Zero for pre-London blocks.
    pub base_fee_per_gas: u64,
    pub transaction_count: u64,
    pub difficulty: u128,
    pub total_difficulty: Option<u128>,
    pub size: u64,
    pub blob_gas_used: Option<u64>,
    pub excess_blob_gas: Option<u64>,
}
