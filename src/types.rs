/// Core domain types for the indexing pipeline.
///
/// These are the "ephemeral working copies" the pipeline carries between
/// NodeClient, Parser, WorkPool and Projector before they land in the Store.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Well-known placeholder box id used by emission/reward inputs (spec §4.6 step 2).
pub const COINBASE_SENTINEL: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Synthetic token id reserved for native-currency (ERG) balances (spec §4.6 step 3).
pub const ERG_TOKEN_ID: &str = "ERG";

/// Error taxonomy the Controller reacts to differently (spec §7).
#[derive(Debug, Error, Clone)]
pub enum IndexerError {
    #[error("node unavailable")]
    Unavailable,
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("bad block: {0}")]
    BadBlock(String),
    #[error("reorg too deep: depth {depth} exceeds max {max}")]
    ReorgTooDeep { depth: u32, max: u32 },
    #[error("store error: {0}")]
    Store(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<rocksdb::Error> for IndexerError {
    fn from(e: rocksdb::Error) -> Self {
        IndexerError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;

/// One register value as returned by the node; kept opaque (spec §9: "unknown
/// register keys are preserved as opaque blobs").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterValue(pub String);

/// Node `/info` response (subset consumed by this pipeline).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "fullHeight")]
    pub full_height: u32,
    #[serde(rename = "bestHeaderId")]
    pub best_header_id: String,
    #[serde(rename = "bestFullHeaderId", default)]
    pub best_full_header_id: Option<String>,
}

/// Node block header JSON shape (subset).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeBlockHeader {
    pub id: String,
    #[serde(rename = "parentId")]
    pub parent_id: String,
    pub height: u32,
    pub timestamp: u64,
    pub difficulty: String,
    pub size: u32,
    pub version: u32,
    #[serde(rename = "powSolutions", default)]
    pub pow_solutions: Option<serde_json::Value>,
    #[serde(rename = "minerPk", default)]
    pub miner_pk: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeAsset {
    #[serde(rename = "tokenId")]
    pub token_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeOutput {
    #[serde(rename = "boxId")]
    pub box_id: String,
    pub value: i64,
    #[serde(rename = "ergoTree")]
    pub ergo_tree: String,
    #[serde(rename = "creationHeight")]
    pub creation_height: i64,
    #[serde(default)]
    pub assets: Vec<NodeAsset>,
    #[serde(rename = "additionalRegisters", default)]
    pub additional_registers: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInput {
    #[serde(rename = "boxId")]
    pub box_id: String,
    #[serde(rename = "spendingProof", default)]
    pub spending_proof: Option<serde_json::Value>,
    #[serde(default)]
    pub extension: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeTransaction {
    pub id: String,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub inputs: Vec<NodeInput>,
    pub outputs: Vec<NodeOutput>,
}

/// Node `/blocks/{id}` full block response.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeFullBlock {
    pub header: NodeBlockHeader,
    #[serde(rename = "blockTransactions")]
    pub block_transactions: NodeBlockTransactions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeBlockTransactions {
    pub transactions: Vec<NodeTransaction>,
}

// ---------------------------------------------------------------------------
// Internal record types (post-Parser, pre-Store)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Output {
    pub box_id: String,
    pub tx_id: String,
    pub index_in_tx: u32,
    pub value: u64,
    pub creation_height: u32,
    pub address: Option<String>,
    pub ergo_tree: String,
    pub additional_registers: HashMap<String, RegisterValue>,
    pub spent_by_tx_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Input {
    pub box_id: String,
    pub tx_id: String,
    pub index_in_tx: u32,
    pub proof_bytes: Option<String>,
    pub extension: HashMap<String, RegisterValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub token_id: String,
    pub box_id: String,
    pub index_in_outputs: u32,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TokenMeta {
    pub name: Option<String>,
    pub description: Option<String>,
    pub decimals: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub block_id: String,
    pub index_in_block: u32,
    pub timestamp_ms: u64,
    pub size: u32,
    pub main_chain: bool,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub id: String,
    pub header_id: String,
    pub parent_id: String,
    pub height: u32,
    pub timestamp_ms: u64,
    pub difficulty: String,
    pub size: u32,
    pub tx_count: u32,
    pub miner_address: Option<String>,
    pub main_chain: bool,
    pub version: u32,
    pub pow_solutions: Option<String>,
}

/// Output of the Parser: a fully-formed block ready for the Projector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedBlock {
    pub block: Block,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Token {
    pub token_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub decimals: Option<u32>,
    pub total_supply: Option<u64>,
    pub first_seen_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    pub current_height: u32,
    pub target_height: u32,
    pub is_syncing: bool,
    pub last_block_time: u64,
    pub updated_at: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            current_height: 0,
            target_height: 0,
            is_syncing: false,
            last_block_time: 0,
            updated_at: 0,
        }
    }
}

/// Signed per-(token_id, address) adjustment produced by the Projector for
/// the HolderAggregator (spec §4.6 step 3 / §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceDelta {
    pub token_id: String,
    pub address: String,
    pub delta: i64,
}
