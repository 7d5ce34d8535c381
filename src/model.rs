/// Unified data model (spec §3): Block, Transaction, Action, Datasource,
/// Filter types, and the cron-augmented filter.
///
/// Struct shapes follow the teacher's `types.rs` convention of plain public
/// fields with `serde` derives for wire structs, rather than builder types.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: i64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: i64,
    pub gas_price: String,
}

/// Unified block: identity is `(height, hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub author: String,
    pub header: BlockHeader,
    pub chunks: Vec<Chunk>,
    pub transactions: Vec<Transaction>,
    pub actions: Vec<Action>,
    pub receipts: Vec<serde_json::Value>,
}

impl Block {
    pub fn identity(&self) -> (i64, &str) {
        (self.header.height, self.header.hash.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub shard_id: u64,
    pub chunk_hash: String,
    pub transactions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    pub id: String,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub signer_id: String,
    pub receiver_id: String,
    pub actions: Vec<serde_json::Value>,
    pub gas_price: String,
    pub gas_used: u64,
    pub block_hash: String,
    pub block_height: i64,
    pub timestamp: i64,
    pub result: TxResult,
}

/// One member of the closed action variant set (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ActionPayload {
    CreateAccount,
    DeployContract { code: String },
    FunctionCall {
        method_name: String,
        args: String,
        gas: u64,
        deposit: String,
    },
    Transfer {
        deposit: String,
    },
    Stake {
        stake: String,
        public_key: String,
    },
    AddKey {
        public_key: String,
        access_key: Option<serde_json::Value>,
    },
    DeleteKey {
        public_key: String,
    },
    DeleteAccount {
        beneficiary_id: String,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionPayload::CreateAccount => "CreateAccount",
            ActionPayload::DeployContract { .. } => "DeployContract",
            ActionPayload::FunctionCall { .. } => "FunctionCall",
            ActionPayload::Transfer { .. } => "Transfer",
            ActionPayload::Stake { .. } => "Stake",
            ActionPayload::AddKey { .. } => "AddKey",
            ActionPayload::DeleteKey { .. } => "DeleteKey",
            ActionPayload::DeleteAccount { .. } => "DeleteAccount",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Position within the transaction; used as identity alongside `transaction`.
    pub id: usize,
    pub action: ActionPayload,
    pub transaction_hash: String,
}

/// Filter types (spec §3/§4.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlockFilter {
    pub modulo: Option<u64>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransactionFilter {
    pub sender: Option<String>,
    pub receiver: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionFilter {
    #[serde(rename = "type")]
    pub action_type: String,
    /// Accepted but never consulted by the filter engine; reserved pending
    /// a future filter-engine extension (spec §9 open question).
    pub action: Option<serde_json::Value>,
}

/// `filter | filter[] | undefined` (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterArray<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> FilterArray<T> {
    pub fn as_slice_owned(self) -> Vec<T> {
        match self {
            FilterArray::One(t) => vec![t],
            FilterArray::Many(v) => v,
        }
    }
}

/// Cron-compiled timestamp filter: `{schedule, next}`, compiled once at
/// project load against the block at the datasource's `startBlock`.
#[derive(Debug, Clone)]
pub struct CronFilter {
    pub schedule: cron::Schedule,
    pub next: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Block,
    Transaction,
    Action,
    Custom,
}

#[derive(Debug, Clone)]
pub struct Handler {
    pub kind: HandlerKind,
    /// Custom datasources use a named sub-kind resolved via the processor's
    /// `handlerProcessors` map (spec §4.8 step 2).
    pub custom_kind: Option<String>,
    pub handler: String,
    pub block_filter: Option<FilterArrayOpt<BlockFilter>>,
    pub transaction_filter: Option<FilterArrayOpt<TransactionFilter>>,
    pub action_filter: Option<FilterArrayOpt<ActionFilter>>,
}

/// Non-generic-serde-friendly owned equivalent of `FilterArray` used once
/// filters have been normalized into a plain `Vec` at datasource-load time.
pub type FilterArrayOpt<T> = Vec<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasourceFlavor {
    Runtime,
    Custom,
}

#[derive(Debug, Clone)]
pub struct Datasource {
    pub name: Option<String>,
    pub flavor: DatasourceFlavor,
    pub start_block: i64,
    pub handlers: Vec<Handler>,
    /// Custom datasources' processor key; resolved against a registry the
    /// host process owns (the processor itself — `validate`,
    /// `dsFilterProcessor`, `handlerProcessors`, `dictionaryQuery`,
    /// `transformer` — is an external collaborator, spec §1).
    pub processor_key: Option<String>,
}

impl Datasource {
    pub fn is_enabled_at(&self, height: i64) -> bool {
        height >= self.start_block
    }
}

/// Dictionary service metadata (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionaryMetadata {
    #[serde(rename = "lastProcessedHeight")]
    pub last_processed_height: i64,
    #[serde(rename = "genesisHash")]
    pub genesis_hash: String,
    pub chain: String,
    #[serde(rename = "startHeight")]
    pub start_height: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionaryResponse {
    #[serde(rename = "batchBlocks")]
    pub batch_blocks: Vec<i64>,
    #[serde(rename = "_metadata")]
    pub metadata: DictionaryMetadata,
}

/// Result of processing one block at a worker (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessBlockResponse {
    pub block_hash: Option<String>,
    pub dynamic_ds_created: bool,
    pub reindex_block_height: Option<i64>,
}

pub type EntityConditions = HashMap<String, serde_json::Value>;
