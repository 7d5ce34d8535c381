/// RPC Adapter (spec §4.1): typed client for block/chunk/tx-status/finality
/// queries over chain JSON-RPC.
///
/// Generalizes the teacher's `monitor.rs::index_block_from_rpc` raw-POST
/// pattern (there: `reqwest::blocking::Client` against a Bitcoin-style RPC)
/// to an async client against NEAR's JSON-RPC methods, with one retry on
/// `NetworkError` per spec §5.
use crate::errors::{EngineError, EngineResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BlockId {
    Height(i64),
    Hash(String),
    Finality(Finality),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Finality {
    Final,
    Optimistic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBlock {
    pub author: String,
    pub header: RawBlockHeader,
    pub chunks: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBlockHeader {
    pub height: i64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: i64,
    pub gas_price: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChunk {
    pub header: Value,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxStatusOutcome {
    pub id: String,
    #[serde(default)]
    pub logs: Vec<String>,
    pub gas_burnt: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub chain_id: String,
    pub latest_protocol_version: u32,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// A single chain RPC endpoint.
pub struct RpcAdapter {
    pub endpoint: String,
    client: reqwest::Client,
}

impl RpcAdapter {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client build");
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> EngineResult<R> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "near-indexer-engine",
            "method": method,
            "params": params,
        });

        let do_request = || self.client.post(&self.endpoint).json(&body).send();

        let response = match do_request().await {
            Ok(r) => r,
            Err(_first_err) => do_request().await.map_err(EngineError::from)?,
        };

        let parsed: JsonRpcResponse<R> = response.json().await.map_err(EngineError::from)?;

        if let Some(err) = parsed.error {
            return Err(EngineError::rpc(format!(
                "{} ({:?})",
                err.message, err.data
            )));
        }
        parsed
            .result
            .ok_or_else(|| EngineError::rpc(format!("empty result for {}", method)))
    }

    pub async fn block(&self, id: BlockId) -> EngineResult<RawBlock> {
        let params = match id {
            BlockId::Height(h) => serde_json::json!({ "block_id": h }),
            BlockId::Hash(h) => serde_json::json!({ "block_id": h }),
            BlockId::Finality(f) => serde_json::json!({ "finality": f }),
        };
        match self.call("block", params).await {
            Err(EngineError::Rpc(msg)) if msg.to_lowercase().contains("unknown block") => {
                Err(EngineError::BlockUnavailable { height: -1 })
            }
            other => other,
        }
    }

    pub async fn chunk(&self, chunk_hash: &str) -> EngineResult<RawChunk> {
        self.call("chunk", serde_json::json!({ "chunk_id": chunk_hash }))
            .await
    }

    pub async fn tx_status_receipts(
        &self,
        tx_hash: &str,
        signer_id: &str,
    ) -> EngineResult<TxStatusOutcome> {
        self.call(
            "EXPERIMENTAL_tx_status",
            serde_json::json!({ "tx_hash": tx_hash, "sender_account_id": signer_id }),
        )
        .await
    }

    pub async fn status(&self) -> EngineResult<StatusResponse> {
        self.call("status", serde_json::json!([])).await
    }

    /// Height-aware variant used by handler code (spec §4.1): validator set
    /// at a given block reference.
    pub async fn validators(&self, id: BlockId) -> EngineResult<Value> {
        let params = match id {
            BlockId::Height(h) => serde_json::json!([h]),
            BlockId::Hash(h) => serde_json::json!([h]),
            BlockId::Finality(f) => serde_json::json!([f]),
        };
        self.call("validators", params).await
    }

    /// Height-aware variant used by handler code (spec §4.1): access-key
    /// change set for an account at a given block reference.
    pub async fn access_key_changes(
        &self,
        account_ids: &[String],
        id: BlockId,
    ) -> EngineResult<Value> {
        let block_id_param = match id {
            BlockId::Height(h) => serde_json::json!({ "block_id": h }),
            BlockId::Hash(h) => serde_json::json!({ "block_id": h }),
            BlockId::Finality(f) => serde_json::json!({ "finality": f }),
        };
        let mut params = serde_json::json!({ "account_ids": account_ids });
        if let Value::Object(ref mut map) = params {
            if let Value::Object(block_map) = block_id_param {
                map.extend(block_map);
            }
        }
        self.call("EXPERIMENTAL_changes", params).await
    }
}
