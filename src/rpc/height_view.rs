/// Height-pinned RPC view (spec §4.1): substitutes `this.height` wherever a
/// call would otherwise accept a block reference. Constructed fresh per
/// handler invocation and handed to the user handler as part of its context
/// (spec §4.8 step 5, §6); holds an `Arc` clone of the adapter rather than a
/// borrow so it can be carried by value into the handler runtime's owned
/// `HandlerContext`.
use super::adapter::{BlockId, RawBlock, RpcAdapter, StatusResponse, TxStatusOutcome};
use crate::errors::EngineResult;
use std::sync::Arc;

pub struct HeightPinnedView {
    adapter: Arc<RpcAdapter>,
    height: i64,
}

impl HeightPinnedView {
    pub fn new(adapter: Arc<RpcAdapter>, height: i64) -> Self {
        Self { adapter, height }
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    /// `block()` with no reference pins to `self.height`.
    pub async fn block(&self) -> EngineResult<RawBlock> {
        self.adapter.block(BlockId::Height(self.height)).await
    }

    pub async fn block_at(&self, id: BlockId) -> EngineResult<RawBlock> {
        self.adapter.block(id).await
    }

    pub async fn tx_status_receipts(
        &self,
        tx_hash: &str,
        signer_id: &str,
    ) -> EngineResult<TxStatusOutcome> {
        self.adapter.tx_status_receipts(tx_hash, signer_id).await
    }

    pub async fn status(&self) -> EngineResult<StatusResponse> {
        self.adapter.status().await
    }

    pub async fn validators(&self) -> EngineResult<serde_json::Value> {
        self.adapter.validators(BlockId::Height(self.height)).await
    }

    pub async fn access_key_changes(&self, account_ids: &[String]) -> EngineResult<serde_json::Value> {
        self.adapter
            .access_key_changes(account_ids, BlockId::Height(self.height))
            .await
    }
}
