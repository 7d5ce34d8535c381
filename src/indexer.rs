/// Indexer (spec §4.8): per-block handler selection and dispatch.
///
/// For each fetched block, resolves the active datasource set (static plus
/// dynamic datasources whose `startBlock` has been reached), applies the
/// Filter Engine (and, for custom datasources, the processor's own filter),
/// transforms the matched input through the processor's transformer (or
/// passes it through unchanged for runtime datasources), and invokes the
/// user handler — a sandboxed external collaborator per spec §1, modeled
/// here as the `HandlerRuntime` trait so the engine core stays decoupled
/// from whatever sandbox hosts user mapping code.
use crate::dynamic_ds::DynamicDsManager;
use crate::errors::{EngineError, EngineResult};
use crate::filter::{block_passes, filter_action, filter_transaction};
use crate::model::{Block, CronFilter, Datasource, HandlerKind, ProcessBlockResponse};
use crate::rpc::{HeightPinnedView, RpcAdapter};
use crate::store::Store;
use crate::unfinalized::UnfinalizedTracker;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::debug;

/// Capability trait for custom datasources (spec §9 "polymorphic
/// datasources"): owns filter validation, dictionary query synthesis, and
/// the transformer. `transform` returns multiple derived inputs per input
/// under the v1.0.0 contract; v0.0.0 transformers are adapted by the caller
/// lifting a single value into a singleton list.
#[async_trait]
pub trait DatasourceProcessor: Send + Sync {
    fn base_handler_kind(&self, custom_kind: &str) -> HandlerKind;

    fn filter_processor(&self, _custom_kind: &str, _input: &Value, _ds: &Datasource) -> bool {
        true
    }

    fn dictionary_query(&self, _filter: &Value, _ds: &Datasource) -> Option<Value> {
        None
    }

    async fn transform(&self, custom_kind: &str, input: Value, ds: &Datasource) -> Vec<Value>;
}

/// Context handed to a user handler invocation: the height-pinned API view,
/// logger, store and `createDynamicDatasource` are realized per-invocation
/// rather than as process globals (spec §9 "global mutable singletons").
pub struct HandlerContext {
    pub height: i64,
    pub chain_id: String,
    pub kind: HandlerKind,
    pub handler_name: String,
    pub input: Value,
    /// `api` (spec §6): height-pinned RPC view, fresh per invocation.
    pub api: HeightPinnedView,
    /// `store` (spec §6): the external persistence collaborator.
    pub store: Arc<dyn Store>,
}

#[derive(Debug, Default, Clone)]
pub struct HandlerEffects {
    /// `(templateName, args)` pairs requested via `createDynamicDatasource`.
    pub dynamic_ds_requests: Vec<(String, Value)>,
}

#[async_trait]
pub trait HandlerRuntime: Send + Sync {
    async fn invoke(&self, ctx: HandlerContext) -> Result<HandlerEffects, String>;
}

/// Identifies one `BlockFilter` entry's compiled cron state: datasource
/// (by `startBlock`/name), handler, and position within its filter list.
type CronKey = (i64, Option<String>, String, usize);

pub struct Indexer {
    static_datasources: Vec<Datasource>,
    dynamic_ds: Arc<DynamicDsManager>,
    unfinalized: Option<Arc<UnfinalizedTracker>>,
    handler_runtime: Arc<dyn HandlerRuntime>,
    processors: HashMap<String, Arc<dyn DatasourceProcessor>>,
    chain_id: String,
    adapter: Arc<RpcAdapter>,
    store: Arc<dyn Store>,
    cron_cache: StdMutex<HashMap<CronKey, Option<CronFilter>>>,
}

impl Indexer {
    pub fn new(
        static_datasources: Vec<Datasource>,
        dynamic_ds: Arc<DynamicDsManager>,
        unfinalized: Option<Arc<UnfinalizedTracker>>,
        handler_runtime: Arc<dyn HandlerRuntime>,
        processors: HashMap<String, Arc<dyn DatasourceProcessor>>,
        chain_id: String,
        adapter: Arc<RpcAdapter>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            static_datasources,
            dynamic_ds,
            unfinalized,
            handler_runtime,
            processors,
            chain_id,
            adapter,
            store,
            cron_cache: StdMutex::new(HashMap::new()),
        }
    }

    /// `getAllDataSources(height)` (spec §4.8 step 1).
    async fn active_datasources(&self, height: i64) -> Vec<Datasource> {
        let mut all: Vec<Datasource> = self
            .static_datasources
            .iter()
            .filter(|ds| ds.is_enabled_at(height))
            .cloned()
            .collect();
        all.extend(self.dynamic_ds.get_dynamic_datasources(Some(height)).await);
        all
    }

    pub async fn index_block(&self, block: &Block) -> EngineResult<ProcessBlockResponse> {
        let height = block.header.height;

        if let Some(tracker) = &self.unfinalized {
            if let Some(fork_height) = tracker
                .check_for_fork(height, &block.header.prev_hash)
                .await
            {
                return Ok(ProcessBlockResponse {
                    block_hash: Some(block.header.hash.clone()),
                    dynamic_ds_created: false,
                    reindex_block_height: Some(fork_height),
                });
            }
            tracker
                .record_header(height, block.header.hash.clone(), block.header.prev_hash.clone())
                .await;
        }

        let datasources = self.active_datasources(height).await;
        let mut dynamic_ds_created = false;

        for ds in &datasources {
            for handler in &ds.handlers {
                let base_kind = match handler.kind {
                    HandlerKind::Custom => {
                        let custom_kind = handler.custom_kind.as_deref().unwrap_or_default();
                        ds.processor_key
                            .as_ref()
                            .and_then(|key| self.processors.get(key))
                            .map(|p| p.base_handler_kind(custom_kind))
                            .unwrap_or(HandlerKind::Block)
                    }
                    other => other,
                };

                let matched_inputs = self.matched_inputs(block, ds, handler, base_kind);

                for input in matched_inputs {
                    let transformed = self.transform_input(ds, handler, base_kind, input).await;

                    for value in transformed {
                        let api = HeightPinnedView::new(self.adapter.clone(), height);
                        let ctx = HandlerContext {
                            height,
                            chain_id: self.chain_id.clone(),
                            kind: base_kind,
                            handler_name: handler.handler.clone(),
                            input: value,
                            api,
                            store: self.store.clone(),
                        };

                        crate::metrics::HANDLER_INVOCATIONS
                            .with_label_values(&[kind_label(base_kind)])
                            .inc();
                        let _timer = crate::metrics::HANDLER_DURATION
                            .with_label_values(&[kind_label(base_kind)])
                            .start_timer();

                        match self.handler_runtime.invoke(ctx).await {
                            Ok(effects) => {
                                for (template, args) in effects.dynamic_ds_requests {
                                    if self
                                        .dynamic_ds
                                        .create_dynamic_datasource(&template, vec![], height + 1)
                                        .await
                                        .is_ok()
                                    {
                                        dynamic_ds_created = true;
                                    }
                                    debug!(template, ?args, "handler requested dynamic datasource");
                                }
                            }
                            Err(e) => {
                                // `HandlerError` is fatal (spec §7): abort this
                                // block rather than continue to the next
                                // input/handler/datasource.
                                crate::metrics::HANDLER_ERRORS.inc();
                                tracing::error!(handler = %handler.handler, error = %e, "handler error, aborting block");
                                return Err(EngineError::handler(e));
                            }
                        }
                    }
                }
            }
        }

        Ok(ProcessBlockResponse {
            block_hash: Some(block.header.hash.clone()),
            dynamic_ds_created,
            reindex_block_height: None,
        })
    }

    /// Applies the base filter (Filter Engine), then the processor's
    /// `filterProcessor` for custom datasources, and returns the raw JSON
    /// inputs that matched (spec §4.8 steps 2-3).
    fn matched_inputs(
        &self,
        block: &Block,
        ds: &Datasource,
        handler: &crate::model::Handler,
        base_kind: HandlerKind,
    ) -> Vec<Value> {
        let mut matched = Vec::new();
        match base_kind {
            HandlerKind::Block => {
                let filters = handler.block_filter.clone().unwrap_or_default();
                let timestamp_matches: Vec<bool> = filters
                    .iter()
                    .enumerate()
                    .map(|(idx, f)| match &f.timestamp {
                        None => true,
                        Some(cron_expr) => {
                            self.eval_cron(ds, handler, idx, cron_expr, block.header.timestamp)
                        }
                    })
                    .collect();
                if block_passes(block, &filters, &timestamp_matches) {
                    matched.push(serde_json::to_value(block).unwrap_or(Value::Null));
                }
            }
            HandlerKind::Transaction => {
                let filters = handler.transaction_filter.clone().unwrap_or_default();
                for tx in &block.transactions {
                    if filter_transaction(tx, &filters) {
                        matched.push(serde_json::to_value(tx).unwrap_or(Value::Null));
                    }
                }
            }
            HandlerKind::Action => {
                let filters = handler.action_filter.clone().unwrap_or_default();
                for action in &block.actions {
                    if filter_action(action.action.kind(), &filters) {
                        matched.push(serde_json::to_value(action).unwrap_or(Value::Null));
                    }
                }
            }
            HandlerKind::Custom => {
                matched.push(serde_json::to_value(block).unwrap_or(Value::Null));
            }
        }

        if let (HandlerKind::Custom, Some(custom_kind)) = (handler.kind, &handler.custom_kind) {
            if let Some(processor) = ds.processor_key.as_ref().and_then(|k| self.processors.get(k)) {
                matched.retain(|input| processor.filter_processor(custom_kind, input, ds));
            }
        }

        matched
    }

    /// Resolves the cron-timestamp match for one `BlockFilter` entry (spec
    /// §4.3), compiling and caching the `CronFilter` on first sight. The
    /// anchor is the first block this indexer observes carrying that
    /// (datasource, handler, filter) triple — the datasource's `startBlock`
    /// in the common case, per spec §3's "reference timestamp derived from
    /// the block at the datasource startBlock." A compile failure is logged
    /// once and the entry is treated as an unconditional pass from then on.
    fn eval_cron(
        &self,
        ds: &Datasource,
        handler: &crate::model::Handler,
        filter_idx: usize,
        cron_expr: &str,
        block_timestamp_ms: i64,
    ) -> bool {
        let key = (ds.start_block, ds.name.clone(), handler.handler.clone(), filter_idx);
        let mut cache = self.cron_cache.lock().expect("cron cache poisoned");
        let entry = cache.entry(key).or_insert_with(|| {
            crate::filter::compile_cron_filter(cron_expr, block_timestamp_ms)
                .map_err(|e| {
                    tracing::error!(error = %e, cron = cron_expr, "failed to compile cron filter, entry always passes");
                })
                .ok()
        });
        match entry {
            Some(cron_filter) => crate::filter::match_cron(cron_filter, block_timestamp_ms),
            None => true,
        }
    }

    /// `transformer` (spec §4.8 step 4): custom datasources delegate to the
    /// processor; runtime datasources pass the input through as a singleton.
    async fn transform_input(
        &self,
        ds: &Datasource,
        handler: &crate::model::Handler,
        _base_kind: HandlerKind,
        input: Value,
    ) -> Vec<Value> {
        if handler.kind == HandlerKind::Custom {
            if let Some(processor) = ds.processor_key.as_ref().and_then(|k| self.processors.get(k)) {
                let custom_kind = handler.custom_kind.as_deref().unwrap_or_default();
                return processor.transform(custom_kind, input, ds).await;
            }
        }
        vec![input]
    }
}

fn kind_label(kind: HandlerKind) -> &'static str {
    match kind {
        HandlerKind::Block => "block",
        HandlerKind::Transaction => "transaction",
        HandlerKind::Action => "action",
        HandlerKind::Custom => "custom",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockHeader, DatasourceFlavor, Handler, TxResult};
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_adapter() -> Arc<RpcAdapter> {
        Arc::new(RpcAdapter::new("http://localhost:0".to_string(), 1))
    }

    fn test_store() -> Arc<dyn Store> {
        Arc::new(InMemoryStore::new())
    }

    struct CountingRuntime {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HandlerRuntime for CountingRuntime {
        async fn invoke(&self, _ctx: HandlerContext) -> Result<HandlerEffects, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerEffects::default())
        }
    }

    struct FailingRuntime;

    #[async_trait]
    impl HandlerRuntime for FailingRuntime {
        async fn invoke(&self, _ctx: HandlerContext) -> Result<HandlerEffects, String> {
            Err("boom".to_string())
        }
    }

    fn sample_block(height: i64) -> Block {
        Block {
            author: "validator.near".into(),
            header: BlockHeader {
                height,
                hash: format!("hash{}", height),
                prev_hash: format!("hash{}", height - 1),
                timestamp: 0,
                gas_price: "1".into(),
            },
            chunks: vec![],
            transactions: vec![crate::model::Transaction {
                hash: "tx1".into(),
                signer_id: "alice.near".into(),
                receiver_id: "bob.near".into(),
                actions: vec![],
                gas_price: "1".into(),
                gas_used: 0,
                block_hash: format!("hash{}", height),
                block_height: height,
                timestamp: 0,
                result: TxResult { id: "tx1".into(), logs: vec![] },
            }],
            actions: vec![],
            receipts: vec![],
        }
    }

    #[tokio::test]
    async fn invokes_handler_for_matching_transaction() {
        let runtime = Arc::new(CountingRuntime { calls: AtomicUsize::new(0) });
        let ds = Datasource {
            name: None,
            flavor: DatasourceFlavor::Runtime,
            start_block: 0,
            handlers: vec![Handler {
                kind: HandlerKind::Transaction,
                custom_kind: None,
                handler: "handleTx".into(),
                block_filter: None,
                transaction_filter: None,
                action_filter: None,
            }],
            processor_key: None,
        };
        let indexer = Indexer::new(
            vec![ds],
            Arc::new(DynamicDsManager::new(vec![])),
            None,
            runtime.clone(),
            HashMap::new(),
            "testnet".into(),
            test_adapter(),
            test_store(),
        );
        let response = indexer.index_block(&sample_block(10)).await.unwrap();
        assert_eq!(response.block_hash, Some("hash10".to_string()));
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skips_datasources_below_start_block() {
        let runtime = Arc::new(CountingRuntime { calls: AtomicUsize::new(0) });
        let ds = Datasource {
            name: None,
            flavor: DatasourceFlavor::Runtime,
            start_block: 100,
            handlers: vec![Handler {
                kind: HandlerKind::Transaction,
                custom_kind: None,
                handler: "handleTx".into(),
                block_filter: None,
                transaction_filter: None,
                action_filter: None,
            }],
            processor_key: None,
        };
        let indexer = Indexer::new(
            vec![ds],
            Arc::new(DynamicDsManager::new(vec![])),
            None,
            runtime.clone(),
            HashMap::new(),
            "testnet".into(),
            test_adapter(),
            test_store(),
        );
        indexer.index_block(&sample_block(10)).await.unwrap();
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_error_aborts_block_as_fatal() {
        let ds = Datasource {
            name: None,
            flavor: DatasourceFlavor::Runtime,
            start_block: 0,
            handlers: vec![Handler {
                kind: HandlerKind::Transaction,
                custom_kind: None,
                handler: "handleTx".into(),
                block_filter: None,
                transaction_filter: None,
                action_filter: None,
            }],
            processor_key: None,
        };
        let indexer = Indexer::new(
            vec![ds],
            Arc::new(DynamicDsManager::new(vec![])),
            None,
            Arc::new(FailingRuntime),
            HashMap::new(),
            "testnet".into(),
            test_adapter(),
            test_store(),
        );
        let result = indexer.index_block(&sample_block(10)).await;
        assert!(matches!(result, Err(EngineError::Handler(_))));
    }

    #[tokio::test]
    async fn block_handler_gated_by_cron_filter() {
        let runtime = Arc::new(CountingRuntime { calls: AtomicUsize::new(0) });
        let ds = Datasource {
            name: None,
            flavor: DatasourceFlavor::Runtime,
            start_block: 10,
            handlers: vec![Handler {
                kind: HandlerKind::Block,
                custom_kind: None,
                handler: "handleBlock".into(),
                block_filter: Some(vec![crate::model::BlockFilter {
                    modulo: None,
                    // Every minute; anchored to the first block seen (t=0),
                    // so it won't match again until a block crosses the
                    // next minute boundary.
                    timestamp: Some("0 * * * * *".into()),
                }]),
                transaction_filter: None,
                action_filter: None,
            }],
            processor_key: None,
        };
        let indexer = Indexer::new(
            vec![ds],
            Arc::new(DynamicDsManager::new(vec![])),
            None,
            runtime.clone(),
            HashMap::new(),
            "testnet".into(),
            test_adapter(),
            test_store(),
        );

        let mut first = sample_block(10);
        first.header.timestamp = 0;
        indexer.index_block(&first).await.unwrap();
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);

        let mut crossing = sample_block(11);
        crossing.header.timestamp = 61_000;
        indexer.index_block(&crossing).await.unwrap();
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
    }
}
