/// Fetch Scheduler (spec §4.6): the central loop deciding which block
/// heights to process next, using the dictionary when applicable and
/// falling back to sequential ranges, honoring finalized vs. best-block
/// targets, modulo-only block filters, cron-timestamp filters, and bypass
/// lists.
///
/// Grounded on `sync.rs::run_sync_service`'s mode-dispatch shape and
/// `monitor.rs::run_block_monitor`'s timer-driven polling loop
/// (`tokio::time::sleep` cadence), generalized to the batch/dictionary/
/// modulo decision tree below.
use crate::api_pool::ApiPool;
use crate::config::{DICTIONARY_MAX_QUERY_SIZE, MINIMUM_BATCH_SIZE};
use crate::dictionary::{build_queries, merge_dictionary_and_modulo, DictionaryClient};
use crate::dispatcher::Dispatcher;
use crate::dynamic_ds::DynamicDsManager;
use crate::model::{Datasource, HandlerKind};
use crate::rpc::{BlockId, Finality};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

pub struct SchedulerConfig {
    pub batch_size: usize,
    pub unfinalized: bool,
    pub init_height: i64,
    pub dictionary_start_height: i64,
    pub chain_interval_ms: u64,
}

/// Pluggable memory-pressure probe behind `checkBatchScale()` (spec §4.6);
/// the concrete accounting (RSS vs. budget) is an external helper this
/// engine doesn't own. Default never throttles.
pub trait BatchScaleProbe: Send + Sync {
    fn scale(&self) -> f64 {
        1.0
    }
}

pub struct NoopBatchScaleProbe;
impl BatchScaleProbe for NoopBatchScaleProbe {}

pub struct FetchScheduler {
    api_pool: Arc<ApiPool>,
    dictionary: Option<Arc<DictionaryClient>>,
    dispatcher: Arc<dyn Dispatcher>,
    static_datasources: Vec<Datasource>,
    dynamic_ds: Arc<DynamicDsManager>,
    config: SchedulerConfig,
    bypass_blocks: Mutex<Vec<i64>>,
    batch_scale_bits: AtomicU64,
    latest_finalized_height: AtomicI64,
    latest_best_height: AtomicI64,
    batch_scale_probe: Arc<dyn BatchScaleProbe>,
}

/// `chainInterval * 0.9`, clamped at the engine's default 5000ms ceiling
/// (spec §4.6 "chain-interval calibration").
pub fn block_time_variance_ms(chain_interval_ms: u64) -> u64 {
    let scaled = (chain_interval_ms as f64 * 0.9) as u64;
    crate::config::DEFAULT_BLOCK_TIME_VARIANCE_MS.min(scaled)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        a.max(b)
    } else {
        a / gcd(a, b) * b
    }
}

impl FetchScheduler {
    pub fn new(
        api_pool: Arc<ApiPool>,
        dictionary: Option<Arc<DictionaryClient>>,
        dispatcher: Arc<dyn Dispatcher>,
        static_datasources: Vec<Datasource>,
        dynamic_ds: Arc<DynamicDsManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            api_pool,
            dictionary,
            dispatcher,
            static_datasources,
            dynamic_ds,
            config,
            bypass_blocks: Mutex::new(Vec::new()),
            batch_scale_bits: AtomicU64::new(1.0f64.to_bits()),
            latest_finalized_height: AtomicI64::new(-1),
            latest_best_height: AtomicI64::new(-1),
            batch_scale_probe: Arc::new(NoopBatchScaleProbe),
        }
    }

    pub fn with_bypass_blocks(self, blocks: Vec<i64>) -> Self {
        // Only used at construction time, before any task reads the mutex.
        *self.bypass_blocks.try_lock().expect("uncontended at init") = blocks;
        self
    }

    pub fn with_batch_scale_probe(mut self, probe: Arc<dyn BatchScaleProbe>) -> Self {
        self.batch_scale_probe = probe;
        self
    }

    fn batch_scale(&self) -> f64 {
        f64::from_bits(self.batch_scale_bits.load(Ordering::SeqCst))
    }

    fn set_batch_scale(&self, scale: f64) {
        self.batch_scale_bits.store(scale.to_bits(), Ordering::SeqCst);
        crate::metrics::BATCH_SCALE.set(scale);
    }

    /// `scaledBatchSize = round(batchScale * config.batchSize)`, floored at
    /// `min(MINIMUM_BATCH_SIZE, config.batchSize * 3)` (spec §4.6 step 2).
    fn scaled_batch_size(&self) -> usize {
        let floor = MINIMUM_BATCH_SIZE.min(self.config.batch_size * 3);
        let scaled = (self.batch_scale() * self.config.batch_size as f64).round() as usize;
        scaled.max(floor)
    }

    async fn current_datasources(&self, height: i64) -> Vec<Datasource> {
        let mut all: Vec<Datasource> = self
            .static_datasources
            .iter()
            .filter(|ds| ds.is_enabled_at(height))
            .cloned()
            .collect();
        all.extend(self.dynamic_ds.get_dynamic_datasources(Some(height)).await);
        all
    }

    fn block_moduli(datasources: &[Datasource]) -> Vec<u64> {
        datasources
            .iter()
            .flat_map(|ds| ds.handlers.iter())
            .filter(|h| h.kind == HandlerKind::Block)
            .flat_map(|h| h.block_filter.clone().unwrap_or_default())
            .filter_map(|f| f.modulo)
            .collect()
    }

    fn all_block_modulo_handlers(datasources: &[Datasource]) -> bool {
        let has_any_handler = datasources.iter().any(|ds| !ds.handlers.is_empty());
        has_any_handler
            && datasources.iter().all(|ds| {
                ds.handlers.iter().all(|h| {
                    h.kind == HandlerKind::Block
                        && h.block_filter
                            .as_ref()
                            .map(|fs| !fs.is_empty() && fs.iter().all(|f| f.modulo.is_some()))
                            .unwrap_or(false)
                })
            })
    }

    /// Modulo-only fast path (spec §4.6 step 6, §9 lcm refinement): expands
    /// the scan window by `batchSize * lcm(modulos)` rather than
    /// `batchSize * max(modulo)`, which never over-fetches.
    fn modulo_fast_path(datasources: &[Datasource], start: i64, batch_size: usize) -> Vec<i64> {
        let modulos = Self::block_moduli(datasources);
        if modulos.is_empty() {
            return (start..start + batch_size as i64).collect();
        }
        let l = modulos.iter().copied().fold(1u64, lcm) as i64;
        let window_end = start + (batch_size as i64) * l;
        let mut result = Vec::with_capacity(batch_size);
        let mut h = start;
        while h <= window_end && result.len() < batch_size {
            if modulos.iter().any(|m| h % (*m as i64) == 0) {
                result.push(h);
            }
            h += 1;
        }
        result
    }

    fn moduli_only_blocks_in_range(datasources: &[Datasource], start: i64, end: i64) -> Vec<i64> {
        let modulos = Self::block_moduli(datasources);
        if modulos.is_empty() {
            return Vec::new();
        }
        (start..=end)
            .filter(|h| modulos.iter().any(|m| h % (*m as i64) == 0))
            .collect()
    }

    /// Bypass application (spec §4.6 step 7, §8 testable property): cleaned
    /// list excludes any bypass member; the watermark advances to the raw
    /// max regardless, and consumed bypass entries are removed so bypass
    /// doesn't make the scheduler repeat work on the next scan.
    async fn apply_bypass_and_enqueue(&self, raw: Vec<i64>) {
        if raw.is_empty() {
            return;
        }
        let max_raw = *raw.iter().max().expect("non-empty");

        let mut bypass = self.bypass_blocks.lock().await;
        let cleaned: Vec<i64> = raw.into_iter().filter(|h| !bypass.contains(h)).collect();
        bypass.retain(|b| *b > max_raw);
        drop(bypass);

        self.dispatcher.enqueue_blocks(cleaned, max_raw).await;
    }

    /// One iteration of the scheduler's main loop (spec §4.6 steps 1-7).
    pub async fn scan_once(&self) {
        let start = self.dispatcher.latest_buffered_height() + 1;
        let scaled_batch_size = self.scaled_batch_size();
        let latest_target = if self.config.unfinalized {
            self.latest_best_height.load(Ordering::SeqCst)
        } else {
            self.latest_finalized_height.load(Ordering::SeqCst)
        };

        if latest_target < 0 {
            return; // chain head not yet observed by the side loops.
        }

        let free = self.dispatcher.free_size().await;
        if free < scaled_batch_size || start > latest_target {
            tokio::time::sleep(Duration::from_millis(1)).await;
            return;
        }

        let datasources = self.current_datasources(start).await;

        if let Some(dict) = &self.dictionary {
            if !dict.is_disabled() && start >= self.config.dictionary_start_height {
                if let Some(queries) = build_queries(&datasources) {
                    if self.run_dictionary_path(dict, &datasources, start, scaled_batch_size, &queries).await {
                        return;
                    }
                }
            }
        }

        self.run_non_dictionary_path(&datasources, start, scaled_batch_size, latest_target)
            .await;
    }

    /// Returns `true` if the dictionary path handled (or deliberately
    /// skipped) this cycle, so the caller shouldn't fall through to the
    /// non-dictionary path.
    async fn run_dictionary_path(
        &self,
        dict: &DictionaryClient,
        datasources: &[Datasource],
        start: i64,
        scaled_batch_size: usize,
        queries: &[crate::dictionary::QueryEntry],
    ) -> bool {
        let query_end = start + DICTIONARY_MAX_QUERY_SIZE;

        let response = match dict
            .scoped_dictionary_entries(start, query_end, scaled_batch_size, queries)
            .await
        {
            Ok(Some(r)) => r,
            Ok(None) => return true, // genesis mismatch (disabled) or lag (skip this cycle)
            Err(e) => {
                warn!(error = %e, "dictionary query failed, skipping this cycle");
                return true;
            }
        };

        // Discard and restart if `start` moved during the query.
        if self.dispatcher.latest_buffered_height() + 1 != start {
            return true;
        }

        let modulo_blocks = Self::moduli_only_blocks_in_range(datasources, start, query_end - 1);
        let merged = merge_dictionary_and_modulo(response.batch_blocks.clone(), modulo_blocks);

        if merged.is_empty() {
            let new_watermark = (query_end - 1).min(response.metadata.last_processed_height);
            self.dispatcher.enqueue_blocks(vec![], new_watermark).await;
            return true;
        }

        let free = self.dispatcher.free_size().await;
        let take: Vec<i64> = merged.into_iter().take(free).collect();
        for _h in &take {
            crate::metrics::HEIGHTS_ENQUEUED.with_label_values(&["dictionary"]).inc();
        }
        self.apply_bypass_and_enqueue(take).await;
        true
    }

    async fn run_non_dictionary_path(
        &self,
        datasources: &[Datasource],
        start: i64,
        scaled_batch_size: usize,
        latest_target: i64,
    ) {
        let end = (start + scaled_batch_size as i64 - 1).min(latest_target);

        let heights = if Self::all_block_modulo_handlers(datasources) {
            Self::modulo_fast_path(datasources, start, self.config.batch_size)
        } else {
            (start..=end).collect()
        };

        for _ in &heights {
            crate::metrics::HEIGHTS_ENQUEUED.with_label_values(&["range"]).inc();
        }
        self.apply_bypass_and_enqueue(heights).await;
    }

    /// `resetForNewDs(h+1)` (spec §4.7): called by the dispatcher when a
    /// processed block created a dynamic datasource. Resyncs the dictionary
    /// query set (implicit — queries are rebuilt every cycle from live
    /// datasources) and flushes buffered heights.
    pub async fn reset_for_new_ds(&self, from_height: i64) {
        self.dispatcher.flush_queue(from_height).await;
        info!(from_height, "scheduler: reset for new datasource");
    }

    /// Unfinalized rollback: flush and rewind to the fork height.
    pub async fn reset_for_reindex(&self, fork_height: i64) {
        self.dynamic_ds.delete_temp_ds_records(fork_height + 1).await;
        self.dispatcher.flush_queue(fork_height + 1).await;
        info!(fork_height, "scheduler: reset for reindex");
    }

    pub async fn run_scan_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.scan_once().await;
        }
    }

    /// `getFinalizedBlockHead()` side loop: polls `finality:final` every
    /// `BLOCK_TIME_VARIANCE` ms.
    pub async fn run_finalized_head_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let variance = block_time_variance_ms(self.config.chain_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Ok(idx) = self.api_pool.acquire().await {
                let result = self
                    .api_pool
                    .with_adapter(idx, |adapter| {
                        Box::pin(async move { adapter.block(BlockId::Finality(Finality::Final)).await })
                    })
                    .await;
                match result {
                    Ok(block) => {
                        self.latest_finalized_height
                            .store(block.header.height, Ordering::SeqCst);
                        crate::metrics::CHAIN_HEAD_HEIGHT
                            .with_label_values(&["final"])
                            .set(block.header.height);
                    }
                    Err(e) => warn!(error = %e, "finalized head poll failed, skipping"),
                }
            }
            tokio::time::sleep(Duration::from_millis(variance)).await;
        }
    }

    /// `getBestBlockHead()` side loop: polls `finality:optimistic`.
    pub async fn run_best_head_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let variance = block_time_variance_ms(self.config.chain_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Ok(idx) = self.api_pool.acquire().await {
                let result = self
                    .api_pool
                    .with_adapter(idx, |adapter| {
                        Box::pin(async move { adapter.block(BlockId::Finality(Finality::Optimistic)).await })
                    })
                    .await;
                match result {
                    Ok(block) => {
                        self.latest_best_height
                            .store(block.header.height, Ordering::SeqCst);
                        crate::metrics::CHAIN_HEAD_HEIGHT
                            .with_label_values(&["optimistic"])
                            .set(block.header.height);
                    }
                    Err(e) => warn!(error = %e, "best head poll failed, skipping"),
                }
            }
            tokio::time::sleep(Duration::from_millis(variance)).await;
        }
    }

    /// `checkBatchScale()` side loop: every 60s, adjusts `batchScale` via
    /// the pluggable memory-pressure probe.
    pub async fn run_batch_scale_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            let scale = self.batch_scale_probe.scale().clamp(f64::EPSILON, 1.0);
            self.set_batch_scale(scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_time_variance_clamps_to_default_ceiling() {
        assert_eq!(block_time_variance_ms(6000), 5000);
        assert_eq!(block_time_variance_ms(4000), 3600);
    }

    #[test]
    fn lcm_of_moduli() {
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(vec![4u64, 6, 3].into_iter().fold(1u64, lcm), 12);
    }

    #[test]
    fn modulo_fast_path_enqueues_batch_size_matches() {
        use crate::model::{BlockFilter, DatasourceFlavor, Handler};
        let ds = Datasource {
            name: None,
            flavor: DatasourceFlavor::Runtime,
            start_block: 0,
            handlers: vec![Handler {
                kind: HandlerKind::Block,
                custom_kind: None,
                handler: "h".into(),
                block_filter: Some(vec![BlockFilter { modulo: Some(100), timestamp: None }]),
                transaction_filter: None,
                action_filter: None,
            }],
            processor_key: None,
        };
        let heights = FetchScheduler::modulo_fast_path(&[ds], 1000, 6);
        assert_eq!(heights, vec![1000, 1100, 1200, 1300, 1400, 1500]);
    }
}
