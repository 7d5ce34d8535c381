/// Engine configuration loading.
///
/// Layered config: `config.toml` (if present) overlaid with `RBLOX_`-prefixed
/// environment variables, with CLI flags taking final precedence when
/// supplied by `crate::cli`. A single process-wide snapshot is published into
/// a `OnceCell` the same way the teacher's `config.rs` does, since the bulk
/// of the engine (scheduler, dispatcher, dictionary) reads it from arbitrary
/// call depths without threading a reference everywhere.
pub use config::Config as RawConfig;
pub use once_cell::sync::OnceCell;

use crate::errors::{EngineError, EngineResult};

static GLOBAL_CONFIG: OnceCell<EngineConfig> = OnceCell::new();

pub const MINIMUM_BATCH_SIZE: usize = 5;
pub const DICTIONARY_MAX_QUERY_SIZE: i64 = 10_000;
pub const DEFAULT_CHAIN_INTERVAL_MS: u64 = 6_000;
pub const DEFAULT_BLOCK_TIME_VARIANCE_MS: u64 = 5_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chain RPC endpoints, comma-separated on the CLI.
    pub endpoints: Vec<String>,
    /// Dictionary service base URL, if accelerated indexing is enabled.
    pub dictionary_url: Option<String>,
    /// Heights the scheduler enqueues unconditionally skip, regardless of filters.
    pub bypass_blocks: Vec<i64>,
    /// Target `batchScale * batchSize` blocks per scan.
    pub batch_size: usize,
    /// Bounded concurrency for block fetch/assembly (`config.fetchBatchSize`).
    pub fetch_batch_size: usize,
    /// Worker-pool size; 0 selects single-process dispatcher mode.
    pub worker_count: usize,
    /// Use the best (optimistic) block as scheduling target instead of finalized.
    pub unfinalized: bool,
    /// Entity-store write-behind cache sizing, handed to the external store collaborator.
    pub store_cache_size: usize,
    /// Enable profiler hooks (exposed to the host process, not implemented here).
    pub profiler: bool,
    /// Height the scheduler starts scanning from on a cold start.
    pub init_height: i64,
    /// Declared chain id (or legacy genesis hash) the API Pool cross-validates against.
    pub expected_chain_id: Option<String>,
    pub expected_genesis_hash: Option<String>,
    pub max_reconnect_attempts: u32,
    pub rpc_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dictionary_url: None,
            bypass_blocks: Vec::new(),
            batch_size: 50,
            fetch_batch_size: 10,
            worker_count: 0,
            unfinalized: false,
            store_cache_size: 1000,
            profiler: false,
            init_height: 0,
            expected_chain_id: None,
            expected_genesis_hash: None,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
        }
    }
}

/// Build the raw layered config from `config.toml` (optional) and environment.
pub fn load_raw_config() -> EngineResult<RawConfig> {
    RawConfig::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(config::Environment::with_prefix("RBLOX").separator("_"))
        .build()
        .map_err(|e| EngineError::config(format!("failed to load config: {}", e)))
}

pub fn init_global_config(overrides: EngineConfig) -> EngineResult<()> {
    GLOBAL_CONFIG
        .set(overrides)
        .map_err(|_| EngineError::config("config already initialized"))
}

pub fn get_global_config() -> &'static EngineConfig {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

#[cfg(test)]
pub fn set_global_config_for_test(cfg: EngineConfig) {
    let _ = GLOBAL_CONFIG.set(cfg);
}
