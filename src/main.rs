mod api_pool;
mod assembler;
mod cli;
mod config;
mod dictionary;
mod dispatcher;
mod dynamic_ds;
mod errors;
mod filter;
mod indexer;
mod manifest;
mod metrics;
mod model;
mod rpc;
mod scheduler;
mod store;
mod telemetry;
mod unfinalized;
mod worker_pool;

use crate::config::{init_global_config, EngineConfig};
use crate::dispatcher::{Dispatcher, DispatcherSignal, SingleProcessDispatcher};
use crate::dynamic_ds::DynamicDsManager;
use crate::errors::EngineError;
use crate::indexer::{HandlerContext, HandlerEffects, HandlerRuntime, Indexer};
use crate::manifest::ProjectManifest;
use crate::scheduler::{FetchScheduler, SchedulerConfig};
use crate::store::{InMemoryStore, Store};
use crate::unfinalized::UnfinalizedTracker;
use async_trait::async_trait;
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Stand-in for the sandboxed execution environment that runs user mapping
/// handlers (spec §1: out of scope). Logs the invocation and never raises
/// side effects; a real deployment wires this to the actual sandbox.
struct LoggingHandlerRuntime;

#[async_trait]
impl HandlerRuntime for LoggingHandlerRuntime {
    async fn invoke(&self, ctx: HandlerContext) -> Result<HandlerEffects, String> {
        info!(
            height = ctx.height,
            handler = %ctx.handler_name,
            kind = ?ctx.kind,
            "dispatching to handler runtime"
        );
        Ok(HandlerEffects::default())
    }
}

fn load_manifest(path: &str) -> Result<ProjectManifest, EngineError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| EngineError::config(format!("failed to read manifest {}: {}", path, e)))?;
    let manifest: ProjectManifest = serde_yaml::from_str(&contents)
        .map_err(|e| EngineError::config(format!("failed to parse manifest {}: {}", path, e)))?;
    manifest::validate_spec_version(&manifest)?;
    Ok(manifest)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = cli::Cli::parse();

    telemetry::init_tracing(telemetry::TelemetryConfig::default())?;
    metrics::init_metrics()?;

    let manifest = match load_manifest(&cli.manifest) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "fatal: manifest load/validation failed");
            std::process::exit(1);
        }
    };

    let endpoints = if cli.endpoint.is_empty() {
        manifest.network.endpoint.clone()
    } else {
        cli.endpoint.clone()
    };
    let dictionary_url = cli.dictionary.clone().or_else(|| manifest.network.dictionary.clone());
    let mut bypass_blocks = cli.bypass_blocks_sorted();
    bypass_blocks.extend(manifest.network.bypass_blocks.iter().copied());
    bypass_blocks.sort_unstable();
    bypass_blocks.dedup();

    let engine_config = EngineConfig {
        endpoints: endpoints.clone(),
        dictionary_url: dictionary_url.clone(),
        bypass_blocks,
        batch_size: cli.batch_size,
        fetch_batch_size: cli.fetch_batch_size,
        worker_count: cli.workers,
        unfinalized: cli.unfinalized_blocks,
        store_cache_size: cli.store_cache_size,
        profiler: cli.profiler,
        init_height: manifest.data_sources.iter().map(|d| d.start_block).min().unwrap_or(0),
        expected_chain_id: manifest.network.chain_id.clone(),
        expected_genesis_hash: manifest.network.genesis_hash.clone(),
        ..EngineConfig::default()
    };
    let init_height = engine_config.init_height;
    let unfinalized_mode = engine_config.unfinalized;
    let worker_count = engine_config.worker_count;
    let fetch_batch_size = engine_config.fetch_batch_size;
    let batch_size = engine_config.batch_size;

    init_global_config(engine_config)?;
    let config = config::get_global_config();

    if let Some(cmd) = &cli.command {
        return run_subcommand(cmd);
    }

    let api_pool = Arc::new(api_pool::ApiPool::new(
        endpoints.clone(),
        config.rpc_timeout_secs,
        config.max_reconnect_attempts,
    ));

    if let Err(e) = api_pool
        .init(
            config.expected_chain_id.as_deref(),
            config.expected_genesis_hash.as_deref(),
            0,
        )
        .await
    {
        error!(error = %e, "fatal: api pool init failed");
        std::process::exit(1);
    }

    let network_meta = api_pool.network_meta().await.expect("init() populates network_meta");
    info!(chain = %network_meta.chain, genesis = %network_meta.genesis_hash, "api pool initialized");

    let primary_adapter = Arc::new(rpc::RpcAdapter::new(
        endpoints.first().cloned().unwrap_or_default(),
        config.rpc_timeout_secs,
    ));
    let assembler = Arc::new(assembler::Assembler::new(primary_adapter.clone(), fetch_batch_size));

    let static_datasources = manifest::into_datasources(&manifest);
    let dynamic_ds = Arc::new(DynamicDsManager::new(manifest.templates.clone()));
    let unfinalized_tracker = Some(Arc::new(UnfinalizedTracker::new()));
    let handler_runtime: Arc<dyn HandlerRuntime> = Arc::new(LoggingHandlerRuntime);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let indexer = Arc::new(Indexer::new(
        static_datasources.clone(),
        dynamic_ds.clone(),
        unfinalized_tracker.clone(),
        handler_runtime,
        HashMap::new(),
        network_meta.chain.clone(),
        primary_adapter.clone(),
        store.clone(),
    ));

    let dictionary_client = dictionary_url
        .as_ref()
        .map(|url| Arc::new(dictionary::DictionaryClient::new(url.clone(), network_meta.genesis_hash.clone())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (dispatcher, mut signal_rx): (Arc<dyn Dispatcher>, _) = if worker_count > 0 {
        let (wp, rx) = worker_pool::WorkerPoolDispatcher::new(
            worker_count,
            assembler.clone(),
            indexer.clone(),
            batch_size * 4,
        );
        wp.seed_initial_height(init_height);
        let wp_clone = wp.clone();
        let store_clone = store.clone();
        let shutdown_rx_clone = shutdown_rx.clone();
        tokio::spawn(async move { wp_clone.run(store_clone, shutdown_rx_clone).await });
        (wp, rx)
    } else {
        let (sp, rx) = SingleProcessDispatcher::new(batch_size * 4);
        sp.seed_initial_height(init_height);
        let sp_clone = sp.clone();
        let assembler_clone = assembler.clone();
        let indexer_clone = indexer.clone();
        let store_clone = store.clone();
        let shutdown_rx_clone = shutdown_rx.clone();
        tokio::spawn(async move {
            sp_clone
                .run(assembler_clone, indexer_clone, store_clone, fetch_batch_size, shutdown_rx_clone)
                .await
        });
        (sp, rx)
    };

    let scheduler = Arc::new(
        FetchScheduler::new(
            api_pool.clone(),
            dictionary_client,
            dispatcher,
            static_datasources,
            dynamic_ds.clone(),
            SchedulerConfig {
                batch_size,
                unfinalized: unfinalized_mode,
                init_height,
                dictionary_start_height: init_height,
                chain_interval_ms: config::DEFAULT_CHAIN_INTERVAL_MS,
            },
        )
        .with_bypass_blocks(config.bypass_blocks.clone()),
    );

    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                match signal {
                    DispatcherSignal::DynamicDsCreated { after_height } => {
                        scheduler.reset_for_new_ds(after_height + 1).await;
                    }
                    DispatcherSignal::ReindexRequested { fork_height } => {
                        scheduler.reset_for_reindex(fork_height).await;
                    }
                }
            }
        });
    }

    tokio::spawn(scheduler.clone().run_scan_loop(shutdown_rx.clone()));
    tokio::spawn(scheduler.clone().run_finalized_head_loop(shutdown_rx.clone()));
    tokio::spawn(scheduler.clone().run_best_head_loop(shutdown_rx.clone()));
    tokio::spawn(scheduler.clone().run_batch_scale_loop(shutdown_rx.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    Ok(())
}

/// MMR migration and the mapping-handler test runner are explicitly out of
/// core scope (spec §1); the CLI recognizes the verbs and defers to the
/// store/sandbox collaborators that would actually implement them.
fn run_subcommand(cmd: &cli::Command) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        cli::Command::MigrateMmr => {
            warn!("mmr migration is owned by the store collaborator, not the engine core");
        }
        cli::Command::Test { block_height } => {
            warn!(?block_height, "test runner is owned by the sandboxed handler runtime, not the engine core");
        }
    }
    Ok(())
}
