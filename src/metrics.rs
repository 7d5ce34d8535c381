/// Metrics Module - Prometheus Instrumentation
///
/// Realizes spec §2's "cross-cutting event bus emits metrics": pipeline
/// progress/throughput, latency histograms, error counters and pool health
/// gauges for the fetch-schedule-dispatch pipeline. Structure (lazy_static
/// registry + typed metric statics + a single `init_metrics`) follows the
/// teacher's `metrics.rs` verbatim; the metric catalog itself is re-themed
/// from PIVX/UTXO concerns to scheduler/dispatcher/indexer concerns.
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ------------------------------------------------------------------
    // Pipeline progress & throughput
    // ------------------------------------------------------------------

    /// Heights enqueued by the fetch scheduler, by source (dictionary, modulo, range).
    pub static ref HEIGHTS_ENQUEUED: IntCounterVec = IntCounterVec::new(
        Opts::new("engine_heights_enqueued_total", "Heights enqueued by the fetch scheduler"),
        &["source"]
    ).unwrap();

    /// Blocks dispatched to the indexer.
    pub static ref BLOCKS_DISPATCHED: IntCounter = IntCounter::new(
        "engine_blocks_dispatched_total",
        "Total blocks handed to the indexer"
    ).unwrap();

    /// Handler invocations, by datasource kind.
    pub static ref HANDLER_INVOCATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("engine_handler_invocations_total", "Handler invocations by datasource kind"),
        &["kind"]
    ).unwrap();

    /// Latest buffered height (the dispatcher's scheduling watermark).
    pub static ref LATEST_BUFFERED_HEIGHT: IntGauge = IntGauge::new(
        "engine_latest_buffered_height",
        "Highest height the dispatcher has buffered"
    ).unwrap();

    /// Finalized / best chain-head heights observed by the scheduler's side loops.
    pub static ref CHAIN_HEAD_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("engine_chain_head_height", "Chain head height by finality"),
        &["finality"]
    ).unwrap();

    /// Dispatcher free capacity (backpressure signal).
    pub static ref DISPATCHER_FREE_SIZE: IntGauge = IntGauge::new(
        "engine_dispatcher_free_size",
        "Free slots remaining in the block dispatcher queue"
    ).unwrap();

    /// Current batch scale factor (0,1].
    pub static ref BATCH_SCALE: prometheus::Gauge = prometheus::Gauge::new(
        "engine_batch_scale",
        "Current scheduler batch-size scale factor"
    ).unwrap();

    // ------------------------------------------------------------------
    // Latency histograms
    // ------------------------------------------------------------------

    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("engine_rpc_call_duration_seconds", "Chain RPC call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();

    pub static ref BLOCK_ASSEMBLY_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("engine_block_assembly_duration_seconds", "Time to fetch+assemble one block")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref DICTIONARY_QUERY_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("engine_dictionary_query_duration_seconds", "Dictionary query round-trip latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref HANDLER_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("engine_handler_duration_seconds", "User handler execution latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["kind"]
    ).unwrap();

    // ------------------------------------------------------------------
    // Error & retry counters
    // ------------------------------------------------------------------

    pub static ref RPC_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("engine_rpc_errors_total", "RPC errors by method and error type"),
        &["method", "error_type"]
    ).unwrap();

    pub static ref DICTIONARY_DISABLED: IntCounter = IntCounter::new(
        "engine_dictionary_disabled_total",
        "Times the dictionary was disabled for the session due to genesis mismatch"
    ).unwrap();

    pub static ref DICTIONARY_SKIPPED_CYCLES: IntCounter = IntCounter::new(
        "engine_dictionary_skipped_cycles_total",
        "Times a dictionary cycle was skipped due to lastProcessedHeight lag"
    ).unwrap();

    pub static ref REINDEX_EVENTS: IntCounter = IntCounter::new(
        "engine_reindex_events_total",
        "Times the unfinalized tracker signaled a reindex due to a fork"
    ).unwrap();

    pub static ref BLOCKS_UNAVAILABLE: IntCounter = IntCounter::new(
        "engine_blocks_unavailable_total",
        "Heights reported permanently unavailable by the chain RPC"
    ).unwrap();

    pub static ref HANDLER_ERRORS: IntCounter = IntCounter::new(
        "engine_handler_errors_total",
        "Fatal user handler errors"
    ).unwrap();

    // ------------------------------------------------------------------
    // API pool health
    // ------------------------------------------------------------------

    pub static ref API_CONNECTED: IntCounter = IntCounter::new(
        "engine_api_connected_total",
        "Total ApiConnected events emitted by the API pool"
    ).unwrap();

    pub static ref API_DISCONNECTED: IntCounter = IntCounter::new(
        "engine_api_disconnected_total",
        "Total ApiDisconnected (quarantine) events emitted by the API pool"
    ).unwrap();

    // ------------------------------------------------------------------
    // Dynamic datasources
    // ------------------------------------------------------------------

    pub static ref DYNAMIC_DATASOURCES_CREATED: IntCounter = IntCounter::new(
        "engine_dynamic_datasources_created_total",
        "Total dynamic datasources created by handlers"
    ).unwrap();

    // ------------------------------------------------------------------
    // Operational
    // ------------------------------------------------------------------

    pub static ref SERVICE_START_TIMESTAMP: IntGauge = IntGauge::new(
        "engine_service_start_timestamp_seconds",
        "Unix timestamp when the engine started"
    ).unwrap();
}

/// Register all metrics with the global registry. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(HEIGHTS_ENQUEUED.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_DISPATCHED.clone()))?;
    REGISTRY.register(Box::new(HANDLER_INVOCATIONS.clone()))?;
    REGISTRY.register(Box::new(LATEST_BUFFERED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(CHAIN_HEAD_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(DISPATCHER_FREE_SIZE.clone()))?;
    REGISTRY.register(Box::new(BATCH_SCALE.clone()))?;

    REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(BLOCK_ASSEMBLY_DURATION.clone()))?;
    REGISTRY.register(Box::new(DICTIONARY_QUERY_DURATION.clone()))?;
    REGISTRY.register(Box::new(HANDLER_DURATION.clone()))?;

    REGISTRY.register(Box::new(RPC_ERRORS.clone()))?;
    REGISTRY.register(Box::new(DICTIONARY_DISABLED.clone()))?;
    REGISTRY.register(Box::new(DICTIONARY_SKIPPED_CYCLES.clone()))?;
    REGISTRY.register(Box::new(REINDEX_EVENTS.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_UNAVAILABLE.clone()))?;
    REGISTRY.register(Box::new(HANDLER_ERRORS.clone()))?;

    REGISTRY.register(Box::new(API_CONNECTED.clone()))?;
    REGISTRY.register(Box::new(API_DISCONNECTED.clone()))?;

    REGISTRY.register(Box::new(DYNAMIC_DATASOURCES_CREATED.clone()))?;

    REGISTRY.register(Box::new(SERVICE_START_TIMESTAMP.clone()))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    SERVICE_START_TIMESTAMP.set(now as i64);

    Ok(())
}

/// Render the registry in Prometheus text exposition format.
pub fn render() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_api_connected() {
    API_CONNECTED.inc();
}

pub fn record_api_disconnected() {
    API_DISCONNECTED.inc();
}
