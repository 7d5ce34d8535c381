/// Block Dispatcher — single-process mode (spec §4.7).
///
/// An in-memory bounded queue; a bounded pool of worker tasks pulls heights,
/// drives the Assembler then the Indexer, and commits results to the store
/// in strictly ascending height order (spec §5 ordering guarantee) even
/// though fetch+assemble+handler execution runs concurrently.
///
/// The bounded-concurrency fan-out generalizes the teacher's
/// `parallel.rs::process_files_parallel` semaphore pattern; the ascending-
/// commit reordering buffer is new (PIVX's single-writer `.dat` ingestion
/// has no analogous out-of-order concern).
use crate::assembler::Assembler;
use crate::errors::{EngineError, EngineResult};
use crate::indexer::Indexer;
use crate::metrics;
use crate::model::ProcessBlockResponse;
use crate::store::Store;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

/// Common interface the Fetch Scheduler drives regardless of dispatch mode
/// (spec §4.7 provides `enqueueBlocks`/`flushQueue`/`freeSize`/
/// `latestBufferedHeight`/`init` for both single-process and worker-pool
/// dispatchers).
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn enqueue_blocks(&self, heights: Vec<i64>, latest_buffered_height: i64);
    async fn flush_queue(&self, height: i64);
    async fn free_size(&self) -> usize;
    fn latest_buffered_height(&self) -> i64;
}

#[async_trait]
impl Dispatcher for SingleProcessDispatcher {
    async fn enqueue_blocks(&self, heights: Vec<i64>, latest_buffered_height: i64) {
        SingleProcessDispatcher::enqueue_blocks(self, heights, latest_buffered_height).await
    }

    async fn flush_queue(&self, height: i64) {
        SingleProcessDispatcher::flush_queue(self, height).await
    }

    async fn free_size(&self) -> usize {
        SingleProcessDispatcher::free_size(self).await
    }

    fn latest_buffered_height(&self) -> i64 {
        SingleProcessDispatcher::latest_buffered_height(self)
    }
}

/// Signal raised when a processed block created a dynamic datasource or
/// detected a fork; the scheduler listens on this to flush and resync.
#[derive(Debug, Clone)]
pub enum DispatcherSignal {
    DynamicDsCreated { after_height: i64 },
    ReindexRequested { fork_height: i64 },
}

pub struct SingleProcessDispatcher {
    queue: Mutex<VecDeque<i64>>,
    capacity: usize,
    latest_buffered_height: AtomicI64,
    in_flight: AtomicUsize,
    signal_tx: mpsc::UnboundedSender<DispatcherSignal>,
}

impl SingleProcessDispatcher {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DispatcherSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            latest_buffered_height: AtomicI64::new(-1),
            in_flight: AtomicUsize::new(0),
            signal_tx,
        });
        (dispatcher, signal_rx)
    }

    /// `enqueueBlocks(heights[], latestBufferedHeight)`.
    pub async fn enqueue_blocks(&self, heights: Vec<i64>, latest_buffered_height: i64) {
        let mut queue = self.queue.lock().await;
        for h in heights {
            metrics::HEIGHTS_ENQUEUED.with_label_values(&["range"]).inc();
            queue.push_back(h);
        }
        self.latest_buffered_height
            .store(latest_buffered_height, Ordering::SeqCst);
        metrics::LATEST_BUFFERED_HEIGHT.set(latest_buffered_height);
    }

    /// `flushQueue(height)`: discards buffered heights >= height, resets the
    /// watermark to `height - 1`.
    pub async fn flush_queue(&self, height: i64) {
        let mut queue = self.queue.lock().await;
        queue.retain(|h| *h < height);
        self.latest_buffered_height.store(height - 1, Ordering::SeqCst);
        metrics::LATEST_BUFFERED_HEIGHT.set(height - 1);
        info!(height, "dispatcher: flushed queue");
    }

    /// `freeSize`: capacity minus buffered-plus-in-flight heights.
    pub async fn free_size(&self) -> usize {
        let buffered = self.queue.lock().await.len();
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        self.capacity.saturating_sub(buffered + in_flight)
    }

    pub fn latest_buffered_height(&self) -> i64 {
        self.latest_buffered_height.load(Ordering::SeqCst)
    }

    /// Seeds the watermark at cold start (`config.initHeight`, spec §4.6 step 1).
    pub fn seed_initial_height(&self, init_height: i64) {
        self.latest_buffered_height
            .store(init_height - 1, Ordering::SeqCst);
    }

    async fn pop(&self) -> Option<i64> {
        self.queue.lock().await.pop_front()
    }

    /// Runs the worker pool until `shutdown` fires. Concurrency is
    /// `config.fetchBatchSize` (spec §4.7); results are buffered by height
    /// and committed to the store in ascending order.
    pub async fn run(
        self: Arc<Self>,
        assembler: Arc<Assembler>,
        indexer: Arc<Indexer>,
        store: Arc<dyn Store>,
        concurrency: usize,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let pending: Arc<Mutex<BTreeMap<i64, ProcessBlockResponse>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let next_to_commit = Arc::new(AtomicI64::new(-1));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let height = match self.pop().await {
                Some(h) => h,
                None => {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    continue;
                }
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let assembler = assembler.clone();
            let indexer = indexer.clone();
            let store = store.clone();
            let pending = pending.clone();
            let next_to_commit = next_to_commit.clone();
            let signal_tx = self.signal_tx.clone();
            let dispatcher = self.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let response = match process_height(height, &assembler, &indexer, &signal_tx).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!(height, error = %e, "dispatcher: fatal error, aborting engine");
                        std::process::exit(1);
                    }
                };
                dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst);

                if next_to_commit.load(Ordering::SeqCst) < 0 {
                    next_to_commit.store(height, Ordering::SeqCst);
                }

                let mut buffered = pending.lock().await;
                buffered.insert(height, response);

                // Commit every contiguous prefix starting at next_to_commit.
                loop {
                    let expected = next_to_commit.load(Ordering::SeqCst);
                    match buffered.remove(&expected) {
                        Some(resp) => {
                            commit(&store, expected, &resp).await;
                            next_to_commit.store(expected + 1, Ordering::SeqCst);
                        }
                        None => break,
                    }
                }
            });
        }
    }
}

async fn process_height(
    height: i64,
    assembler: &Assembler,
    indexer: &Indexer,
    signal_tx: &mpsc::UnboundedSender<DispatcherSignal>,
) -> DispatcherResult<ProcessBlockResponse> {
    let block = match assembler.assemble(height).await {
        Ok(b) => b,
        Err(EngineError::BlockUnavailable { .. }) => {
            warn!(height, "dispatcher: block unavailable, skipping");
            return Ok(ProcessBlockResponse {
                block_hash: None,
                dynamic_ds_created: false,
                reindex_block_height: None,
            });
        }
        Err(e) => {
            error!(height, error = %e, "dispatcher: fatal error assembling block");
            return Err(e);
        }
    };

    // `HandlerError` and other non-`BlockUnavailable` failures are fatal
    // (spec §4.7/§7): propagate rather than mapping to a null response.
    let response = indexer.index_block(&block).await?;

    if response.dynamic_ds_created {
        let _ = signal_tx.send(DispatcherSignal::DynamicDsCreated { after_height: height });
    }
    if let Some(fork_height) = response.reindex_block_height {
        let _ = signal_tx.send(DispatcherSignal::ReindexRequested { fork_height });
    }

    Ok(response)
}

async fn commit(store: &Arc<dyn Store>, height: i64, response: &ProcessBlockResponse) {
    metrics::BLOCKS_DISPATCHED.inc();
    if let Some(hash) = &response.block_hash {
        store.set_metadata(height, hash, "").await;
        info!(height, hash = %hash, "dispatcher: committed block");
    }
}

pub type DispatcherResult<T> = EngineResult<T>;
