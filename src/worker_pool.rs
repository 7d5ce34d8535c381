/// Block Dispatcher — worker-pool mode (spec §4.7).
///
/// A fixed set of worker processes (here: `tokio` tasks, standing in for
/// the inter-process RPC fabric the spec describes — see §9's "worker
/// memory lock is a process-wide gate") each run a `WorkerService` exposing
/// `fetchBlock(h)` and `processBlock(h)`. The dispatcher assigns heights
/// round-robin and commits results in ascending order, same as the
/// single-process dispatcher.
use crate::assembler::Assembler;
use crate::dispatcher::Dispatcher;
use crate::errors::EngineError;
use crate::indexer::Indexer;
use crate::metrics;
use crate::model::ProcessBlockResponse;
use crate::store::Store;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

/// Per-worker RPC surface (spec §4.7): `fetchBlock` pulls a block into the
/// worker's own fetched-block map (gated by a process-wide memory lock),
/// `processBlock` runs handlers and returns the block's processing result.
struct WorkerService {
    id: usize,
    fetched: Mutex<HashMap<i64, ()>>,
    assembler: Arc<Assembler>,
    indexer: Arc<Indexer>,
    /// Process-wide gate: writers set it high on memory pressure, readers
    /// await unlock before expanding their fetched-block working set.
    memory_lock: Arc<Semaphore>,
}

impl WorkerService {
    fn new(id: usize, assembler: Arc<Assembler>, indexer: Arc<Indexer>, memory_lock: Arc<Semaphore>) -> Self {
        Self {
            id,
            fetched: Mutex::new(HashMap::new()),
            assembler,
            indexer,
            memory_lock,
        }
    }

    /// `fetchBlock(h)`: pulls the block into worker memory. Transient
    /// errors are fatal and re-raised by the caller; a permanent 404
    /// surfaces as `BlockUnavailableError`, non-fatal.
    async fn fetch_block(&self, height: i64) -> Result<Option<crate::model::Block>, EngineError> {
        let _permit = self.memory_lock.acquire().await.expect("memory lock closed");
        match self.assembler.assemble(height).await {
            Ok(block) => {
                self.fetched.lock().await.insert(height, ());
                Ok(Some(block))
            }
            Err(EngineError::BlockUnavailable { .. }) => {
                warn!(worker = self.id, height, "worker: block unavailable");
                metrics::BLOCKS_UNAVAILABLE.inc();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// `processBlock(h)`: returns `{blockHash, dynamicDsCreated, reindexBlockHeight}`.
    /// `HandlerError` and other non-`BlockUnavailable` failures are fatal
    /// (spec §4.7/§7) and propagate to the caller rather than being mapped
    /// to a null response.
    async fn process_block(&self, height: i64) -> Result<ProcessBlockResponse, EngineError> {
        let block = match self.fetch_block(height).await? {
            Some(b) => b,
            None => {
                return Ok(ProcessBlockResponse {
                    block_hash: None,
                    dynamic_ds_created: false,
                    reindex_block_height: None,
                })
            }
        };
        self.indexer.index_block(&block).await
    }
}

pub struct WorkerPoolDispatcher {
    workers: Vec<Arc<WorkerService>>,
    queue: Mutex<VecDeque<i64>>,
    capacity: usize,
    latest_buffered_height: AtomicI64,
    in_flight: AtomicUsize,
    next_worker: AtomicUsize,
    signal_tx: mpsc::UnboundedSender<crate::dispatcher::DispatcherSignal>,
}

impl WorkerPoolDispatcher {
    pub fn new(
        worker_count: usize,
        assembler: Arc<Assembler>,
        indexer: Arc<Indexer>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<crate::dispatcher::DispatcherSignal>) {
        let memory_lock = Arc::new(Semaphore::new(worker_count.max(1)));
        let workers = (0..worker_count.max(1))
            .map(|id| {
                Arc::new(WorkerService::new(
                    id,
                    assembler.clone(),
                    indexer.clone(),
                    memory_lock.clone(),
                ))
            })
            .collect();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                workers,
                queue: Mutex::new(VecDeque::new()),
                capacity,
                latest_buffered_height: AtomicI64::new(-1),
                in_flight: AtomicUsize::new(0),
                next_worker: AtomicUsize::new(0),
                signal_tx,
            }),
            signal_rx,
        )
    }

    pub fn seed_initial_height(&self, init_height: i64) {
        self.latest_buffered_height
            .store(init_height - 1, Ordering::SeqCst);
    }

    fn pick_worker(&self) -> Arc<WorkerService> {
        let idx = self.next_worker.fetch_add(1, Ordering::SeqCst) % self.workers.len();
        self.workers[idx].clone()
    }

    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn Store>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let pending: Arc<Mutex<BTreeMap<i64, ProcessBlockResponse>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let next_to_commit = Arc::new(AtomicI64::new(-1));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let height = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };
            let height = match height {
                Some(h) => h,
                None => {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    continue;
                }
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let worker = self.pick_worker();
            let store = store.clone();
            let pending = pending.clone();
            let next_to_commit = next_to_commit.clone();
            let signal_tx = self.signal_tx.clone();
            let dispatcher = self.clone();

            tokio::spawn(async move {
                let response = match worker.process_block(height).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!(height, error = %e, "worker: fatal error, aborting engine");
                        std::process::exit(1);
                    }
                };
                dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst);

                if response.dynamic_ds_created {
                    let _ = signal_tx.send(crate::dispatcher::DispatcherSignal::DynamicDsCreated {
                        after_height: height,
                    });
                }
                if let Some(fork_height) = response.reindex_block_height {
                    let _ = signal_tx.send(crate::dispatcher::DispatcherSignal::ReindexRequested {
                        fork_height,
                    });
                }

                if next_to_commit.load(Ordering::SeqCst) < 0 {
                    next_to_commit.store(height, Ordering::SeqCst);
                }

                let mut buffered = pending.lock().await;
                buffered.insert(height, response);
                loop {
                    let expected = next_to_commit.load(Ordering::SeqCst);
                    match buffered.remove(&expected) {
                        Some(resp) => {
                            metrics::BLOCKS_DISPATCHED.inc();
                            if let Some(hash) = &resp.block_hash {
                                store.set_metadata(expected, hash, "").await;
                                info!(height = expected, hash = %hash, "worker pool: committed block");
                            }
                            next_to_commit.store(expected + 1, Ordering::SeqCst);
                        }
                        None => break,
                    }
                }
            });
        }
    }
}

#[async_trait]
impl Dispatcher for WorkerPoolDispatcher {
    async fn enqueue_blocks(&self, heights: Vec<i64>, latest_buffered_height: i64) {
        let mut queue = self.queue.lock().await;
        for h in heights {
            metrics::HEIGHTS_ENQUEUED.with_label_values(&["range"]).inc();
            queue.push_back(h);
        }
        self.latest_buffered_height
            .store(latest_buffered_height, Ordering::SeqCst);
        metrics::LATEST_BUFFERED_HEIGHT.set(latest_buffered_height);
    }

    async fn flush_queue(&self, height: i64) {
        let mut queue = self.queue.lock().await;
        queue.retain(|h| *h < height);
        self.latest_buffered_height.store(height - 1, Ordering::SeqCst);
        metrics::LATEST_BUFFERED_HEIGHT.set(height - 1);
        info!(height, "worker pool dispatcher: flushed queue");
    }

    async fn free_size(&self) -> usize {
        let buffered = self.queue.lock().await.len();
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        self.capacity.saturating_sub(buffered + in_flight)
    }

    fn latest_buffered_height(&self) -> i64 {
        self.latest_buffered_height.load(Ordering::SeqCst)
    }
}
