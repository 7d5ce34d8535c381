/// API Pool (spec §4.2): multiplexes chain RPC endpoints with health/
/// reconnect semantics and cross-validates chain identity across them.
///
/// Connection bookkeeping follows the teacher's idiom of sharing state
/// behind `Arc<...>` plus a lazily-initialized lock (`main.rs`'s
/// `DB_MUTEX: TokioMutex<()>`), here a `tokio::sync::RwLock` over the member
/// list since reads (picking a healthy member) vastly outnumber writes
/// (quarantine/reinstate).
use crate::errors::{EngineError, EngineResult};
use crate::metrics;
use crate::rpc::{BlockId, Finality, RpcAdapter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct NetworkMeta {
    pub chain: String,
    pub genesis_hash: String,
}

struct Member {
    adapter: RpcAdapter,
    healthy: bool,
    failures: u32,
    quarantined_until: Option<Instant>,
}

pub struct ApiPool {
    members: RwLock<Vec<Member>>,
    network_meta: RwLock<Option<NetworkMeta>>,
    max_reconnect_attempts: u32,
}

/// Events the pool emits onto the cross-cutting event bus (spec §2).
#[derive(Debug, Clone)]
pub enum ApiPoolEvent {
    ApiConnected { endpoint: String },
    ApiDisconnected { endpoint: String },
}

impl ApiPool {
    pub fn new(endpoints: Vec<String>, timeout_secs: u64, max_reconnect_attempts: u32) -> Self {
        let members = endpoints
            .into_iter()
            .map(|e| Member {
                adapter: RpcAdapter::new(e, timeout_secs),
                healthy: true,
                failures: 0,
                quarantined_until: None,
            })
            .collect();
        Self {
            members: RwLock::new(members),
            network_meta: RwLock::new(None),
            max_reconnect_attempts,
        }
    }

    /// Initializes the pool: probes each endpoint, records network identity
    /// from the first success, and fail-fasts on any disagreement.
    pub async fn init(
        &self,
        expected_chain_id: Option<&str>,
        expected_genesis_hash: Option<&str>,
        genesis_height: i64,
    ) -> EngineResult<()> {
        let mut meta: Option<NetworkMeta> = None;
        let members = self.members.read().await;

        if members.is_empty() {
            return Err(EngineError::config("no RPC endpoints configured"));
        }

        for (idx, member) in members.iter().enumerate() {
            let status = member.adapter.status().await?;

            if let Some(expected) = expected_chain_id {
                if expected != status.chain_id {
                    return Err(EngineError::chain_mismatch(format!(
                        "endpoint {} reports chainId {} but manifest declares {}",
                        member.adapter.endpoint, status.chain_id, expected
                    )));
                }
            }

            if idx == 0 {
                let genesis_block = member.adapter.block(BlockId::Height(genesis_height)).await?;
                let genesis_hash = genesis_block.header.hash.clone();

                if let Some(expected) = expected_genesis_hash {
                    if expected != genesis_hash {
                        return Err(EngineError::chain_mismatch(format!(
                            "endpoint {} genesis hash {} disagrees with manifest {}",
                            member.adapter.endpoint, genesis_hash, expected
                        )));
                    }
                }

                meta = Some(NetworkMeta {
                    chain: status.chain_id.clone(),
                    genesis_hash,
                });
                info!(endpoint = %member.adapter.endpoint, chain = %status.chain_id, "api pool: recorded network identity");
                metrics::record_api_connected();
            } else {
                let reference = meta.as_ref().expect("first endpoint always sets meta");
                let block_at_genesis = member.adapter.block(BlockId::Height(genesis_height)).await?;
                if block_at_genesis.header.hash != reference.genesis_hash {
                    return Err(EngineError::chain_mismatch(format!(
                        "endpoint {} disagrees with endpoint 0 at genesis height {}: {} != {}",
                        member.adapter.endpoint,
                        genesis_height,
                        block_at_genesis.header.hash,
                        reference.genesis_hash
                    )));
                }
                metrics::record_api_connected();
            }
        }

        drop(members);
        *self.network_meta.write().await = meta;
        Ok(())
    }

    pub async fn network_meta(&self) -> Option<NetworkMeta> {
        self.network_meta.read().await.clone()
    }

    /// Returns a reference-counted handle usable for a single call; since
    /// members are stored behind a lock we hand back the endpoint index so
    /// callers can report success/failure back via `record_result`.
    pub async fn acquire(&self) -> EngineResult<usize> {
        let members = self.members.read().await;
        let now = Instant::now();
        for (idx, m) in members.iter().enumerate() {
            let quarantined = m.quarantined_until.map_or(false, |until| now < until);
            if m.healthy && !quarantined {
                return Ok(idx);
            }
        }
        Err(EngineError::network("no healthy api pool member available"))
    }

    pub async fn with_adapter<F, T>(&self, idx: usize, f: F) -> EngineResult<T>
    where
        F: for<'a> FnOnce(
            &'a RpcAdapter,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = EngineResult<T>> + Send + 'a>>,
    {
        let result = {
            let members = self.members.read().await;
            let member = members
                .get(idx)
                .ok_or_else(|| EngineError::network("api pool member index out of range"))?;
            f(&member.adapter).await
        };

        match &result {
            Ok(_) => self.record_success(idx).await,
            Err(EngineError::Network(_)) | Err(EngineError::Rpc(_)) => {
                self.record_failure(idx).await
            }
            _ => {}
        }
        result
    }

    async fn record_success(&self, idx: usize) {
        let mut members = self.members.write().await;
        if let Some(m) = members.get_mut(idx) {
            if !m.healthy {
                info!(endpoint = %m.adapter.endpoint, "api pool: endpoint reinstated");
                metrics::record_api_connected();
            }
            m.healthy = true;
            m.failures = 0;
            m.quarantined_until = None;
        }
    }

    async fn record_failure(&self, idx: usize) {
        let mut members = self.members.write().await;
        if let Some(m) = members.get_mut(idx) {
            m.failures += 1;
            if m.failures >= self.max_reconnect_attempts {
                m.healthy = false;
                let backoff = Duration::from_secs(2u64.saturating_pow(m.failures.min(6)));
                m.quarantined_until = Some(Instant::now() + backoff);
                warn!(endpoint = %m.adapter.endpoint, failures = m.failures, "api pool: quarantining endpoint");
                metrics::record_api_disconnected();
            } else {
                error!(endpoint = %m.adapter.endpoint, failures = m.failures, "api pool: endpoint call failed");
            }
        }
    }

    pub async fn endpoint_count(&self) -> usize {
        self.members.read().await.len()
    }
}

/// `unsafeApi()`: returns a healthy member's adapter index for direct use by
/// callers that don't need height-pinning (e.g. chain-head pollers).
pub async fn unsafe_api(pool: &Arc<ApiPool>) -> EngineResult<usize> {
    pool.acquire().await
}

pub fn finality_params(f: Finality) -> BlockId {
    BlockId::Finality(f)
}
