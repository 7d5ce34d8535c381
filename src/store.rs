/// Store trait (spec §1 scope note): "the relational persistence layer
/// (store, POI, MMR)" is treated as an external collaborator. This module
/// defines the interface the engine depends on — an async key/value and
/// typed-entity surface plus the per-block metadata writes spec §6 names
/// (`lastProcessedHeight`, `genesisHash`, `chain`, the dynamic-ds creation
/// log) — without implementing an actual relational backend.
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, entity: &str, id: &str) -> Option<Value>;
    async fn set(&self, entity: &str, id: &str, value: Value);
    async fn remove(&self, entity: &str, id: &str);

    /// Per-block metadata the engine writes after a successful commit.
    async fn set_metadata(&self, last_processed_height: i64, genesis_hash: &str, chain: &str);

    async fn get_last_processed_height(&self) -> Option<i64>;
}

/// In-memory double used by tests and by the CLI when no real store is wired.
#[derive(Default)]
pub struct InMemoryStore {
    entities: tokio::sync::Mutex<std::collections::HashMap<(String, String), Value>>,
    last_processed_height: std::sync::atomic::AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entities: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            last_processed_height: std::sync::atomic::AtomicI64::new(-1),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, entity: &str, id: &str) -> Option<Value> {
        self.entities
            .lock()
            .await
            .get(&(entity.to_string(), id.to_string()))
            .cloned()
    }

    async fn set(&self, entity: &str, id: &str, value: Value) {
        self.entities
            .lock()
            .await
            .insert((entity.to_string(), id.to_string()), value);
    }

    async fn remove(&self, entity: &str, id: &str) {
        self.entities
            .lock()
            .await
            .remove(&(entity.to_string(), id.to_string()));
    }

    async fn set_metadata(&self, last_processed_height: i64, _genesis_hash: &str, _chain: &str) {
        self.last_processed_height
            .store(last_processed_height, std::sync::atomic::Ordering::SeqCst);
    }

    async fn get_last_processed_height(&self) -> Option<i64> {
        let h = self
            .last_processed_height
            .load(std::sync::atomic::Ordering::SeqCst);
        if h < 0 {
            None
        } else {
            Some(h)
        }
    }
}
