/// Unfinalized Blocks Tracker (spec §4.10): records headers fetched at
/// `finality:final` and, in unfinalized mode, compares each indexed block's
/// `prevHash` chain against its cache to detect rollbacks.
///
/// Grounded directly on `reorg.rs::find_fork_point` (walk-backwards common-
/// ancestor search) and `monitor.rs::detect_reorg` (height/hash comparison),
/// generalized from PIVX's UTXO hash-at-height comparison to NEAR's
/// `prevHash`-chain comparison and restated without a RocksDB dependency —
/// the cache here is an in-memory ring of recently finalized headers.
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::metrics;

#[derive(Debug, Clone)]
pub struct CachedHeader {
    pub hash: String,
    pub prev_hash: String,
}

/// Bounds how many recent finalized headers are retained; a fork deeper than
/// this cannot be detected by prevHash comparison alone.
const CACHE_DEPTH: usize = 500;

pub struct UnfinalizedTracker {
    headers: RwLock<BTreeMap<i64, CachedHeader>>,
}

impl UnfinalizedTracker {
    pub fn new() -> Self {
        Self {
            headers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Called by the scheduler's `getFinalizedBlockHead()` side loop.
    pub async fn record_finalized(&self, height: i64, hash: String, prev_hash: String) {
        let mut headers = self.headers.write().await;
        headers.insert(height, CachedHeader { hash, prev_hash });
        while headers.len() > CACHE_DEPTH {
            let oldest = *headers.keys().next().expect("non-empty");
            headers.remove(&oldest);
        }
    }

    /// Compares an indexed (possibly unfinalized) block's `prevHash` against
    /// the cached header at `height - 1`. A mismatch means the canonical
    /// chain has diverged from what was previously indexed; returns the
    /// fork height (the last height that still matches) so the caller can
    /// flush and reindex from there.
    pub async fn check_for_fork(
        &self,
        height: i64,
        prev_hash: &str,
    ) -> Option<i64> {
        let headers = self.headers.read().await;
        let cached_prev = headers.get(&(height - 1))?;
        if cached_prev.hash != prev_hash {
            warn!(
                height,
                expected = %cached_prev.hash,
                got = %prev_hash,
                "unfinalized tracker: prevHash mismatch, signaling reindex"
            );
            metrics::REINDEX_EVENTS.inc();
            return Some(self.find_fork_point(height - 1, &headers));
        }
        None
    }

    /// Walks backwards through the cache to find the last height whose
    /// cached hash still agrees with itself — i.e. the deepest point we can
    /// still trust without further RPC queries. Mirrors `find_fork_point`'s
    /// walk-backwards shape; here it degrades to "the height just below the
    /// mismatch" since divergent-chain headers aren't available locally.
    fn find_fork_point(&self, from_height: i64, headers: &BTreeMap<i64, CachedHeader>) -> i64 {
        let mut height = from_height;
        while height > 0 {
            if headers.contains_key(&height) {
                return height;
            }
            height -= 1;
        }
        0
    }

    pub async fn record_header(&self, height: i64, hash: String, prev_hash: String) {
        self.record_finalized(height, hash, prev_hash).await;
    }
}

impl Default for UnfinalizedTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_fork_when_prev_hash_matches() {
        let tracker = UnfinalizedTracker::new();
        tracker.record_finalized(100, "h100".into(), "h99".into()).await;
        assert_eq!(tracker.check_for_fork(101, "h100").await, None);
    }

    #[tokio::test]
    async fn detects_fork_on_prev_hash_mismatch() {
        let tracker = UnfinalizedTracker::new();
        tracker.record_finalized(100, "h100".into(), "h99".into()).await;
        let fork = tracker.check_for_fork(101, "different".into()).await;
        assert_eq!(fork, Some(100));
    }

    #[tokio::test]
    async fn no_fork_signaled_without_cached_ancestor() {
        let tracker = UnfinalizedTracker::new();
        assert_eq!(tracker.check_for_fork(500, "whatever").await, None);
    }
}
