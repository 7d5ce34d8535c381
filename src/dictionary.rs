/// Dictionary Client (spec §4.5): builds entity queries from handler
/// filters, executes paginated `scopedDictionaryEntries`, and validates
/// responses against the pool's genesis identity.
use crate::errors::{EngineError, EngineResult};
use crate::metrics;
use crate::model::{Datasource, DictionaryResponse, HandlerKind};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryEntry {
    pub entity: String,
    /// `(field, value)` pairs, sorted, used both as the wire query and as
    /// the dedup key (spec: "Deduplicate entries by (entity, sorted-conditions)").
    pub conditions: Vec<(String, String)>,
}

/// Build the set of dictionary query entries for one scan (spec §4.5).
///
/// Returns `None` when any `Block` handler has no modulo — in that case the
/// dictionary is abandoned entirely for this scan.
pub fn build_queries(datasources: &[Datasource]) -> Option<Vec<QueryEntry>> {
    let mut entries: BTreeMap<QueryEntry, ()> = BTreeMap::new();

    for ds in datasources {
        for handler in &ds.handlers {
            match handler.kind {
                HandlerKind::Block => {
                    let has_non_modulo = handler
                        .block_filter
                        .as_ref()
                        .map(|fs| fs.iter().any(|f| f.modulo.is_none()))
                        .unwrap_or(true);
                    if has_non_modulo {
                        return None;
                    }
                    // Block/modulo handlers contribute no dictionary query.
                }
                HandlerKind::Transaction => {
                    if let Some(filters) = &handler.transaction_filter {
                        for f in filters {
                            let mut conditions = Vec::new();
                            if let Some(sender) = &f.sender {
                                conditions.push(("sender".to_string(), sender.clone()));
                            }
                            if let Some(receiver) = &f.receiver {
                                conditions.push(("receiver".to_string(), receiver.clone()));
                            }
                            conditions.sort();
                            entries.insert(
                                QueryEntry {
                                    entity: "transactions".to_string(),
                                    conditions,
                                },
                                (),
                            );
                        }
                    }
                }
                HandlerKind::Action => {
                    if let Some(filters) = &handler.action_filter {
                        for f in filters {
                            if f.action_type.is_empty() {
                                continue;
                            }
                            entries.insert(
                                QueryEntry {
                                    entity: "actions".to_string(),
                                    conditions: vec![("type".to_string(), f.action_type.clone())],
                                },
                                (),
                            );
                        }
                    }
                }
                HandlerKind::Custom => {
                    // Custom datasources delegate to `processor.dictionaryQuery`,
                    // an external collaborator (spec §1); falling back to base
                    // filters the same way is the caller's responsibility since
                    // the processor isn't modeled here.
                }
            }
        }
    }

    Some(entries.into_keys().collect())
}

pub struct DictionaryClient {
    base_url: String,
    client: reqwest::Client,
    genesis_hash: String,
    disabled: std::sync::atomic::AtomicBool,
}

impl DictionaryClient {
    pub fn new(base_url: impl Into<String>, genesis_hash: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            genesis_hash: genesis_hash.into(),
            disabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn disable(&self) {
        self.disabled.store(true, std::sync::atomic::Ordering::SeqCst);
        metrics::DICTIONARY_DISABLED.inc();
    }

    /// `scopedDictionaryEntries(start, end, limit)`.
    pub async fn scoped_dictionary_entries(
        &self,
        start: i64,
        end: i64,
        limit: usize,
        queries: &[QueryEntry],
    ) -> EngineResult<Option<DictionaryResponse>> {
        if self.is_disabled() {
            return Ok(None);
        }

        let _timer = metrics::DICTIONARY_QUERY_DURATION.start_timer();

        let body = serde_json::json!({
            "start": start,
            "end": end,
            "limit": limit,
            "queries": queries.iter().map(|q| serde_json::json!({
                "entity": q.entity,
                "conditions": q.conditions.iter().map(|(field, value)| serde_json::json!({
                    "field": field,
                    "value": value,
                    "matcher": "equalTo",
                })).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        });

        let response = self
            .client
            .post(format!("{}/dictionary", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(EngineError::from)?;

        let parsed: DictionaryResponse = response.json().await.map_err(EngineError::from)?;

        self.validate(&parsed, start)
    }

    /// Validation rules (spec §4.5): a genesis mismatch disables the
    /// dictionary for the session; a `lastProcessedHeight` lag behind the
    /// requested start skips just this cycle.
    fn validate(
        &self,
        response: &DictionaryResponse,
        requested_start: i64,
    ) -> EngineResult<Option<DictionaryResponse>> {
        if response.metadata.genesis_hash != self.genesis_hash {
            self.disable();
            return Err(EngineError::dictionary(format!(
                "dictionary genesisHash {} disagrees with pool genesis {}",
                response.metadata.genesis_hash, self.genesis_hash
            )));
        }

        if response.metadata.last_processed_height < requested_start {
            warn!(
                requested_start,
                last_processed_height = response.metadata.last_processed_height,
                "dictionary lagging behind requested start, skipping cycle"
            );
            metrics::DICTIONARY_SKIPPED_CYCLES.inc();
            return Ok(None);
        }

        Ok(Some(response.clone()))
    }
}

/// Merge dictionary-returned blocks with locally-computed modulo blocks,
/// dedupe and sort ascending (spec §4.6 dictionary path, §8 "merge order").
pub fn merge_dictionary_and_modulo(
    dict_blocks: Vec<i64>,
    modulo_blocks: Vec<i64>,
) -> Vec<i64> {
    let mut set: HashSet<i64> = HashSet::new();
    set.extend(dict_blocks);
    set.extend(modulo_blocks);
    let mut merged: Vec<i64> = set.into_iter().collect();
    merged.sort_unstable();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionFilter, BlockFilter, Datasource, DatasourceFlavor, Handler, HandlerKind, TransactionFilter};

    fn ds_with_handler(h: Handler) -> Datasource {
        Datasource {
            name: None,
            flavor: DatasourceFlavor::Runtime,
            start_block: 0,
            handlers: vec![h],
            processor_key: None,
        }
    }

    #[test]
    fn modulo_only_block_handler_yields_no_query_not_abandonment() {
        let h = Handler {
            kind: HandlerKind::Block,
            custom_kind: None,
            handler: "h".into(),
            block_filter: Some(vec![BlockFilter { modulo: Some(100), timestamp: None }]),
            transaction_filter: None,
            action_filter: None,
        };
        let queries = build_queries(&[ds_with_handler(h)]);
        assert_eq!(queries, Some(vec![]));
    }

    #[test]
    fn block_handler_without_modulo_abandons_dictionary() {
        let h = Handler {
            kind: HandlerKind::Block,
            custom_kind: None,
            handler: "h".into(),
            block_filter: Some(vec![BlockFilter { modulo: None, timestamp: Some("* * * * * *".into()) }]),
            transaction_filter: None,
            action_filter: None,
        };
        assert_eq!(build_queries(&[ds_with_handler(h)]), None);
    }

    #[test]
    fn transaction_handler_emits_entity_query() {
        let h = Handler {
            kind: HandlerKind::Transaction,
            custom_kind: None,
            handler: "h".into(),
            block_filter: None,
            transaction_filter: Some(vec![TransactionFilter {
                sender: Some("alice.near".into()),
                receiver: None,
            }]),
            action_filter: None,
        };
        let queries = build_queries(&[ds_with_handler(h)]).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].entity, "transactions");
    }

    #[test]
    fn action_handler_emits_entity_query() {
        let h = Handler {
            kind: HandlerKind::Action,
            custom_kind: None,
            handler: "h".into(),
            block_filter: None,
            transaction_filter: None,
            action_filter: Some(vec![ActionFilter {
                action_type: "Transfer".into(),
                action: None,
            }]),
        };
        let queries = build_queries(&[ds_with_handler(h)]).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].entity, "actions");
    }

    #[test]
    fn merge_dedupes_and_sorts() {
        let merged = merge_dictionary_and_modulo(vec![5, 1, 3], vec![3, 2]);
        assert_eq!(merged, vec![1, 2, 3, 5]);
    }
}
