/// Dynamic Datasource Manager (spec §4.9): lets handlers register new
/// datasources mid-indexing, materialized from templates, and keeps a
/// creation log keyed by height so rollbacks can remove them cleanly.
///
/// Modeled after the teacher's height-keyed persistence idiom seen in
/// `reorg.rs`'s rollback-to-height logic, but over an in-memory `BTreeMap`
/// rather than a RocksDB column family — the entity store is an external
/// collaborator here (spec §1), not owned by this engine.
use crate::manifest::TemplateManifest;
use crate::metrics;
use crate::model::{Datasource, DatasourceFlavor, Handler};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone)]
pub struct DynamicDatasource {
    pub name: String,
    pub datasource: Datasource,
    pub created_at_height: i64,
}

pub struct DynamicDsManager {
    templates: Vec<TemplateManifest>,
    /// Creation log keyed by the height a dynamic datasource was created at,
    /// so `delete_temp_ds_records` can drop everything from a rewound height
    /// forward.
    created: RwLock<BTreeMap<i64, Vec<DynamicDatasource>>>,
}

impl DynamicDsManager {
    pub fn new(templates: Vec<TemplateManifest>) -> Self {
        Self {
            templates,
            created: RwLock::new(BTreeMap::new()),
        }
    }

    /// `createDynamicDatasource(name, args, atHeight)`.
    ///
    /// `args` is opaque to the engine core — it's threaded through to the
    /// handler runtime's template materialization, which is an external
    /// collaborator (spec §1: "sandboxed execution environment").
    pub async fn create_dynamic_datasource(
        &self,
        template_name: &str,
        handlers: Vec<Handler>,
        at_height: i64,
    ) -> Result<(), String> {
        let template = self
            .templates
            .iter()
            .find(|t| t.name == template_name)
            .ok_or_else(|| format!("no template named {}", template_name))?;

        let ds = Datasource {
            name: Some(template_name.to_string()),
            flavor: DatasourceFlavor::Runtime,
            start_block: at_height,
            handlers,
            processor_key: if template.kind.starts_with("Near/Custom") {
                Some(template.kind.clone())
            } else {
                None
            },
        };

        let entry = DynamicDatasource {
            name: template_name.to_string(),
            datasource: ds,
            created_at_height: at_height,
        };

        self.created
            .write()
            .await
            .entry(at_height)
            .or_insert_with(Vec::new)
            .push(entry);

        metrics::DYNAMIC_DATASOURCES_CREATED.inc();
        info!(template = template_name, at_height, "dynamic datasource created");
        Ok(())
    }

    /// `getDynamicDatasources()` merged with static templates — returns only
    /// the ones created so far, at or below `at_height` when one is given.
    pub async fn get_dynamic_datasources(&self, at_height: Option<i64>) -> Vec<Datasource> {
        self.created
            .read()
            .await
            .iter()
            .filter(|(height, _)| at_height.map_or(true, |h| **height <= h))
            .flat_map(|(_, entries)| entries.iter().map(|e| e.datasource.clone()))
            .collect()
    }

    /// `deleteTempDsRecords(height)`: removes every dynamic datasource
    /// created at or after `height`, used on rollback (spec §3 invariant:
    /// "buffered but unprocessed heights are discarded on ... unfinalized-
    /// chain rollback").
    pub async fn delete_temp_ds_records(&self, height: i64) {
        let mut created = self.created.write().await;
        let removed: Vec<i64> = created.range(height..).map(|(h, _)| *h).collect();
        for h in removed {
            created.remove(&h);
        }
        info!(from_height = height, "dynamic datasource records rolled back");
    }

    pub fn templates(&self) -> &[TemplateManifest] {
        &self.templates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MappingManifest;

    fn template() -> TemplateManifest {
        TemplateManifest {
            name: "TokenTracker".into(),
            kind: "Near/Runtime".into(),
            mapping: MappingManifest {
                file: "mapping.js".into(),
                handlers: vec![],
            },
        }
    }

    #[tokio::test]
    async fn creates_and_lists_dynamic_datasource() {
        let mgr = DynamicDsManager::new(vec![template()]);
        mgr.create_dynamic_datasource("TokenTracker", vec![], 500)
            .await
            .unwrap();
        let ds = mgr.get_dynamic_datasources(None).await;
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].start_block, 500);
    }

    #[tokio::test]
    async fn unknown_template_errors() {
        let mgr = DynamicDsManager::new(vec![template()]);
        assert!(mgr
            .create_dynamic_datasource("Nope", vec![], 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rollback_removes_records_at_or_after_height() {
        let mgr = DynamicDsManager::new(vec![template()]);
        mgr.create_dynamic_datasource("TokenTracker", vec![], 100)
            .await
            .unwrap();
        mgr.create_dynamic_datasource("TokenTracker", vec![], 200)
            .await
            .unwrap();
        mgr.delete_temp_ds_records(150).await;
        let ds = mgr.get_dynamic_datasources(None).await;
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].start_block, 100);
    }

    #[tokio::test]
    async fn honors_at_height_filter() {
        let mgr = DynamicDsManager::new(vec![template()]);
        mgr.create_dynamic_datasource("TokenTracker", vec![], 100)
            .await
            .unwrap();
        mgr.create_dynamic_datasource("TokenTracker", vec![], 300)
            .await
            .unwrap();
        let ds = mgr.get_dynamic_datasources(Some(200)).await;
        assert_eq!(ds.len(), 1);
    }
}
