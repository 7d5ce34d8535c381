/// Project manifest input shapes (spec §6).
///
/// Manifest parsing and versioning is an explicit out-of-scope collaborator
/// (spec §1); this module defines only the `serde`-deserializable shapes the
/// engine consumes once a manifest YAML document has already been parsed and
/// the `specVersion` gate applied, plus that one gate (`>= 1.0.0` is the only
/// manifest-level validation spec asks the engine itself to perform).
use crate::errors::{EngineError, EngineResult};
use crate::model::{
    ActionFilter, BlockFilter, Datasource, DatasourceFlavor, FilterArray, Handler, HandlerKind,
    TransactionFilter,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectManifest {
    #[serde(rename = "specVersion")]
    pub spec_version: String,
    pub name: String,
    pub version: String,
    pub schema: SchemaRef,
    pub network: NetworkManifest,
    #[serde(rename = "dataSources")]
    pub data_sources: Vec<DataSourceManifest>,
    #[serde(default)]
    pub templates: Vec<TemplateManifest>,
    pub runner: RunnerManifest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaRef {
    pub file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkManifest {
    #[serde(rename = "chainId")]
    pub chain_id: Option<String>,
    #[serde(rename = "genesisHash")]
    pub genesis_hash: Option<String>,
    #[serde(deserialize_with = "one_or_many_strings")]
    pub endpoint: Vec<String>,
    pub dictionary: Option<String>,
    #[serde(rename = "bypassBlocks", default)]
    pub bypass_blocks: Vec<i64>,
}

fn one_or_many_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceManifest {
    pub kind: String,
    #[serde(rename = "startBlock")]
    pub start_block: i64,
    pub mapping: MappingManifest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingManifest {
    pub file: String,
    pub handlers: Vec<HandlerManifest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandlerManifest {
    pub kind: String,
    pub handler: String,
    #[serde(default)]
    pub filter: Option<HandlerFilterManifest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HandlerFilterManifest {
    Block(FilterArray<BlockFilter>),
    Transaction(FilterArray<TransactionFilter>),
    Action(FilterArray<ActionFilter>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateManifest {
    pub name: String,
    pub kind: String,
    pub mapping: MappingManifest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerManifest {
    pub node: RunnerNodeManifest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerNodeManifest {
    pub name: String,
    pub version: String,
}

/// Minimum accepted `specVersion` (spec §6: "SpecVersions <1.0.0 are rejected").
pub const MIN_SPEC_VERSION: &str = "1.0.0";

pub fn validate_spec_version(manifest: &ProjectManifest) -> EngineResult<()> {
    if compare_semver(&manifest.spec_version, MIN_SPEC_VERSION) < 0 {
        return Err(EngineError::config(format!(
            "manifest specVersion {} is below the minimum supported {}",
            manifest.spec_version, MIN_SPEC_VERSION
        )));
    }
    Ok(())
}

/// Minimal `major.minor.patch` comparison; manifests only ever need to be
/// compared against literal version strings, not arbitrary semver ranges.
fn compare_semver(a: &str, b: &str) -> i32 {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (pa, pb) = (parse(a), parse(b));
    for i in 0..pa.len().max(pb.len()) {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        if x != y {
            return if x < y { -1 } else { 1 };
        }
    }
    0
}

/// Converts the manifest's declarative datasource/handler shapes into the
/// engine's runtime `Datasource`/`Handler` model (spec §3). Manifest parsing
/// itself stays out of scope (spec §1); this is the one seam where the
/// already-parsed manifest meets the engine core.
pub fn into_datasources(manifest: &ProjectManifest) -> Vec<Datasource> {
    manifest.data_sources.iter().map(convert_datasource).collect()
}

fn convert_datasource(ds: &DataSourceManifest) -> Datasource {
    let flavor = if ds.kind == "Near/Runtime" {
        DatasourceFlavor::Runtime
    } else {
        DatasourceFlavor::Custom
    };
    let processor_key = match flavor {
        DatasourceFlavor::Custom => Some(ds.kind.clone()),
        DatasourceFlavor::Runtime => None,
    };
    Datasource {
        name: None,
        flavor,
        start_block: ds.start_block,
        handlers: ds.mapping.handlers.iter().map(|h| convert_handler(h, flavor)).collect(),
        processor_key,
    }
}

fn convert_handler(h: &HandlerManifest, flavor: DatasourceFlavor) -> Handler {
    if flavor == DatasourceFlavor::Custom {
        return Handler {
            kind: HandlerKind::Custom,
            custom_kind: Some(h.kind.clone()),
            handler: h.handler.clone(),
            block_filter: None,
            transaction_filter: None,
            action_filter: None,
        };
    }

    match h.kind.as_str() {
        "Near/BlockHandler" => Handler {
            kind: HandlerKind::Block,
            custom_kind: None,
            handler: h.handler.clone(),
            block_filter: h.filter.as_ref().and_then(|f| match f {
                HandlerFilterManifest::Block(fa) => Some(fa.clone().as_slice_owned()),
                _ => None,
            }),
            transaction_filter: None,
            action_filter: None,
        },
        "Near/TransactionHandler" => Handler {
            kind: HandlerKind::Transaction,
            custom_kind: None,
            handler: h.handler.clone(),
            block_filter: None,
            transaction_filter: h.filter.as_ref().and_then(|f| match f {
                HandlerFilterManifest::Transaction(fa) => Some(fa.clone().as_slice_owned()),
                _ => None,
            }),
            action_filter: None,
        },
        "Near/ActionHandler" => Handler {
            kind: HandlerKind::Action,
            custom_kind: None,
            handler: h.handler.clone(),
            block_filter: None,
            transaction_filter: None,
            action_filter: h.filter.as_ref().and_then(|f| match f {
                HandlerFilterManifest::Action(fa) => Some(fa.clone().as_slice_owned()),
                _ => None,
            }),
        },
        other => Handler {
            kind: HandlerKind::Custom,
            custom_kind: Some(other.to_string()),
            handler: h.handler.clone(),
            block_filter: None,
            transaction_filter: None,
            action_filter: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_old_spec_version() {
        let manifest = ProjectManifest {
            spec_version: "0.0.1".into(),
            name: "n".into(),
            version: "1".into(),
            schema: SchemaRef { file: "schema.graphql".into() },
            network: NetworkManifest {
                chain_id: None,
                genesis_hash: None,
                endpoint: vec!["http://localhost:3030".into()],
                dictionary: None,
                bypass_blocks: vec![],
            },
            data_sources: vec![],
            templates: vec![],
            runner: RunnerManifest {
                node: RunnerNodeManifest { name: "near".into(), version: "1.0.0".into() },
            },
        };
        assert!(validate_spec_version(&manifest).is_err());
    }

    #[test]
    fn accepts_current_spec_version() {
        assert_eq!(compare_semver("1.0.0", "1.0.0"), 0);
        assert_eq!(compare_semver("1.2.0", "1.0.0"), 1);
    }
}
