use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::candidates::{fetch_candidates, list_available_collections, CandidateQuery};
use super::{capability_names, CatalogError, CatalogGateway, CatalogRecord, ClientInfo};

pub const DEFAULT_PROBE_SAMPLE: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogProbeReport {
    pub dependencies: BTreeMap<String, Option<String>>,
    pub missing_dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
    pub tools: Vec<String>,
    pub collections: Vec<Value>,
    pub sample_images: Vec<CatalogRecord>,
    pub image_total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CatalogProbeReport {
    pub fn from_dependencies(dependencies: BTreeMap<String, Option<String>>) -> Self {
        let missing_dependencies = dependencies
            .iter()
            .filter(|(_, location)| location.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        Self {
            dependencies,
            missing_dependencies,
            ..Self::default()
        }
    }
}

/// Quick look at what the catalog offers. Failures land in `error` so the
/// caller always gets a report back.
pub fn probe_catalog(
    gateway: &mut dyn CatalogGateway,
    mut report: CatalogProbeReport,
    protocol_version: &str,
    client_info: &ClientInfo,
    query: &CandidateQuery,
    sample_limit: usize,
) -> CatalogProbeReport {
    if let Err(error) = fill_probe(gateway, &mut report, protocol_version, client_info, query, sample_limit) {
        warn!(%error, "catalog probe failed");
        report.error = Some(error.to_string());
    }
    report
}

fn fill_probe(
    gateway: &mut dyn CatalogGateway,
    report: &mut CatalogProbeReport,
    protocol_version: &str,
    client_info: &ClientInfo,
    query: &CandidateQuery,
    sample_limit: usize,
) -> Result<(), CatalogError> {
    let init = gateway.initialize(protocol_version, json!({}), client_info)?;
    report.server_info = Some(init.get("serverInfo").cloned().unwrap_or_else(|| json!({})));

    let listing = gateway.list_capabilities()?;
    report.tools = capability_names(&listing);

    let mut collections = list_available_collections(gateway)?;
    collections.sort_by(|a, b| collection_path(a).cmp(collection_path(b)));
    report.collections = collections;

    let images = fetch_candidates(gateway, query)?;
    let sample_len = sample_limit.max(1).min(images.len());
    report.image_total = images.len();
    report.sample_images = images.into_iter().take(sample_len).collect();

    info!(
        tools = report.tools.len(),
        collections = report.collections.len(),
        images = report.image_total,
        "catalog probe complete"
    );
    Ok(())
}

fn collection_path(collection: &Value) -> &str {
    collection.get("path").and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::transport::TransportError;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct ScriptedGateway {
        images: Vec<Value>,
        fail_listing: bool,
    }

    impl CatalogGateway for ScriptedGateway {
        fn initialize(&mut self, _: &str, _: Value, _: &ClientInfo) -> Result<Value, CatalogError> {
            Ok(json!({"serverInfo": {"name": "darktable-mcp", "version": "0.3"}}))
        }

        fn list_capabilities(&mut self) -> Result<Value, CatalogError> {
            if self.fail_listing {
                return Err(TransportError::Timeout {
                    timeout: Duration::from_secs(1),
                    diagnostics: String::from("lua: stuck"),
                }
                .into());
            }
            Ok(json!({"tools": [{"name": "list_collection"}, {"name": "apply_batch_edits"}]}))
        }

        fn invoke_capability(&mut self, name: &str, _: Value) -> Result<Value, CatalogError> {
            match name {
                "list_available_collections" => Ok(json!({"content": [{"json": [
                    {"path": "zeta", "count": 1},
                    {"path": "alpha", "count": 3}
                ]}]})),
                _ => Ok(json!({"content": [{"json": self.images.clone()}]})),
            }
        }
    }

    fn client_info() -> ClientInfo {
        ClientInfo {
            name: String::from("shutter-host"),
            version: String::from("test"),
        }
    }

    #[test]
    fn probe_collects_server_state_and_sample() {
        let mut gateway = ScriptedGateway {
            images: (1..=5).map(|id| json!({"id": id})).collect(),
            fail_listing: false,
        };
        let deps = BTreeMap::from([
            (String::from("darktable-cli"), None),
            (String::from("lua"), Some(String::from("/usr/bin/lua"))),
        ]);

        let report = probe_catalog(
            &mut gateway,
            CatalogProbeReport::from_dependencies(deps),
            "2024-11-05",
            &client_info(),
            &CandidateQuery::default(),
            3,
        );

        assert_eq!(report.missing_dependencies, vec!["darktable-cli"]);
        assert_eq!(report.server_info, Some(json!({"name": "darktable-mcp", "version": "0.3"})));
        assert_eq!(report.tools, vec!["list_collection", "apply_batch_edits"]);
        assert_eq!(report.collections[0]["path"], json!("alpha"));
        assert_eq!(report.sample_images.len(), 3);
        assert_eq!(report.image_total, 5);
        assert_eq!(report.error, None);
    }

    #[test]
    fn probe_reports_errors_instead_of_raising() {
        let mut gateway = ScriptedGateway {
            images: Vec::new(),
            fail_listing: true,
        };

        let report = probe_catalog(
            &mut gateway,
            CatalogProbeReport::default(),
            "2024-11-05",
            &client_info(),
            &CandidateQuery::default(),
            DEFAULT_PROBE_SAMPLE,
        );

        let error = report.error.expect("error should be recorded");
        assert!(error.contains("lua: stuck"));
        assert!(report.server_info.is_some());
        assert!(report.tools.is_empty());
    }

    #[test]
    fn probe_with_empty_catalog_has_empty_sample() {
        let mut gateway = ScriptedGateway {
            images: Vec::new(),
            fail_listing: false,
        };
        let report = probe_catalog(
            &mut gateway,
            CatalogProbeReport::default(),
            "2024-11-05",
            &client_info(),
            &CandidateQuery::default(),
            0,
        );
        assert!(report.sample_images.is_empty());
        assert_eq!(report.image_total, 0);
    }
}
