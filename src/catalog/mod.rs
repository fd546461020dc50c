pub mod candidates;
pub mod client;
pub mod probe;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::worker::transport::TransportError;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_LIST_CAPABILITIES: &str = "tools/list";
pub const METHOD_INVOKE_CAPABILITY: &str = "tools/call";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("capability '{capability}' returned no content")]
    MissingContent { capability: String },
    #[error("capability '{capability}' returned an unexpected shape: {detail}")]
    UnexpectedShape { capability: String, detail: String },
}

/// One image as the catalog worker reports it. The object is kept whole so
/// it round-trips into logs and prompts untouched; accessors cover the keys
/// the host relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogRecord(Map<String, Value>);

impl CatalogRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn id(&self) -> Option<i64> {
        self.0.get("id").and_then(Value::as_i64)
    }

    pub fn path(&self) -> &str {
        self.str_field("path")
    }

    pub fn filename(&self) -> &str {
        self.str_field("filename")
    }

    pub fn rating(&self) -> Option<i64> {
        self.0.get("rating").and_then(Value::as_i64)
    }

    pub fn color_labels(&self) -> Vec<String> {
        self.0
            .get("colorlabels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|label| match label {
                        Value::String(text) => Some(text.clone()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_raw(&self) -> Option<bool> {
        self.0.get("is_raw").and_then(Value::as_bool)
    }

    /// `<path>/<filename>`, the file the catalog entry points at.
    pub fn file_path(&self) -> PathBuf {
        Path::new(self.path()).join(self.filename())
    }

    fn str_field(&self, key: &str) -> &str {
        self.0.get(key).and_then(Value::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// The three verbs the catalog worker understands. Results are handed back
/// uninterpreted.
pub trait CatalogGateway {
    fn initialize(
        &mut self,
        protocol_version: &str,
        capabilities: Value,
        client_info: &ClientInfo,
    ) -> Result<Value, CatalogError>;

    fn list_capabilities(&mut self) -> Result<Value, CatalogError>;

    fn invoke_capability(&mut self, name: &str, arguments: Value) -> Result<Value, CatalogError>;
}

pub fn first_content_json(result: &Value) -> Option<&Value> {
    result.get("content")?.as_array()?.first()?.get("json")
}

pub fn first_content_text(result: &Value) -> Option<&str> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(Value::as_str))
}

/// Per-item failures reported by an export call, if any.
pub fn export_errors(result: &Value) -> Vec<Value> {
    result
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|part| part.get("json").and_then(Value::as_object))
        .filter_map(|json| json.get("errors").and_then(Value::as_array))
        .find(|errors| !errors.is_empty())
        .cloned()
        .unwrap_or_default()
}

pub fn capability_names(listing: &Value) -> Vec<String> {
    listing
        .get("tools")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|tool| tool.get("name").and_then(Value::as_str))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> CatalogRecord {
        CatalogRecord::from_value(value).expect("test record should be an object")
    }

    #[test]
    fn record_accessors_read_known_keys() {
        let rec = record(json!({
            "id": 42,
            "path": "/photos/2024",
            "filename": "IMG_0001.CR3",
            "rating": 3,
            "colorlabels": ["red", "blue"],
            "is_raw": true,
            "custom": {"x": 1}
        }));

        assert_eq!(rec.id(), Some(42));
        assert_eq!(rec.rating(), Some(3));
        assert_eq!(rec.color_labels(), vec!["red", "blue"]);
        assert_eq!(rec.is_raw(), Some(true));
        assert_eq!(rec.file_path(), PathBuf::from("/photos/2024/IMG_0001.CR3"));
        assert_eq!(
            serde_json::to_value(&rec).expect("record should serialize")["custom"],
            json!({"x": 1})
        );
    }

    #[test]
    fn record_tolerates_missing_fields() {
        let rec = record(json!({"id": 1}));
        assert_eq!(rec.path(), "");
        assert_eq!(rec.rating(), None);
        assert!(rec.color_labels().is_empty());
        assert!(CatalogRecord::from_value(json!([1, 2])).is_none());
    }

    #[test]
    fn content_helpers_pick_first_entries() {
        let result = json!({
            "content": [
                {"type": "json", "json": [{"id": 1}]},
                {"type": "text", "text": "applied 1 edit"}
            ]
        });

        assert_eq!(first_content_json(&result), Some(&json!([{"id": 1}])));
        assert_eq!(first_content_text(&result), Some("applied 1 edit"));
        assert_eq!(first_content_json(&json!({"content": []})), None);
    }

    #[test]
    fn export_errors_returns_first_non_empty_list() {
        let result = json!({
            "content": [
                {"type": "text", "text": "export done"},
                {"type": "json", "json": {"errors": []}},
                {"type": "json", "json": {"errors": [{"id": 3, "reason": "missing"}]}}
            ]
        });

        assert_eq!(export_errors(&result), vec![json!({"id": 3, "reason": "missing"})]);
        assert!(export_errors(&json!({})).is_empty());
    }

    #[test]
    fn capability_names_skip_unnamed_tools() {
        let listing = json!({"tools": [{"name": "list_collection"}, {"description": "x"}, {"name": ""}]});
        assert_eq!(capability_names(&listing), vec!["list_collection"]);
    }
}
