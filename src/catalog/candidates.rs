use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use super::{first_content_json, CatalogError, CatalogGateway, CatalogRecord};

pub const DEFAULT_MIN_RATING: i64 = -2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    All,
    Collection(String),
    PathContains(String),
    Tag(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateSourceError {
    #[error("source '{source_kind}' requires {flag}")]
    MissingValue {
        source_kind: &'static str,
        flag: &'static str,
    },
    #[error("unknown source '{0}' (expected all, collection, path or tag)")]
    Unknown(String),
}

impl CandidateSource {
    pub fn parse(kind: &str, value: Option<&str>) -> Result<Self, CandidateSourceError> {
        let value = value.map(str::trim).filter(|value| !value.is_empty());
        let required = |source_kind: &'static str, flag: &'static str| {
            value
                .map(str::to_string)
                .ok_or(CandidateSourceError::MissingValue { source_kind, flag })
        };
        match kind {
            "all" => Ok(Self::All),
            "collection" => Ok(Self::Collection(required("collection", "--collection")?)),
            "path" => Ok(Self::PathContains(required("path", "--path-contains")?)),
            "tag" => Ok(Self::Tag(required("tag", "--tag")?)),
            other => Err(CandidateSourceError::Unknown(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Collection(_) => "collection",
            Self::PathContains(_) => "path",
            Self::Tag(_) => "tag",
        }
    }

    pub fn capability(&self) -> &'static str {
        match self {
            Self::All | Self::Collection(_) => "list_collection",
            Self::PathContains(_) => "list_by_path",
            Self::Tag(_) => "list_by_tag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub source: CandidateSource,
    pub min_rating: i64,
    pub only_raw: bool,
}

impl Default for CandidateQuery {
    fn default() -> Self {
        Self {
            source: CandidateSource::All,
            min_rating: DEFAULT_MIN_RATING,
            only_raw: false,
        }
    }
}

impl CandidateQuery {
    pub fn arguments(&self) -> Value {
        let mut arguments = Map::new();
        arguments.insert(String::from("min_rating"), json!(self.min_rating));
        arguments.insert(String::from("only_raw"), json!(self.only_raw));
        match &self.source {
            CandidateSource::All => {}
            CandidateSource::Collection(path) => {
                arguments.insert(String::from("collection_path"), json!(path));
            }
            CandidateSource::PathContains(fragment) => {
                arguments.insert(String::from("path_contains"), json!(fragment));
            }
            CandidateSource::Tag(tag) => {
                arguments.insert(String::from("tag"), json!(tag));
            }
        }
        Value::Object(arguments)
    }
}

pub fn fetch_candidates(
    gateway: &mut dyn CatalogGateway,
    query: &CandidateQuery,
) -> Result<Vec<CatalogRecord>, CatalogError> {
    let capability = query.source.capability();
    let result = gateway.invoke_capability(capability, query.arguments())?;
    let records = records_from_result(capability, &result)?;
    debug!(capability, source = query.source.as_str(), count = records.len(), "candidates listed");
    Ok(records)
}

pub fn list_available_collections(
    gateway: &mut dyn CatalogGateway,
) -> Result<Vec<Value>, CatalogError> {
    let capability = "list_available_collections";
    let result = gateway.invoke_capability(capability, json!({}))?;
    match first_content_json(&result) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(CatalogError::UnexpectedShape {
            capability: capability.to_string(),
            detail: format!("expected a list, got {}", json_kind(other)),
        }),
        None => Err(CatalogError::MissingContent {
            capability: capability.to_string(),
        }),
    }
}

fn records_from_result(capability: &str, result: &Value) -> Result<Vec<CatalogRecord>, CatalogError> {
    let Some(json) = first_content_json(result) else {
        return Err(CatalogError::MissingContent {
            capability: capability.to_string(),
        });
    };
    let Value::Array(items) = json else {
        return Err(CatalogError::UnexpectedShape {
            capability: capability.to_string(),
            detail: format!("expected a list of records, got {}", json_kind(json)),
        });
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            CatalogRecord::from_value(item.clone()).ok_or_else(|| CatalogError::UnexpectedShape {
                capability: capability.to_string(),
                detail: format!("record {index} is {}", json_kind(item)),
            })
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
