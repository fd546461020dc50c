use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::CatalogRecord;
use crate::pipeline::OperationMode;

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("failed to create run-log parent directory '{path}': {message}")]
    CreateParent { path: String, message: String },
    #[error("failed to serialize run log JSON: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write run log '{path}': {message}")]
    WriteFile { path: String, message: String },
}

pub fn write_pretty_json_with_newline<T>(path: &Path, value: &T) -> Result<(), RunLogError>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| RunLogError::CreateParent {
            path: parent.display().to_string(),
            message: error.to_string(),
        })?;
    }

    let mut bytes = serde_json::to_vec_pretty(value).map_err(RunLogError::Serialize)?;
    bytes.push(b'\n');
    fs::write(path, bytes).map_err(|error| RunLogError::WriteFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogRecord {
    pub run_id: String,
    pub timestamp: String,
    pub mode: OperationMode,
    pub source: String,
    pub images_sample: Vec<CatalogRecord>,
    pub model_answer: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl RunLogRecord {
    pub fn new(
        mode: OperationMode,
        source: impl Into<String>,
        images_sample: Vec<CatalogRecord>,
        model_answer: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            timestamp: Local::now().to_rfc3339(),
            mode,
            source: source.into(),
            images_sample,
            model_answer: model_answer.into(),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

pub fn run_log_file_name(mode: OperationMode, at: DateTime<Local>) -> String {
    format!("batch-{}-{}.json", mode.as_str(), at.format("%Y%m%d-%H%M%S-%3f"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogWriter {
    dir: PathBuf,
}

impl RunLogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn write(&self, record: &RunLogRecord) -> Result<PathBuf, RunLogError> {
        let path = self.dir.join(run_log_file_name(record.mode, Local::now()));
        write_pretty_json_with_newline(&path, record)?;
        Ok(path)
    }
}

/// Stores `result` under `extra.mutation_result` of an existing log. When the
/// log can no longer be read as an object, the result goes to a sibling
/// `<stem>-mutation-result.json` instead. Returns the file written.
pub fn append_mutation_result(log_path: &Path, result: &Value) -> Result<PathBuf, RunLogError> {
    let existing = fs::read_to_string(log_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());

    if let Some(Value::Object(mut root)) = existing {
        let extra = root
            .entry("extra")
            .or_insert_with(|| Value::Object(Map::new()));
        if !extra.is_object() {
            *extra = Value::Object(Map::new());
        }
        if let Value::Object(extra) = extra {
            extra.insert(String::from("mutation_result"), result.clone());
        }
        write_pretty_json_with_newline(log_path, &root)?;
        return Ok(log_path.to_path_buf());
    }

    let stem = log_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("run"));
    let fallback = log_path.with_file_name(format!("{stem}-mutation-result.json"));
    write_pretty_json_with_newline(&fallback, result)?;
    Ok(fallback)
}
