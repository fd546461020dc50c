use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::pipeline::OperationMode;

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("model answer is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("model answer for {mode} does not match the expected shape: {message}")]
    Shape { mode: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEdit {
    pub id: i64,
    pub rating: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingPlan {
    #[serde(default)]
    pub edits: Vec<RatingEdit>,
}

impl RatingPlan {
    /// Edits shaped for `apply_batch_edits`, extra fields carried through.
    pub fn batch_edits(&self) -> Vec<Value> {
        self.edits
            .iter()
            .map(|edit| {
                let mut entry = edit.extra.clone();
                entry.insert(String::from("id"), Value::from(edit.id));
                entry.insert(String::from("rating"), Value::from(edit.rating));
                Value::Object(entry)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagAssignment {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub ids: Vec<i64>,
}

impl TagAssignment {
    pub fn is_applicable(&self) -> bool {
        !self.tag.trim().is_empty() && !self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaggingPlan {
    #[serde(default)]
    pub tags: Vec<TagAssignment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportPlan {
    #[serde(default, alias = "ids_to_export")]
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentEdit {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i64>,
    #[serde(
        default,
        alias = "color_labels",
        skip_serializing_if = "Option::is_none"
    )]
    pub colorlabels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreatmentPlan {
    #[serde(default)]
    pub edits: Vec<TreatmentEdit>,
}

impl TreatmentPlan {
    /// Rating and color-label changes, shaped for `apply_batch_edits`.
    pub fn metadata_edits(&self) -> Vec<Value> {
        self.edits
            .iter()
            .filter(|edit| edit.rating.is_some() || edit.colorlabels.is_some())
            .map(|edit| {
                let mut entry = Map::new();
                entry.insert(String::from("id"), json!(edit.id));
                if let Some(rating) = edit.rating {
                    entry.insert(String::from("rating"), json!(rating));
                }
                if let Some(labels) = &edit.colorlabels {
                    entry.insert(String::from("colorlabels"), json!(labels));
                }
                Value::Object(entry)
            })
            .collect()
    }

    /// Style edits, shaped for `apply_generated_styles`.
    pub fn style_edits(&self) -> Vec<Value> {
        self.edits
            .iter()
            .filter_map(|edit| {
                let style = edit.style.as_ref().filter(|style| !style.is_null())?;
                Some(json!({"id": edit.id, "style": style}))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModePlan {
    Rating(RatingPlan),
    Tagging(TaggingPlan),
    Export(ExportPlan),
    Treatment(TreatmentPlan),
}

impl ModePlan {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Rating(plan) => plan.edits.is_empty(),
            Self::Tagging(plan) => !plan.tags.iter().any(TagAssignment::is_applicable),
            Self::Export(plan) => plan.ids.is_empty(),
            Self::Treatment(plan) => {
                plan.metadata_edits().is_empty() && plan.style_edits().is_empty()
            }
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Rating(plan) => serde_json::to_value(plan),
            Self::Tagging(plan) => serde_json::to_value(plan),
            Self::Export(plan) => serde_json::to_value(plan),
            Self::Treatment(plan) => serde_json::to_value(plan),
        }
    }
}

/// Removes a surrounding ``` fence (with or without a language tag).
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        // single-line fence: the tag runs up to the first non-letter
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub fn parse_answer(raw: &str) -> Result<Value, AnswerError> {
    serde_json::from_str(strip_code_fence(raw)).map_err(AnswerError::Json)
}

pub fn parse_plan(mode: OperationMode, raw: &str) -> Result<ModePlan, AnswerError> {
    let value = parse_answer(raw)?;
    if !value.is_object() {
        return Err(shape_error(mode, format!("expected an object, got {value}")));
    }
    let plan = match mode {
        OperationMode::Rating => typed(mode, value).map(ModePlan::Rating)?,
        OperationMode::Tagging => typed(mode, value).map(ModePlan::Tagging)?,
        OperationMode::Export => typed(mode, value).map(ModePlan::Export)?,
        OperationMode::Treatment => typed(mode, value).map(ModePlan::Treatment)?,
        OperationMode::Full => {
            return Err(shape_error(
                mode,
                String::from("composite mode has no answer of its own"),
            ))
        }
    };
    Ok(plan)
}

fn typed<T: for<'de> Deserialize<'de>>(mode: OperationMode, value: Value) -> Result<T, AnswerError> {
    serde_json::from_value(value).map_err(|error| shape_error(mode, error.to_string()))
}

fn shape_error(mode: OperationMode, message: String) -> AnswerError {
    AnswerError::Shape {
        mode: mode.as_str(),
        message,
    }
}
