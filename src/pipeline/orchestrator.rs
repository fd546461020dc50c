use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::catalog::candidates::{fetch_candidates, CandidateQuery};
use crate::catalog::{export_errors, first_content_text, CatalogError, CatalogGateway, CatalogRecord};
use crate::config::DEFAULT_MAX_VISION_WORKERS;
use crate::llm::{ChatMessage, ChatProvider, LlmError, ProviderKind};
use crate::pipeline::answer::{parse_plan, ModePlan};
use crate::pipeline::messages::build_messages;
use crate::pipeline::prompts::{PromptLibrary, PromptVariant};
use crate::pipeline::runlog::{append_mutation_result, RunLogError, RunLogRecord, RunLogWriter};
use crate::pipeline::vision::prepare_vision_payloads;
use crate::pipeline::OperationMode;

pub const DEFAULT_SAMPLE_LIMIT: usize = 200;
pub const EXPORT_FORMAT: &str = "jpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub query: CandidateQuery,
    pub limit: usize,
    pub text_only: bool,
    pub dry_run: bool,
    pub prompt_variant: PromptVariant,
    pub prompt_override: Option<PathBuf>,
    pub target_dir: Option<PathBuf>,
    pub max_workers: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            query: CandidateQuery::default(),
            limit: DEFAULT_SAMPLE_LIMIT,
            text_only: false,
            dry_run: false,
            prompt_variant: PromptVariant::Basic,
            prompt_override: None,
            target_dir: None,
            max_workers: DEFAULT_MAX_VISION_WORKERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModeStatus {
    Skipped { reason: String },
    NoCandidates,
    PromptUnavailable { error: String },
    NoImagesOnDisk { errors: Vec<String> },
    AnswerRejected { error: String },
    DryRun { plan: Value },
    NothingToApply,
    Applied { results: Vec<Value> },
    MutationFailed { capability: String, error: String },
    Failed { error: String },
}

impl ModeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::NoCandidates => "no_candidates",
            Self::PromptUnavailable { .. } => "prompt_unavailable",
            Self::NoImagesOnDisk { .. } => "no_images_on_disk",
            Self::AnswerRejected { .. } => "answer_rejected",
            Self::DryRun { .. } => "dry_run",
            Self::NothingToApply => "nothing_to_apply",
            Self::Applied { .. } => "applied",
            Self::MutationFailed { .. } => "mutation_failed",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeReport {
    pub mode: OperationMode,
    pub candidates: usize,
    pub sampled: usize,
    pub vision_errors: Vec<String>,
    pub run_log: Option<PathBuf>,
    #[serde(flatten)]
    pub status: ModeStatus,
}

impl ModeReport {
    fn new(mode: OperationMode, status: ModeStatus) -> Self {
        Self {
            mode,
            candidates: 0,
            sampled: 0,
            vision_errors: Vec::new(),
            run_log: None,
            status,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("[{mode}] catalog call failed: {source}")]
    Catalog {
        mode: &'static str,
        #[source]
        source: CatalogError,
    },
    #[error("[{mode}] model call failed: {source}")]
    Llm {
        mode: &'static str,
        #[source]
        source: LlmError,
    },
    #[error("[{mode}] plan could not be serialized: {source}")]
    Plan {
        mode: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("[{mode}] run log could not be written: {source}")]
    RunLog {
        mode: &'static str,
        #[source]
        source: RunLogError,
    },
}

struct MutationFailure {
    capability: &'static str,
    error: CatalogError,
    completed: Vec<Value>,
}

pub struct BatchOrchestrator<'a> {
    gateway: &'a mut dyn CatalogGateway,
    provider: &'a dyn ChatProvider,
    provider_kind: ProviderKind,
    prompts: PromptLibrary,
    run_log: RunLogWriter,
    progress: Option<&'a (dyn Fn(usize, usize, &str) + Sync)>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        gateway: &'a mut dyn CatalogGateway,
        provider: &'a dyn ChatProvider,
        provider_kind: ProviderKind,
        prompts: PromptLibrary,
        run_log: RunLogWriter,
    ) -> Self {
        Self {
            gateway,
            provider,
            provider_kind,
            prompts,
            run_log,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a (dyn Fn(usize, usize, &str) + Sync)) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs one mode, or every stage of `Full` in order. A failing stage of
    /// `Full` is reported and the next stage still runs.
    pub fn run(
        &mut self,
        mode: OperationMode,
        options: &BatchOptions,
    ) -> Result<Vec<ModeReport>, OrchestratorError> {
        if !mode.is_composite() {
            return self.run_mode(mode, options).map(|report| vec![report]);
        }

        info!(mode = mode.as_str(), "running full pipeline");
        let mut reports = Vec::with_capacity(OperationMode::FULL_PIPELINE_ORDER.len());
        for stage in OperationMode::FULL_PIPELINE_ORDER {
            match self.run_mode(stage, options) {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(mode = stage.as_str(), error = %err, "stage aborted");
                    reports.push(ModeReport::new(
                        stage,
                        ModeStatus::Failed {
                            error: err.to_string(),
                        },
                    ));
                }
            }
        }
        Ok(reports)
    }

    fn run_mode(
        &mut self,
        mode: OperationMode,
        options: &BatchOptions,
    ) -> Result<ModeReport, OrchestratorError> {
        let tag = mode.as_str();

        let target_dir = match (mode, options.target_dir.as_ref()) {
            (OperationMode::Export, None) => {
                warn!(mode = tag, "export needs a target directory; skipping");
                return Ok(ModeReport::new(
                    mode,
                    ModeStatus::Skipped {
                        reason: String::from("export requires a target directory"),
                    },
                ));
            }
            (_, dir) => dir,
        };

        let records = fetch_candidates(&mut *self.gateway, &options.query)
            .map_err(|source| OrchestratorError::Catalog { mode: tag, source })?;
        info!(mode = tag, candidates = records.len(), "candidates fetched");
        let mut report = ModeReport::new(mode, ModeStatus::NoCandidates);
        report.candidates = records.len();
        if records.is_empty() {
            return Ok(report);
        }

        let sample: Vec<CatalogRecord> = records.into_iter().take(options.limit).collect();
        report.sampled = sample.len();

        let prompt = match self.prompts.load(
            mode,
            options.prompt_variant,
            options.prompt_override.as_deref(),
        ) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(mode = tag, error = %err, "prompt unavailable; model not called");
                report.status = ModeStatus::PromptUnavailable {
                    error: err.to_string(),
                };
                return Ok(report);
            }
        };

        let attach_images = !options.text_only;
        let (messages, attached): (Vec<ChatMessage>, usize) = {
            let batch =
                prepare_vision_payloads(&sample, attach_images, options.max_workers, self.progress);
            report.vision_errors = batch.errors.clone();
            if attach_images && batch.payloads.is_empty() {
                error!(
                    mode = tag,
                    errors = batch.errors.len(),
                    "no images found on disk; check that the drive is mounted and the catalog is current"
                );
                report.status = ModeStatus::NoImagesOnDisk {
                    errors: batch.errors,
                };
                return Ok(report);
            }
            if !batch.errors.is_empty() {
                warn!(mode = tag, errors = ?batch.errors, "some images could not be prepared");
            }
            (
                build_messages(self.provider_kind, &prompt.body, &sample, &batch.payloads),
                batch.payloads.len(),
            )
        };

        info!(mode = tag, model = self.provider.model(), messages = messages.len(), "calling model");
        let reply = self
            .provider
            .chat(&messages)
            .map_err(|source| OrchestratorError::Llm { mode: tag, source })?;

        let mut record = RunLogRecord::new(mode, options.query.source.as_str(), sample, reply.content.as_str())
            .with_extra("llm", reply.meta.clone())
            .with_extra(
                "vision",
                json!({
                    "attached": attached,
                    "errors": report.vision_errors,
                    "mode": if attach_images { "images" } else { "text" },
                }),
            )
            .with_extra(
                "prompt",
                json!({
                    "variant": options.prompt_variant.as_str(),
                    "sha256": prompt.sha256(),
                    "source": prompt.source.display().to_string(),
                }),
            );
        if let Some(dir) = target_dir {
            record = record.with_extra("target_dir", json!(dir.display().to_string()));
        }
        let log_path = self
            .run_log
            .write(&record)
            .map_err(|source| OrchestratorError::RunLog { mode: tag, source })?;
        info!(mode = tag, log = %log_path.display(), "run log written");
        report.run_log = Some(log_path.clone());

        let plan = match parse_plan(mode, &reply.content) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(mode = tag, error = %err, answer = %reply.content, "model answer rejected");
                report.status = ModeStatus::AnswerRejected {
                    error: err.to_string(),
                };
                return Ok(report);
            }
        };

        if options.dry_run {
            info!(mode = tag, "dry run; no catalog changes made");
            let plan = plan
                .to_value()
                .map_err(|source| OrchestratorError::Plan { mode: tag, source })?;
            report.status = ModeStatus::DryRun { plan };
            return Ok(report);
        }
        if plan.is_empty() {
            info!(mode = tag, "model proposed no changes");
            report.status = ModeStatus::NothingToApply;
            return Ok(report);
        }

        let (status, logged) = match self.apply(&plan, target_dir) {
            Ok(results) => {
                let logged = Value::Array(results.clone());
                (ModeStatus::Applied { results }, logged)
            }
            Err(failure) => {
                error!(
                    mode = tag,
                    capability = failure.capability,
                    error = %failure.error,
                    "catalog mutation failed"
                );
                let logged = json!({
                    "capability": failure.capability,
                    "error": failure.error.to_string(),
                    "completed": failure.completed,
                });
                (
                    ModeStatus::MutationFailed {
                        capability: failure.capability.to_string(),
                        error: failure.error.to_string(),
                    },
                    logged,
                )
            }
        };
        match append_mutation_result(&log_path, &logged) {
            Ok(written) if written != log_path => {
                warn!(mode = tag, file = %written.display(), "mutation result saved beside run log");
            }
            Ok(_) => {}
            Err(err) => warn!(mode = tag, error = %err, "mutation result not logged"),
        }
        report.status = status;
        Ok(report)
    }

    fn apply(
        &mut self,
        plan: &ModePlan,
        target_dir: Option<&PathBuf>,
    ) -> Result<Vec<Value>, MutationFailure> {
        let mut results = Vec::new();
        match plan {
            ModePlan::Rating(rating) => {
                self.invoke(
                    "apply_batch_edits",
                    json!({ "edits": rating.batch_edits() }),
                    &mut results,
                )?;
            }
            ModePlan::Tagging(tagging) => {
                for entry in tagging.tags.iter().filter(|entry| entry.is_applicable()) {
                    self.invoke(
                        "tag_batch",
                        json!({"tag": entry.tag, "ids": entry.ids}),
                        &mut results,
                    )?;
                    info!(mode = "tagging", tag = %entry.tag, images = entry.ids.len(), "tag applied");
                }
            }
            ModePlan::Export(export) => {
                let target = target_dir
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_default();
                let arguments = json!({
                    "target_dir": target,
                    "ids": export.ids,
                    "format": EXPORT_FORMAT,
                    "overwrite": false,
                });
                self.invoke("export_collection", arguments, &mut results)?;
                if let Some(result) = results.last().and_then(|entry| entry.get("result")) {
                    for failure in export_errors(result) {
                        warn!(mode = "export", failure = %failure, "image not exported");
                    }
                }
            }
            ModePlan::Treatment(treatment) => {
                let metadata = treatment.metadata_edits();
                if !metadata.is_empty() {
                    self.invoke("apply_batch_edits", json!({ "edits": metadata }), &mut results)?;
                }
                let styles = treatment.style_edits();
                if !styles.is_empty() {
                    self.invoke("apply_generated_styles", json!({ "edits": styles }), &mut results)?;
                }
            }
        }
        Ok(results)
    }

    fn invoke(
        &mut self,
        capability: &'static str,
        arguments: Value,
        results: &mut Vec<Value>,
    ) -> Result<(), MutationFailure> {
        match self.gateway.invoke_capability(capability, arguments) {
            Ok(result) => {
                if let Some(summary) = first_content_text(&result) {
                    info!(capability, summary, "catalog updated");
                }
                results.push(json!({"capability": capability, "result": result}));
                Ok(())
            }
            Err(error) => Err(MutationFailure {
                capability,
                error,
                completed: std::mem::take(results),
            }),
        }
    }
}
