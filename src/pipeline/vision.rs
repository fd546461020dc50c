use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::CatalogRecord;
use crate::pipeline::image_encode::encode_image_bytes;

pub const PROGRESS_LABEL: &str = "Preparing images";

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("file not found: {}", path.display())]
    ResourceNotFound { path: PathBuf },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionPayload<'a> {
    pub source: &'a CatalogRecord,
    pub path: PathBuf,
    pub base64: String,
    pub data_url: String,
    pub mime: String,
    /// False when the original bytes were sent as-is.
    pub transcoded: bool,
}

#[derive(Debug, Default)]
pub struct VisionBatch<'a> {
    pub payloads: Vec<VisionPayload<'a>>,
    pub errors: Vec<String>,
    pub encoded_bytes: usize,
}

impl VisionBatch<'_> {
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

#[derive(Default)]
struct Tally {
    completed: usize,
    encoded_bytes: usize,
}

/// Reads and encodes every record's file on a bounded pool of scoped
/// threads. Output keeps input order; unreadable files become error strings.
/// `progress` receives `(completed, total, label)` from worker threads.
pub fn prepare_vision_payloads<'a>(
    records: &'a [CatalogRecord],
    attach_images: bool,
    max_workers: usize,
    progress: Option<&(dyn Fn(usize, usize, &str) + Sync)>,
) -> VisionBatch<'a> {
    if !attach_images || records.is_empty() {
        return VisionBatch::default();
    }

    let total = records.len();
    let workers = max_workers.clamp(1, total);
    let log_every = if total > 200 { 50 } else { 10 };
    info!(images = total, workers, "preparing vision payloads");

    let cursor = AtomicUsize::new(0);
    let tally = Mutex::new(Tally::default());
    let (tx, rx) = mpsc::channel::<(usize, Result<VisionPayload<'a>, VisionError>)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let cursor = &cursor;
            let tally = &tally;
            scope.spawn(move || loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(record) = records.get(index) else {
                    break;
                };
                let outcome = load_payload(record);
                let encoded = outcome.as_ref().map(|p| p.base64.len()).unwrap_or(0);

                let completed = {
                    let mut guard = tally.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.completed += 1;
                    guard.encoded_bytes += encoded;
                    guard.completed
                };
                if completed == 1 || completed % 3 == 0 || completed == total {
                    if let Some(report) = progress {
                        report(completed, total, PROGRESS_LABEL);
                    }
                }
                if completed % log_every == 0 || completed == total {
                    debug!(completed, total, "vision payloads progress");
                }

                if tx.send((index, outcome)).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let mut results: Vec<(usize, Result<VisionPayload<'a>, VisionError>)> = rx.into_iter().collect();
    results.sort_by_key(|(index, _)| *index);

    let encoded_bytes = tally
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .encoded_bytes;
    let mut batch = VisionBatch {
        encoded_bytes,
        ..VisionBatch::default()
    };
    for (_, outcome) in results {
        match outcome {
            Ok(payload) => batch.payloads.push(payload),
            Err(error) => {
                warn!(%error, "image skipped");
                batch.errors.push(error.to_string());
            }
        }
    }

    info!(
        payloads = batch.payloads.len(),
        raw_fallbacks = batch.payloads.iter().filter(|p| !p.transcoded).count(),
        errors = batch.errors.len(),
        encoded_mib = %format!("{:.2}", mebibytes(batch.encoded_bytes)),
        "vision payloads ready"
    );
    batch
}

fn load_payload(record: &CatalogRecord) -> Result<VisionPayload<'_>, VisionError> {
    let path = record.file_path();
    let bytes = read_image(&path)?;
    let encoded = encode_image_bytes(&path, bytes.as_slice());
    let data_url = encoded.data_url();
    Ok(VisionPayload {
        source: record,
        path,
        base64: encoded.base64,
        data_url,
        mime: encoded.mime,
        transcoded: encoded.transcoded,
    })
}

fn read_image(path: &Path) -> Result<Vec<u8>, VisionError> {
    std::fs::read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            VisionError::ResourceNotFound {
                path: path.to_path_buf(),
            }
        } else {
            VisionError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn mebibytes(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
