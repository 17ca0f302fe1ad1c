//! Ingestion orchestrator.
//!
//! One request = up to `max_files` files of one ingestion type. Each file runs
//! as an independent unit: a blocking parser worker produces normalized
//! chunks, and the async side writes them and (for dispatches) reconciles
//! them with a file-scoped ledger. Files of one request run concurrently;
//! nothing is shared between them except the store.
//!
//! Two dispatch files claiming the same pending record at the same time race,
//! and the last decrement wins. Re-uploading is always safe because every
//! write is an upsert by row signature.

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::normalize::NormalizedChunk;
use crate::reconcile::{reconcile_chunk, ReconciliationLedger};
use crate::record::{IngestKind, UploadLogEntry};
use crate::source::{detect_format, produce_chunks};
use crate::store::OrderStore;
use crate::writer::write_batch;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Chunks buffered between a parser worker and its writer.
const CHANNEL_DEPTH: usize = 4;

/// A file to ingest: the name the user uploaded it under, and where it lives now.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub path: PathBuf,
}

impl UploadedFile {
    pub fn new(file_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            file_name: file_name.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub file_name: String,
    pub rows_inserted: u64,
    pub rows_failed: u64,
    pub reconciled: u64,
    pub total_quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub files_processed: Vec<String>,
    pub rows_inserted: u64,
    pub reconciled_orders: u64,
    pub status_type: IngestKind,
    pub files: Vec<FileReport>,
}

/// Ingest one file end to end. Does not write the upload log.
pub async fn ingest_file(
    store: Arc<dyn OrderStore>,
    file: UploadedFile,
    kind: IngestKind,
    chunk_size: usize,
) -> Result<FileReport, IngestError> {
    let format =
        detect_format(&file.file_name).ok_or_else(|| IngestError::UnsupportedFormat(file.file_name.clone()))?;

    info!("{}: ingesting as {} ({:?})", file.file_name, kind, format);

    let (tx, mut rx) = mpsc::channel::<NormalizedChunk>(CHANNEL_DEPTH);
    let worker_path = file.path.clone();
    let worker_name = file.file_name.clone();
    let producer = tokio::task::spawn_blocking(move || {
        produce_chunks(&worker_path, &worker_name, format, kind, chunk_size, tx)
    });

    let mut report = FileReport {
        file_name: file.file_name.clone(),
        ..FileReport::default()
    };
    let mut ledger = ReconciliationLedger::new();

    let consumed: Result<(), IngestError> = async {
        while let Some(chunk) = rx.recv().await {
            let outcome = write_batch(store.as_ref(), kind, &chunk.records)
                .await
                .map_err(|source| IngestError::Store {
                    file: file.file_name.clone(),
                    source,
                })?;
            report.rows_inserted += outcome.processed;
            report.rows_failed += outcome.failed;
            report.total_quantity += chunk.quantity_total;

            if kind == IngestKind::Dispatched {
                report.reconciled += reconcile_chunk(store.as_ref(), &mut ledger, &chunk.records).await;
            }
        }
        Ok(())
    }
    .await;

    // Unblock the worker if we stopped early.
    drop(rx);

    let produced = producer.await.map_err(|e| IngestError::Worker {
        file: file.file_name.clone(),
        message: e.to_string(),
    })?;
    consumed?;
    produced?;

    info!(
        "{}: {} rows written, {} failed, {} pending orders reconciled",
        report.file_name, report.rows_inserted, report.rows_failed, report.reconciled
    );
    Ok(report)
}

pub struct Ingestor {
    store: Arc<dyn OrderStore>,
    config: IngestConfig,
    legacy_constraint: OnceCell<()>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn OrderStore>, config: IngestConfig) -> Self {
        Self {
            store,
            config,
            legacy_constraint: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Validate the request without touching any state.
    fn validate(&self, files: &[UploadedFile]) -> Result<(), IngestError> {
        if files.is_empty() {
            return Err(IngestError::NoFiles);
        }
        if files.len() > self.config.max_files {
            return Err(IngestError::TooManyFiles {
                count: files.len(),
                max: self.config.max_files,
            });
        }
        if let Some(bad) = files.iter().find(|f| detect_format(&f.file_name).is_none()) {
            return Err(IngestError::UnsupportedFormat(bad.file_name.clone()));
        }
        Ok(())
    }

    /// Once per process, before the first pending upload.
    async fn drop_legacy_constraint(&self) {
        self.legacy_constraint
            .get_or_init(|| async {
                match self.store.drop_legacy_pending_constraint().await {
                    Ok(()) => info!("Legacy pending-order constraint removed (or absent)"),
                    Err(e) => warn!("Could not remove legacy pending-order constraint: {}", e),
                }
            })
            .await;
    }

    /// Ingest every file, write one upload-log entry per completed file, and
    /// summarize. If any file fails, the completed files are still logged and
    /// the first failure (in request order) is returned.
    pub async fn ingest_files(
        &self,
        files: Vec<UploadedFile>,
        kind: IngestKind,
    ) -> Result<IngestSummary, IngestError> {
        self.validate(&files)?;

        if kind == IngestKind::Pending {
            self.drop_legacy_constraint().await;
        }

        info!("Upload started: {} file(s) as {}", files.len(), kind);

        let file_count = files.len();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_files.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, file) in files.into_iter().enumerate() {
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            let chunk_size = self.config.chunk_size;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (idx, ingest_file(store, file, kind, chunk_size).await)
            });
        }

        let mut results: Vec<Option<Result<FileReport, IngestError>>> =
            (0..file_count).map(|_| None).collect();
        let mut panicked: Option<IngestError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => {
                    error!("File task failed: {}", e);
                    panicked.get_or_insert(IngestError::Worker {
                        file: "<unknown>".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut reports = Vec::with_capacity(file_count);
        let mut first_error = None;
        for result in results.into_iter().flatten() {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("Upload error: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        for report in &reports {
            let entry = UploadLogEntry {
                upload_date: Utc::now(),
                total_items: report.total_quantity,
                file_name: report.file_name.clone(),
                batch_id: kind.tag().to_string(),
            };
            if let Err(e) = self.store.append_upload_log(&entry).await {
                warn!("Failed to record upload log for {}: {}", report.file_name, e);
            }
        }

        if let Some(e) = first_error.or(panicked) {
            return Err(e);
        }

        let summary = IngestSummary {
            files_processed: reports.iter().map(|r| r.file_name.clone()).collect(),
            rows_inserted: reports.iter().map(|r| r.rows_inserted).sum(),
            reconciled_orders: reports.iter().map(|r| r.reconciled).sum(),
            status_type: kind,
            files: reports,
        };

        info!(
            "Upload finished: {} file(s), {} rows, {} reconciled",
            summary.files_processed.len(),
            summary.rows_inserted,
            summary.reconciled_orders
        );
        Ok(summary)
    }
}
