//! Upload endpoints: spool multipart files to disk, then run the ingestion
//! pipeline over them.

use crate::error::ApiError;
use crate::AppState;
use axum::extract::{Multipart, State};
use axum::Json;
use ingest::{IngestError, IngestKind, IngestSummary, UploadedFile};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Multipart field that carries files. Other fields are ignored.
const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub files_processed: Vec<String>,
    pub rows_inserted: u64,
    pub reconciled_orders: u64,
    pub status_type: IngestKind,
}

impl From<IngestSummary> for UploadResponse {
    fn from(summary: IngestSummary) -> Self {
        Self {
            message: format!("Processed {} files successfully", summary.files_processed.len()),
            files_processed: summary.files_processed,
            rows_inserted: summary.rows_inserted,
            reconciled_orders: summary.reconciled_orders,
            status_type: summary.status_type,
        }
    }
}

/// Spooled temp files, removed when dropped. Removal also happens when the
/// request times out and the handler future is dropped mid-ingestion.
#[derive(Default)]
struct Spool {
    paths: Vec<PathBuf>,
}

impl Spool {
    fn track(&mut self, dir: &Path) -> PathBuf {
        let path = dir.join(Uuid::new_v4().to_string());
        self.paths.push(path.clone());
        path
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed spooled upload {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove spooled upload {}: {}", path.display(), e),
            }
        }
    }
}

/// Write every `file` field to the upload directory. Stops at the first
/// file past `max_files`, before writing it.
async fn spool_files(
    dir: &Path,
    max_files: usize,
    mut multipart: Multipart,
    spool: &mut Spool,
) -> Result<Vec<UploadedFile>, ApiError> {
    let mut files = Vec::new();

    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        if files.len() >= max_files {
            return Err(IngestError::TooManyFiles {
                count: files.len() + 1,
                max: max_files,
            }
            .into());
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("upload-{}", files.len() + 1));

        let path = spool.track(dir);
        let mut out = tokio::fs::File::create(&path).await?;
        let mut size = 0usize;
        while let Some(chunk) = field.chunk().await? {
            size += chunk.len();
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        debug!("Spooled {} ({} bytes) to {}", file_name, size, path.display());
        files.push(UploadedFile::new(file_name, path));
    }

    Ok(files)
}

/// Run `work` under `limit`. Dropping it on timeout also drops its spool.
async fn within<T>(limit: Duration, work: impl Future<Output = Result<T, ApiError>>) -> Result<T, ApiError> {
    tokio::time::timeout(limit, work)
        .await
        .map_err(|_| ApiError::Timeout(limit))?
}

async fn spool_and_ingest(state: &AppState, kind: IngestKind, multipart: Multipart) -> Result<IngestSummary, ApiError> {
    let mut spool = Spool::default();
    let max_files = state.ingestor.config().max_files;
    let files = spool_files(&state.config.upload_dir, max_files, multipart, &mut spool).await?;

    info!("Received {} file(s) for {} upload", files.len(), kind);
    Ok(state.ingestor.ingest_files(files, kind).await?)
}

async fn upload(state: Arc<AppState>, kind: IngestKind, multipart: Multipart) -> Result<Json<UploadResponse>, ApiError> {
    let summary = within(state.config.upload_timeout, spool_and_ingest(&state, kind, multipart)).await?;
    Ok(Json(summary.into()))
}

pub async fn upload_pending(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    upload(state, IngestKind::Pending, multipart).await
}

pub async fn upload_dispatched(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    upload(state, IngestKind::Dispatched, multipart).await
}
