use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    // ===== Input errors: reported before any state is touched =====
    #[error("No files uploaded")]
    NoFiles,

    #[error("Max {max} files allowed at a time (got {count})")]
    TooManyFiles { count: usize, max: usize },

    #[error("Unsupported file format: '{0}' (expected .csv, .txt, .xlsx, .xlsm, .xlsb, .xls or .ods)")]
    UnsupportedFormat(String),

    // ===== Fatal per-file errors =====
    #[error("Failed to read {file}: {source}")]
    Read {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV parse error in {file}: {message}")]
    Csv { file: String, message: String },

    #[error("Spreadsheet parse error in {file}: {message}")]
    Spreadsheet { file: String, message: String },

    #[error("Parser worker for {file} failed: {message}")]
    Worker { file: String, message: String },

    #[error("Ingestion of {file} stopped before the parser finished")]
    Aborted { file: String },

    #[error("Failed to write rows of {file}: {source}")]
    Store {
        file: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    /// Caller mistakes, as opposed to failures while processing.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            IngestError::NoFiles | IngestError::TooManyFiles { .. } | IngestError::UnsupportedFormat(_)
        )
    }
}
