//! Order ingestion pipeline.
//!
//! Uploaded CSV/spreadsheet files flow through:
//! 1. `source`      - blocking parser worker, streams raw rows
//! 2. `mapper`      - fuzzy header matching onto canonical fields
//! 3. `normalize`   - numeric coercion, status, row signature
//! 4. `writer`      - bulk upsert with per-row fallback
//! 5. `reconcile`   - dispatched rows consume pending quantity
//!
//! `orchestrator` drives one request of up to `max_files` files end to end.

pub mod config;
pub mod error;
pub mod mapper;
pub mod normalize;
pub mod orchestrator;
pub mod reconcile;
pub mod record;
pub mod source;
pub mod store;
pub mod writer;

pub use config::IngestConfig;
pub use error::IngestError;
pub use orchestrator::{FileReport, IngestSummary, Ingestor, UploadedFile};
pub use record::{IngestKind, OrderRecord, OrderStatus, UploadLogEntry};
pub use store::{MemoryStore, OrderStore, PgOrderStore, StoreError};
