//! Storage seam for the pipeline.
//!
//! The batch writer and reconciliation engine only talk to [`OrderStore`];
//! `postgres` is the production backend, `memory` backs dry runs and tests.

pub mod memory;
pub mod postgres;

use crate::record::{IngestKind, MatchKey, OrderRecord, UploadLogEntry};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgOrderStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    /// The store answered and refused the data itself (constraint, type or
    /// value errors). Connection, pool and protocol failures are not.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::Rejected(_) | StoreError::Database(sqlx::Error::Database(_))
        )
    }
}

/// A pending record as seen by the reconciliation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCandidate {
    pub id: i64,
    pub key: MatchKey,
    pub pending_quantity: f64,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Upsert a batch keyed by `row_signature` in one round trip.
    /// All-or-nothing: an error means none of the batch is known to be written.
    async fn upsert_many(&self, kind: IngestKind, records: &[OrderRecord]) -> Result<u64, StoreError>;

    /// Upsert a single record keyed by `row_signature`.
    async fn upsert_one(&self, kind: IngestKind, record: &OrderRecord) -> Result<(), StoreError>;

    /// Pending records whose PO number is in `po_numbers` and whose product
    /// code is in `product_codes`, ordered by id.
    async fn find_pending_candidates(
        &self,
        po_numbers: &[String],
        product_codes: &[String],
    ) -> Result<Vec<PendingCandidate>, StoreError>;

    /// Returns how many records were deleted.
    async fn delete_pending(&self, ids: &[i64]) -> Result<u64, StoreError>;

    async fn update_pending_quantities(&self, updates: &[(i64, f64)]) -> Result<(), StoreError>;

    async fn append_upload_log(&self, entry: &UploadLogEntry) -> Result<(), StoreError>;

    /// Drop the old compound uniqueness constraint on pending orders, which
    /// rejects legitimate re-uploads. Absence is not an error.
    async fn drop_legacy_pending_constraint(&self) -> Result<(), StoreError>;
}
