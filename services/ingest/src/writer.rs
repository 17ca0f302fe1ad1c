//! Batch writer: unordered, idempotent bulk upserts keyed by row signature.

use crate::record::{IngestKind, OrderRecord};
use crate::store::{OrderStore, StoreError};
use tracing::{debug, warn};

/// Failures are logged, only a few of them individually.
const MAX_LOGGED_FAILURES: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub processed: u64,
    pub failed: u64,
}

/// Write `records` into the `kind` collection.
///
/// One statement per batch first; if the store rejects it, every row is retried
/// on its own so that one bad row cannot take the others down with it. Only a
/// batch in which every row fails is an error. Connection-level failures are
/// returned as they are, without per-row retries.
pub async fn write_batch(
    store: &dyn OrderStore,
    kind: IngestKind,
    records: &[OrderRecord],
) -> Result<WriteOutcome, StoreError> {
    if records.is_empty() {
        return Ok(WriteOutcome::default());
    }

    let bulk_error = match store.upsert_many(kind, records).await {
        Ok(_) => {
            debug!("Bulk upsert of {} {} rows", records.len(), kind);
            return Ok(WriteOutcome {
                processed: records.len() as u64,
                failed: 0,
            });
        }
        Err(e) => e,
    };

    // An unreachable store would fail every row the same way, one timeout at a time.
    if !bulk_error.is_rejection() {
        return Err(bulk_error);
    }

    warn!(
        "Batch write warning ({}): {}; retrying {} rows individually",
        kind,
        bulk_error,
        records.len()
    );

    let mut outcome = WriteOutcome::default();
    let mut last_error = bulk_error;
    for record in records {
        match store.upsert_one(kind, record).await {
            Ok(()) => outcome.processed += 1,
            Err(e) => {
                if outcome.failed < MAX_LOGGED_FAILURES as u64 {
                    warn!("  skipped row {}: {}", record.row_signature, e);
                }
                outcome.failed += 1;
                last_error = e;
            }
        }
    }

    if outcome.failed > MAX_LOGGED_FAILURES as u64 {
        warn!("  ... and {} more", outcome.failed - MAX_LOGGED_FAILURES as u64);
    }

    if outcome.processed == 0 {
        return Err(last_error);
    }
    Ok(outcome)
}
