//! In-process backend used for `--dry-run` ingestion and for tests.

use super::{OrderStore, PendingCandidate, StoreError};
use crate::record::{IngestKind, OrderRecord, UploadLogEntry};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Collection {
    /// row_signature -> (id, record)
    rows: BTreeMap<String, (i64, OrderRecord)>,
}

impl Collection {
    fn upsert(&mut self, next_id: &mut i64, record: &OrderRecord) {
        match self.rows.get_mut(&record.row_signature) {
            Some((_, existing)) => *existing = record.clone(),
            None => {
                *next_id += 1;
                self.rows
                    .insert(record.row_signature.clone(), (*next_id, record.clone()));
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    pending: Collection,
    dispatched: Collection,
    upload_logs: Vec<UploadLogEntry>,
    failing_signatures: HashSet<String>,
    reconciliation_down: bool,
    legacy_constraint_drops: u32,
    legacy_constraint_locked: bool,
}

impl State {
    fn collection(&mut self, kind: IngestKind) -> (&mut Collection, &mut i64) {
        match kind {
            IngestKind::Pending => (&mut self.pending, &mut self.next_id),
            IngestKind::Dispatched => (&mut self.dispatched, &mut self.next_id),
        }
    }

    fn check_reconciliation(&self) -> Result<(), StoreError> {
        if self.reconciliation_down {
            return Err(StoreError::Rejected("pending store unavailable".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of one collection in insertion order.
    pub async fn records(&self, kind: IngestKind) -> Vec<OrderRecord> {
        let state = self.state.read().await;
        let collection = match kind {
            IngestKind::Pending => &state.pending,
            IngestKind::Dispatched => &state.dispatched,
        };
        let mut rows: Vec<_> = collection.rows.values().cloned().collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter().map(|(_, record)| record).collect()
    }

    pub async fn count(&self, kind: IngestKind) -> usize {
        let state = self.state.read().await;
        match kind {
            IngestKind::Pending => state.pending.rows.len(),
            IngestKind::Dispatched => state.dispatched.rows.len(),
        }
    }

    pub async fn upload_logs(&self) -> Vec<UploadLogEntry> {
        self.state.read().await.upload_logs.clone()
    }

    /// Make every write touching `signature` fail.
    #[cfg(test)]
    pub async fn fail_signature(&self, signature: &str) {
        self.state
            .write()
            .await
            .failing_signatures
            .insert(signature.to_string());
    }

    /// Make every reconciliation read/write against pending records fail.
    #[cfg(test)]
    pub async fn set_reconciliation_down(&self, down: bool) {
        self.state.write().await.reconciliation_down = down;
    }

    /// Make the legacy constraint drop fail, as if the table were locked.
    #[cfg(test)]
    pub async fn set_legacy_constraint_locked(&self, locked: bool) {
        self.state.write().await.legacy_constraint_locked = locked;
    }

    /// How many times a legacy constraint drop was attempted.
    #[cfg(test)]
    pub async fn legacy_constraint_drops(&self) -> u32 {
        self.state.read().await.legacy_constraint_drops
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn upsert_many(&self, kind: IngestKind, records: &[OrderRecord]) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        if let Some(bad) = records
            .iter()
            .find(|r| state.failing_signatures.contains(&r.row_signature))
        {
            return Err(StoreError::Rejected(format!(
                "duplicate key value violates unique constraint ({})",
                bad.row_signature
            )));
        }

        let (collection, next_id) = state.collection(kind);
        for record in records {
            collection.upsert(next_id, record);
        }
        Ok(records.len() as u64)
    }

    async fn upsert_one(&self, kind: IngestKind, record: &OrderRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.failing_signatures.contains(&record.row_signature) {
            return Err(StoreError::Rejected(format!(
                "duplicate key value violates unique constraint ({})",
                record.row_signature
            )));
        }
        let (collection, next_id) = state.collection(kind);
        collection.upsert(next_id, record);
        Ok(())
    }

    async fn find_pending_candidates(
        &self,
        po_numbers: &[String],
        product_codes: &[String],
    ) -> Result<Vec<PendingCandidate>, StoreError> {
        let state = self.state.read().await;
        state.check_reconciliation()?;

        let mut candidates: Vec<PendingCandidate> = state
            .pending
            .rows
            .values()
            .filter(|(_, r)| po_numbers.contains(&r.po_number) && product_codes.contains(&r.product_code))
            .map(|(id, r)| PendingCandidate {
                id: *id,
                key: r.match_key(),
                pending_quantity: r.pending_quantity,
            })
            .collect();
        candidates.sort_by_key(|c| c.id);
        Ok(candidates)
    }

    async fn delete_pending(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        state.check_reconciliation()?;

        let before = state.pending.rows.len();
        state.pending.rows.retain(|_, (id, _)| !ids.contains(id));
        Ok((before - state.pending.rows.len()) as u64)
    }

    async fn update_pending_quantities(&self, updates: &[(i64, f64)]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_reconciliation()?;

        for (id, record) in state.pending.rows.values_mut() {
            if let Some((_, qty)) = updates.iter().find(|(target, _)| target == id) {
                record.pending_quantity = *qty;
            }
        }
        Ok(())
    }

    async fn append_upload_log(&self, entry: &UploadLogEntry) -> Result<(), StoreError> {
        self.state.write().await.upload_logs.push(entry.clone());
        Ok(())
    }

    async fn drop_legacy_pending_constraint(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.legacy_constraint_drops += 1;
        if state.legacy_constraint_locked {
            return Err(StoreError::Rejected("lock timeout on pending_orders".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::map_fields;
    use crate::normalize::normalize_row;
    use serde_json::json;

    fn record(po: &str, qty: &str, kind: IngestKind, ordinal: u64) -> OrderRecord {
        let raw = [
            ("PO".to_string(), json!(po)),
            ("Product Code".to_string(), json!("PC1")),
            ("Pending Qty".to_string(), json!(qty)),
        ]
        .into_iter()
        .collect();
        normalize_row(map_fields(raw), kind, ordinal)
    }

    #[tokio::test]
    async fn test_upsert_same_signature_replaces() {
        let store = MemoryStore::new();
        let r = record("PO1", "10", IngestKind::Pending, 0);
        store.upsert_many(IngestKind::Pending, &[r.clone()]).await.unwrap();
        store.upsert_one(IngestKind::Pending, &r).await.unwrap();
        assert_eq!(store.count(IngestKind::Pending).await, 1);
        assert_eq!(store.count(IngestKind::Dispatched).await, 0);
    }

    #[tokio::test]
    async fn test_failing_signature_rejects_whole_batch() {
        let store = MemoryStore::new();
        let good = record("PO1", "10", IngestKind::Pending, 0);
        let bad = record("PO2", "10", IngestKind::Pending, 1);
        store.fail_signature(&bad.row_signature).await;

        let result = store.upsert_many(IngestKind::Pending, &[good, bad]).await;
        assert!(result.is_err());
        assert_eq!(store.count(IngestKind::Pending).await, 0);
    }

    #[tokio::test]
    async fn test_candidates_and_mutations() {
        let store = MemoryStore::new();
        let a = record("PO1", "10", IngestKind::Pending, 0);
        let b = record("PO2", "20", IngestKind::Pending, 1);
        store.upsert_many(IngestKind::Pending, &[a, b]).await.unwrap();

        let found = store
            .find_pending_candidates(&["PO1".to_string()], &["PC1".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pending_quantity, 10.0);

        store.update_pending_quantities(&[(found[0].id, 4.0)]).await.unwrap();
        assert_eq!(store.records(IngestKind::Pending).await[0].pending_quantity, 4.0);

        assert_eq!(store.delete_pending(&[found[0].id]).await.unwrap(), 1);
        assert_eq!(store.count(IngestKind::Pending).await, 1);
    }
}
