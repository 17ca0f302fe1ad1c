//! Reconciliation engine: dispatched rows consume outstanding pending quantity.
//!
//! Matching is on the exact `(po_number, product_code, size)` tuple. The
//! ledger is file-scoped: it is created once per dispatched file and passed
//! through every chunk, so a pending record closed by an earlier chunk can
//! never be consumed again by a later one.

use crate::record::{MatchKey, OrderRecord};
use crate::store::{OrderStore, PendingCandidate};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Consume-once lookup of pending records for one file.
#[derive(Debug, Default)]
pub struct ReconciliationLedger {
    open: HashMap<MatchKey, VecDeque<PendingCandidate>>,
    /// Every candidate id ever admitted, open or closed.
    seen: HashSet<i64>,
}

impl ReconciliationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit freshly fetched candidates. Ids the ledger already knows keep
    /// their ledger state, which is at least as current as the store's.
    fn admit(&mut self, candidates: Vec<PendingCandidate>) {
        for candidate in candidates {
            if !self.seen.insert(candidate.id) {
                continue;
            }
            self.open
                .entry(candidate.key.clone())
                .or_default()
                .push_back(candidate);
        }
    }

    /// Number of pending records still open in this ledger.
    pub fn open_count(&self) -> usize {
        self.open.values().map(VecDeque::len).sum()
    }
}

/// Pending-record mutations produced by walking one chunk.
#[derive(Debug, Default, PartialEq)]
struct Settlement {
    closed: Vec<i64>,
    decremented: Vec<(i64, f64)>,
}

/// Apply dispatched rows to the ledger in file order.
fn settle(ledger: &mut ReconciliationLedger, records: &[OrderRecord]) -> Settlement {
    let mut closed = Vec::new();
    let mut decremented: HashMap<i64, f64> = HashMap::new();

    for record in records {
        let key = record.match_key();
        let Some(queue) = ledger.open.get_mut(&key) else {
            continue;
        };
        let Some(head) = queue.front_mut() else {
            continue;
        };

        let remaining = head.pending_quantity - record.dispatch_quantity;
        if remaining <= 0.0 {
            closed.push(head.id);
            decremented.remove(&head.id);
            queue.pop_front();
            if queue.is_empty() {
                ledger.open.remove(&key);
            }
        } else {
            head.pending_quantity = remaining;
            decremented.insert(head.id, remaining);
        }
    }

    let mut decremented: Vec<(i64, f64)> = decremented.into_iter().collect();
    decremented.sort_by_key(|(id, _)| *id);
    Settlement { closed, decremented }
}

/// Reconcile one chunk of dispatched records against pending records.
///
/// Never fails: store errors are logged and the closed count only reflects
/// deletions that were actually committed.
pub async fn reconcile_chunk(
    store: &dyn OrderStore,
    ledger: &mut ReconciliationLedger,
    records: &[OrderRecord],
) -> u64 {
    if records.is_empty() {
        return 0;
    }

    let po_numbers: Vec<String> = records
        .iter()
        .map(|r| r.po_number.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let product_codes: Vec<String> = records
        .iter()
        .map(|r| r.product_code.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    match store.find_pending_candidates(&po_numbers, &product_codes).await {
        Ok(candidates) => {
            debug!("Fetched {} pending candidates", candidates.len());
            ledger.admit(candidates);
        }
        Err(e) => {
            warn!("Reconciliation lookup failed, using ledger only: {}", e);
        }
    }

    let settlement = settle(ledger, records);

    let mut reconciled = 0;
    if !settlement.closed.is_empty() {
        match store.delete_pending(&settlement.closed).await {
            Ok(deleted) => reconciled = deleted,
            Err(e) => warn!(
                "Failed to close {} reconciled pending records: {}",
                settlement.closed.len(),
                e
            ),
        }
    }

    if !settlement.decremented.is_empty() {
        if let Err(e) = store.update_pending_quantities(&settlement.decremented).await {
            warn!(
                "Failed to decrement {} pending records: {}",
                settlement.decremented.len(),
                e
            );
        }
    }

    reconciled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::map_fields;
    use crate::normalize::normalize_row;
    use crate::record::IngestKind;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn row(po: &str, pc: &str, size: &str, qty_header: &str, qty: f64, ordinal: u64, kind: IngestKind) -> OrderRecord {
        let raw = [
            ("PO Number".to_string(), json!(po)),
            ("Product Code".to_string(), json!(pc)),
            ("Size".to_string(), json!(size)),
            (qty_header.to_string(), json!(qty)),
        ]
        .into_iter()
        .collect();
        normalize_row(map_fields(raw), kind, ordinal)
    }

    fn pending(po: &str, pc: &str, size: &str, qty: f64, ordinal: u64) -> OrderRecord {
        row(po, pc, size, "Pending Qty", qty, ordinal, IngestKind::Pending)
    }

    fn dispatch(po: &str, pc: &str, size: &str, qty: f64, ordinal: u64) -> OrderRecord {
        row(po, pc, size, "Dispatch Qty", qty, ordinal, IngestKind::Dispatched)
    }

    async fn seeded(records: &[OrderRecord]) -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_many(IngestKind::Pending, records).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_partial_then_full_dispatch() {
        let store = seeded(&[pending("PO1", "PC1", "S1", 100.0, 0)]).await;

        let mut ledger = ReconciliationLedger::new();
        let closed = reconcile_chunk(&store, &mut ledger, &[dispatch("PO1", "PC1", "S1", 40.0, 0)]).await;
        assert_eq!(closed, 0);
        let left = store.records(IngestKind::Pending).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].pending_quantity, 60.0);

        // A later upload starts a fresh ledger and sees the persisted balance.
        let mut ledger = ReconciliationLedger::new();
        let closed = reconcile_chunk(&store, &mut ledger, &[dispatch("PO1", "PC1", "S1", 60.0, 0)]).await;
        assert_eq!(closed, 1);
        assert_eq!(store.count(IngestKind::Pending).await, 0);
    }

    #[tokio::test]
    async fn test_over_dispatch_closes_record() {
        let store = seeded(&[pending("PO1", "PC1", "S1", 100.0, 0)]).await;
        let mut ledger = ReconciliationLedger::new();
        let closed = reconcile_chunk(&store, &mut ledger, &[dispatch("PO1", "PC1", "S1", 150.0, 0)]).await;
        assert_eq!(closed, 1);
        assert_eq!(store.count(IngestKind::Pending).await, 0);
    }

    #[tokio::test]
    async fn test_no_match_has_no_side_effect() {
        let store = seeded(&[pending("PO1", "PC1", "S1", 100.0, 0)]).await;
        let mut ledger = ReconciliationLedger::new();
        let closed = reconcile_chunk(
            &store,
            &mut ledger,
            &[
                dispatch("PO9", "PC1", "S1", 10.0, 0),
                // Same PO and product, different size: prefilter hit, no key match.
                dispatch("PO1", "PC1", "S2", 10.0, 1),
            ],
        )
        .await;
        assert_eq!(closed, 0);
        assert_eq!(store.records(IngestKind::Pending).await[0].pending_quantity, 100.0);
    }

    #[tokio::test]
    async fn test_sequential_rows_in_one_chunk() {
        let store = seeded(&[pending("PO1", "PC1", "S1", 100.0, 0)]).await;
        let mut ledger = ReconciliationLedger::new();
        let closed = reconcile_chunk(
            &store,
            &mut ledger,
            &[
                dispatch("PO1", "PC1", "S1", 30.0, 0),
                dispatch("PO1", "PC1", "S1", 70.0, 1),
                dispatch("PO1", "PC1", "S1", 5.0, 2),
            ],
        )
        .await;
        assert_eq!(closed, 1);
        assert_eq!(store.count(IngestKind::Pending).await, 0);
        assert_eq!(ledger.open_count(), 0);
    }

    #[tokio::test]
    async fn test_ledger_spans_chunks() {
        let store = seeded(&[pending("PO1", "PC1", "S1", 50.0, 0)]).await;
        let mut ledger = ReconciliationLedger::new();

        let first = reconcile_chunk(&store, &mut ledger, &[dispatch("PO1", "PC1", "S1", 50.0, 0)]).await;
        let second = reconcile_chunk(&store, &mut ledger, &[dispatch("PO1", "PC1", "S1", 50.0, 1)]).await;
        assert_eq!(first + second, 1);
    }

    #[tokio::test]
    async fn test_closed_record_not_reconsumed_when_delete_failed() {
        let store = seeded(&[pending("PO1", "PC1", "S1", 50.0, 0)]).await;
        let mut ledger = ReconciliationLedger::new();

        // First chunk fetches the candidate; closing it fails.
        let candidates = store
            .find_pending_candidates(&["PO1".to_string()], &["PC1".to_string()])
            .await
            .unwrap();
        ledger.admit(candidates);
        store.set_reconciliation_down(true).await;
        let closed = reconcile_chunk(&store, &mut ledger, &[dispatch("PO1", "PC1", "S1", 50.0, 0)]).await;
        assert_eq!(closed, 0, "failed deletes are under-reported");

        // The record is still in the store, but the ledger will not re-admit it.
        store.set_reconciliation_down(false).await;
        let closed = reconcile_chunk(&store, &mut ledger, &[dispatch("PO1", "PC1", "S1", 50.0, 1)]).await;
        assert_eq!(closed, 0);
        assert_eq!(store.count(IngestKind::Pending).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_keys_queue_in_id_order() {
        let store = seeded(&[
            pending("PO1", "PC1", "S1", 10.0, 0),
            pending("PO1", "PC1", "S1", 20.0, 1),
        ])
        .await;
        let mut ledger = ReconciliationLedger::new();
        let closed = reconcile_chunk(
            &store,
            &mut ledger,
            &[
                dispatch("PO1", "PC1", "S1", 10.0, 0),
                dispatch("PO1", "PC1", "S1", 5.0, 1),
            ],
        )
        .await;
        assert_eq!(closed, 1);
        let left = store.records(IngestKind::Pending).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].pending_quantity, 15.0);
    }

    #[tokio::test]
    async fn test_store_down_does_not_panic() {
        let store = seeded(&[pending("PO1", "PC1", "S1", 10.0, 0)]).await;
        store.set_reconciliation_down(true).await;
        let mut ledger = ReconciliationLedger::new();
        let closed = reconcile_chunk(&store, &mut ledger, &[dispatch("PO1", "PC1", "S1", 10.0, 0)]).await;
        assert_eq!(closed, 0);
    }

    #[test]
    fn test_settle_keeps_final_decrement_only() {
        let mut ledger = ReconciliationLedger::new();
        ledger.admit(vec![PendingCandidate {
            id: 7,
            key: MatchKey {
                po_number: "PO1".into(),
                product_code: "PC1".into(),
                size: "S1".into(),
            },
            pending_quantity: 100.0,
        }]);
        let settlement = settle(
            &mut ledger,
            &[
                dispatch("PO1", "PC1", "S1", 10.0, 0),
                dispatch("PO1", "PC1", "S1", 20.0, 1),
            ],
        );
        assert_eq!(
            settlement,
            Settlement {
                closed: vec![],
                decremented: vec![(7, 70.0)],
            }
        );
    }
}
