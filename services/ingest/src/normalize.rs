//! Row normalizer: numeric coercion, status, and row signatures.
//!
//! Everything here is DETERMINISTIC: the same raw row at the same ordinal
//! under the same ingestion type always yields the same record.

use crate::mapper::FieldMapper;
use crate::record::{IngestKind, OrderDraft, OrderRecord, RawRow};
use sha2::{Digest, Sha256};

/// Coerce free-form cell text to a non-negative number. Empty, non-numeric,
/// non-finite and negative values all become `0`.
pub fn coerce_number(value: &str) -> f64 {
    let cleaned = value.trim().replace(',', "");
    if cleaned.is_empty() {
        return 0.0;
    }
    match cleaned.parse::<f64>() {
        Ok(n) if n.is_finite() && n > 0.0 => n,
        _ => 0.0,
    }
}

/// Fingerprint of a row at a given position of a given upload type.
///
/// The ordinal is the row's position across the whole file, so two identical
/// rows in one file never collapse into one record, while uploading the same
/// file again reproduces the same signatures.
pub fn row_signature(raw: &RawRow, kind: IngestKind, ordinal: u64) -> String {
    // BTreeMap serializes with sorted keys; this cannot fail for JSON values.
    let canonical = serde_json::to_string(raw).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.tag().as_bytes());
    hasher.update(b"|");
    hasher.update(ordinal.to_string().as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

pub fn normalize_row(draft: OrderDraft, kind: IngestKind, ordinal: u64) -> OrderRecord {
    let row_signature = row_signature(&draft.raw, kind, ordinal);

    OrderRecord {
        quantity: coerce_number(&draft.quantity),
        dispatch_quantity: coerce_number(&draft.dispatch_quantity),
        pending_quantity: coerce_number(&draft.pending_quantity),
        gross_weight: coerce_number(&draft.gross_weight),
        charge_weight: coerce_number(&draft.charge_weight),
        rate: coerce_number(&draft.rate),
        po_number: draft.po_number,
        so_number: draft.so_number,
        order_number: draft.order_number,
        line_item_number: draft.line_item_number,
        product_code: draft.product_code,
        part_number: draft.part_number,
        size: draft.size,
        drawing_number: draft.drawing_number,
        customer_name: draft.customer_name,
        customer_code: draft.customer_code,
        order_date: draft.order_date,
        dispatch_date: draft.dispatch_date,
        expected_delivery_date: draft.expected_delivery_date,
        so_date: draft.so_date,
        pack_slip_date: draft.pack_slip_date,
        invoice_date: draft.invoice_date,
        invoice_number: draft.invoice_number,
        truck_number: draft.truck_number,
        transport: draft.transport,
        department_remark: draft.department_remark,
        so_special_remark: draft.so_special_remark,
        die_indent: draft.die_indent,
        status: kind.status(),
        row_signature,
        raw: draft.raw,
    }
}

/// Quantity that counts toward an upload's total.
pub fn relevant_quantity(record: &OrderRecord, kind: IngestKind) -> f64 {
    match kind {
        IngestKind::Dispatched => record.dispatch_quantity,
        IngestKind::Pending if record.pending_quantity > 0.0 => record.pending_quantity,
        IngestKind::Pending => record.quantity,
    }
}

/// A run of consecutive normalized rows of one file.
#[derive(Debug, Clone)]
pub struct NormalizedChunk {
    pub records: Vec<OrderRecord>,
    pub quantity_total: f64,
    pub first_ordinal: u64,
    pub next_ordinal: u64,
}

/// Map and normalize a chunk of rows, starting at `start_ordinal`.
///
/// The returned `next_ordinal` must be fed into the following chunk of the
/// same file.
pub fn normalize_chunk(
    rows: Vec<RawRow>,
    mapper: &mut FieldMapper,
    kind: IngestKind,
    start_ordinal: u64,
) -> NormalizedChunk {
    let mut ordinal = start_ordinal;
    let mut quantity_total = 0.0;
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let record = normalize_row(mapper.map(row), kind, ordinal);
        quantity_total += relevant_quantity(&record, kind);
        records.push(record);
        ordinal += 1;
    }

    NormalizedChunk {
        records,
        quantity_total,
        first_ordinal: start_ordinal,
        next_ordinal: ordinal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::map_fields;
    use crate::record::OrderStatus;
    use serde_json::json;
    use std::collections::HashSet;

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_coerce_number_defaults() {
        assert_eq!(coerce_number(""), 0.0);
        assert_eq!(coerce_number("   "), 0.0);
        assert_eq!(coerce_number("abc"), 0.0);
        assert_eq!(coerce_number("NaN"), 0.0);
        assert_eq!(coerce_number("inf"), 0.0);
        assert_eq!(coerce_number("-5"), 0.0);
    }

    #[test]
    fn test_coerce_number_values() {
        assert_eq!(coerce_number("42"), 42.0);
        assert_eq!(coerce_number(" 12.5 "), 12.5);
        assert_eq!(coerce_number("1,250"), 1250.0);
    }

    #[test]
    fn test_normalize_row_bad_quantities() {
        let draft = map_fields(raw(&[("Qty", ""), ("Rate", "abc"), ("Gross Wt", "x1")]));
        let record = normalize_row(draft, IngestKind::Pending, 0);
        assert_eq!(record.quantity, 0.0);
        assert_eq!(record.rate, 0.0);
        assert_eq!(record.gross_weight, 0.0);
        assert_eq!(record.status, OrderStatus::Pending);
    }

    #[test]
    fn test_signature_determinism() {
        let row = raw(&[("PO", "1"), ("Qty", "3")]);
        let a = row_signature(&row, IngestKind::Pending, 7);
        let b = row_signature(&row, IngestKind::Pending, 7);
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn test_signature_distinguishes_identical_rows_by_ordinal() {
        let row = raw(&[("PO", "1"), ("Qty", "3")]);
        assert_ne!(
            row_signature(&row, IngestKind::Pending, 0),
            row_signature(&row, IngestKind::Pending, 1)
        );
    }

    #[test]
    fn test_signature_distinguishes_ingestion_type() {
        let row = raw(&[("PO", "1")]);
        assert_ne!(
            row_signature(&row, IngestKind::Pending, 0),
            row_signature(&row, IngestKind::Dispatched, 0)
        );
    }

    #[test]
    fn test_normalize_chunk_threads_ordinal() {
        let mut mapper = FieldMapper::new();
        let rows = vec![raw(&[("PO", "1")]); 3];

        let first = normalize_chunk(rows.clone(), &mut mapper, IngestKind::Pending, 0);
        assert_eq!(first.first_ordinal, 0);
        assert_eq!(first.next_ordinal, 3);

        let second = normalize_chunk(rows, &mut mapper, IngestKind::Pending, first.next_ordinal);
        assert_eq!(second.first_ordinal, 3);
        assert_eq!(second.next_ordinal, 6);

        let signatures: HashSet<_> = first
            .records
            .iter()
            .chain(second.records.iter())
            .map(|r| r.row_signature.clone())
            .collect();
        assert_eq!(signatures.len(), 6);
    }

    #[test]
    fn test_relevant_quantity_totals() {
        let mut mapper = FieldMapper::new();
        let rows = vec![
            raw(&[("Pending Qty", "50"), ("Qty", "80")]),
            raw(&[("Pending Qty", ""), ("Qty", "20")]),
        ];
        let chunk = normalize_chunk(rows, &mut mapper, IngestKind::Pending, 0);
        assert_eq!(chunk.quantity_total, 70.0);

        let rows = vec![raw(&[("Dispatch Qty", "15"), ("Qty", "80")])];
        let chunk = normalize_chunk(rows, &mut mapper, IngestKind::Dispatched, 0);
        assert_eq!(chunk.quantity_total, 15.0);
    }
}
