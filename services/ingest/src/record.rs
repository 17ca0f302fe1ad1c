//! Canonical order record shapes shared by every stage of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A source row exactly as parsed: header -> cell value.
///
/// A `BTreeMap` keeps key order sorted, which makes its JSON serialization
/// canonical (the row signature depends on that).
pub type RawRow = BTreeMap<String, serde_json::Value>;

/// Which collection an upload feeds, and whether reconciliation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestKind {
    Pending,
    Dispatched,
}

impl IngestKind {
    /// Tag used in signatures, upload logs and API responses.
    pub fn tag(self) -> &'static str {
        match self {
            IngestKind::Pending => "PENDING",
            IngestKind::Dispatched => "DISPATCHED",
        }
    }

    pub fn status(self) -> OrderStatus {
        match self {
            IngestKind::Pending => OrderStatus::Pending,
            IngestKind::Dispatched => OrderStatus::Dispatched,
        }
    }
}

impl fmt::Display for IngestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for IngestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(IngestKind::Pending),
            "dispatched" | "dispatch" => Ok(IngestKind::Dispatched),
            other => Err(format!("unknown ingestion type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Dispatched,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Dispatched => "Dispatched",
        }
    }
}

/// Output of the field mapper: every canonical field as text, plus the raw row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderDraft {
    pub po_number: String,
    pub so_number: String,
    pub order_number: String,
    pub line_item_number: String,
    pub product_code: String,
    pub part_number: String,
    pub size: String,
    pub drawing_number: String,
    pub customer_name: String,
    pub customer_code: String,
    pub quantity: String,
    pub dispatch_quantity: String,
    pub pending_quantity: String,
    pub gross_weight: String,
    pub charge_weight: String,
    pub rate: String,
    pub order_date: String,
    pub dispatch_date: String,
    pub expected_delivery_date: String,
    pub so_date: String,
    pub pack_slip_date: String,
    pub invoice_date: String,
    pub invoice_number: String,
    pub truck_number: String,
    pub transport: String,
    pub department_remark: String,
    pub so_special_remark: String,
    pub die_indent: String,
    pub raw: RawRow,
}

/// A normalized row, ready to be upserted by `row_signature`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub po_number: String,
    pub so_number: String,
    pub order_number: String,
    pub line_item_number: String,
    pub product_code: String,
    pub part_number: String,
    pub size: String,
    pub drawing_number: String,
    pub customer_name: String,
    pub customer_code: String,
    pub quantity: f64,
    pub dispatch_quantity: f64,
    pub pending_quantity: f64,
    pub gross_weight: f64,
    pub charge_weight: f64,
    pub rate: f64,
    pub order_date: String,
    pub dispatch_date: String,
    pub expected_delivery_date: String,
    pub so_date: String,
    pub pack_slip_date: String,
    pub invoice_date: String,
    pub invoice_number: String,
    pub truck_number: String,
    pub transport: String,
    pub department_remark: String,
    pub so_special_remark: String,
    pub die_indent: String,
    pub status: OrderStatus,
    pub row_signature: String,
    pub raw: RawRow,
}

impl OrderRecord {
    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            po_number: self.po_number.clone(),
            product_code: self.product_code.clone(),
            size: self.size.clone(),
        }
    }
}

/// The tuple a dispatched row is reconciled on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchKey {
    pub po_number: String,
    pub product_code: String,
    pub size: String,
}

/// Audit trail entry, one per processed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadLogEntry {
    pub upload_date: DateTime<Utc>,
    pub total_items: f64,
    pub file_name: String,
    pub batch_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_kind_parse() {
        assert_eq!("pending".parse::<IngestKind>().unwrap(), IngestKind::Pending);
        assert_eq!(" Dispatched ".parse::<IngestKind>().unwrap(), IngestKind::Dispatched);
        assert!("shipped".parse::<IngestKind>().is_err());
    }

    #[test]
    fn test_ingest_kind_tags_are_distinct() {
        assert_ne!(IngestKind::Pending.tag(), IngestKind::Dispatched.tag());
        assert_eq!(IngestKind::Dispatched.status(), OrderStatus::Dispatched);
    }
}
