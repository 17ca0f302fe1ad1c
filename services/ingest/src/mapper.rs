//! Field mapper: arbitrary spreadsheet headers -> canonical order fields.
//!
//! Headers are compared after reduction to lowercase ASCII alphanumerics, so
//! `P.O. No.`, `po no` and `PO_NO` all resolve to the same field. Matching is
//! explicit: only the synonyms listed here are recognized, anything else stays
//! in `raw` only.

use crate::record::{OrderDraft, RawRow};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    PoNumber,
    SoNumber,
    OrderNumber,
    LineItemNumber,
    ProductCode,
    PartNumber,
    Size,
    DrawingNumber,
    CustomerName,
    CustomerCode,
    Quantity,
    DispatchQuantity,
    PendingQuantity,
    GrossWeight,
    ChargeWeight,
    Rate,
    OrderDate,
    DispatchDate,
    ExpectedDeliveryDate,
    SoDate,
    PackSlipDate,
    InvoiceDate,
    InvoiceNumber,
    TruckNumber,
    Transport,
    DepartmentRemark,
    SoSpecialRemark,
    DieIndent,
}

/// Known header spellings per canonical field, already in reduced form.
const FIELD_SYNONYMS: &[(Field, &[&str])] = &[
    (
        Field::PoNumber,
        &["ponumber", "pono", "po", "purchaseorder", "purchaseorderno", "purchaseordernumber", "custpono", "customerpono", "customerpo"],
    ),
    (Field::SoNumber, &["sonumber", "sono", "so", "salesorder", "salesorderno", "salesordernumber"]),
    (Field::OrderNumber, &["ordernumber", "orderno", "orderid", "ordno"]),
    (
        Field::LineItemNumber,
        &["lineitemnumber", "lineitemno", "lineitem", "lineno", "linenumber", "line", "itemno", "polineno", "poline"],
    ),
    (Field::ProductCode, &["productcode", "prodcode", "product", "itemcode", "materialcode"]),
    (Field::PartNumber, &["partnumber", "partno", "part", "customerpartno", "custpartno"]),
    (Field::Size, &["size", "itemsize", "dimension"]),
    (Field::DrawingNumber, &["drawingnumber", "drawingno", "dwgno", "drgno", "drawing"]),
    (Field::CustomerName, &["customername", "customer", "partyname", "party", "client", "buyer"]),
    (Field::CustomerCode, &["customercode", "custcode", "partycode"]),
    (Field::Quantity, &["quantity", "qty", "orderqty", "orderedqty", "orderquantity", "poqty"]),
    (
        Field::DispatchQuantity,
        &["dispatchquantity", "dispatchqty", "dispatchedqty", "dispatchedquantity", "despatchqty", "shippedqty", "invoiceqty"],
    ),
    (
        Field::PendingQuantity,
        &["pendingquantity", "pendingqty", "balanceqty", "balqty", "openqty", "outstandingqty"],
    ),
    (Field::GrossWeight, &["grossweight", "grosswt", "grwt"]),
    (Field::ChargeWeight, &["chargeweight", "chargewt", "chargedweight", "chargeableweight"]),
    (Field::Rate, &["rate", "unitrate", "unitprice", "price"]),
    (Field::OrderDate, &["orderdate", "podate"]),
    (Field::DispatchDate, &["dispatchdate", "despatchdate", "shipdate", "shippingdate"]),
    (
        Field::ExpectedDeliveryDate,
        &["expecteddeliverydate", "deliverydate", "duedate", "edd", "requireddate"],
    ),
    (Field::SoDate, &["sodate", "salesorderdate"]),
    (Field::PackSlipDate, &["packslipdate", "packingslipdate"]),
    (Field::InvoiceDate, &["invoicedate", "invdate", "billdate"]),
    (Field::InvoiceNumber, &["invoicenumber", "invoiceno", "invno", "billno"]),
    (Field::TruckNumber, &["trucknumber", "truckno", "vehicleno", "vehiclenumber", "lorryno"]),
    (Field::Transport, &["transport", "transporter", "transportername", "carrier"]),
    (Field::DepartmentRemark, &["departmentremark", "deptremark", "remark", "remarks"]),
    (Field::SoSpecialRemark, &["sospecialremark", "specialremark"]),
    (Field::DieIndent, &["dieindent", "die"]),
];

/// Reduce a header to lowercase ASCII alphanumerics.
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Resolve a header against the synonym table.
pub fn resolve_header(header: &str) -> Option<Field> {
    let normalized = normalize_header(header);
    if normalized.is_empty() {
        return None;
    }
    FIELD_SYNONYMS
        .iter()
        .find(|(_, synonyms)| synonyms.contains(&normalized.as_str()))
        .map(|(field, _)| *field)
}

/// Render a cell as trimmed text. Whole numbers lose their fractional part so
/// that `4500123.0` from a spreadsheet equals `"4500123"` from a CSV.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn slot(draft: &mut OrderDraft, field: Field) -> &mut String {
    match field {
        Field::PoNumber => &mut draft.po_number,
        Field::SoNumber => &mut draft.so_number,
        Field::OrderNumber => &mut draft.order_number,
        Field::LineItemNumber => &mut draft.line_item_number,
        Field::ProductCode => &mut draft.product_code,
        Field::PartNumber => &mut draft.part_number,
        Field::Size => &mut draft.size,
        Field::DrawingNumber => &mut draft.drawing_number,
        Field::CustomerName => &mut draft.customer_name,
        Field::CustomerCode => &mut draft.customer_code,
        Field::Quantity => &mut draft.quantity,
        Field::DispatchQuantity => &mut draft.dispatch_quantity,
        Field::PendingQuantity => &mut draft.pending_quantity,
        Field::GrossWeight => &mut draft.gross_weight,
        Field::ChargeWeight => &mut draft.charge_weight,
        Field::Rate => &mut draft.rate,
        Field::OrderDate => &mut draft.order_date,
        Field::DispatchDate => &mut draft.dispatch_date,
        Field::ExpectedDeliveryDate => &mut draft.expected_delivery_date,
        Field::SoDate => &mut draft.so_date,
        Field::PackSlipDate => &mut draft.pack_slip_date,
        Field::InvoiceDate => &mut draft.invoice_date,
        Field::InvoiceNumber => &mut draft.invoice_number,
        Field::TruckNumber => &mut draft.truck_number,
        Field::Transport => &mut draft.transport,
        Field::DepartmentRemark => &mut draft.department_remark,
        Field::SoSpecialRemark => &mut draft.so_special_remark,
        Field::DieIndent => &mut draft.die_indent,
    }
}

/// Maps rows to drafts, caching header resolution since every row of a file
/// carries the same headers.
#[derive(Debug, Default)]
pub struct FieldMapper {
    resolved: HashMap<String, Option<Field>>,
}

impl FieldMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, row: RawRow) -> OrderDraft {
        let mut draft = OrderDraft::default();

        for (header, value) in &row {
            let field = match self.resolved.get(header) {
                Some(field) => *field,
                None => {
                    let field = resolve_header(header);
                    self.resolved.insert(header.clone(), field);
                    field
                }
            };

            let Some(field) = field else { continue };
            let target = slot(&mut draft, field);
            if target.is_empty() {
                *target = cell_text(value);
            }
        }

        draft.raw = row;
        draft
    }
}

/// One-shot mapping of a single row.
pub fn map_fields(row: RawRow) -> OrderDraft {
    FieldMapper::new().map(row)
}
