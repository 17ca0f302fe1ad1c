//! Query endpoints over persisted orders.
//!
//! - GET /orders/stats   - dashboard KPIs, top customers, trend, upload history
//! - GET /orders/search  - free-text search across both collections
//! - GET /orders/all     - recent dispatched records grouped by customer
//! - GET /orders/pending - open records grouped by customer

use crate::error::ApiError;
use crate::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use ingest::store::postgres::table_for;
use ingest::{IngestKind, UploadLogEntry};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_RANGE: &str = "1M";
const TOP_CUSTOMERS: i64 = 5;
const RECENT_UPLOAD_LOGS: i64 = 20;
const SEARCH_LIMIT: i64 = 50;
const RECENT_DISPATCHED: i64 = 500;

const VIEW_COLUMNS: &str = "id, po_number, so_number, order_number, line_item_number, product_code, \
    part_number, size, drawing_number, customer_name, customer_code, quantity, dispatch_quantity, \
    pending_quantity, gross_weight, charge_weight, rate, order_date, dispatch_date, \
    expected_delivery_date, so_date, pack_slip_date, invoice_date, invoice_number, truck_number, \
    transport, department_remark, so_special_remark, die_indent, status, row_signature, raw, \
    created_at, updated_at";

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: i64,
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
    pub status: String,
    pub row_signature: String,
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub order: OrderView,
    pub source: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CustomerGroup {
    #[serde(rename = "_id")]
    pub customer: String,
    pub count: usize,
    pub orders: Vec<OrderView>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_count: i64,
    pub total_value: f64,
    pub total_quantity: f64,
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TodayTotals {
    pub total_count: i64,
    pub total_value: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CustomerQty {
    pub name: String,
    pub qty: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TrendPoint {
    pub name: String,
    pub orders: i64,
    pub value: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub pending: Totals,
    pub dispatched: Totals,
    pub today: TodayTotals,
    pub top_dispatched_by_qty: Vec<CustomerQty>,
    pub top_pending_by_qty: Vec<CustomerQty>,
    pub recent_upload_logs: Vec<UploadLogEntry>,
    pub trend: Vec<TrendPoint>,
    pub range_used: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    range: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    q: Option<String>,
    customer: Option<String>,
    po_number: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuery {
    customer: Option<String>,
    part: Option<String>,
    due_today: Option<String>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Number of trend buckets for a dashboard range.
fn trend_limit(range: &str) -> i64 {
    match range {
        "1D" => 1,
        "1W" => 7,
        "6M" => 180,
        "1Y" => 365,
        _ => 30,
    }
}

/// Case-insensitive substring pattern for ILIKE, with wildcards escaped.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn label_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

/// Group rows by customer, keeping row order inside each group. Groups are
/// sorted by size, largest first; ties keep first-seen order.
fn group_by_customer(orders: Vec<OrderView>) -> Vec<CustomerGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<CustomerGroup> = Vec::new();

    for order in orders {
        let slot = *index.entry(order.customer_name.clone()).or_insert_with(|| {
            groups.push(CustomerGroup {
                customer: order.customer_name.clone(),
                count: 0,
                orders: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].count += 1;
        groups[slot].orders.push(order);
    }

    groups.sort_by(|a, b| b.count.cmp(&a.count));
    groups
}

fn push_search_filters(qb: &mut QueryBuilder<'_, Postgres>, params: &SearchQuery) {
    qb.push(" WHERE TRUE");

    if let Some(q) = non_empty(&params.q) {
        let pattern = like_pattern(q);
        qb.push(" AND (");
        let mut first = true;
        for column in [
            "po_number",
            "so_number",
            "product_code",
            "part_number",
            "customer_name",
            "line_item_number",
        ] {
            if !first {
                qb.push(" OR ");
            }
            first = false;
            qb.push(column).push(" ILIKE ").push_bind(pattern.clone());
        }
        qb.push(")");
    }
    if let Some(customer) = non_empty(&params.customer) {
        qb.push(" AND customer_name ILIKE ").push_bind(like_pattern(customer));
    }
    if let Some(po) = non_empty(&params.po_number) {
        qb.push(" AND po_number ILIKE ").push_bind(like_pattern(po));
    }
    // Dates are stored as text; comparison is lexical.
    if let Some(start) = non_empty(&params.start_date) {
        qb.push(" AND order_date >= ").push_bind(start.to_string());
    }
    if let Some(end) = non_empty(&params.end_date) {
        qb.push(" AND order_date <= ").push_bind(end.to_string());
    }
}

fn search_query<'a>(kind: IngestKind, params: &SearchQuery) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {} FROM {}", VIEW_COLUMNS, table_for(kind)));
    push_search_filters(&mut qb, params);
    qb.push(" ORDER BY id LIMIT ").push_bind(SEARCH_LIMIT);
    qb
}

fn pending_query<'a>(params: &PendingQuery, today: &str) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "SELECT {} FROM {} WHERE TRUE",
        VIEW_COLUMNS,
        table_for(IngestKind::Pending)
    ));
    if let Some(customer) = non_empty(&params.customer) {
        qb.push(" AND customer_name ILIKE ").push_bind(like_pattern(customer));
    }
    if let Some(part) = non_empty(&params.part) {
        let pattern = like_pattern(part);
        qb.push(" AND (part_number ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR product_code ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if params.due_today.as_deref() == Some("true") {
        qb.push(" AND expected_delivery_date ILIKE ").push_bind(like_pattern(today));
    }
    qb.push(" ORDER BY expected_delivery_date ASC, id ASC");
    qb
}

// ============================================================================
// Stats queries
// ============================================================================

async fn totals(pool: &PgPool, kind: IngestKind) -> Result<Totals, sqlx::Error> {
    let qty = match kind {
        IngestKind::Pending => "pending_quantity",
        IngestKind::Dispatched => "dispatch_quantity",
    };
    let (total_count, total_value, total_quantity): (i64, f64, f64) = sqlx::query_as(&format!(
        "SELECT COUNT(*), COALESCE(SUM({qty} * rate), 0)::float8, COALESCE(SUM({qty}), 0)::float8 FROM {}",
        table_for(kind)
    ))
    .fetch_one(pool)
    .await?;

    Ok(Totals {
        total_count,
        total_value,
        total_quantity,
    })
}

async fn today_totals(pool: &PgPool, since: DateTime<Utc>) -> Result<TodayTotals, sqlx::Error> {
    let (total_count, total_value): (i64, f64) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COALESCE(SUM(dispatch_quantity * rate), 0)::float8
        FROM dispatched_orders
        WHERE created_at >= $1 OR updated_at >= $1
        "#,
    )
    .bind(since)
    .fetch_one(pool)
    .await?;

    Ok(TodayTotals {
        total_count,
        total_value,
    })
}

async fn top_customers(pool: &PgPool, kind: IngestKind) -> Result<Vec<CustomerQty>, sqlx::Error> {
    let qty = match kind {
        IngestKind::Pending => "pending_quantity",
        IngestKind::Dispatched => "dispatch_quantity",
    };
    let rows: Vec<(String, f64)> = sqlx::query_as(&format!(
        "SELECT customer_name, COALESCE(SUM({qty}), 0)::float8 AS total_qty FROM {} \
         GROUP BY customer_name ORDER BY total_qty DESC LIMIT $1",
        table_for(kind)
    ))
    .bind(TOP_CUSTOMERS)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, qty)| CustomerQty {
            name: label_or(name, "Unknown"),
            qty,
        })
        .collect())
}

async fn recent_upload_logs(pool: &PgPool) -> Result<Vec<UploadLogEntry>, sqlx::Error> {
    let rows: Vec<(DateTime<Utc>, f64, String, String)> = sqlx::query_as(
        "SELECT upload_date, total_items, file_name, batch_id FROM upload_logs ORDER BY upload_date DESC LIMIT $1",
    )
    .bind(RECENT_UPLOAD_LOGS)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(upload_date, total_items, file_name, batch_id)| UploadLogEntry {
            upload_date,
            total_items,
            file_name,
            batch_id,
        })
        .collect())
}

async fn dispatch_trend(pool: &PgPool, limit: i64) -> Result<Vec<TrendPoint>, sqlx::Error> {
    let rows: Vec<(String, i64, f64)> = sqlx::query_as(
        r#"
        SELECT dispatch_date, COUNT(*), COALESCE(SUM(dispatch_quantity * rate), 0)::float8
        FROM dispatched_orders
        GROUP BY dispatch_date
        ORDER BY dispatch_date DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    // Latest N buckets, oldest first.
    Ok(rows
        .into_iter()
        .rev()
        .map(|(date, orders, value)| TrendPoint {
            name: label_or(date, "N/A"),
            orders,
            value,
        })
        .collect())
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let pool = &state.pool;
    let range = params.range.unwrap_or_else(|| DEFAULT_RANGE.to_string());
    let since = start_of_day(Utc::now());

    let (pending, dispatched, today, top_dispatched_by_qty, top_pending_by_qty, recent_upload_logs, trend) =
        tokio::try_join!(
            totals(pool, IngestKind::Pending),
            totals(pool, IngestKind::Dispatched),
            today_totals(pool, since),
            top_customers(pool, IngestKind::Dispatched),
            top_customers(pool, IngestKind::Pending),
            recent_upload_logs(pool),
            dispatch_trend(pool, trend_limit(&range)),
        )
        .map_err(ApiError::database("Failed to generate analytics"))?;

    Ok(Json(StatsResponse {
        pending,
        dispatched,
        today,
        top_dispatched_by_qty,
        top_pending_by_qty,
        recent_upload_logs,
        trend,
        range_used: range,
    }))
}

pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    let mut pending_q = search_query(IngestKind::Pending, &params);
    let mut history_q = search_query(IngestKind::Dispatched, &params);

    let (pending, history): (Vec<OrderView>, Vec<OrderView>) = tokio::try_join!(
        pending_q.build_query_as::<OrderView>().fetch_all(&state.pool),
        history_q.build_query_as::<OrderView>().fetch_all(&state.pool),
    )
    .map_err(ApiError::database("Search failed"))?;

    let hits = pending
        .into_iter()
        .map(|mut order| {
            order.status = "Pending".to_string();
            SearchHit {
                order,
                source: "PENDING",
            }
        })
        .chain(history.into_iter().map(|mut order| {
            order.status = "Dispatched".to_string();
            SearchHit {
                order,
                source: "HISTORY",
            }
        }))
        .collect();

    Ok(Json(hits))
}

pub async fn all_orders_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<CustomerGroup>>, ApiError> {
    let orders: Vec<OrderView> = sqlx::query_as(&format!(
        "SELECT {} FROM {} ORDER BY created_at DESC, id DESC LIMIT $1",
        VIEW_COLUMNS,
        table_for(IngestKind::Dispatched)
    ))
    .bind(RECENT_DISPATCHED)
    .fetch_all(&state.pool)
    .await
    .map_err(ApiError::database("Failed to fetch orders"))?;

    Ok(Json(group_by_customer(orders)))
}

pub async fn pending_orders_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PendingQuery>,
) -> Result<Json<Vec<CustomerGroup>>, ApiError> {
    let today = Utc::now().format("%Y-%m-%d").to_string();
    let mut qb = pending_query(&params, &today);

    let orders: Vec<OrderView> = qb
        .build_query_as()
        .fetch_all(&state.pool)
        .await
        .map_err(ApiError::database("Failed to fetch pending orders"))?;

    Ok(Json(group_by_customer(orders)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn view(id: i64, customer: &str) -> OrderView {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        OrderView {
            id,
            po_number: format!("PO{id}"),
            so_number: String::new(),
            order_number: String::new(),
            line_item_number: String::new(),
            product_code: String::new(),
            part_number: String::new(),
            size: String::new(),
            drawing_number: String::new(),
            customer_name: customer.to_string(),
            customer_code: String::new(),
            quantity: 0.0,
            dispatch_quantity: 0.0,
            pending_quantity: 0.0,
            gross_weight: 0.0,
            charge_weight: 0.0,
            rate: 0.0,
            order_date: String::new(),
            dispatch_date: String::new(),
            expected_delivery_date: String::new(),
            so_date: String::new(),
            pack_slip_date: String::new(),
            invoice_date: String::new(),
            invoice_number: String::new(),
            truck_number: String::new(),
            transport: String::new(),
            department_remark: String::new(),
            so_special_remark: String::new(),
            die_indent: String::new(),
            status: "Pending".to_string(),
            row_signature: format!("sha256:{id}"),
            raw: serde_json::json!({}),
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn test_trend_limit() {
        assert_eq!(trend_limit("1D"), 1);
        assert_eq!(trend_limit("1W"), 7);
        assert_eq!(trend_limit("1M"), 30);
        assert_eq!(trend_limit("6M"), 180);
        assert_eq!(trend_limit("1Y"), 365);
        assert_eq!(trend_limit("bogus"), 30);
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("abc"), "%abc%");
        assert_eq!(like_pattern("10%_x"), "%10\\%\\_x%");
    }

    #[test]
    fn test_labels_for_blank_groups() {
        assert_eq!(label_or(String::new(), "Unknown"), "Unknown");
        assert_eq!(label_or("  ".into(), "N/A"), "N/A");
        assert_eq!(label_or("ACME".into(), "Unknown"), "ACME");
    }

    #[test]
    fn test_start_of_day() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 17, 45, 12).unwrap();
        assert_eq!(start_of_day(now), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_group_by_customer() {
        let groups = group_by_customer(vec![
            view(1, "Beta"),
            view(2, "Acme"),
            view(3, "Acme"),
            view(4, "Gamma"),
            view(5, "Acme"),
        ]);

        let summary: Vec<(&str, usize)> = groups.iter().map(|g| (g.customer.as_str(), g.count)).collect();
        assert_eq!(summary, vec![("Acme", 3), ("Beta", 1), ("Gamma", 1)]);
        let acme_ids: Vec<i64> = groups[0].orders.iter().map(|o| o.id).collect();
        assert_eq!(acme_ids, vec![2, 3, 5]);
    }

    #[test]
    fn test_group_json_shape() {
        let groups = group_by_customer(vec![view(1, "Acme")]);
        let json = serde_json::to_value(&groups).unwrap();
        assert_eq!(json[0]["_id"], "Acme");
        assert_eq!(json[0]["count"], 1);
        assert_eq!(json[0]["orders"][0]["poNumber"], "PO1");
    }

    #[test]
    fn test_search_hit_is_tagged() {
        let hit = SearchHit {
            order: view(1, "Acme"),
            source: "HISTORY",
        };
        let json = serde_json::to_value(&hit).unwrap();
        assert_eq!(json["source"], "HISTORY");
        assert_eq!(json["customerName"], "Acme");
    }

    #[test]
    fn test_search_filters_sql() {
        let params = SearchQuery {
            q: Some("4500".into()),
            customer: Some("acme".into()),
            po_number: None,
            start_date: Some("2024-01-01".into()),
            end_date: Some("  ".into()),
        };
        let qb = search_query(IngestKind::Dispatched, &params);
        let sql = qb.sql();
        assert!(sql.starts_with("SELECT id, po_number"));
        assert!(sql.contains("FROM dispatched_orders WHERE TRUE AND (po_number ILIKE $1 OR so_number ILIKE $2"));
        assert!(sql.contains("line_item_number ILIKE $6)"));
        assert!(sql.contains("AND customer_name ILIKE $7"));
        assert!(sql.contains("AND order_date >= $8"));
        assert!(!sql.contains("order_date <="));
        assert!(sql.ends_with("ORDER BY id LIMIT $9"));
    }

    #[test]
    fn test_search_without_filters() {
        let qb = search_query(IngestKind::Pending, &SearchQuery::default());
        assert!(qb.sql().contains("FROM pending_orders WHERE TRUE ORDER BY id LIMIT $1"));
    }

    #[test]
    fn test_pending_filters_sql() {
        let params = PendingQuery {
            customer: None,
            part: Some("PC-1".into()),
            due_today: Some("true".into()),
        };
        let qb = pending_query(&params, "2024-05-01");
        let sql = qb.sql();
        assert!(sql.contains("AND (part_number ILIKE $1 OR product_code ILIKE $2)"));
        assert!(sql.contains("AND expected_delivery_date ILIKE $3"));
        assert!(sql.ends_with("ORDER BY expected_delivery_date ASC, id ASC"));

        let qb = pending_query(&PendingQuery::default(), "2024-05-01");
        assert!(!qb.sql().contains("ILIKE"));
    }
}
