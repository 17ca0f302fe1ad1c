//! PostgreSQL backend.

use super::{OrderStore, PendingCandidate, StoreError};
use crate::record::{IngestKind, MatchKey, OrderRecord, UploadLogEntry};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

/// Columns written by an upsert, in bind order.
const ORDER_COLUMNS: &[&str] = &[
    "po_number",
    "so_number",
    "order_number",
    "line_item_number",
    "product_code",
    "part_number",
    "size",
    "drawing_number",
    "customer_name",
    "customer_code",
    "quantity",
    "dispatch_quantity",
    "pending_quantity",
    "gross_weight",
    "charge_weight",
    "rate",
    "order_date",
    "dispatch_date",
    "expected_delivery_date",
    "so_date",
    "pack_slip_date",
    "invoice_date",
    "invoice_number",
    "truck_number",
    "transport",
    "department_remark",
    "so_special_remark",
    "die_indent",
    "status",
    "row_signature",
    "raw",
];

/// PostgreSQL caps a statement at 65535 bind parameters.
pub const MAX_ROWS_PER_STATEMENT: usize = 65535 / ORDER_COLUMNS.len();

const LEGACY_PENDING_CONSTRAINT: &str = "pending_orders_po_product_so_size_line_key";

fn order_table_ddl(table: &str, default_status: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id BIGSERIAL PRIMARY KEY,
    po_number TEXT NOT NULL DEFAULT '',
    so_number TEXT NOT NULL DEFAULT '',
    order_number TEXT NOT NULL DEFAULT '',
    line_item_number TEXT NOT NULL DEFAULT '',
    product_code TEXT NOT NULL DEFAULT '',
    part_number TEXT NOT NULL DEFAULT '',
    size TEXT NOT NULL DEFAULT '',
    drawing_number TEXT NOT NULL DEFAULT '',
    customer_name TEXT NOT NULL DEFAULT '',
    customer_code TEXT NOT NULL DEFAULT '',
    quantity DOUBLE PRECISION NOT NULL DEFAULT 0,
    dispatch_quantity DOUBLE PRECISION NOT NULL DEFAULT 0,
    pending_quantity DOUBLE PRECISION NOT NULL DEFAULT 0,
    gross_weight DOUBLE PRECISION NOT NULL DEFAULT 0,
    charge_weight DOUBLE PRECISION NOT NULL DEFAULT 0,
    rate DOUBLE PRECISION NOT NULL DEFAULT 0,
    order_date TEXT NOT NULL DEFAULT '',
    dispatch_date TEXT NOT NULL DEFAULT '',
    expected_delivery_date TEXT NOT NULL DEFAULT '',
    so_date TEXT NOT NULL DEFAULT '',
    pack_slip_date TEXT NOT NULL DEFAULT '',
    invoice_date TEXT NOT NULL DEFAULT '',
    invoice_number TEXT NOT NULL DEFAULT '',
    truck_number TEXT NOT NULL DEFAULT '',
    transport TEXT NOT NULL DEFAULT '',
    department_remark TEXT NOT NULL DEFAULT '',
    so_special_remark TEXT NOT NULL DEFAULT '',
    die_indent TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT '{default_status}',
    row_signature TEXT NOT NULL UNIQUE,
    raw JSONB NOT NULL DEFAULT '{{}}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS {table}_customer_idx ON {table} (customer_name);
CREATE INDEX IF NOT EXISTS {table}_created_idx ON {table} (created_at DESC);
"#
    )
}

const SUPPORT_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS pending_orders_match_idx
    ON pending_orders (po_number, product_code, size);

CREATE TABLE IF NOT EXISTS upload_logs (
    id BIGSERIAL PRIMARY KEY,
    upload_date TIMESTAMPTZ NOT NULL DEFAULT now(),
    total_items DOUBLE PRECISION NOT NULL,
    file_name TEXT NOT NULL DEFAULT '',
    batch_id TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS upload_logs_date_idx ON upload_logs (upload_date DESC);
"#;

fn schema() -> String {
    let mut ddl = order_table_ddl("pending_orders", "Pending");
    ddl.push_str(&order_table_ddl("dispatched_orders", "Dispatched"));
    ddl.push_str(SUPPORT_SCHEMA);
    ddl
}

pub fn table_for(kind: IngestKind) -> &'static str {
    match kind {
        IngestKind::Pending => "pending_orders",
        IngestKind::Dispatched => "dispatched_orders",
    }
}

fn upsert_prefix(kind: IngestKind) -> String {
    format!("INSERT INTO {} ({}) ", table_for(kind), ORDER_COLUMNS.join(", "))
}

fn upsert_suffix() -> String {
    let assignments: Vec<String> = ORDER_COLUMNS
        .iter()
        .filter(|c| **c != "row_signature")
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    format!(
        " ON CONFLICT (row_signature) DO UPDATE SET {}, updated_at = now()",
        assignments.join(", ")
    )
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(&schema()).execute(&self.pool).await?;
        info!("Schema ready");
        Ok(())
    }

    async fn upsert_rows(&self, kind: IngestKind, records: &[OrderRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        for batch in records.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(upsert_prefix(kind));
            qb.push_values(batch, |mut b, r| {
                b.push_bind(&r.po_number)
                    .push_bind(&r.so_number)
                    .push_bind(&r.order_number)
                    .push_bind(&r.line_item_number)
                    .push_bind(&r.product_code)
                    .push_bind(&r.part_number)
                    .push_bind(&r.size)
                    .push_bind(&r.drawing_number)
                    .push_bind(&r.customer_name)
                    .push_bind(&r.customer_code)
                    .push_bind(r.quantity)
                    .push_bind(r.dispatch_quantity)
                    .push_bind(r.pending_quantity)
                    .push_bind(r.gross_weight)
                    .push_bind(r.charge_weight)
                    .push_bind(r.rate)
                    .push_bind(&r.order_date)
                    .push_bind(&r.dispatch_date)
                    .push_bind(&r.expected_delivery_date)
                    .push_bind(&r.so_date)
                    .push_bind(&r.pack_slip_date)
                    .push_bind(&r.invoice_date)
                    .push_bind(&r.invoice_number)
                    .push_bind(&r.truck_number)
                    .push_bind(&r.transport)
                    .push_bind(&r.department_remark)
                    .push_bind(&r.so_special_remark)
                    .push_bind(&r.die_indent)
                    .push_bind(r.status.as_str())
                    .push_bind(&r.row_signature)
                    .push_bind(Json(&r.raw));
            });
            qb.push(upsert_suffix());

            let result = qb.build().execute(&self.pool).await?;
            written += result.rows_affected();
        }

        debug!("Upserted {} rows into {}", written, table_for(kind));
        Ok(written)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn upsert_many(&self, kind: IngestKind, records: &[OrderRecord]) -> Result<u64, StoreError> {
        self.upsert_rows(kind, records).await
    }

    async fn upsert_one(&self, kind: IngestKind, record: &OrderRecord) -> Result<(), StoreError> {
        self.upsert_rows(kind, std::slice::from_ref(record)).await?;
        Ok(())
    }

    async fn find_pending_candidates(
        &self,
        po_numbers: &[String],
        product_codes: &[String],
    ) -> Result<Vec<PendingCandidate>, StoreError> {
        if po_numbers.is_empty() || product_codes.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(i64, String, String, String, f64)> = sqlx::query_as(
            r#"
            SELECT id, po_number, product_code, size, pending_quantity
            FROM pending_orders
            WHERE po_number = ANY($1) AND product_code = ANY($2)
            ORDER BY id
            "#,
        )
        .bind(po_numbers)
        .bind(product_codes)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, po_number, product_code, size, pending_quantity)| PendingCandidate {
                id,
                key: MatchKey {
                    po_number,
                    product_code,
                    size,
                },
                pending_quantity,
            })
            .collect())
    }

    async fn delete_pending(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM pending_orders WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_pending_quantities(&self, updates: &[(i64, f64)]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let (ids, quantities): (Vec<i64>, Vec<f64>) = updates.iter().copied().unzip();

        sqlx::query(
            r#"
            UPDATE pending_orders AS p
            SET pending_quantity = u.qty, updated_at = now()
            FROM UNNEST($1::BIGINT[], $2::DOUBLE PRECISION[]) AS u(id, qty)
            WHERE p.id = u.id
            "#,
        )
        .bind(&ids)
        .bind(&quantities)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_upload_log(&self, entry: &UploadLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO upload_logs (upload_date, total_items, file_name, batch_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.upload_date)
        .bind(entry.total_items)
        .bind(&entry.file_name)
        .bind(&entry.batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_legacy_pending_constraint(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "ALTER TABLE pending_orders DROP CONSTRAINT IF EXISTS {LEGACY_PENDING_CONSTRAINT}"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!("DROP INDEX IF EXISTS {LEGACY_PENDING_CONSTRAINT}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
