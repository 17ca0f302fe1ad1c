//! API Service - Order upload and dashboard API
//!
//! Endpoints:
//! - GET  /health            - Health check
//! - POST /upload/pending    - Ingest open-order files (multipart field `file`)
//! - POST /upload/dispatched - Ingest dispatch files and reconcile pending orders
//! - GET  /orders/stats      - Dashboard KPIs and trend
//! - GET  /orders/search     - Search both collections
//! - GET  /orders/all        - Recent dispatched orders by customer
//! - GET  /orders/pending    - Open orders by customer

mod config;
mod error;
mod orders;
mod upload;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use config::ApiConfig;
use ingest::{IngestConfig, Ingestor, PgOrderStore};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// State
// ============================================================================

pub struct AppState {
    pub pool: PgPool,
    pub ingestor: Ingestor,
    pub config: ApiConfig,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn router(state: Arc<AppState>) -> Router {
    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let uploads = Router::new()
        .route("/upload/pending", post(upload::upload_pending))
        .route("/upload/dispatched", post(upload::upload_dispatched))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes));

    Router::new()
        .route("/health", get(health_handler))
        .route("/orders/stats", get(orders::stats_handler))
        .route("/orders/search", get(orders::search_handler))
        .route("/orders/all", get(orders::all_orders_handler))
        .route("/orders/pending", get(orders::pending_orders_handler))
        .merge(uploads)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ApiConfig::from_env()?;

    info!("Connecting to database...");
    let store = PgOrderStore::connect(&config.db_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    store.ensure_schema().await.context("Failed to prepare schema")?;
    info!("Database connected");

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("Failed to create upload dir {}", config.upload_dir.display()))?;

    let pool = store.pool().clone();
    let ingestor = Ingestor::new(Arc::new(store), IngestConfig::from_env());
    let bind = config.bind.clone();
    let state = Arc::new(AppState { pool, ingestor, config });

    let app = router(state);

    info!("API listening on http://{}", bind);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
