//! Ingest CLI - Loads local order files through the ingestion pipeline
//!
//! Usage:
//!   ingest --kind pending open-orders.xlsx
//!   ingest --kind dispatched --dry-run shipped-1.csv shipped-2.csv
//!
//! Writes to PostgreSQL (`DB_URL`) unless `--dry-run` is given, in which case
//! an in-memory store is used and nothing is persisted.

use anyhow::{Context, Result};
use clap::Parser;
use ingest::{IngestConfig, IngestKind, Ingestor, MemoryStore, OrderStore, PgOrderStore, UploadedFile};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Ingests pending or dispatched order files")]
struct Args {
    /// Ingestion type: pending or dispatched
    #[arg(long)]
    kind: IngestKind,

    /// Dry run - use an in-memory store, don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Files to ingest (.csv, .txt, .xlsx, .xlsm, .xlsb, .xls, .ods)
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn uploaded(path: PathBuf) -> UploadedFile {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    UploadedFile::new(file_name, path)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = IngestConfig::from_env();

    info!(
        "Mode: {}, kind: {}, chunk size: {}",
        if args.dry_run { "dry-run" } else { "live" },
        args.kind,
        config.chunk_size
    );

    let store: Arc<dyn OrderStore> = if args.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let store = PgOrderStore::connect(&db_url, max_connections)
            .await
            .context("Failed to connect to database")?;
        store.ensure_schema().await.context("Failed to prepare schema")?;
        Arc::new(store)
    };

    let ingestor = Ingestor::new(store, config);
    let files = args.files.into_iter().map(uploaded).collect();
    let summary = ingestor
        .ingest_files(files, args.kind)
        .await
        .context("Ingestion failed")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
