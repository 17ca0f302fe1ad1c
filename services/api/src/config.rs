use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_UPLOAD_DIR: &str = "./data/uploads";
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub db_url: String,
    pub bind: String,
    /// Where uploads are spooled while they are ingested.
    pub upload_dir: PathBuf,
    pub upload_timeout: Duration,
    pub max_upload_bytes: usize,
    pub db_max_connections: u32,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
        Ok(Self {
            db_url,
            bind: std::env::var("API_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string()),
            upload_dir: std::env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            upload_timeout: Duration::from_secs(env_parse("UPLOAD_TIMEOUT_SECS", DEFAULT_UPLOAD_TIMEOUT_SECS)),
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
        })
    }
}
