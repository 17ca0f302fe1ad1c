use std::env;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_MAX_FILES: usize = 10;
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Rows per batch handed to the writer and the reconciliation engine.
    pub chunk_size: usize,
    /// Files accepted in one request.
    pub max_files: usize,
    /// Files of one request processed at the same time.
    pub max_concurrent_files: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_files: DEFAULT_MAX_FILES,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            chunk_size: env_usize("INGEST_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            max_files: env_usize("INGEST_MAX_FILES", DEFAULT_MAX_FILES),
            max_concurrent_files: env_usize("INGEST_MAX_CONCURRENT_FILES", DEFAULT_MAX_CONCURRENT_FILES),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.max_files, 10);
    }

    #[test]
    fn test_chunk_size_floor() {
        assert_eq!(IngestConfig::default().with_chunk_size(0).chunk_size, 1);
    }

    #[test]
    fn test_env_usize_fallbacks() {
        assert_eq!(env_usize("INGEST_TEST_UNSET_VARIABLE", 7), 7);
    }
}
