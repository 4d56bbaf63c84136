//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RefineryError, Result};

/// Pipeline configuration.
///
/// Every tunable the stages consume lives here; stage structs copy the
/// values they need at construction so workers carry no hidden globals.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub blob_root: PathBuf,
    pub ollama_base_url: String,
    pub embedding_model: String,
    pub reasoning_model: String,

    pub queue_pop_timeout_seconds: u64,
    pub relevance_gate_threshold: f64,
    pub chunk_size_chars: usize,
    pub chunk_overlap_chars: usize,
    pub embedding_dim: usize,
    pub max_crawl_depth: i32,
    pub db_pool_min: u32,
    pub db_pool_max: u32,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub http_timeout_s: u64,
    pub embedding_timeout_s: u64,
    pub reasoning_timeout_s: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| RefineryError::Config("DATABASE_URL must be set".into()))?,
            blob_root: env::var("BLOB_ROOT")
                .unwrap_or_else(|_| "./blobs".to_string())
                .into(),
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            reasoning_model: env::var("REASONING_MODEL").unwrap_or_else(|_| "llama3".to_string()),

            queue_pop_timeout_seconds: parse_env("QUEUE_POP_TIMEOUT_SECONDS", 5),
            relevance_gate_threshold: parse_env("RELEVANCE_GATE_THRESHOLD", 0.3),
            chunk_size_chars: parse_env("CHUNK_SIZE_CHARS", 500),
            chunk_overlap_chars: parse_env("CHUNK_OVERLAP_CHARS", 50),
            embedding_dim: parse_env("EMBEDDING_DIM", 768),
            max_crawl_depth: parse_env("MAX_CRAWL_DEPTH", 1),
            db_pool_min: parse_env("DB_POOL_MIN", 1),
            db_pool_max: parse_env("DB_POOL_MAX", 5),
            retry_attempts: parse_env("RETRY_ATTEMPTS", 2),
            retry_backoff_ms: parse_env("RETRY_BACKOFF_MS", 500),
            http_timeout_s: parse_env("HTTP_TIMEOUT_S", 30),
            embedding_timeout_s: parse_env("EMBEDDING_TIMEOUT_S", 120),
            reasoning_timeout_s: parse_env("REASONING_TIMEOUT_S", 300),
        })
    }

    /// Blocking-pop timeout for queue consumers.
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_pop_timeout_seconds)
    }

    /// Backoff between database retry attempts.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_on_missing_or_garbage() {
        assert_eq!(parse_env::<usize>("REFINERY_TEST_UNSET_VAR", 500), 500);
        std::env::set_var("REFINERY_TEST_GARBAGE_VAR", "not-a-number");
        assert_eq!(parse_env::<u64>("REFINERY_TEST_GARBAGE_VAR", 7), 7);
        std::env::remove_var("REFINERY_TEST_GARBAGE_VAR");
    }
}
