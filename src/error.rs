//! Typed errors for the refinery pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match
//! on the failure kind. The worker runtime never propagates an error across
//! a stage boundary; it classifies with [`RefineryError::is_transient`] and
//! either retries or records a terminal `error` state on the document.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while running the pipeline.
#[derive(Debug, Error)]
pub enum RefineryError {
    /// HTTP request completed with a non-success status
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    /// HTTP transport failure (connect, timeout, body read)
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Relational store failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Blob store failure
    #[error("blob store error: {0}")]
    Blob(String),

    /// Embedding service failure
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Embedding came back with the wrong dimension
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    EmbeddingDim { expected: usize, got: usize },

    /// Reasoning service failure
    #[error("reasoning error: {0}")]
    Reasoning(String),

    /// Job payload is not a valid identifier or references a deleted row
    #[error("poison job: {0}")]
    PoisonJob(String),

    /// Document row missing for an id the pipeline was handed
    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    /// Crawl request row missing
    #[error("crawl request not found: {0}")]
    CrawlRequestNotFound(Uuid),

    /// Response content type the pipeline cannot extract text from
    #[error("unsupported content type: {0}")]
    UnsupportedMime(String),

    /// Extracted text is too short to be a document
    #[error("extracted text too short ({0} chars)")]
    EmptyDocument(usize),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl RefineryError {
    /// Whether the failure is worth a local retry.
    ///
    /// Transient: network-level HTTP failures, 5xx responses, and
    /// connection-class database errors. Everything else is permanent for
    /// the current job.
    pub fn is_transient(&self) -> bool {
        match self {
            RefineryError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            RefineryError::HttpStatus { status, .. } => *status >= 500,
            RefineryError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
            ),
            _ => false,
        }
    }

    /// Whether the job payload itself is bad and must be discarded
    /// without touching any document row.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            RefineryError::PoisonJob(_)
                | RefineryError::DocumentNotFound(_)
                | RefineryError::CrawlRequestNotFound(_)
        )
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, RefineryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = RefineryError::HttpStatus {
            url: "https://example.com".into(),
            status: 503,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = RefineryError::HttpStatus {
            url: "https://example.com".into(),
            status: 404,
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn poison_errors_are_not_transient() {
        let err = RefineryError::PoisonJob("not-a-uuid".into());
        assert!(err.is_poison());
        assert!(!err.is_transient());
    }

    #[test]
    fn dimension_mismatch_is_permanent() {
        let err = RefineryError::EmbeddingDim {
            expected: 768,
            got: 384,
        };
        assert!(!err.is_transient());
    }
}
