//! Document and crawl-request types.
//!
//! A document is a single ingested source moving through the pipeline.
//! Its `stage` column in the relational store is the authoritative record
//! of progress; queue messages are only a hand-off mechanism.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::extraction::DocumentCategory;

/// Processing stages a document moves through (stable enum values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Pending,
    Chunking,
    Embedding,
    Evaluating,
    Extracting,
    Resolving,
    Complete,
    Error,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Pending => "pending",
            ProcessingStage::Chunking => "chunking",
            ProcessingStage::Embedding => "embedding",
            ProcessingStage::Evaluating => "evaluating",
            ProcessingStage::Extracting => "extracting",
            ProcessingStage::Resolving => "resolving",
            ProcessingStage::Complete => "complete",
            ProcessingStage::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStage::Pending),
            "chunking" => Some(ProcessingStage::Chunking),
            "embedding" => Some(ProcessingStage::Embedding),
            "evaluating" => Some(ProcessingStage::Evaluating),
            "extracting" => Some(ProcessingStage::Extracting),
            "resolving" => Some(ProcessingStage::Resolving),
            "complete" => Some(ProcessingStage::Complete),
            "error" => Some(ProcessingStage::Error),
            _ => None,
        }
    }

    /// The queue a worker for this stage consumes from.
    ///
    /// Terminal stages have no queue.
    pub fn queue(&self) -> Option<&'static str> {
        match self {
            ProcessingStage::Chunking => Some(crate::traits::queue::queues::CHUNK),
            ProcessingStage::Embedding => Some(crate::traits::queue::queues::EMBED),
            ProcessingStage::Evaluating => Some(crate::traits::queue::queues::EVALUATE),
            ProcessingStage::Extracting => Some(crate::traits::queue::queues::EXTRACT),
            ProcessingStage::Resolving => Some(crate::traits::queue::queues::RESOLVE),
            _ => None,
        }
    }

    /// Whether a document in this stage is done moving.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStage::Complete | ProcessingStage::Error)
    }
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ingested source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub source_url: Option<String>,
    /// SHA-256 of the extracted text, unique across documents
    pub content_hash: String,
    pub mime_type: String,
    /// Location of the raw text in the blob store
    pub blob_location: String,
    pub stage: ProcessingStage,
    pub error_message: Option<String>,
    pub chunk_count: i32,
    pub confidence_score: Option<f64>,
    pub category: Option<DocumentCategory>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a new document in the given stage.
    pub fn new(
        title: impl Into<String>,
        content_hash: impl Into<String>,
        mime_type: impl Into<String>,
        blob_location: impl Into<String>,
        stage: ProcessingStage,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            source_url: None,
            content_hash: content_hash.into(),
            mime_type: mime_type.into(),
            blob_location: blob_location.into(),
            stage,
            error_message: None,
            chunk_count: 0,
            confidence_score: None,
            category: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the source URL.
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }
}

/// SHA-256 hex digest of document text, used for ingest deduplication.
pub fn hash_content(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lifecycle of a crawl request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Pending => "pending",
            CrawlStatus::Active => "active",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CrawlStatus::Pending),
            "active" => Some(CrawlStatus::Active),
            "completed" => Some(CrawlStatus::Completed),
            "failed" => Some(CrawlStatus::Failed),
            _ => None,
        }
    }
}

/// A URL queued for crawling. Unique on URL; completed and failed rows
/// remain for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub id: Uuid,
    pub url: String,
    pub status: CrawlStatus,
    pub depth: i32,
    pub max_depth: i32,
    pub parent_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlRequest {
    /// Create a pending request at depth zero.
    pub fn new(url: impl Into<String>, max_depth: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            status: CrawlStatus::Pending,
            depth: 0,
            max_depth,
            parent_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a child request for a discovered link.
    pub fn child(&self, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            status: CrawlStatus::Pending,
            depth: self.depth + 1,
            max_depth: self.max_depth,
            parent_url: Some(self.url.clone()),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256_hex() {
        let hash = hash_content("P0301: cylinder 1 misfire");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_content("P0301: cylinder 1 misfire"));
        assert_ne!(hash, hash_content("P0302: cylinder 2 misfire"));
    }

    #[test]
    fn stage_round_trips_through_strings() {
        for stage in [
            ProcessingStage::Pending,
            ProcessingStage::Chunking,
            ProcessingStage::Embedding,
            ProcessingStage::Evaluating,
            ProcessingStage::Extracting,
            ProcessingStage::Resolving,
            ProcessingStage::Complete,
            ProcessingStage::Error,
        ] {
            assert_eq!(ProcessingStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(ProcessingStage::parse("chewing"), None);
    }

    #[test]
    fn child_request_inherits_depth_budget() {
        let parent = CrawlRequest::new("https://example.com/", 2);
        let child = parent.child("https://example.com/p0301");
        assert_eq!(child.depth, 1);
        assert_eq!(child.max_depth, 2);
        assert_eq!(child.parent_url.as_deref(), Some("https://example.com/"));
    }
}
