//! Direct text ingestion: the non-crawl entry point into the pipeline.

use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::traits::blob::BlobStore;
use crate::traits::queue::{queues, JobQueue};
use crate::traits::store::PipelineStore;
use crate::types::document::{hash_content, Document, ProcessingStage};

/// Result of a direct ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new document was created and queued for chunking.
    Created(Uuid),
    /// The same content hash already exists; nothing was written.
    Duplicate(Uuid),
}

impl IngestOutcome {
    pub fn document_id(&self) -> Uuid {
        match self {
            IngestOutcome::Created(id) | IngestOutcome::Duplicate(id) => *id,
        }
    }
}

/// Ingest raw text: dedup by content hash, store the blob, create the
/// document in stage `chunking`, and enqueue it.
pub async fn ingest_text<S, B, Q>(
    store: &S,
    blob: &B,
    queue: &Q,
    title: Option<&str>,
    source_url: Option<&str>,
    text: &str,
) -> Result<IngestOutcome>
where
    S: PipelineStore,
    B: BlobStore,
    Q: JobQueue,
{
    let content_hash = hash_content(text);
    if let Some(existing) = store.find_document_by_hash(&content_hash).await? {
        info!(document_id = %existing.id, "duplicate ingest, skipping");
        return Ok(IngestOutcome::Duplicate(existing.id));
    }

    let title = title
        .map(str::to_string)
        .or_else(|| {
            text.lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(|line| line.chars().take(100).collect())
        })
        .unwrap_or_else(|| "Untitled".to_string());

    let mut document = Document::new(
        title,
        content_hash,
        "text/plain",
        String::new(),
        ProcessingStage::Chunking,
    );
    if let Some(url) = source_url {
        document = document.with_source_url(url);
    }

    let key = format!("raw/{}.txt", document.id);
    document.blob_location = blob.put(&key, text.as_bytes(), "text/plain").await?;
    store.insert_document(&document).await?;
    queue.push(queues::CHUNK, &document.id.to_string()).await?;

    info!(document_id = %document.id, chars = text.chars().count(), "ingested text");
    Ok(IngestOutcome::Created(document.id))
}
