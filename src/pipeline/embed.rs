//! Embed stage: one vector per chunk.
//!
//! Chunks are embedded serially within a document. A vector with the
//! wrong dimension is dropped (the chunk stays unembedded) rather than
//! failing the document.

use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{RefineryError, Result};
use crate::pipeline::runtime::DocumentStage;
use crate::traits::ai::Embedder;
use crate::traits::store::PipelineStore;
use crate::types::document::ProcessingStage;

/// The embed stage worker.
pub struct EmbedStage<S, E> {
    store: Arc<S>,
    embedder: Arc<E>,
}

impl<S: PipelineStore, E: Embedder> EmbedStage<S, E> {
    pub fn new(store: Arc<S>, embedder: Arc<E>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait::async_trait]
impl<S: PipelineStore, E: Embedder> DocumentStage for EmbedStage<S, E> {
    fn stage(&self) -> ProcessingStage {
        ProcessingStage::Embedding
    }

    fn next_stage(&self) -> ProcessingStage {
        ProcessingStage::Evaluating
    }

    async fn run(&self, document_id: Uuid) -> Result<String> {
        let chunks = self.store.chunks_missing_embedding(document_id).await?;
        let expected = self.embedder.dimension();

        let mut embedded = 0usize;
        let mut dropped = 0usize;
        for chunk in &chunks {
            match self.embedder.embed(&chunk.content).await {
                Ok(vector) if vector.len() == expected => {
                    self.store.store_chunk_embedding(chunk.id, &vector).await?;
                    embedded += 1;
                }
                Ok(vector) => {
                    warn!(
                        chunk_id = %chunk.id,
                        expected,
                        got = vector.len(),
                        "dropping embedding with wrong dimension"
                    );
                    dropped += 1;
                }
                Err(e @ RefineryError::EmbeddingDim { .. }) => {
                    warn!(chunk_id = %chunk.id, error = %e, "dropping embedding");
                    dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(format!("embedded {embedded} chunks ({dropped} dropped)"))
    }
}
