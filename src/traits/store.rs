//! Pipeline store seam.
//!
//! The relational store is the single source of truth: stage
//! transitions, chunks, evaluations, staged extractions, the knowledge
//! graph, and the append-only audit trails all live behind this trait.
//! `apply_resolution` is the one compound operation; each backend runs
//! it atomically (a single transaction in Postgres, a single write lock
//! in memory).

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::types::chunk::{Chunk, ChunkEvaluation, NewChunk};
use crate::types::document::{CrawlRequest, CrawlStatus, Document, ProcessingStage};
use crate::types::extraction::{DtcCode, StagedExtraction};
use crate::types::knowledge::{
    DtcCause, DtcDiagnosticStep, DtcMaster, EntitySource, ProcessingLogEntry, ResolutionLogEntry,
    Vehicle,
};
use crate::types::resolution::{ResolutionOutcome, ResolutionPlan};

#[async_trait]
pub trait PipelineStore: Send + Sync {
    // --- documents ---

    async fn insert_document(&self, document: &Document) -> Result<()>;

    async fn document(&self, id: Uuid) -> Result<Option<Document>>;

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;

    /// Set the processing stage; `error` is recorded when the stage is
    /// `error`. This is the atomic stage transition every advance rides
    /// on.
    async fn set_document_stage(
        &self,
        id: Uuid,
        stage: ProcessingStage,
        error: Option<&str>,
    ) -> Result<()>;

    /// Documents sitting in a non-terminal stage for longer than the
    /// threshold, the reaper's input.
    async fn documents_in_stage_longer_than(
        &self,
        stage: ProcessingStage,
        older_than: Duration,
    ) -> Result<Vec<Uuid>>;

    // --- crawl requests ---

    /// Insert a crawl request; returns `false` when the URL already has
    /// one (unique on URL).
    async fn insert_crawl_request(&self, request: &CrawlRequest) -> Result<bool>;

    async fn crawl_request(&self, id: Uuid) -> Result<Option<CrawlRequest>>;

    async fn set_crawl_request_status(
        &self,
        id: Uuid,
        status: CrawlStatus,
        error: Option<&str>,
    ) -> Result<()>;

    // --- chunks ---

    /// Insert all chunks of a document and set its `chunk_count`, in one
    /// transaction. Chunks are immutable once written.
    async fn insert_chunks(&self, document_id: Uuid, chunks: &[NewChunk]) -> Result<usize>;

    async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<Chunk>>;

    async fn chunks_missing_embedding(&self, document_id: Uuid) -> Result<Vec<Chunk>>;

    async fn store_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> Result<()>;

    // --- evaluations ---

    /// Upsert the evaluation for a chunk (unique on chunk id;
    /// re-evaluation overwrites).
    async fn upsert_evaluation(&self, evaluation: &ChunkEvaluation) -> Result<()>;

    async fn evaluations_for_document(&self, document_id: Uuid) -> Result<Vec<ChunkEvaluation>>;

    /// Chunks whose evaluation passes the relevance gate (inclusive).
    async fn eligible_chunks(&self, document_id: Uuid, relevance_threshold: f64)
        -> Result<Vec<Chunk>>;

    // --- staged extractions ---

    /// Replace the staged extraction for a document.
    async fn stage_extraction(&self, document_id: Uuid, staged: &StagedExtraction) -> Result<()>;

    async fn staged_extraction(&self, document_id: Uuid) -> Result<StagedExtraction>;

    // --- resolution ---

    /// Apply a resolution plan atomically: knowledge-graph upserts,
    /// vehicle links, provenance rows, resolution log, and the
    /// document's category and confidence.
    async fn apply_resolution(&self, plan: &ResolutionPlan) -> Result<ResolutionOutcome>;

    // --- knowledge graph reads ---

    async fn dtc_master_by_code(&self, code: &DtcCode) -> Result<Option<DtcMaster>>;

    async fn causes_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<DtcCause>>;

    async fn steps_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<DtcDiagnosticStep>>;

    /// Follow the decision tree one level: the step taken when the given
    /// step passed or failed.
    async fn next_diagnostic_step(
        &self,
        step_id: Uuid,
        passed: bool,
    ) -> Result<Option<DtcDiagnosticStep>>;

    async fn vehicles_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<Vehicle>>;

    async fn entity_sources(&self, entity_table: &str, entity_id: Uuid)
        -> Result<Vec<EntitySource>>;

    async fn resolution_log(&self, run_id: Uuid) -> Result<Vec<ResolutionLogEntry>>;

    // --- processing log ---

    async fn append_processing_log(&self, entry: &ProcessingLogEntry) -> Result<()>;

    async fn processing_log_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<ProcessingLogEntry>>;
}
