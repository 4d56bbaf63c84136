//! DTC Knowledge Refinery
//!
//! A queue-driven pipeline that ingests automotive diagnostic documents
//! and distills them into a normalized, provenance-tracked knowledge
//! graph of Diagnostic Trouble Codes, causes, diagnostic steps,
//! sensors, TSBs, and affected vehicles.
//!
//! Documents move through six ordered stages, each a pool of workers
//! consuming from a durable job queue:
//!
//! ```text
//! crawl-req-id -[Crawl]-> doc-id -[Chunk]-> doc-id -[Embed]-> doc-id
//!              -[Evaluate]-> doc-id -[Extract]-> doc-id -[Resolve]-> done
//! ```
//!
//! The relational store is the single source of truth: every stage
//! transition is an atomic commit, followed by a best-effort queue
//! push. The Resolve stage runs a deterministic scoring engine and
//! upserts into the knowledge graph with full provenance.
//!
//! # Modules
//!
//! - [`traits`] - seams for the queue, blob store, pipeline store, and AI clients
//! - [`pipeline`] - the six stages and the worker runtime
//! - [`scoring`] - pure score components shared by Resolve and the stats surface
//! - [`stores`], [`queue`], [`blob`], [`ai`] - backends per seam
//! - [`testing`] - deterministic mocks

pub mod ai;
pub mod blob;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod scoring;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

pub use config::Config;
pub use error::{RefineryError, Result};

pub use ai::OllamaClient;
pub use blob::{FsBlobStore, MemoryBlobStore};
pub use queue::{MemoryQueue, PostgresQueue};
pub use stores::{MemoryStore, PostgresStore};

pub use pipeline::{
    ingest_text, plan_resolution, requeue_stuck_documents, submit_url, ChunkStage, CrawlStage,
    EmbedStage, EvaluateStage, ExtractStage, IngestOutcome, ResolveStage, WorkerRuntime,
};

pub use traits::{
    ai::{Embedder, Reasoner},
    blob::BlobStore,
    queue::{queues, JobQueue},
    store::PipelineStore,
};

pub use types::document::{CrawlRequest, CrawlStatus, Document, ProcessingStage};
pub use types::extraction::{DocumentCategory, DtcCode, Likelihood, Severity};
