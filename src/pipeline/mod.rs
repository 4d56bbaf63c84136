//! The six-stage processing pipeline and its worker runtime.

pub mod chunk;
pub mod crawl;
pub mod embed;
pub mod evaluate;
pub mod extract;
pub mod ingest;
pub mod resolve;
pub mod runtime;

pub use chunk::{ChunkSplitter, ChunkStage};
pub use crawl::{submit_url, CrawlOutcome, CrawlStage};
pub use embed::EmbedStage;
pub use evaluate::EvaluateStage;
pub use extract::ExtractStage;
pub use ingest::{ingest_text, IngestOutcome};
pub use resolve::{plan_resolution, ResolveStage};
pub use runtime::{requeue_stuck_documents, DocumentStage, WorkerRuntime};
