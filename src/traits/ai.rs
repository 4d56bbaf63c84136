//! AI seams: reasoning and embedding.
//!
//! Implementations wrap a specific model server and own their timeouts.
//! Workers are single-flight against these endpoints: one in-flight
//! call per worker process.

use async_trait::async_trait;

use crate::error::Result;

/// Prompted text completion used by the evaluate and extract stages.
///
/// Returns the model's raw text; callers parse it leniently and treat
/// unparseable output as an empty result, never an error.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(&self, system: &str, prompt: &str) -> Result<String>;

    /// Identifier persisted alongside evaluations.
    fn model(&self) -> &str;
}

/// Text to fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The dimension every returned vector must have.
    fn dimension(&self) -> usize;
}
