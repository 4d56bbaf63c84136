//! Mock AI implementations for testing.
//!
//! Deterministic, configurable stand-ins for the reasoning and
//! embedding seams so pipeline logic can be exercised without a model
//! server.

use async_trait::async_trait;
use std::sync::RwLock;

use crate::error::{RefineryError, Result};
use crate::traits::ai::{Embedder, Reasoner};

/// A mock reasoner returning canned responses.
///
/// Responses are matched by substring against the prompt, first match
/// wins; unmatched prompts get the default response.
pub struct MockReasoner {
    responses: RwLock<Vec<(String, String)>>,
    default_response: RwLock<String>,
    calls: RwLock<Vec<String>>,
    fail_with: RwLock<Option<String>>,
}

impl Default for MockReasoner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReasoner {
    pub fn new() -> Self {
        Self {
            responses: RwLock::new(Vec::new()),
            default_response: RwLock::new("{}".to_string()),
            calls: RwLock::new(Vec::new()),
            fail_with: RwLock::new(None),
        }
    }

    /// Add a canned response for prompts containing `needle`.
    pub fn with_response(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses
            .write()
            .unwrap()
            .push((needle.into(), response.into()));
        self
    }

    /// Set the response for unmatched prompts.
    pub fn with_default_response(self, response: impl Into<String>) -> Self {
        *self.default_response.write().unwrap() = response.into();
        self
    }

    /// Make every call fail with a reasoning error.
    pub fn failing(self, message: impl Into<String>) -> Self {
        *self.fail_with.write().unwrap() = Some(message.into());
        self
    }

    /// Prompts seen so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    async fn reason(&self, _system: &str, prompt: &str) -> Result<String> {
        self.calls.write().unwrap().push(prompt.to_string());
        if let Some(message) = self.fail_with.read().unwrap().clone() {
            return Err(RefineryError::Reasoning(message));
        }
        let responses = self.responses.read().unwrap();
        for (needle, response) in responses.iter() {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.default_response.read().unwrap().clone())
    }

    fn model(&self) -> &str {
        "mock-reasoner"
    }
}

/// A mock embedder producing deterministic vectors seeded from a
/// SHA-256 of the text.
pub struct MockEmbedder {
    dimension: usize,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(768)
    }
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();
        Ok((0..self.dimension)
            .map(|i| (hash[i % 32] as f32 / 127.5) - 1.0)
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_reasoner_matches_by_substring() {
        let reasoner = MockReasoner::new()
            .with_response("P0301", r#"{"answer": "misfire"}"#)
            .with_default_response(r#"{"answer": "unknown"}"#);

        let hit = reasoner.reason("system", "tell me about P0301").await.unwrap();
        assert!(hit.contains("misfire"));
        let miss = reasoner.reason("system", "tell me about weather").await.unwrap();
        assert!(miss.contains("unknown"));
        assert_eq!(reasoner.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(768);
        let a = embedder.embed("spark plug").await.unwrap();
        let b = embedder.embed("spark plug").await.unwrap();
        let c = embedder.embed("ignition coil").await.unwrap();
        assert_eq!(a.len(), 768);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
