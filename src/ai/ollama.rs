//! Ollama client implementing the reasoning and embedding seams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RefineryError, Result};
use crate::traits::ai::{Embedder, Reasoner};

/// HTTP client for an Ollama server, usable as both [`Reasoner`] and
/// [`Embedder`].
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    reasoning_model: String,
    embedding_model: String,
    embedding_dim: usize,
    reasoning_timeout: Duration,
    embedding_timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            reasoning_model: "llama3".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dim: 768,
            reasoning_timeout: Duration::from_secs(300),
            embedding_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_reasoning_model(mut self, model: impl Into<String>) -> Self {
        self.reasoning_model = model.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.embedding_model = model.into();
        self.embedding_dim = dimension;
        self
    }

    pub fn with_timeouts(mut self, reasoning: Duration, embedding: Duration) -> Self {
        self.reasoning_timeout = reasoning;
        self.embedding_timeout = embedding;
        self
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl Reasoner for OllamaClient {
    async fn reason(&self, system: &str, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            model: &self.reasoning_model,
            prompt,
            system,
            stream: false,
            format: "json",
            options: GenerateOptions { temperature: 0.1 },
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.reasoning_timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefineryError::Reasoning(format!(
                "ollama generate returned HTTP {status}"
            )));
        }

        let body: GenerateResponse = response.json().await?;
        Ok(body.response)
    }

    fn model(&self) -> &str {
        &self.reasoning_model
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            prompt: text,
        };

        let response = self
            .http
            .post(format!("{}/api/embeddings", self.base_url))
            .timeout(self.embedding_timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefineryError::Embedding(format!(
                "ollama embeddings returned HTTP {status}"
            )));
        }

        let body: EmbeddingResponse = response.json().await?;
        if body.embedding.len() != self.embedding_dim {
            return Err(RefineryError::EmbeddingDim {
                expected: self.embedding_dim,
                got: body.embedding.len(),
            });
        }
        Ok(body.embedding)
    }

    fn dimension(&self) -> usize {
        self.embedding_dim
    }
}
