//! Chunk and chunk-evaluation types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An indexed substring of a document. Immutable once created;
/// `(document_id, chunk_index)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub char_start: i32,
    pub char_end: i32,
    /// Approximate token count, good enough for budget accounting
    pub token_count: i32,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a chunk, produced by the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChunk {
    pub chunk_index: i32,
    pub content: String,
    pub char_start: i32,
    pub char_end: i32,
    pub token_count: i32,
}

/// Closed set of automotive domains an evaluated chunk can fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomotiveDomain {
    Obd,
    Electrical,
    Engine,
    Transmission,
    Brakes,
    Suspension,
    Hvac,
    Body,
    General,
    Unknown,
}

impl AutomotiveDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomotiveDomain::Obd => "obd",
            AutomotiveDomain::Electrical => "electrical",
            AutomotiveDomain::Engine => "engine",
            AutomotiveDomain::Transmission => "transmission",
            AutomotiveDomain::Brakes => "brakes",
            AutomotiveDomain::Suspension => "suspension",
            AutomotiveDomain::Hvac => "hvac",
            AutomotiveDomain::Body => "body",
            AutomotiveDomain::General => "general",
            AutomotiveDomain::Unknown => "unknown",
        }
    }

    /// Lenient parse: anything outside the closed set maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "obd" => AutomotiveDomain::Obd,
            "electrical" => AutomotiveDomain::Electrical,
            "engine" => AutomotiveDomain::Engine,
            "transmission" => AutomotiveDomain::Transmission,
            "brakes" => AutomotiveDomain::Brakes,
            "suspension" => AutomotiveDomain::Suspension,
            "hvac" => AutomotiveDomain::Hvac,
            "body" => AutomotiveDomain::Body,
            "general" => AutomotiveDomain::General,
            _ => AutomotiveDomain::Unknown,
        }
    }
}

/// One-to-one evaluation of a chunk by the reasoning model.
///
/// Scores are clamped to [0, 1] before persisting. Re-evaluation
/// overwrites the prior row (`chunk_id` is unique).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEvaluation {
    pub chunk_id: Uuid,
    pub trust_score: f64,
    pub relevance_score: f64,
    pub domain: AutomotiveDomain,
    pub reasoning: String,
    pub model_used: String,
    pub evaluated_at: DateTime<Utc>,
}

impl ChunkEvaluation {
    pub fn new(
        chunk_id: Uuid,
        trust_score: f64,
        relevance_score: f64,
        domain: AutomotiveDomain,
        reasoning: impl Into<String>,
        model_used: impl Into<String>,
    ) -> Self {
        Self {
            chunk_id,
            trust_score: trust_score.clamp(0.0, 1.0),
            relevance_score: relevance_score.clamp(0.0, 1.0),
            domain,
            reasoning: reasoning.into(),
            model_used: model_used.into(),
            evaluated_at: Utc::now(),
        }
    }

    /// The record persisted when every parse strategy failed on the
    /// model's response. The chunk stays in the pipeline but is
    /// excluded by the relevance gate.
    pub fn parse_failed(chunk_id: Uuid, model_used: impl Into<String>) -> Self {
        Self::new(
            chunk_id,
            0.0,
            0.0,
            AutomotiveDomain::Unknown,
            "parse failed",
            model_used,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_parse_is_lenient() {
        assert_eq!(AutomotiveDomain::parse("OBD"), AutomotiveDomain::Obd);
        assert_eq!(AutomotiveDomain::parse(" brakes "), AutomotiveDomain::Brakes);
        assert_eq!(
            AutomotiveDomain::parse("flux capacitor"),
            AutomotiveDomain::Unknown
        );
    }

    #[test]
    fn evaluation_clamps_scores() {
        let eval = ChunkEvaluation::new(
            Uuid::new_v4(),
            1.7,
            -0.2,
            AutomotiveDomain::Engine,
            "ok",
            "llama3",
        );
        assert_eq!(eval.trust_score, 1.0);
        assert_eq!(eval.relevance_score, 0.0);
    }

    #[test]
    fn parse_failed_record_is_gated_out() {
        let eval = ChunkEvaluation::parse_failed(Uuid::new_v4(), "llama3");
        assert_eq!(eval.trust_score, 0.0);
        assert_eq!(eval.relevance_score, 0.0);
        assert_eq!(eval.domain, AutomotiveDomain::Unknown);
        assert_eq!(eval.reasoning, "parse failed");
    }
}
