//! Evaluate stage: per-chunk trust/relevance/domain scoring.
//!
//! One reasoning request per chunk. The response is parsed leniently;
//! a response that defeats all three parse strategies persists as
//! trust=0, relevance=0, domain=unknown and the document continues.

use std::sync::Arc;
use uuid::Uuid;

use crate::ai::parse::parse_lenient_json;
use crate::error::Result;
use crate::pipeline::runtime::DocumentStage;
use crate::traits::ai::Reasoner;
use crate::traits::store::PipelineStore;
use crate::types::chunk::{AutomotiveDomain, ChunkEvaluation};
use crate::types::document::ProcessingStage;

pub const EVALUATION_SYSTEM_PROMPT: &str = r#"You are an automotive technical content evaluator.
You will be given a text chunk from a technical document.

Evaluate it and respond with ONLY a JSON object (no other text):

{
  "trust_score": <float 0.0-1.0>,
  "relevance_score": <float 0.0-1.0>,
  "automotive_domain": "<one of: obd, electrical, engine, transmission, brakes, suspension, hvac, body, general, unknown>",
  "reasoning": "<brief explanation>"
}

Scoring guidelines (use the full 0.0-1.0 range, not just fixed tiers):
- trust_score: Rate source credibility on a continuous scale.
  Anchors: ~0.9-1.0 = OEM/factory data, ~0.7-0.85 = professional repair guide or
  well-sourced technical article, ~0.4-0.65 = forum post with specific details or
  community-verified info, ~0.2-0.35 = anecdotal or vague claims,
  ~0.0-0.15 = spam/ads/completely unverifiable.
  Consider: specificity of claims, presence of part numbers or specs,
  technical depth, consistency with known automotive principles.

- relevance_score: Rate diagnostic utility on a continuous scale.
  Anchors: ~0.9-1.0 = step-by-step diagnostic procedure with measurements,
  ~0.7-0.85 = DTC explanation with causes/symptoms, ~0.5-0.65 = general
  automotive knowledge applicable to diagnostics, ~0.25-0.4 = tangentially
  related automotive content, ~0.0-0.2 = not automotive or not useful.
  Consider: actionability, presence of DTC codes, diagnostic value,
  completeness of information."#;

/// Parsed evaluation response before clamping.
struct ParsedEvaluation {
    trust_score: f64,
    relevance_score: f64,
    domain: AutomotiveDomain,
    reasoning: String,
}

fn parse_evaluation(response: &str) -> Option<ParsedEvaluation> {
    let value = parse_lenient_json(response)?;
    Some(ParsedEvaluation {
        trust_score: value.get("trust_score").and_then(|v| v.as_f64())?,
        relevance_score: value.get("relevance_score").and_then(|v| v.as_f64())?,
        domain: value
            .get("automotive_domain")
            .and_then(|v| v.as_str())
            .map(AutomotiveDomain::parse)
            .unwrap_or(AutomotiveDomain::Unknown),
        reasoning: value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .chars()
            .take(1000)
            .collect(),
    })
}

/// The evaluate stage worker.
pub struct EvaluateStage<S, R> {
    store: Arc<S>,
    reasoner: Arc<R>,
}

impl<S: PipelineStore, R: Reasoner> EvaluateStage<S, R> {
    pub fn new(store: Arc<S>, reasoner: Arc<R>) -> Self {
        Self { store, reasoner }
    }
}

#[async_trait::async_trait]
impl<S: PipelineStore, R: Reasoner> DocumentStage for EvaluateStage<S, R> {
    fn stage(&self) -> ProcessingStage {
        ProcessingStage::Evaluating
    }

    fn next_stage(&self) -> ProcessingStage {
        ProcessingStage::Extracting
    }

    async fn run(&self, document_id: Uuid) -> Result<String> {
        let chunks = self.store.chunks_for_document(document_id).await?;

        let mut evaluated = 0usize;
        let mut parse_failures = 0usize;
        for chunk in &chunks {
            let prompt = format!(
                "Evaluate this automotive technical content chunk:\n\n---\n{}\n---",
                chunk.content
            );
            let response = self
                .reasoner
                .reason(EVALUATION_SYSTEM_PROMPT, &prompt)
                .await?;

            let evaluation = match parse_evaluation(&response) {
                Some(parsed) => ChunkEvaluation::new(
                    chunk.id,
                    parsed.trust_score,
                    parsed.relevance_score,
                    parsed.domain,
                    parsed.reasoning,
                    self.reasoner.model(),
                ),
                None => {
                    parse_failures += 1;
                    ChunkEvaluation::parse_failed(chunk.id, self.reasoner.model())
                }
            };

            self.store.upsert_evaluation(&evaluation).await?;
            evaluated += 1;
        }

        Ok(format!(
            "evaluated {evaluated} chunks ({parse_failures} parse failures)"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_response() {
        let parsed = parse_evaluation(
            r#"{"trust_score": 0.9, "relevance_score": 0.85, "automotive_domain": "obd", "reasoning": "OEM data"}"#,
        )
        .unwrap();
        assert_eq!(parsed.trust_score, 0.9);
        assert_eq!(parsed.domain, AutomotiveDomain::Obd);
    }

    #[test]
    fn missing_scores_fail_the_parse() {
        assert!(parse_evaluation(r#"{"automotive_domain": "obd"}"#).is_none());
    }

    #[test]
    fn raw_prose_fails_the_parse() {
        assert!(parse_evaluation("This chunk looks trustworthy to me.").is_none());
    }

    #[test]
    fn unknown_domain_is_tolerated() {
        let parsed = parse_evaluation(
            r#"{"trust_score": 0.5, "relevance_score": 0.5, "automotive_domain": "marine", "reasoning": ""}"#,
        )
        .unwrap();
        assert_eq!(parsed.domain, AutomotiveDomain::Unknown);
    }
}
