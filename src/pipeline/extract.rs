//! Extract stage: structured entity extraction from eligible chunks.
//!
//! Only chunks at or above the relevance gate reach the model. Each
//! response is parsed leniently and validated: DTC codes outside the
//! canonical pattern and enum values outside the closed sets are
//! dropped element-by-element. Staged rows inherit the chunk's trust
//! and relevance. A document with nothing eligible still advances;
//! Resolve records it as rejected.

use std::sync::Arc;
use uuid::Uuid;

use crate::ai::parse::parse_lenient_json;
use crate::error::Result;
use crate::pipeline::runtime::DocumentStage;
use crate::traits::ai::Reasoner;
use crate::traits::store::PipelineStore;
use crate::types::document::ProcessingStage;
use crate::types::extraction::{
    DtcCode, ExtractionResponse, Likelihood, Severity, StagedCategory, StagedCause, StagedDtc,
    StagedExtraction, StagedSensor, StagedStep, StagedTsb, StagedVehicle,
};

pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are an automotive technical data extractor.
Given a text chunk, extract all structured automotive data.
Respond with ONLY a JSON object (no other text):

{
  "dtc_codes": [
    {"code": "P0171", "description": "System Too Lean Bank 1", "category": "powertrain", "severity": "moderate"}
  ],
  "causes": [
    {"dtc_code": "P0171", "description": "Vacuum leak in intake manifold", "likelihood": "high"}
  ],
  "diagnostic_steps": [
    {"dtc_code": "P0171", "step_order": 1, "description": "Check for vacuum leaks using smoke test",
     "tools_required": "Smoke machine", "expected_values": "No smoke visible from intake"}
  ],
  "sensors": [
    {"name": "MAF Sensor", "sensor_type": "mass_air_flow", "typical_range": "2-7 g/s at idle",
     "unit": "g/s", "related_dtc_codes": ["P0171", "P0101"]}
  ],
  "tsb_references": [
    {"tsb_number": "TSB-2023-0142", "title": "Intake Manifold Gasket Update",
     "affected_models": "2019-2022 Model X", "related_dtc_codes": ["P0171"],
     "summary": "Updated gasket material to prevent vacuum leaks"}
  ],
  "vehicles_mentioned": [
    {"make": "Ford", "model": "F-150", "year_start": 2015, "year_end": 2020,
     "engine": "3.5L EcoBoost", "transmission": "10-speed automatic",
     "related_dtc_codes": ["P0171"]}
  ],
  "document_category": "diagnostic_guide"
}

Rules:
- Only extract data EXPLICITLY stated in the text. Do not fabricate.
- Return empty arrays for categories with no matches.
- category: powertrain, chassis, body, or network
- severity: critical, moderate, minor, or informational
- likelihood: high, medium, or low
- document_category: repair_procedure, diagnostic_guide, dtc_reference,
  tsb_bulletin, wiring_diagram, parts_catalog, forum_discussion,
  owners_manual, recall_notice, or general_reference"#;

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn valid_codes(raw: &[String]) -> Vec<DtcCode> {
    let mut codes: Vec<DtcCode> = raw.iter().filter_map(|c| DtcCode::parse(c)).collect();
    codes.sort();
    codes.dedup();
    codes
}

/// Convert one chunk's response into staged rows, validating as we go.
pub fn stage_chunk_response(
    response: &ExtractionResponse,
    chunk_id: Uuid,
    trust: f64,
    relevance: f64,
) -> StagedExtraction {
    let mut staged = StagedExtraction::default();

    for dtc in &response.dtc_codes {
        let Some(code) = DtcCode::parse(&dtc.code) else {
            continue;
        };
        staged.dtcs.push(StagedDtc {
            code,
            description: dtc.description.trim().to_string(),
            category: non_empty(dtc.category.clone()),
            severity: Severity::parse(&dtc.severity),
            chunk_id,
            trust,
            relevance,
        });
    }

    for cause in &response.causes {
        let Some(code) = DtcCode::parse(&cause.dtc_code) else {
            continue;
        };
        let Some(description) = non_empty(cause.description.clone()) else {
            continue;
        };
        staged.causes.push(StagedCause {
            dtc_code: code,
            description,
            likelihood: Likelihood::parse(&cause.likelihood),
            chunk_id,
            trust,
            relevance,
        });
    }

    for step in &response.diagnostic_steps {
        let Some(code) = DtcCode::parse(&step.dtc_code) else {
            continue;
        };
        let Some(description) = non_empty(step.description.clone()) else {
            continue;
        };
        staged.steps.push(StagedStep {
            dtc_code: code,
            step_order: step.step_order.max(1),
            description,
            tools_required: non_empty(step.tools_required.clone()),
            expected_values: non_empty(step.expected_values.clone()),
            chunk_id,
            trust,
            relevance,
        });
    }

    for sensor in &response.sensors {
        let Some(name) = non_empty(sensor.name.clone()) else {
            continue;
        };
        staged.sensors.push(StagedSensor {
            name,
            sensor_type: non_empty(sensor.sensor_type.clone()),
            typical_range: non_empty(sensor.typical_range.clone()),
            unit: non_empty(sensor.unit.clone()),
            related_dtc_codes: valid_codes(&sensor.related_dtc_codes),
            chunk_id,
            trust,
            relevance,
        });
    }

    for tsb in &response.tsb_references {
        let Some(tsb_number) = non_empty(tsb.tsb_number.clone()) else {
            continue;
        };
        staged.tsbs.push(StagedTsb {
            tsb_number,
            title: tsb.title.trim().to_string(),
            affected_models: tsb.affected_models.trim().to_string(),
            related_dtc_codes: valid_codes(&tsb.related_dtc_codes),
            summary: tsb.summary.trim().to_string(),
            chunk_id,
            trust,
            relevance,
        });
    }

    for vehicle in &response.vehicles_mentioned {
        let (Some(make), Some(model)) = (
            non_empty(vehicle.make.clone()),
            non_empty(vehicle.model.clone()),
        ) else {
            continue;
        };
        staged.vehicles.push(StagedVehicle {
            make,
            model,
            year_start: vehicle.year_start,
            year_end: vehicle.year_end.or(vehicle.year_start),
            engine: non_empty(vehicle.engine.clone()),
            transmission: non_empty(vehicle.transmission.clone()),
            related_dtc_codes: valid_codes(&vehicle.related_dtc_codes),
            chunk_id,
            trust,
            relevance,
        });
    }

    if let Some(category) = response.document_category {
        staged.categories.push(StagedCategory { category, chunk_id });
    }

    staged
}

/// The extract stage worker.
pub struct ExtractStage<S, R> {
    store: Arc<S>,
    reasoner: Arc<R>,
    relevance_gate: f64,
}

impl<S: PipelineStore, R: Reasoner> ExtractStage<S, R> {
    pub fn new(store: Arc<S>, reasoner: Arc<R>, relevance_gate: f64) -> Self {
        Self {
            store,
            reasoner,
            relevance_gate,
        }
    }
}

#[async_trait::async_trait]
impl<S: PipelineStore, R: Reasoner> DocumentStage for ExtractStage<S, R> {
    fn stage(&self) -> ProcessingStage {
        ProcessingStage::Extracting
    }

    fn next_stage(&self) -> ProcessingStage {
        ProcessingStage::Resolving
    }

    async fn run(&self, document_id: Uuid) -> Result<String> {
        let eligible = self
            .store
            .eligible_chunks(document_id, self.relevance_gate)
            .await?;

        if eligible.is_empty() {
            self.store
                .stage_extraction(document_id, &StagedExtraction::default())
                .await?;
            return Ok("no eligible chunks".to_string());
        }

        let evaluations = self.store.evaluations_for_document(document_id).await?;
        let scores: std::collections::HashMap<Uuid, (f64, f64)> = evaluations
            .iter()
            .map(|e| (e.chunk_id, (e.trust_score, e.relevance_score)))
            .collect();

        let mut staged = StagedExtraction::default();
        let mut items = 0usize;
        for chunk in &eligible {
            let prompt = format!(
                "Extract all automotive technical data from this text:\n\n---\n{}\n---",
                chunk.content
            );
            let response_text = self
                .reasoner
                .reason(EXTRACTION_SYSTEM_PROMPT, &prompt)
                .await?;

            let Some(value) = parse_lenient_json(&response_text) else {
                continue;
            };
            let response = ExtractionResponse::from_value(&value);
            items += response.item_count();

            let (trust, relevance) = scores.get(&chunk.id).copied().unwrap_or((0.5, 0.5));
            staged.absorb(stage_chunk_response(&response, chunk.id, trust, relevance));
        }

        self.store.stage_extraction(document_id, &staged).await?;
        Ok(format!(
            "extracted {items} items from {} chunks",
            eligible.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_dtc_codes_are_dropped() {
        let value = json!({
            "dtc_codes": [
                {"code": "P0301", "description": "Cylinder 1 misfire", "category": "powertrain", "severity": "moderate"},
                {"code": "NOTACODE", "description": "bogus", "category": "", "severity": ""}
            ],
            "causes": [
                {"dtc_code": "P0301", "description": "Worn spark plug", "likelihood": "high"},
                {"dtc_code": "ZZZZZ", "description": "Ignored", "likelihood": "low"}
            ]
        });
        let response = ExtractionResponse::from_value(&value);
        let staged = stage_chunk_response(&response, Uuid::new_v4(), 0.9, 0.8);

        assert_eq!(staged.dtcs.len(), 1);
        assert_eq!(staged.dtcs[0].code.as_str(), "P0301");
        assert_eq!(staged.causes.len(), 1);
        assert_eq!(staged.causes[0].likelihood, Likelihood::High);
    }

    #[test]
    fn staged_rows_inherit_chunk_scores() {
        let value = json!({
            "causes": [
                {"dtc_code": "p0420", "description": "Failing catalytic converter", "likelihood": "high"}
            ]
        });
        let response = ExtractionResponse::from_value(&value);
        let chunk_id = Uuid::new_v4();
        let staged = stage_chunk_response(&response, chunk_id, 0.75, 0.6);

        assert_eq!(staged.causes[0].chunk_id, chunk_id);
        assert_eq!(staged.causes[0].trust, 0.75);
        assert_eq!(staged.causes[0].relevance, 0.6);
        assert_eq!(staged.causes[0].dtc_code.as_str(), "P0420");
    }

    #[test]
    fn empty_descriptions_are_dropped() {
        let value = json!({
            "causes": [{"dtc_code": "P0301", "description": "   ", "likelihood": "high"}],
            "diagnostic_steps": [{"dtc_code": "P0301", "step_order": 0, "description": ""}]
        });
        let response = ExtractionResponse::from_value(&value);
        let staged = stage_chunk_response(&response, Uuid::new_v4(), 0.5, 0.5);
        assert!(staged.causes.is_empty());
        assert!(staged.steps.is_empty());
    }

    #[test]
    fn related_codes_are_validated_and_deduped() {
        let value = json!({
            "sensors": [
                {"name": "MAF Sensor", "sensor_type": "mass_air_flow",
                 "related_dtc_codes": ["p0171", "P0171", "garbage", "P0101"]}
            ]
        });
        let response = ExtractionResponse::from_value(&value);
        let staged = stage_chunk_response(&response, Uuid::new_v4(), 0.5, 0.5);
        let codes: Vec<&str> = staged.sensors[0]
            .related_dtc_codes
            .iter()
            .map(|c| c.as_str())
            .collect();
        assert_eq!(codes, vec!["P0101", "P0171"]);
    }

    #[test]
    fn single_year_vehicle_gets_matching_range() {
        let value = json!({
            "vehicles_mentioned": [
                {"make": "Ford", "model": "F-150", "year_start": 2018,
                 "related_dtc_codes": ["P0301"]}
            ]
        });
        let response = ExtractionResponse::from_value(&value);
        let staged = stage_chunk_response(&response, Uuid::new_v4(), 0.5, 0.5);
        assert_eq!(staged.vehicles[0].year_start, Some(2018));
        assert_eq!(staged.vehicles[0].year_end, Some(2018));
    }
}
