//! Extraction contract types.
//!
//! The reasoning model returns an untyped JSON object per chunk; this
//! module defines the typed contract it is parsed into and the staged
//! rows the extract stage accumulates for Resolve. Values outside the
//! closed sets are dropped element-by-element rather than failing the
//! document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A validated Diagnostic Trouble Code in canonical uppercase form.
///
/// Lexical form: one of `P`/`B`/`C`/`U` followed by four hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtcCode(String);

impl DtcCode {
    /// Parse a candidate code, case-insensitively. Returns `None` for
    /// anything that does not match `^[PBCU][0-9A-Fa-f]{4}$`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != 5 {
            return None;
        }
        let mut chars = trimmed.chars();
        let system = chars.next()?.to_ascii_uppercase();
        if !matches!(system, 'P' | 'B' | 'C' | 'U') {
            return None;
        }
        if !chars.clone().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the code is in the emissions-related generic powertrain
    /// range (P0xxx).
    pub fn is_emissions_related(&self) -> bool {
        self.0.starts_with("P0")
    }

    /// System category implied by the leading letter.
    pub fn system_category(&self) -> &'static str {
        match self.0.as_bytes()[0] {
            b'P' => "powertrain",
            b'B' => "body",
            b'C' => "chassis",
            _ => "network",
        }
    }
}

impl std::fmt::Display for DtcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of DTC severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Moderate,
    Minor,
    Informational,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Moderate => "moderate",
            Severity::Minor => "minor",
            Severity::Informational => "informational",
        }
    }

    /// Lenient parse; values outside the closed set are dropped.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Some(Severity::Critical),
            "moderate" => Some(Severity::Moderate),
            "minor" => Some(Severity::Minor),
            "informational" => Some(Severity::Informational),
            _ => None,
        }
    }

    /// 1-5 severity level stored on the master row.
    pub fn level(&self) -> i16 {
        match self {
            Severity::Critical => 5,
            Severity::Moderate => 3,
            Severity::Minor => 2,
            Severity::Informational => 1,
        }
    }
}

/// Closed set of cause likelihoods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Likelihood {
    High,
    Medium,
    Low,
}

impl Likelihood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Likelihood::High => "high",
            Likelihood::Medium => "medium",
            Likelihood::Low => "low",
        }
    }

    /// Lenient parse, defaulting to `Medium`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" => Likelihood::High,
            "low" => Likelihood::Low,
            _ => Likelihood::Medium,
        }
    }
}

/// Closed set of document categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    RepairProcedure,
    DiagnosticGuide,
    DtcReference,
    TsbBulletin,
    WiringDiagram,
    PartsCatalog,
    ForumDiscussion,
    OwnersManual,
    RecallNotice,
    GeneralReference,
}

impl DocumentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentCategory::RepairProcedure => "repair_procedure",
            DocumentCategory::DiagnosticGuide => "diagnostic_guide",
            DocumentCategory::DtcReference => "dtc_reference",
            DocumentCategory::TsbBulletin => "tsb_bulletin",
            DocumentCategory::WiringDiagram => "wiring_diagram",
            DocumentCategory::PartsCatalog => "parts_catalog",
            DocumentCategory::ForumDiscussion => "forum_discussion",
            DocumentCategory::OwnersManual => "owners_manual",
            DocumentCategory::RecallNotice => "recall_notice",
            DocumentCategory::GeneralReference => "general_reference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "repair_procedure" => Some(DocumentCategory::RepairProcedure),
            "diagnostic_guide" => Some(DocumentCategory::DiagnosticGuide),
            "dtc_reference" => Some(DocumentCategory::DtcReference),
            "tsb_bulletin" => Some(DocumentCategory::TsbBulletin),
            "wiring_diagram" => Some(DocumentCategory::WiringDiagram),
            "parts_catalog" => Some(DocumentCategory::PartsCatalog),
            "forum_discussion" => Some(DocumentCategory::ForumDiscussion),
            "owners_manual" => Some(DocumentCategory::OwnersManual),
            "recall_notice" => Some(DocumentCategory::RecallNotice),
            "general_reference" => Some(DocumentCategory::GeneralReference),
            _ => None,
        }
    }
}

// Raw per-chunk extraction response, exactly as the model emits it.
// Deserialized element-by-element so one malformed entry never poisons
// the rest of the chunk.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDtc {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub severity: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCause {
    #[serde(default)]
    pub dtc_code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub likelihood: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub dtc_code: String,
    #[serde(default)]
    pub step_order: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools_required: String,
    #[serde(default)]
    pub expected_values: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSensor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sensor_type: String,
    #[serde(default)]
    pub typical_range: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub related_dtc_codes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTsb {
    #[serde(default)]
    pub tsb_number: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub affected_models: String,
    #[serde(default)]
    pub related_dtc_codes: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVehicle {
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub year_start: Option<i32>,
    #[serde(default)]
    pub year_end: Option<i32>,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub transmission: String,
    #[serde(default)]
    pub related_dtc_codes: Vec<String>,
}

/// Typed view of one chunk's extraction JSON.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResponse {
    pub dtc_codes: Vec<RawDtc>,
    pub causes: Vec<RawCause>,
    pub diagnostic_steps: Vec<RawStep>,
    pub sensors: Vec<RawSensor>,
    pub tsb_references: Vec<RawTsb>,
    pub vehicles_mentioned: Vec<RawVehicle>,
    pub document_category: Option<DocumentCategory>,
}

impl ExtractionResponse {
    /// Build from a parsed JSON value, dropping malformed elements
    /// silently.
    pub fn from_value(value: &Value) -> Self {
        Self {
            dtc_codes: typed_elements(value, "dtc_codes"),
            causes: typed_elements(value, "causes"),
            diagnostic_steps: typed_elements(value, "diagnostic_steps"),
            sensors: typed_elements(value, "sensors"),
            tsb_references: typed_elements(value, "tsb_references"),
            vehicles_mentioned: typed_elements(value, "vehicles_mentioned"),
            document_category: value
                .get("document_category")
                .and_then(Value::as_str)
                .and_then(DocumentCategory::parse),
        }
    }

    pub fn item_count(&self) -> usize {
        self.dtc_codes.len()
            + self.causes.len()
            + self.diagnostic_steps.len()
            + self.sensors.len()
            + self.tsb_references.len()
            + self.vehicles_mentioned.len()
    }
}

fn typed_elements<T: serde::de::DeserializeOwned>(value: &Value, field: &str) -> Vec<T> {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

// Staged rows: the extract stage's output, one per observed entity,
// each carrying its originating chunk and that chunk's scores.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedDtc {
    pub code: DtcCode,
    pub description: String,
    pub category: Option<String>,
    pub severity: Option<Severity>,
    pub chunk_id: Uuid,
    pub trust: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedCause {
    pub dtc_code: DtcCode,
    pub description: String,
    pub likelihood: Likelihood,
    pub chunk_id: Uuid,
    pub trust: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedStep {
    pub dtc_code: DtcCode,
    pub step_order: i32,
    pub description: String,
    pub tools_required: Option<String>,
    pub expected_values: Option<String>,
    pub chunk_id: Uuid,
    pub trust: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedSensor {
    pub name: String,
    pub sensor_type: Option<String>,
    pub typical_range: Option<String>,
    pub unit: Option<String>,
    pub related_dtc_codes: Vec<DtcCode>,
    pub chunk_id: Uuid,
    pub trust: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedTsb {
    pub tsb_number: String,
    pub title: String,
    pub affected_models: String,
    pub related_dtc_codes: Vec<DtcCode>,
    pub summary: String,
    pub chunk_id: Uuid,
    pub trust: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedVehicle {
    pub make: String,
    pub model: String,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    pub engine: Option<String>,
    pub transmission: Option<String>,
    pub related_dtc_codes: Vec<DtcCode>,
    pub chunk_id: Uuid,
    pub trust: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedCategory {
    pub category: DocumentCategory,
    pub chunk_id: Uuid,
}

/// Everything staged for one document, the Resolve stage's input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagedExtraction {
    pub dtcs: Vec<StagedDtc>,
    pub causes: Vec<StagedCause>,
    pub steps: Vec<StagedStep>,
    pub sensors: Vec<StagedSensor>,
    pub tsbs: Vec<StagedTsb>,
    pub vehicles: Vec<StagedVehicle>,
    pub categories: Vec<StagedCategory>,
}

impl StagedExtraction {
    pub fn is_empty(&self) -> bool {
        self.dtcs.is_empty()
            && self.causes.is_empty()
            && self.steps.is_empty()
            && self.sensors.is_empty()
            && self.tsbs.is_empty()
            && self.vehicles.is_empty()
            && self.categories.is_empty()
    }

    /// Merge another document-chunk's staged rows into this one.
    pub fn absorb(&mut self, other: StagedExtraction) {
        self.dtcs.extend(other.dtcs);
        self.causes.extend(other.causes);
        self.steps.extend(other.steps);
        self.sensors.extend(other.sensors);
        self.tsbs.extend(other.tsbs);
        self.vehicles.extend(other.vehicles);
        self.categories.extend(other.categories);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dtc_code_canonicalizes_to_uppercase() {
        let code = DtcCode::parse("p0301").unwrap();
        assert_eq!(code.as_str(), "P0301");
        assert!(code.is_emissions_related());
        assert_eq!(code.system_category(), "powertrain");
    }

    #[test]
    fn dtc_code_accepts_hex_digits() {
        assert!(DtcCode::parse("U3FfA").is_some());
        assert_eq!(DtcCode::parse("c1a2b").unwrap().as_str(), "C1A2B");
    }

    #[test]
    fn dtc_code_rejects_bad_forms() {
        for bad in ["", "P030", "P03011", "X0301", "P030G", "0301P", "P 301"] {
            assert!(DtcCode::parse(bad).is_none(), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn severity_outside_closed_set_is_dropped() {
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("catastrophic"), None);
    }

    #[test]
    fn malformed_elements_are_dropped_not_fatal() {
        let value = json!({
            "dtc_codes": [
                {"code": "P0171", "description": "System too lean", "category": "powertrain", "severity": "moderate"},
                "not-an-object",
                {"code": 42}
            ],
            "causes": [],
            "document_category": "diagnostic_guide"
        });
        let response = ExtractionResponse::from_value(&value);
        assert_eq!(response.dtc_codes.len(), 1);
        assert_eq!(response.dtc_codes[0].code, "P0171");
        assert_eq!(
            response.document_category,
            Some(DocumentCategory::DiagnosticGuide)
        );
    }

    #[test]
    fn unknown_category_is_none() {
        let value = json!({"document_category": "grocery_list"});
        let response = ExtractionResponse::from_value(&value);
        assert_eq!(response.document_category, None);
    }
}
