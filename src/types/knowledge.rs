//! Normalized knowledge-graph rows and the append-only audit types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::extraction::DtcCode;

/// Evidence aggregates carried by every non-reference knowledge row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    pub evidence_count: i64,
    pub avg_trust: f64,
    pub avg_relevance: f64,
}

impl Aggregates {
    pub fn new(evidence_count: i64, avg_trust: f64, avg_relevance: f64) -> Self {
        Self {
            evidence_count,
            avg_trust,
            avg_relevance,
        }
    }
}

/// Canonical row for a DTC code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcMaster {
    pub id: Uuid,
    pub code: DtcCode,
    pub system_category: String,
    pub generic_description: String,
    /// Trust of the observation that supplied the current description;
    /// a later observation replaces it only with strictly higher trust.
    pub description_trust: f64,
    pub severity_level: Option<i16>,
    pub emissions_related: bool,
    pub confidence_score: f64,
    pub conflict_flag: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A possible cause for a DTC, unique on `(dtc_master_id, lower(cause))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcCause {
    pub id: Uuid,
    pub dtc_master_id: Uuid,
    pub cause: String,
    pub probability_weight: f64,
    pub aggregates: Aggregates,
    pub conflict_flag: bool,
}

/// A diagnostic step for a DTC, unique on `(dtc_master_id, lower(instruction))`.
///
/// The decision tree is self-referential: `pass_next_step_id` and
/// `fail_next_step_id` point back into this table and are walked one
/// level at a time, never loaded eagerly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcDiagnosticStep {
    pub id: Uuid,
    pub dtc_master_id: Uuid,
    pub step_order: i32,
    pub instruction: String,
    pub tools_required: Option<String>,
    pub expected_values: Option<String>,
    pub pass_next_step_id: Option<Uuid>,
    pub fail_next_step_id: Option<Uuid>,
    pub aggregates: Aggregates,
}

/// Reference row for a sensor, unique on name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: Uuid,
    pub name: String,
    pub sensor_type: Option<String>,
}

/// Junction row linking a sensor to a DTC, unique on
/// `(dtc_master_id, sensor_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcSensorLink {
    pub id: Uuid,
    pub dtc_master_id: Uuid,
    pub sensor_id: Uuid,
    pub typical_range: Option<String>,
    pub unit: Option<String>,
    pub aggregates: Aggregates,
}

/// Technical Service Bulletin reference, unique on `tsb_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsbReference {
    pub id: Uuid,
    pub tsb_number: String,
    pub title: String,
    pub affected_models: String,
    pub summary: String,
    pub related_dtc_codes: Vec<DtcCode>,
    pub aggregates: Aggregates,
}

/// Canonical vehicle row, matched on `(make, model)` with year overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Uuid,
    pub make: String,
    pub model: String,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
}

impl Vehicle {
    /// Whether this row covers the given year range (overlap, not
    /// containment). A row without years matches any range.
    pub fn years_overlap(&self, start: Option<i32>, end: Option<i32>) -> bool {
        match (self.year_start, self.year_end) {
            (None, None) => true,
            (vs, ve) => {
                let vs = vs.unwrap_or(i32::MIN);
                let ve = ve.unwrap_or(i32::MAX);
                let qs = start.unwrap_or(i32::MIN);
                let qe = end.unwrap_or(i32::MAX);
                vs <= qe && qs <= ve
            }
        }
    }
}

/// Junction row linking a vehicle to a DTC master row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleDtcLink {
    pub vehicle_id: Uuid,
    pub dtc_master_id: Uuid,
    pub source_chunk_id: Uuid,
}

/// Append-only provenance link from a knowledge row back to the chunk
/// that contributed it. Unique on `(entity_table, entity_id, chunk_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySource {
    pub entity_table: String,
    pub entity_id: Uuid,
    pub chunk_id: Uuid,
    pub trust_score: f64,
    pub relevance_score: f64,
    pub extracted_at: DateTime<Utc>,
}

/// Action recorded for each entity touched during a Resolve run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Created,
    Updated,
    Merged,
    Rejected,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::Created => "created",
            ResolutionAction::Updated => "updated",
            ResolutionAction::Merged => "merged",
            ResolutionAction::Rejected => "rejected",
        }
    }
}

/// One append-only row per action taken during a Resolve run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionLogEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub action: ResolutionAction,
    pub entity_table: String,
    pub entity_id: Option<Uuid>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl ResolutionLogEntry {
    pub fn new(
        run_id: Uuid,
        action: ResolutionAction,
        entity_table: impl Into<String>,
        entity_id: Option<Uuid>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            action,
            entity_table: entity_table.into(),
            entity_id,
            details: details.into(),
            created_at: Utc::now(),
        }
    }
}

/// Status of one stage attempt on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Started,
    Completed,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Started => "started",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Error => "error",
        }
    }
}

/// One append-only row per stage attempt per document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub id: Uuid,
    pub document_id: Uuid,
    pub stage: String,
    pub status: ProcessingStatus,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub fn new(document_id: Uuid, stage: impl Into<String>, status: ProcessingStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            stage: stage.into(),
            status,
            message: None,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Entity table names, kept in one place so provenance rows and log
/// entries never drift.
pub mod tables {
    pub const DTC_MASTER: &str = "dtc_master";
    pub const CAUSES: &str = "dtc_possible_causes";
    pub const STEPS: &str = "dtc_diagnostic_steps";
    pub const SENSORS: &str = "dtc_related_sensors";
    pub const TSBS: &str = "tsb_references";
    pub const VEHICLE_LINKS: &str = "vehicle_dtc_codes";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vehicle_year_overlap() {
        let vehicle = Vehicle {
            id: Uuid::new_v4(),
            make: "Ford".into(),
            model: "F-150".into(),
            year_start: Some(2015),
            year_end: Some(2020),
        };
        assert!(vehicle.years_overlap(Some(2018), Some(2018)));
        assert!(vehicle.years_overlap(Some(2019), Some(2023)));
        assert!(vehicle.years_overlap(None, None));
        assert!(!vehicle.years_overlap(Some(2021), Some(2023)));
    }

    #[test]
    fn yearless_vehicle_matches_any_range() {
        let vehicle = Vehicle {
            id: Uuid::new_v4(),
            make: "Toyota".into(),
            model: "Camry".into(),
            year_start: None,
            year_end: None,
        };
        assert!(vehicle.years_overlap(Some(1999), Some(1999)));
    }
}
