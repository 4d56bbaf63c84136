//! Resolution plan types.
//!
//! The Resolve stage first computes a deterministic plan from the staged
//! rows (pure, no I/O), then hands the plan to the store, which applies
//! it in a single transaction. Aggregates in the plan describe *this
//! run's observations*; the store merges them with whatever the graph
//! already holds, skipping chunks that already have provenance rows so a
//! replay never double-counts evidence.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::extraction::{DocumentCategory, DtcCode, Likelihood};
use crate::types::knowledge::Aggregates;

/// One chunk's contribution to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub chunk_id: Uuid,
    pub trust: f64,
    pub relevance: f64,
}

/// Planned upsert of a DTC master row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcUpsert {
    pub code: DtcCode,
    pub description: String,
    /// Trust of the chunk that supplied `description`
    pub description_trust: f64,
    pub system_category: String,
    pub severity_level: Option<i16>,
    /// Two observations of the same code disagreed on a closed-set
    /// attribute within this run
    pub severity_conflict: bool,
    pub emissions_related: bool,
    pub sources: Vec<Provenance>,
}

/// Planned upsert of a possible cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CauseUpsert {
    pub dtc_code: DtcCode,
    pub cause: String,
    pub likelihood: Likelihood,
    pub aggregates: Aggregates,
    pub probability_weight: f64,
    pub score: f64,
    pub sources: Vec<Provenance>,
}

/// Planned upsert of a diagnostic step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepUpsert {
    pub dtc_code: DtcCode,
    pub step_order: i32,
    pub instruction: String,
    pub tools_required: Option<String>,
    pub expected_values: Option<String>,
    pub aggregates: Aggregates,
    pub score: f64,
    pub sources: Vec<Provenance>,
}

/// Planned upsert of a sensor and its link to one DTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorUpsert {
    pub dtc_code: DtcCode,
    pub name: String,
    pub sensor_type: Option<String>,
    pub typical_range: Option<String>,
    pub unit: Option<String>,
    pub aggregates: Aggregates,
    pub score: f64,
    pub sources: Vec<Provenance>,
}

/// Planned upsert of a TSB reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsbUpsert {
    pub tsb_number: String,
    pub title: String,
    pub affected_models: String,
    pub summary: String,
    pub related_dtc_codes: Vec<DtcCode>,
    pub aggregates: Aggregates,
    pub score: f64,
    pub sources: Vec<Provenance>,
}

/// Planned vehicle resolution and DTC linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleLinkPlan {
    pub make: String,
    pub model: String,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    pub dtc_codes: Vec<DtcCode>,
    pub source_chunk_id: Uuid,
    /// Vehicle-specificity component against the document's context
    pub specificity: f64,
    pub score: f64,
}

/// A staged entity that will not reach the knowledge graph, recorded in
/// the resolution log instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedEntity {
    pub entity_table: String,
    pub reason: String,
    pub details: String,
}

/// The full, ordered output of Resolve phases A-D for one document.
///
/// Lists are sorted by the deterministic rank (unified score desc,
/// evidence desc, trust desc, relevance desc, key asc), so two plans
/// built from the same staged rows are identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionPlan {
    pub run_id: Uuid,
    pub document_id: Uuid,
    pub dtc_upserts: Vec<DtcUpsert>,
    pub cause_upserts: Vec<CauseUpsert>,
    pub step_upserts: Vec<StepUpsert>,
    pub sensor_upserts: Vec<SensorUpsert>,
    pub tsb_upserts: Vec<TsbUpsert>,
    pub vehicle_links: Vec<VehicleLinkPlan>,
    pub document_category: Option<DocumentCategory>,
    pub document_confidence: Option<f64>,
    pub rejected: Vec<RejectedEntity>,
}

impl ResolutionPlan {
    /// A plan that only records why nothing was resolved.
    pub fn empty(document_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            document_id,
            dtc_upserts: Vec::new(),
            cause_upserts: Vec::new(),
            step_upserts: Vec::new(),
            sensor_upserts: Vec::new(),
            tsb_upserts: Vec::new(),
            vehicle_links: Vec::new(),
            document_category: None,
            document_confidence: None,
            rejected: vec![RejectedEntity {
                entity_table: String::new(),
                reason: reason.into(),
                details: String::new(),
            }],
        }
    }

    pub fn is_noop(&self) -> bool {
        self.dtc_upserts.is_empty()
            && self.cause_upserts.is_empty()
            && self.step_upserts.is_empty()
            && self.sensor_upserts.is_empty()
            && self.tsb_upserts.is_empty()
            && self.vehicle_links.is_empty()
    }
}

/// Counts of what a Resolve run did, for the completion log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub created: u64,
    pub updated: u64,
    pub merged: u64,
    pub rejected: u64,
    pub sources_recorded: u64,
    pub vehicles_created: u64,
    pub vehicle_links_created: u64,
}

impl ResolutionOutcome {
    pub fn summary(&self) -> String {
        format!(
            "created={} updated={} merged={} rejected={} sources={} vehicles={} links={}",
            self.created,
            self.updated,
            self.merged,
            self.rejected,
            self.sources_recorded,
            self.vehicles_created,
            self.vehicle_links_created,
        )
    }
}
