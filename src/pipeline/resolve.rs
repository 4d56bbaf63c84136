//! Resolve stage: scoring, deduplication, vehicle linking, and the
//! knowledge-graph upsert.
//!
//! Planning is pure: phases A-D (fingerprinting, aggregation, scoring,
//! vehicle resolution) run over the staged rows with no I/O, producing
//! a deterministically ordered [`ResolutionPlan`]. The store then
//! applies the plan in one transaction (phase E-F: upserts, provenance,
//! resolution log, document confidence). Transient database failures
//! retry the whole document once before it is marked failed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::runtime::DocumentStage;
use crate::scoring::{
    self, rank_cmp, EntityKind, ImpactInputs, RankKey, VehicleContext, VehicleRef,
};
use crate::traits::store::PipelineStore;
use crate::types::document::ProcessingStage;
use crate::types::extraction::{DocumentCategory, StagedExtraction, StagedVehicle};
use crate::types::knowledge::{tables, Aggregates};
use crate::types::resolution::{
    CauseUpsert, DtcUpsert, Provenance, RejectedEntity, ResolutionPlan, SensorUpsert, StepUpsert,
    TsbUpsert, VehicleLinkPlan,
};

/// Normalized fingerprint for text-entity deduplication: lowercase,
/// collapsed whitespace, terminal punctuation stripped.
pub fn fingerprint(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', '!', '?', ';', ':', ','])
        .trim_end()
        .to_string()
}

/// Map an extraction category string onto a master-row system category,
/// falling back to the one implied by the code letter.
fn system_category(raw: Option<&str>, fallback: &'static str) -> String {
    let Some(raw) = raw else {
        return fallback.to_string();
    };
    match raw.trim().to_lowercase().as_str() {
        "powertrain" | "engine" | "transmission" => "powertrain".to_string(),
        "chassis" => "chassis".to_string(),
        "body" => "body".to_string(),
        "network" => "network".to_string(),
        "electrical" => "electrical".to_string(),
        "emissions" => "emissions".to_string(),
        "" => fallback.to_string(),
        other => other.to_string(),
    }
}

/// Derive the document's vehicle context: the modal make across staged
/// mentions, then the modal model within that make, then the modal
/// start year. Ties break alphabetically so the context is stable.
pub fn vehicle_context(vehicles: &[StagedVehicle]) -> VehicleContext {
    if vehicles.is_empty() {
        return VehicleContext::default();
    }

    let mut make_counts: BTreeMap<String, usize> = BTreeMap::new();
    for vehicle in vehicles {
        *make_counts.entry(vehicle.make.to_lowercase()).or_default() += 1;
    }
    let best_make = make_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(make, _)| make.clone())
        .expect("non-empty mentions");

    let of_make: Vec<&StagedVehicle> = vehicles
        .iter()
        .filter(|v| v.make.to_lowercase() == best_make)
        .collect();

    let mut model_counts: BTreeMap<String, usize> = BTreeMap::new();
    for vehicle in &of_make {
        *model_counts.entry(vehicle.model.to_lowercase()).or_default() += 1;
    }
    let best_model = model_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(model, _)| model.clone());

    let mut year_counts: BTreeMap<i32, usize> = BTreeMap::new();
    for vehicle in &of_make {
        if let Some(year) = vehicle.year_start {
            *year_counts.entry(year).or_default() += 1;
        }
    }
    let best_year = year_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(year, _)| *year);

    VehicleContext {
        make: of_make.first().map(|v| v.make.clone()),
        model: best_model.and_then(|target| {
            of_make
                .iter()
                .find(|v| v.model.to_lowercase() == target)
                .map(|v| v.model.clone())
        }),
        year: best_year,
    }
}

fn dedup_sources(rows: impl Iterator<Item = Provenance>) -> Vec<Provenance> {
    let mut seen = Vec::new();
    let mut sources = Vec::new();
    for row in rows {
        if seen.contains(&row.chunk_id) {
            continue;
        }
        seen.push(row.chunk_id);
        sources.push(row);
    }
    sources
}

/// Phases A-D: build the resolution plan from the staged rows.
pub fn plan_resolution(document_id: Uuid, staged: &StagedExtraction) -> ResolutionPlan {
    if staged.is_empty() {
        return ResolutionPlan::empty(document_id, "no eligible chunks");
    }

    let ctx = vehicle_context(&staged.vehicles);
    let run_id = Uuid::new_v4();
    let mut rejected: Vec<RejectedEntity> = Vec::new();

    // DTC master upserts, one per code, ordered by code.
    let mut dtc_groups: BTreeMap<String, Vec<&crate::types::extraction::StagedDtc>> =
        BTreeMap::new();
    for dtc in &staged.dtcs {
        dtc_groups
            .entry(dtc.code.as_str().to_string())
            .or_default()
            .push(dtc);
    }

    let mut dtc_upserts = Vec::new();
    for group in dtc_groups.values() {
        let code = group[0].code.clone();

        let described = group
            .iter()
            .filter(|d| !d.description.is_empty())
            .max_by(|a, b| {
                a.trust
                    .total_cmp(&b.trust)
                    .then_with(|| b.description.cmp(&a.description))
            });
        let (description, description_trust) = described
            .map(|d| (d.description.clone(), d.trust))
            .unwrap_or_default();

        let severities: Vec<_> = group.iter().filter_map(|d| d.severity).collect();
        let mut distinct = severities.clone();
        distinct.sort_by_key(|s| s.level());
        distinct.dedup();
        let severity_conflict = distinct.len() > 1;
        let severity_level = group
            .iter()
            .filter(|d| d.severity.is_some())
            .max_by(|a, b| a.trust.total_cmp(&b.trust))
            .and_then(|d| d.severity)
            .map(|s| s.level());

        let category = group
            .iter()
            .filter_map(|d| d.category.as_deref())
            .next()
            .map(str::to_string);

        dtc_upserts.push(DtcUpsert {
            system_category: system_category(category.as_deref(), code.system_category()),
            emissions_related: code.is_emissions_related(),
            description,
            description_trust,
            severity_level,
            severity_conflict,
            sources: dedup_sources(group.iter().map(|d| Provenance {
                chunk_id: d.chunk_id,
                trust: d.trust,
                relevance: d.relevance,
            })),
            code,
        });
    }

    // Causes: group by (code, fingerprint), aggregate, score, rank.
    let mut cause_groups: BTreeMap<(String, String), Vec<&crate::types::extraction::StagedCause>> =
        BTreeMap::new();
    for cause in &staged.causes {
        let print = fingerprint(&cause.description);
        if print.is_empty() {
            continue;
        }
        cause_groups
            .entry((cause.dtc_code.as_str().to_string(), print))
            .or_default()
            .push(cause);
    }

    let mut cause_upserts: Vec<(RankKey, CauseUpsert)> = Vec::new();
    for ((code_key, print), group) in &cause_groups {
        let evidence_count = group.len() as i64;
        let avg_trust = group.iter().map(|c| c.trust).sum::<f64>() / group.len() as f64;
        let avg_relevance = group.iter().map(|c| c.relevance).sum::<f64>() / group.len() as f64;
        let weight = scoring::probability_weight(evidence_count);

        let canonical = group
            .iter()
            .max_by(|a, b| {
                a.trust
                    .total_cmp(&b.trust)
                    .then_with(|| b.description.cmp(&a.description))
            })
            .expect("non-empty group");

        let score = scoring::unified_score(
            EntityKind::Cause,
            avg_trust,
            avg_relevance,
            evidence_count,
            &VehicleRef::default(),
            &ctx,
            &ImpactInputs {
                probability_weight: weight,
                ..Default::default()
            },
        );

        cause_upserts.push((
            RankKey {
                score,
                evidence_count,
                avg_trust,
                avg_relevance,
                key: format!("{code_key}:{print}"),
            },
            CauseUpsert {
                dtc_code: canonical.dtc_code.clone(),
                cause: canonical.description.clone(),
                likelihood: canonical.likelihood,
                aggregates: Aggregates::new(evidence_count, avg_trust, avg_relevance),
                probability_weight: weight,
                score,
                sources: dedup_sources(group.iter().map(|c| Provenance {
                    chunk_id: c.chunk_id,
                    trust: c.trust,
                    relevance: c.relevance,
                })),
            },
        ));
    }
    cause_upserts.sort_by(|a, b| rank_cmp(&a.0, &b.0));

    // Diagnostic steps: same shape, impact-neutral.
    let mut step_groups: BTreeMap<(String, String), Vec<&crate::types::extraction::StagedStep>> =
        BTreeMap::new();
    for step in &staged.steps {
        let print = fingerprint(&step.description);
        if print.is_empty() {
            continue;
        }
        step_groups
            .entry((step.dtc_code.as_str().to_string(), print))
            .or_default()
            .push(step);
    }

    let mut step_upserts: Vec<(RankKey, StepUpsert)> = Vec::new();
    for ((code_key, print), group) in &step_groups {
        let evidence_count = group.len() as i64;
        let avg_trust = group.iter().map(|s| s.trust).sum::<f64>() / group.len() as f64;
        let avg_relevance = group.iter().map(|s| s.relevance).sum::<f64>() / group.len() as f64;

        let canonical = group
            .iter()
            .max_by(|a, b| {
                a.trust
                    .total_cmp(&b.trust)
                    .then_with(|| b.description.cmp(&a.description))
            })
            .expect("non-empty group");

        let score = scoring::unified_score(
            EntityKind::DiagnosticStep,
            avg_trust,
            avg_relevance,
            evidence_count,
            &VehicleRef::default(),
            &ctx,
            &ImpactInputs::default(),
        );

        step_upserts.push((
            RankKey {
                score,
                evidence_count,
                avg_trust,
                avg_relevance,
                key: format!("{code_key}:{print}"),
            },
            StepUpsert {
                dtc_code: canonical.dtc_code.clone(),
                step_order: group.iter().map(|s| s.step_order).min().unwrap_or(1),
                instruction: canonical.description.clone(),
                tools_required: canonical.tools_required.clone(),
                expected_values: canonical.expected_values.clone(),
                aggregates: Aggregates::new(evidence_count, avg_trust, avg_relevance),
                score,
                sources: dedup_sources(group.iter().map(|s| Provenance {
                    chunk_id: s.chunk_id,
                    trust: s.trust,
                    relevance: s.relevance,
                })),
            },
        ));
    }
    step_upserts.sort_by(|a, b| rank_cmp(&a.0, &b.0));

    // Sensors: one upsert per (DTC, sensor name). A sensor with no
    // valid related code cannot join the graph.
    let mut sensor_groups: BTreeMap<(String, String), Vec<&crate::types::extraction::StagedSensor>> =
        BTreeMap::new();
    for sensor in &staged.sensors {
        if sensor.related_dtc_codes.is_empty() {
            rejected.push(RejectedEntity {
                entity_table: tables::SENSORS.to_string(),
                reason: "no related dtc codes".to_string(),
                details: sensor.name.clone(),
            });
            continue;
        }
        for code in &sensor.related_dtc_codes {
            sensor_groups
                .entry((code.as_str().to_string(), sensor.name.to_lowercase()))
                .or_default()
                .push(sensor);
        }
    }

    let mut sensor_upserts: Vec<(RankKey, SensorUpsert)> = Vec::new();
    for ((code_key, name_key), group) in &sensor_groups {
        let evidence_count = group.len() as i64;
        let avg_trust = group.iter().map(|s| s.trust).sum::<f64>() / group.len() as f64;
        let avg_relevance = group.iter().map(|s| s.relevance).sum::<f64>() / group.len() as f64;

        let canonical = group
            .iter()
            .max_by(|a, b| a.trust.total_cmp(&b.trust).then_with(|| b.name.cmp(&a.name)))
            .expect("non-empty group");

        let score = scoring::unified_score(
            EntityKind::Sensor,
            avg_trust,
            avg_relevance,
            evidence_count,
            &VehicleRef::default(),
            &ctx,
            &ImpactInputs::default(),
        );

        sensor_upserts.push((
            RankKey {
                score,
                evidence_count,
                avg_trust,
                avg_relevance,
                key: format!("{code_key}:{name_key}"),
            },
            SensorUpsert {
                dtc_code: canonical
                    .related_dtc_codes
                    .iter()
                    .find(|c| c.as_str() == code_key)
                    .cloned()
                    .unwrap_or_else(|| group[0].related_dtc_codes[0].clone()),
                name: canonical.name.clone(),
                sensor_type: canonical.sensor_type.clone(),
                typical_range: canonical.typical_range.clone(),
                unit: canonical.unit.clone(),
                aggregates: Aggregates::new(evidence_count, avg_trust, avg_relevance),
                score,
                sources: dedup_sources(group.iter().map(|s| Provenance {
                    chunk_id: s.chunk_id,
                    trust: s.trust,
                    relevance: s.relevance,
                })),
            },
        ));
    }
    sensor_upserts.sort_by(|a, b| rank_cmp(&a.0, &b.0));

    // TSB references, grouped by bulletin number.
    let mut tsb_groups: BTreeMap<String, Vec<&crate::types::extraction::StagedTsb>> =
        BTreeMap::new();
    for tsb in &staged.tsbs {
        tsb_groups
            .entry(tsb.tsb_number.clone())
            .or_default()
            .push(tsb);
    }

    let mut tsb_upserts: Vec<(RankKey, TsbUpsert)> = Vec::new();
    for (number, group) in &tsb_groups {
        let evidence_count = group.len() as i64;
        let avg_trust = group.iter().map(|t| t.trust).sum::<f64>() / group.len() as f64;
        let avg_relevance = group.iter().map(|t| t.relevance).sum::<f64>() / group.len() as f64;

        let canonical = group
            .iter()
            .max_by(|a, b| a.trust.total_cmp(&b.trust).then_with(|| b.title.cmp(&a.title)))
            .expect("non-empty group");

        let mut related = Vec::new();
        for tsb in group {
            for code in &tsb.related_dtc_codes {
                if !related.contains(code) {
                    related.push(code.clone());
                }
            }
        }
        related.sort();

        let score = scoring::unified_score(
            EntityKind::TsbReference,
            avg_trust,
            avg_relevance,
            evidence_count,
            &VehicleRef::default(),
            &ctx,
            &ImpactInputs::default(),
        );

        tsb_upserts.push((
            RankKey {
                score,
                evidence_count,
                avg_trust,
                avg_relevance,
                key: number.clone(),
            },
            TsbUpsert {
                tsb_number: number.clone(),
                title: canonical.title.clone(),
                affected_models: canonical.affected_models.clone(),
                summary: canonical.summary.clone(),
                related_dtc_codes: related,
                aggregates: Aggregates::new(evidence_count, avg_trust, avg_relevance),
                score,
                sources: dedup_sources(group.iter().map(|t| Provenance {
                    chunk_id: t.chunk_id,
                    trust: t.trust,
                    relevance: t.relevance,
                })),
            },
        ));
    }
    tsb_upserts.sort_by(|a, b| rank_cmp(&a.0, &b.0));

    // Vehicle mentions: one link plan per distinct (make, model, years).
    let mut vehicle_groups: BTreeMap<(String, String, Option<i32>, Option<i32>), Vec<&StagedVehicle>> =
        BTreeMap::new();
    for vehicle in &staged.vehicles {
        vehicle_groups
            .entry((
                vehicle.make.to_lowercase(),
                vehicle.model.to_lowercase(),
                vehicle.year_start,
                vehicle.year_end,
            ))
            .or_default()
            .push(vehicle);
    }

    let mut vehicle_links: Vec<(RankKey, VehicleLinkPlan)> = Vec::new();
    for ((make_key, model_key, year_start, year_end), group) in &vehicle_groups {
        let evidence_count = group.len() as i64;
        let avg_trust = group.iter().map(|v| v.trust).sum::<f64>() / group.len() as f64;
        let avg_relevance = group.iter().map(|v| v.relevance).sum::<f64>() / group.len() as f64;

        let entity_ref = VehicleRef {
            make: Some(group[0].make.clone()),
            model: Some(group[0].model.clone()),
            year_start: *year_start,
            year_end: *year_end,
        };
        let specificity = scoring::vehicle_specificity_score(&entity_ref, &ctx);
        let score = scoring::evidence_quality_score(avg_trust, avg_relevance)
            + scoring::consensus_score(evidence_count)
            + specificity;

        let mut codes = Vec::new();
        for vehicle in group {
            for code in &vehicle.related_dtc_codes {
                if !codes.contains(code) {
                    codes.push(code.clone());
                }
            }
        }
        codes.sort();

        vehicle_links.push((
            RankKey {
                score,
                evidence_count,
                avg_trust,
                avg_relevance,
                key: format!("{make_key}:{model_key}:{year_start:?}:{year_end:?}"),
            },
            VehicleLinkPlan {
                make: group[0].make.clone(),
                model: group[0].model.clone(),
                year_start: *year_start,
                year_end: *year_end,
                dtc_codes: codes,
                source_chunk_id: group[0].chunk_id,
                specificity,
                score,
            },
        ));
    }
    vehicle_links.sort_by(|a, b| rank_cmp(&a.0, &b.0));

    // Document category: majority vote across chunk-level categories.
    let mut category_counts: BTreeMap<&'static str, (usize, DocumentCategory)> = BTreeMap::new();
    for staged_category in &staged.categories {
        let entry = category_counts
            .entry(staged_category.category.as_str())
            .or_insert((0, staged_category.category));
        entry.0 += 1;
    }
    let document_category = category_counts
        .iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.0.cmp(a.0)))
        .map(|(_, (_, category))| *category);

    // Document confidence over distinct contributing chunks.
    let mut chunk_trust: BTreeMap<Uuid, f64> = BTreeMap::new();
    for source in staged
        .dtcs
        .iter()
        .map(|d| (d.chunk_id, d.trust))
        .chain(staged.causes.iter().map(|c| (c.chunk_id, c.trust)))
        .chain(staged.steps.iter().map(|s| (s.chunk_id, s.trust)))
        .chain(staged.sensors.iter().map(|s| (s.chunk_id, s.trust)))
        .chain(staged.tsbs.iter().map(|t| (t.chunk_id, t.trust)))
        .chain(staged.vehicles.iter().map(|v| (v.chunk_id, v.trust)))
    {
        chunk_trust.entry(source.0).or_insert(source.1);
    }
    let document_confidence = if chunk_trust.is_empty() {
        None
    } else {
        let avg_trust = chunk_trust.values().sum::<f64>() / chunk_trust.len() as f64;
        Some(scoring::confidence_score(chunk_trust.len() as i64, avg_trust))
    };

    ResolutionPlan {
        run_id,
        document_id,
        dtc_upserts,
        cause_upserts: cause_upserts.into_iter().map(|(_, u)| u).collect(),
        step_upserts: step_upserts.into_iter().map(|(_, u)| u).collect(),
        sensor_upserts: sensor_upserts.into_iter().map(|(_, u)| u).collect(),
        tsb_upserts: tsb_upserts.into_iter().map(|(_, u)| u).collect(),
        vehicle_links: vehicle_links.into_iter().map(|(_, u)| u).collect(),
        document_category,
        document_confidence,
        rejected,
    }
}

/// The resolve stage worker. Terminal: on success the document moves to
/// `complete` and nothing is enqueued.
pub struct ResolveStage<S> {
    store: Arc<S>,
    retry_backoff: Duration,
}

impl<S: PipelineStore> ResolveStage<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[async_trait::async_trait]
impl<S: PipelineStore> DocumentStage for ResolveStage<S> {
    fn stage(&self) -> ProcessingStage {
        ProcessingStage::Resolving
    }

    fn next_stage(&self) -> ProcessingStage {
        ProcessingStage::Complete
    }

    async fn run(&self, document_id: Uuid) -> Result<String> {
        let staged = self.store.staged_extraction(document_id).await?;
        let plan = plan_resolution(document_id, &staged);

        let outcome = match self.store.apply_resolution(&plan).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => {
                warn!(%document_id, error = %e, "resolution rolled back, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.store.apply_resolution(&plan).await?
            }
            Err(e) => return Err(e),
        };

        Ok(format!("run {}: {}", plan.run_id, outcome.summary()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::extraction::{DtcCode, Likelihood, StagedCause, StagedDtc};

    fn cause(code: &str, text: &str, trust: f64, relevance: f64, chunk: Uuid) -> StagedCause {
        StagedCause {
            dtc_code: DtcCode::parse(code).unwrap(),
            description: text.to_string(),
            likelihood: Likelihood::Medium,
            chunk_id: chunk,
            trust,
            relevance,
        }
    }

    fn dtc(code: &str, chunk: Uuid) -> StagedDtc {
        StagedDtc {
            code: DtcCode::parse(code).unwrap(),
            description: format!("{code} description"),
            category: None,
            severity: None,
            chunk_id: chunk,
            trust: 0.8,
            relevance: 0.8,
        }
    }

    fn vehicle(make: &str, model: &str, codes: &[&str], chunk: Uuid) -> StagedVehicle {
        StagedVehicle {
            make: make.to_string(),
            model: model.to_string(),
            year_start: None,
            year_end: None,
            engine: None,
            transmission: None,
            related_dtc_codes: codes.iter().map(|c| DtcCode::parse(c).unwrap()).collect(),
            chunk_id: chunk,
            trust: 0.7,
            relevance: 0.7,
        }
    }

    #[test]
    fn fingerprint_normalizes() {
        assert_eq!(fingerprint("  Worn   Spark Plug.  "), "worn spark plug");
        assert_eq!(fingerprint("Vacuum leak!"), "vacuum leak");
        assert_eq!(fingerprint("a  b\tc"), "a b c");
        assert_eq!(fingerprint("..."), "");
    }

    #[test]
    fn equal_fingerprints_group_and_aggregate() {
        let chunk_a = Uuid::new_v4();
        let chunk_b = Uuid::new_v4();
        let staged = StagedExtraction {
            dtcs: vec![dtc("P0301", chunk_a)],
            causes: vec![
                cause("P0301", "Worn spark plug.", 0.9, 0.8, chunk_a),
                cause("P0301", "worn  SPARK plug", 0.5, 0.6, chunk_b),
                cause("P0301", "Failed ignition coil", 0.9, 0.8, chunk_a),
            ],
            ..Default::default()
        };

        let plan = plan_resolution(Uuid::new_v4(), &staged);
        assert_eq!(plan.cause_upserts.len(), 2);

        let merged = plan
            .cause_upserts
            .iter()
            .find(|c| fingerprint(&c.cause) == "worn spark plug")
            .unwrap();
        assert_eq!(merged.aggregates.evidence_count, 2);
        assert!((merged.aggregates.avg_trust - 0.7).abs() < 1e-9);
        assert!((merged.aggregates.avg_relevance - 0.7).abs() < 1e-9);
        assert!((merged.probability_weight - 0.6).abs() < 1e-9);
        // canonical text comes from the higher-trust observation
        assert_eq!(merged.cause, "Worn spark plug.");
        assert_eq!(merged.sources.len(), 2);
    }

    #[test]
    fn plan_ordering_is_reproducible() {
        let chunk = Uuid::new_v4();
        let staged = StagedExtraction {
            dtcs: vec![dtc("P0301", chunk)],
            causes: vec![
                cause("P0301", "Bad fuel injector", 0.6, 0.6, chunk),
                cause("P0301", "Worn spark plug", 0.9, 0.9, chunk),
                cause("P0301", "Failed ignition coil", 0.9, 0.9, chunk),
            ],
            ..Default::default()
        };

        let plan_a = plan_resolution(Uuid::new_v4(), &staged);
        let plan_b = plan_resolution(Uuid::new_v4(), &staged);

        let order_a: Vec<&str> = plan_a.cause_upserts.iter().map(|c| c.cause.as_str()).collect();
        let order_b: Vec<&str> = plan_b.cause_upserts.iter().map(|c| c.cause.as_str()).collect();
        assert_eq!(order_a, order_b);
        // equal scores tie-break on the normalized key, ascending
        assert_eq!(order_a[0], "Failed ignition coil");
        assert_eq!(order_a[1], "Worn spark plug");
        assert_eq!(order_a[2], "Bad fuel injector");
    }

    #[test]
    fn conflicting_vehicle_ranks_below_matching_one() {
        let chunk_a = Uuid::new_v4();
        let chunk_b = Uuid::new_v4();
        let staged = StagedExtraction {
            dtcs: vec![dtc("P0420", chunk_a)],
            vehicles: vec![
                vehicle("Ford", "F-150", &["P0420"], chunk_a),
                vehicle("Ford", "F-150", &["P0420"], chunk_a),
                vehicle("Toyota", "Camry", &["P0420"], chunk_b),
            ],
            ..Default::default()
        };

        let plan = plan_resolution(Uuid::new_v4(), &staged);
        assert_eq!(plan.vehicle_links.len(), 2);
        // Ford is the document context (modal make), so the Toyota
        // mention contradicts it and sinks to the bottom.
        assert_eq!(plan.vehicle_links[0].make, "Ford");
        assert!((plan.vehicle_links[0].specificity - 20.0).abs() < 1e-9);
        assert_eq!(plan.vehicle_links[1].make, "Toyota");
        assert!((plan.vehicle_links[1].specificity - -20.0).abs() < 1e-9);
        assert!(plan.vehicle_links[0].score > plan.vehicle_links[1].score);
    }

    #[test]
    fn severity_disagreement_sets_conflict() {
        use crate::types::extraction::Severity;
        let chunk = Uuid::new_v4();
        let mut first = dtc("P0301", chunk);
        first.severity = Some(Severity::Critical);
        let mut second = dtc("P0301", chunk);
        second.severity = Some(Severity::Minor);

        let staged = StagedExtraction {
            dtcs: vec![first, second],
            ..Default::default()
        };
        let plan = plan_resolution(Uuid::new_v4(), &staged);
        assert_eq!(plan.dtc_upserts.len(), 1);
        assert!(plan.dtc_upserts[0].severity_conflict);
    }

    #[test]
    fn empty_staging_plans_a_rejection() {
        let plan = plan_resolution(Uuid::new_v4(), &StagedExtraction::default());
        assert!(plan.is_noop());
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].reason, "no eligible chunks");
    }

    #[test]
    fn sensor_without_codes_is_rejected() {
        use crate::types::extraction::StagedSensor;
        let chunk = Uuid::new_v4();
        let staged = StagedExtraction {
            sensors: vec![StagedSensor {
                name: "Orphan Sensor".to_string(),
                sensor_type: None,
                typical_range: None,
                unit: None,
                related_dtc_codes: vec![],
                chunk_id: chunk,
                trust: 0.5,
                relevance: 0.5,
            }],
            ..Default::default()
        };
        let plan = plan_resolution(Uuid::new_v4(), &staged);
        assert!(plan.sensor_upserts.is_empty());
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].details, "Orphan Sensor");
    }

    #[test]
    fn document_category_is_majority_vote() {
        use crate::types::extraction::StagedCategory;
        let staged = StagedExtraction {
            dtcs: vec![dtc("P0301", Uuid::new_v4())],
            categories: vec![
                StagedCategory {
                    category: DocumentCategory::DiagnosticGuide,
                    chunk_id: Uuid::new_v4(),
                },
                StagedCategory {
                    category: DocumentCategory::DiagnosticGuide,
                    chunk_id: Uuid::new_v4(),
                },
                StagedCategory {
                    category: DocumentCategory::ForumDiscussion,
                    chunk_id: Uuid::new_v4(),
                },
            ],
            ..Default::default()
        };
        let plan = plan_resolution(Uuid::new_v4(), &staged);
        assert_eq!(plan.document_category, Some(DocumentCategory::DiagnosticGuide));
    }

    #[test]
    fn document_confidence_counts_distinct_chunks() {
        let chunk_a = Uuid::new_v4();
        let chunk_b = Uuid::new_v4();
        let staged = StagedExtraction {
            dtcs: vec![dtc("P0301", chunk_a)],
            causes: vec![
                cause("P0301", "Worn spark plug", 0.8, 0.8, chunk_a),
                cause("P0301", "Failed coil", 0.8, 0.8, chunk_b),
            ],
            ..Default::default()
        };
        let plan = plan_resolution(Uuid::new_v4(), &staged);
        // two distinct chunks, avg trust 0.8
        let expected = scoring::confidence_score(2, 0.8);
        assert!((plan.document_confidence.unwrap() - expected).abs() < 1e-9);
    }
}
