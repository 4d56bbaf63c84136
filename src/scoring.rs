//! Pure scoring functions shared by Resolve and the stats surface.
//!
//! Everything here is deterministic: no I/O, no clock, no randomness.
//! The unified score S is the sum of four components and lies in
//! [-20, 100]; ties are broken by the fixed rank ordering so two runs
//! over the same inputs always produce the same order.

use std::cmp::Ordering;

use crate::types::knowledge::Aggregates;

/// Entity kinds the practical-impact component distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Cause,
    Symptom,
    DiagnosticStep,
    VerifiedFix,
    RelatedPart,
    Sensor,
    LiveDataParameter,
    ForumThread,
    TsbReference,
}

/// Clamp to [0, 1].
pub fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Evidence Quality Score, 0-50.
///
/// `EQS = 50 * (0.65 * avg_trust + 0.35 * avg_relevance)`
pub fn evidence_quality_score(avg_trust: f64, avg_relevance: f64) -> f64 {
    50.0 * (0.65 * clamp01(avg_trust) + 0.35 * clamp01(avg_relevance))
}

/// Consensus Score, 0-20, saturating at 10 pieces of evidence.
///
/// `CS = 20 * clamp(ln(1 + n) / ln(1 + 10), 0, 1)`
pub fn consensus_score(evidence_count: i64) -> f64 {
    if evidence_count <= 0 {
        return 0.0;
    }
    let consensus = (1.0 + evidence_count as f64).ln() / 11.0_f64.ln();
    20.0 * clamp01(consensus)
}

/// Vehicle identity an entity carries (all fields optional).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleRef {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
}

/// The document's declared vehicle context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleContext {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Vehicle Specificity Score, -20 to +20.
///
/// +20 exact make/model/year match against context, +12 make only,
/// +6 OEM-agnostic or no context to compare, -20 on contradiction.
pub fn vehicle_specificity_score(entity: &VehicleRef, ctx: &VehicleContext) -> f64 {
    let Some(ctx_make) = ctx.make.as_deref() else {
        return 6.0;
    };
    let Some(entity_make) = entity.make.as_deref() else {
        return 6.0;
    };
    if !eq_ci(entity_make, ctx_make) {
        return -20.0;
    }
    let (Some(ctx_model), Some(entity_model)) = (ctx.model.as_deref(), entity.model.as_deref())
    else {
        return 12.0;
    };
    if !eq_ci(entity_model, ctx_model) {
        return -20.0;
    }
    match (ctx.year, entity.year_start, entity.year_end) {
        (Some(year), Some(start), Some(end)) => {
            if start <= year && year <= end {
                20.0
            } else {
                -20.0
            }
        }
        (Some(year), Some(start), None) => {
            if year >= start {
                20.0
            } else {
                -20.0
            }
        }
        _ => 20.0,
    }
}

/// Inputs to the practical-impact component; only the fields relevant
/// to the entity kind are read.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImpactInputs {
    pub confirmed_repairs: i64,
    pub probability_weight: f64,
    pub frequency_score: i64,
    pub solution_marked: bool,
}

/// Practical Impact Score, 0-10.
pub fn practical_impact_score(kind: EntityKind, inputs: &ImpactInputs) -> f64 {
    match kind {
        EntityKind::VerifiedFix | EntityKind::RelatedPart => {
            if inputs.confirmed_repairs <= 0 {
                return 0.0;
            }
            let impact = (1.0 + inputs.confirmed_repairs as f64).ln() / 51.0_f64.ln();
            10.0 * clamp01(impact)
        }
        EntityKind::Cause => 10.0 * clamp01(inputs.probability_weight),
        EntityKind::Symptom => 10.0 * clamp01(inputs.frequency_score as f64 / 10.0),
        EntityKind::ForumThread => {
            if inputs.solution_marked {
                6.0
            } else {
                0.0
            }
        }
        EntityKind::DiagnosticStep
        | EntityKind::Sensor
        | EntityKind::LiveDataParameter
        | EntityKind::TsbReference => 0.0,
    }
}

/// The unified score S in [-20, 100]: the sum of the four components.
#[allow(clippy::too_many_arguments)]
pub fn unified_score(
    kind: EntityKind,
    avg_trust: f64,
    avg_relevance: f64,
    evidence_count: i64,
    entity_vehicle: &VehicleRef,
    ctx: &VehicleContext,
    impact: &ImpactInputs,
) -> f64 {
    evidence_quality_score(avg_trust, avg_relevance)
        + consensus_score(evidence_count)
        + vehicle_specificity_score(entity_vehicle, ctx)
        + practical_impact_score(kind, impact)
}

/// Empirical probability weight for a cause:
/// `min(1.0, 0.5 + 0.1 * (evidence_count - 1))`.
pub fn probability_weight(evidence_count: i64) -> f64 {
    let count = evidence_count.max(1);
    (0.5 + 0.1 * (count - 1) as f64).min(1.0)
}

/// Frequency score for a symptom: `min(10, evidence_count)`.
pub fn frequency_score(evidence_count: i64) -> i64 {
    evidence_count.clamp(0, 10)
}

/// DTC confidence, shared with the stats surface:
/// `min(1.0, 0.3 * min(1, source_count / 5) + 0.7 * avg_trust)`.
pub fn confidence_score(source_count: i64, avg_trust: f64) -> f64 {
    let source_factor = (source_count as f64 / 5.0).min(1.0);
    (0.3 * source_factor + 0.7 * avg_trust).min(1.0)
}

/// Checklist for the weighted completeness score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletenessChecklist {
    pub has_steps: bool,
    pub has_causes: bool,
    pub has_description: bool,
    pub has_sensors: bool,
    pub has_tsb: bool,
    pub has_category: bool,
    pub has_severity: bool,
}

/// Weighted completeness: steps 0.30, causes 0.25, description 0.15,
/// sensors 0.10, TSB 0.10, category 0.05, severity 0.05.
pub fn completeness_score(checklist: &CompletenessChecklist) -> f64 {
    let mut total = 0.0;
    if checklist.has_steps {
        total += 0.30;
    }
    if checklist.has_causes {
        total += 0.25;
    }
    if checklist.has_description {
        total += 0.15;
    }
    if checklist.has_sensors {
        total += 0.10;
    }
    if checklist.has_tsb {
        total += 0.10;
    }
    if checklist.has_category {
        total += 0.05;
    }
    if checklist.has_severity {
        total += 0.05;
    }
    total
}

/// Sort key for deterministic entity ordering.
///
/// `key` is the entity id when one exists, otherwise the normalized
/// text; it is the final ascending tie-breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct RankKey {
    pub score: f64,
    pub evidence_count: i64,
    pub avg_trust: f64,
    pub avg_relevance: f64,
    pub key: String,
}

/// Compare two entities for ranking: score desc, evidence desc, trust
/// desc, relevance desc, key asc.
pub fn rank_cmp(a: &RankKey, b: &RankKey) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.evidence_count.cmp(&a.evidence_count))
        .then_with(|| b.avg_trust.total_cmp(&a.avg_trust))
        .then_with(|| b.avg_relevance.total_cmp(&a.avg_relevance))
        .then_with(|| a.key.cmp(&b.key))
}

/// Merge stored aggregates with a new observation as evidence-weighted
/// means: the old aggregate weighted by its count, the new observation
/// weighted by its count.
pub fn merge_aggregates(old: &Aggregates, new: &Aggregates) -> Aggregates {
    let old_n = old.evidence_count.max(0) as f64;
    let new_n = new.evidence_count.max(0) as f64;
    let total = old_n + new_n;
    if total == 0.0 {
        return *old;
    }
    Aggregates {
        evidence_count: old.evidence_count.max(0) + new.evidence_count.max(0),
        avg_trust: (old.avg_trust * old_n + new.avg_trust * new_n) / total,
        avg_relevance: (old.avg_relevance * old_n + new.avg_relevance * new_n) / total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn evidence_quality_weights_trust_over_relevance() {
        assert!((evidence_quality_score(1.0, 1.0) - 50.0).abs() < EPS);
        assert!((evidence_quality_score(1.0, 0.0) - 32.5).abs() < EPS);
        assert!((evidence_quality_score(0.0, 1.0) - 17.5).abs() < EPS);
        // out-of-range inputs clamp
        assert!((evidence_quality_score(2.0, -1.0) - 32.5).abs() < EPS);
    }

    #[test]
    fn consensus_saturates_at_ten() {
        assert_eq!(consensus_score(0), 0.0);
        assert!((consensus_score(10) - 20.0).abs() < EPS);
        assert!((consensus_score(100) - 20.0).abs() < EPS);
    }

    #[test]
    fn consensus_is_monotone_non_decreasing() {
        let mut prev = 0.0;
        for n in 0..50 {
            let score = consensus_score(n);
            assert!(score >= prev, "consensus dropped at n={n}");
            prev = score;
        }
    }

    fn ctx(make: &str, model: &str, year: Option<i32>) -> VehicleContext {
        VehicleContext {
            make: Some(make.into()),
            model: Some(model.into()),
            year,
        }
    }

    fn entity(make: &str, model: &str, years: Option<(i32, i32)>) -> VehicleRef {
        VehicleRef {
            make: Some(make.into()),
            model: Some(model.into()),
            year_start: years.map(|(s, _)| s),
            year_end: years.map(|(_, e)| e),
        }
    }

    #[test]
    fn vehicle_specificity_exact_match_is_plus_twenty() {
        let score = vehicle_specificity_score(
            &entity("Ford", "F-150", Some((2015, 2020))),
            &ctx("Ford", "F-150", Some(2018)),
        );
        assert_eq!(score, 20.0);
    }

    #[test]
    fn vehicle_specificity_make_only_is_plus_twelve() {
        let score = vehicle_specificity_score(
            &VehicleRef {
                make: Some("Ford".into()),
                ..Default::default()
            },
            &ctx("Ford", "F-150", None),
        );
        assert_eq!(score, 12.0);
    }

    #[test]
    fn vehicle_specificity_contradiction_is_minus_twenty() {
        let score = vehicle_specificity_score(
            &entity("Toyota", "Camry", None),
            &ctx("Ford", "F-150", None),
        );
        assert_eq!(score, -20.0);
        // year out of range is also a contradiction
        let score = vehicle_specificity_score(
            &entity("Ford", "F-150", Some((2000, 2005))),
            &ctx("Ford", "F-150", Some(2018)),
        );
        assert_eq!(score, -20.0);
    }

    #[test]
    fn vehicle_specificity_agnostic_is_plus_six() {
        let score = vehicle_specificity_score(&VehicleRef::default(), &VehicleContext::default());
        assert_eq!(score, 6.0);
        let score =
            vehicle_specificity_score(&VehicleRef::default(), &ctx("Ford", "F-150", Some(2018)));
        assert_eq!(score, 6.0);
    }

    #[test]
    fn practical_impact_per_kind() {
        let inputs = ImpactInputs {
            confirmed_repairs: 50,
            probability_weight: 0.8,
            frequency_score: 5,
            solution_marked: true,
        };
        assert!((practical_impact_score(EntityKind::VerifiedFix, &inputs) - 10.0).abs() < EPS);
        assert!((practical_impact_score(EntityKind::Cause, &inputs) - 8.0).abs() < EPS);
        assert!((practical_impact_score(EntityKind::Symptom, &inputs) - 5.0).abs() < EPS);
        assert_eq!(practical_impact_score(EntityKind::ForumThread, &inputs), 6.0);
        assert_eq!(
            practical_impact_score(EntityKind::DiagnosticStep, &inputs),
            0.0
        );
        assert_eq!(practical_impact_score(EntityKind::Sensor, &inputs), 0.0);
    }

    #[test]
    fn unified_score_stays_in_range() {
        // worst case: zero quality, zero consensus, contradiction, zero impact
        let low = unified_score(
            EntityKind::Cause,
            0.0,
            0.0,
            0,
            &entity("Toyota", "Camry", None),
            &ctx("Ford", "F-150", None),
            &ImpactInputs::default(),
        );
        assert!((low - -20.0).abs() < EPS);

        // best case: perfect quality, saturated consensus, exact match, max impact
        let high = unified_score(
            EntityKind::Cause,
            1.0,
            1.0,
            10,
            &entity("Ford", "F-150", Some((2015, 2020))),
            &ctx("Ford", "F-150", Some(2018)),
            &ImpactInputs {
                probability_weight: 1.0,
                ..Default::default()
            },
        );
        assert!((high - 100.0).abs() < EPS);
    }

    #[test]
    fn probability_weight_clamps() {
        assert!((probability_weight(1) - 0.5).abs() < EPS);
        assert!((probability_weight(3) - 0.7).abs() < EPS);
        assert!((probability_weight(6) - 1.0).abs() < EPS);
        assert!((probability_weight(60) - 1.0).abs() < EPS);
    }

    #[test]
    fn frequency_score_caps_at_ten() {
        assert_eq!(frequency_score(3), 3);
        assert_eq!(frequency_score(10), 10);
        assert_eq!(frequency_score(25), 10);
    }

    #[test]
    fn confidence_formula_is_exact() {
        // 5+ sources with perfect trust reach 1.0
        assert!((confidence_score(5, 1.0) - 1.0).abs() < EPS);
        // 1 source, trust 0.5: 0.3*0.2 + 0.7*0.5 = 0.41
        assert!((confidence_score(1, 0.5) - 0.41).abs() < EPS);
        // formula from the stats contract, checked exactly
        let expected = (0.3 * (3.0_f64 / 5.0).min(1.0) + 0.7 * 0.8).min(1.0);
        assert!((confidence_score(3, 0.8) - expected).abs() < EPS);
    }

    #[test]
    fn completeness_weights_sum_to_one() {
        let all = CompletenessChecklist {
            has_steps: true,
            has_causes: true,
            has_description: true,
            has_sensors: true,
            has_tsb: true,
            has_category: true,
            has_severity: true,
        };
        assert!((completeness_score(&all) - 1.0).abs() < EPS);
        let steps_only = CompletenessChecklist {
            has_steps: true,
            ..Default::default()
        };
        assert!((completeness_score(&steps_only) - 0.30).abs() < EPS);
    }

    #[test]
    fn rank_ordering_is_deterministic() {
        let mut entries = vec![
            RankKey {
                score: 50.0,
                evidence_count: 2,
                avg_trust: 0.8,
                avg_relevance: 0.8,
                key: "b".into(),
            },
            RankKey {
                score: 50.0,
                evidence_count: 2,
                avg_trust: 0.8,
                avg_relevance: 0.8,
                key: "a".into(),
            },
            RankKey {
                score: 60.0,
                evidence_count: 1,
                avg_trust: 0.2,
                avg_relevance: 0.2,
                key: "c".into(),
            },
            RankKey {
                score: 50.0,
                evidence_count: 3,
                avg_trust: 0.1,
                avg_relevance: 0.1,
                key: "d".into(),
            },
        ];
        entries.sort_by(rank_cmp);
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn merge_aggregates_is_evidence_weighted() {
        let old = Aggregates::new(3, 0.9, 0.6);
        let new = Aggregates::new(1, 0.5, 1.0);
        let merged = merge_aggregates(&old, &new);
        assert_eq!(merged.evidence_count, 4);
        assert!((merged.avg_trust - (0.9 * 3.0 + 0.5) / 4.0).abs() < EPS);
        assert!((merged.avg_relevance - (0.6 * 3.0 + 1.0) / 4.0).abs() < EPS);
    }

    #[test]
    fn merge_with_empty_observation_is_identity() {
        let old = Aggregates::new(2, 0.7, 0.4);
        let merged = merge_aggregates(&old, &Aggregates::new(0, 0.0, 0.0));
        assert_eq!(merged.evidence_count, 2);
        assert!((merged.avg_trust - 0.7).abs() < EPS);
    }
}
