//! In-memory pipeline store.
//!
//! Backs the integration tests and single-process experiments. All
//! state sits behind one `RwLock`, so `apply_resolution` is atomic the
//! same way the Postgres transaction is.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{RefineryError, Result};
use crate::scoring::{self, confidence_score};
use crate::traits::store::PipelineStore;
use crate::types::chunk::{Chunk, ChunkEvaluation, NewChunk};
use crate::types::document::{CrawlRequest, CrawlStatus, Document, ProcessingStage};
use crate::types::extraction::{DtcCode, StagedExtraction};
use crate::types::knowledge::{
    tables, Aggregates, DtcCause, DtcDiagnosticStep, DtcMaster, DtcSensorLink, EntitySource,
    ProcessingLogEntry, ResolutionAction, ResolutionLogEntry, Sensor, TsbReference, Vehicle,
    VehicleDtcLink,
};
use crate::types::resolution::{Provenance, ResolutionOutcome, ResolutionPlan};

#[derive(Default)]
struct Inner {
    documents: HashMap<Uuid, Document>,
    crawl_requests: HashMap<Uuid, CrawlRequest>,
    crawl_request_by_url: HashMap<String, Uuid>,

    chunks: HashMap<Uuid, Chunk>,
    evaluations: HashMap<Uuid, ChunkEvaluation>,
    staged: HashMap<Uuid, StagedExtraction>,

    dtc_masters: HashMap<Uuid, DtcMaster>,
    dtc_by_code: HashMap<String, Uuid>,
    causes: HashMap<Uuid, DtcCause>,
    steps: HashMap<Uuid, DtcDiagnosticStep>,
    sensors: HashMap<Uuid, Sensor>,
    sensor_by_name: HashMap<String, Uuid>,
    sensor_links: HashMap<Uuid, DtcSensorLink>,
    tsbs: HashMap<Uuid, TsbReference>,
    tsb_by_number: HashMap<String, Uuid>,
    vehicles: HashMap<Uuid, Vehicle>,
    vehicle_links: Vec<VehicleDtcLink>,

    entity_sources: Vec<EntitySource>,
    entity_source_keys: HashSet<(String, Uuid, Uuid)>,
    resolution_log: Vec<ResolutionLogEntry>,
    processing_log: Vec<ProcessingLogEntry>,
}

/// In-memory implementation of [`PipelineStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunk rows, across all documents.
    pub fn chunk_count(&self) -> usize {
        self.inner.read().unwrap().chunks.len()
    }

    /// Number of resolution log rows, across all runs.
    pub fn resolution_log_len(&self) -> usize {
        self.inner.read().unwrap().resolution_log.len()
    }

    /// All entity-source rows, for invariant checks in tests.
    pub fn all_entity_sources(&self) -> Vec<EntitySource> {
        self.inner.read().unwrap().entity_sources.clone()
    }

    /// All resolution log rows, across every run.
    pub fn all_resolution_log(&self) -> Vec<ResolutionLogEntry> {
        self.inner.read().unwrap().resolution_log.clone()
    }
}

impl Inner {
    fn record_source(
        &mut self,
        table: &str,
        entity_id: Uuid,
        source: &Provenance,
        outcome: &mut ResolutionOutcome,
    ) {
        let key = (table.to_string(), entity_id, source.chunk_id);
        if self.entity_source_keys.contains(&key) {
            return;
        }
        self.entity_source_keys.insert(key);
        self.entity_sources.push(EntitySource {
            entity_table: table.to_string(),
            entity_id,
            chunk_id: source.chunk_id,
            trust_score: source.trust,
            relevance_score: source.relevance,
            extracted_at: Utc::now(),
        });
        outcome.sources_recorded += 1;
    }

    /// Sources from this observation that have no provenance row yet.
    /// Replayed chunks contribute nothing, which keeps evidence counts
    /// stable across replays.
    fn novel_sources(&self, table: &str, entity_id: Uuid, sources: &[Provenance]) -> Vec<Provenance> {
        sources
            .iter()
            .filter(|s| {
                !self
                    .entity_source_keys
                    .contains(&(table.to_string(), entity_id, s.chunk_id))
            })
            .copied()
            .collect()
    }

    fn log(
        &mut self,
        run_id: Uuid,
        action: ResolutionAction,
        table: &str,
        entity_id: Option<Uuid>,
        details: String,
    ) {
        self.resolution_log.push(ResolutionLogEntry::new(
            run_id, action, table, entity_id, details,
        ));
    }

    fn master_id_for(&self, code: &DtcCode) -> Option<Uuid> {
        self.dtc_by_code.get(code.as_str()).copied()
    }
}

fn observed_aggregates(sources: &[Provenance]) -> Aggregates {
    if sources.is_empty() {
        return Aggregates::new(0, 0.0, 0.0);
    }
    let n = sources.len() as f64;
    Aggregates::new(
        sources.len() as i64,
        sources.iter().map(|s| s.trust).sum::<f64>() / n,
        sources.iter().map(|s| s.relevance).sum::<f64>() / n,
    )
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn insert_document(&self, document: &Document) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .documents
            .insert(document.id, document.clone());
        Ok(())
    }

    async fn document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.inner.read().unwrap().documents.get(&id).cloned())
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .documents
            .values()
            .find(|d| d.content_hash == content_hash)
            .cloned())
    }

    async fn set_document_stage(
        &self,
        id: Uuid,
        stage: ProcessingStage,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let document = inner
            .documents
            .get_mut(&id)
            .ok_or(RefineryError::DocumentNotFound(id))?;
        document.stage = stage;
        document.error_message = error.map(str::to_string);
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn documents_in_stage_longer_than(
        &self,
        stage: ProcessingStage,
        older_than: Duration,
    ) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - older_than;
        Ok(self
            .inner
            .read()
            .unwrap()
            .documents
            .values()
            .filter(|d| d.stage == stage && d.updated_at < cutoff)
            .map(|d| d.id)
            .collect())
    }

    async fn insert_crawl_request(&self, request: &CrawlRequest) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        if inner.crawl_request_by_url.contains_key(&request.url) {
            return Ok(false);
        }
        inner
            .crawl_request_by_url
            .insert(request.url.clone(), request.id);
        inner.crawl_requests.insert(request.id, request.clone());
        Ok(true)
    }

    async fn crawl_request(&self, id: Uuid) -> Result<Option<CrawlRequest>> {
        Ok(self.inner.read().unwrap().crawl_requests.get(&id).cloned())
    }

    async fn set_crawl_request_status(
        &self,
        id: Uuid,
        status: CrawlStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let request = inner
            .crawl_requests
            .get_mut(&id)
            .ok_or(RefineryError::CrawlRequestNotFound(id))?;
        request.status = status;
        request.error_message = error.map(str::to_string);
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_chunks(&self, document_id: Uuid, chunks: &[NewChunk]) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        if !inner.documents.contains_key(&document_id) {
            return Err(RefineryError::DocumentNotFound(document_id));
        }

        // Re-chunking replaces: drop the old chunks and their
        // evaluations, cascade to provenance rows.
        let stale: Vec<Uuid> = inner
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.id)
            .collect();
        for chunk_id in stale {
            inner.chunks.remove(&chunk_id);
            inner.evaluations.remove(&chunk_id);
            inner.entity_sources.retain(|s| s.chunk_id != chunk_id);
            inner
                .entity_source_keys
                .retain(|(_, _, source_chunk)| *source_chunk != chunk_id);
        }

        for chunk in chunks {
            let row = Chunk {
                id: Uuid::new_v4(),
                document_id,
                chunk_index: chunk.chunk_index,
                content: chunk.content.clone(),
                char_start: chunk.char_start,
                char_end: chunk.char_end,
                token_count: chunk.token_count,
                embedding: None,
                created_at: Utc::now(),
            };
            inner.chunks.insert(row.id, row);
        }

        let count = chunks.len();
        if let Some(document) = inner.documents.get_mut(&document_id) {
            document.chunk_count = count as i32;
            document.updated_at = Utc::now();
        }
        Ok(count)
    }

    async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let inner = self.inner.read().unwrap();
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn chunks_missing_embedding(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        Ok(self
            .chunks_for_document(document_id)
            .await?
            .into_iter()
            .filter(|c| c.embedding.is_none())
            .collect())
    }

    async fn store_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(chunk) = inner.chunks.get_mut(&chunk_id) {
            chunk.embedding = Some(embedding.to_vec());
        }
        Ok(())
    }

    async fn upsert_evaluation(&self, evaluation: &ChunkEvaluation) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .evaluations
            .insert(evaluation.chunk_id, evaluation.clone());
        Ok(())
    }

    async fn evaluations_for_document(&self, document_id: Uuid) -> Result<Vec<ChunkEvaluation>> {
        let inner = self.inner.read().unwrap();
        let mut evaluations: Vec<(i32, ChunkEvaluation)> = inner
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .filter_map(|c| {
                inner
                    .evaluations
                    .get(&c.id)
                    .map(|e| (c.chunk_index, e.clone()))
            })
            .collect();
        evaluations.sort_by_key(|(index, _)| *index);
        Ok(evaluations.into_iter().map(|(_, e)| e).collect())
    }

    async fn eligible_chunks(
        &self,
        document_id: Uuid,
        relevance_threshold: f64,
    ) -> Result<Vec<Chunk>> {
        let inner = self.inner.read().unwrap();
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .filter(|c| {
                inner
                    .evaluations
                    .get(&c.id)
                    .is_some_and(|e| e.relevance_score >= relevance_threshold)
            })
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn stage_extraction(&self, document_id: Uuid, staged: &StagedExtraction) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .staged
            .insert(document_id, staged.clone());
        Ok(())
    }

    async fn staged_extraction(&self, document_id: Uuid) -> Result<StagedExtraction> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .staged
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_resolution(&self, plan: &ResolutionPlan) -> Result<ResolutionOutcome> {
        let mut inner = self.inner.write().unwrap();
        let mut outcome = ResolutionOutcome::default();
        let run_id = plan.run_id;
        let mut touched_masters: HashSet<Uuid> = HashSet::new();

        // DTC master rows
        for upsert in &plan.dtc_upserts {
            let now = Utc::now();
            let (master_id, action) = match inner.master_id_for(&upsert.code) {
                Some(id) => {
                    let master = inner.dtc_masters.get_mut(&id).expect("indexed master");
                    if !upsert.description.is_empty()
                        && upsert.description_trust > master.description_trust
                    {
                        master.generic_description = upsert.description.clone();
                        master.description_trust = upsert.description_trust;
                    }
                    if master.severity_level.is_none() {
                        master.severity_level = upsert.severity_level;
                    }
                    master.conflict_flag |= upsert.severity_conflict;
                    master.updated_at = now;
                    (id, ResolutionAction::Updated)
                }
                None => {
                    let master = DtcMaster {
                        id: Uuid::new_v4(),
                        code: upsert.code.clone(),
                        system_category: upsert.system_category.clone(),
                        generic_description: upsert.description.clone(),
                        description_trust: upsert.description_trust,
                        severity_level: upsert.severity_level,
                        emissions_related: upsert.emissions_related,
                        confidence_score: 0.0,
                        conflict_flag: upsert.severity_conflict,
                        created_at: now,
                        updated_at: now,
                    };
                    let id = master.id;
                    inner.dtc_by_code.insert(upsert.code.as_str().to_string(), id);
                    inner.dtc_masters.insert(id, master);
                    (id, ResolutionAction::Created)
                }
            };

            touched_masters.insert(master_id);
            for source in &upsert.sources {
                inner.record_source(tables::DTC_MASTER, master_id, source, &mut outcome);
            }
            match action {
                ResolutionAction::Created => outcome.created += 1,
                _ => outcome.updated += 1,
            }
            inner.log(
                run_id,
                action,
                tables::DTC_MASTER,
                Some(master_id),
                format!("code={}", upsert.code),
            );
        }

        // Possible causes
        for upsert in &plan.cause_upserts {
            let Some(master_id) = inner.master_id_for(&upsert.dtc_code) else {
                outcome.rejected += 1;
                inner.log(
                    run_id,
                    ResolutionAction::Rejected,
                    tables::CAUSES,
                    None,
                    format!("unknown dtc {} for cause", upsert.dtc_code),
                );
                continue;
            };
            touched_masters.insert(master_id);

            let key = upsert.cause.to_lowercase();
            let existing = inner
                .causes
                .values()
                .find(|c| c.dtc_master_id == master_id && c.cause.to_lowercase() == key)
                .map(|c| c.id);

            match existing {
                Some(cause_id) => {
                    let novel = inner.novel_sources(tables::CAUSES, cause_id, &upsert.sources);
                    if !novel.is_empty() {
                        let observation = observed_aggregates(&novel);
                        let cause = inner.causes.get_mut(&cause_id).expect("cause row");
                        cause.aggregates = scoring::merge_aggregates(&cause.aggregates, &observation);
                        cause.probability_weight =
                            scoring::probability_weight(cause.aggregates.evidence_count);
                        for source in &novel {
                            inner.record_source(tables::CAUSES, cause_id, source, &mut outcome);
                        }
                        outcome.merged += 1;
                        inner.log(
                            run_id,
                            ResolutionAction::Merged,
                            tables::CAUSES,
                            Some(cause_id),
                            format!("dtc={} evidence+={}", upsert.dtc_code, observation.evidence_count),
                        );
                    }
                }
                None => {
                    let cause = DtcCause {
                        id: Uuid::new_v4(),
                        dtc_master_id: master_id,
                        cause: upsert.cause.clone(),
                        probability_weight: upsert.probability_weight,
                        aggregates: upsert.aggregates,
                        conflict_flag: false,
                    };
                    let cause_id = cause.id;
                    inner.causes.insert(cause_id, cause);
                    for source in &upsert.sources {
                        inner.record_source(tables::CAUSES, cause_id, source, &mut outcome);
                    }
                    outcome.created += 1;
                    inner.log(
                        run_id,
                        ResolutionAction::Created,
                        tables::CAUSES,
                        Some(cause_id),
                        format!("dtc={} likelihood={}", upsert.dtc_code, upsert.likelihood.as_str()),
                    );
                }
            }
        }

        // Diagnostic steps
        for upsert in &plan.step_upserts {
            let Some(master_id) = inner.master_id_for(&upsert.dtc_code) else {
                outcome.rejected += 1;
                inner.log(
                    run_id,
                    ResolutionAction::Rejected,
                    tables::STEPS,
                    None,
                    format!("unknown dtc {} for step", upsert.dtc_code),
                );
                continue;
            };
            touched_masters.insert(master_id);

            let key = upsert.instruction.to_lowercase();
            let existing = inner
                .steps
                .values()
                .find(|s| s.dtc_master_id == master_id && s.instruction.to_lowercase() == key)
                .map(|s| s.id);

            match existing {
                Some(step_id) => {
                    let novel = inner.novel_sources(tables::STEPS, step_id, &upsert.sources);
                    if !novel.is_empty() {
                        let observation = observed_aggregates(&novel);
                        let step = inner.steps.get_mut(&step_id).expect("step row");
                        step.aggregates = scoring::merge_aggregates(&step.aggregates, &observation);
                        step.step_order = step.step_order.min(upsert.step_order);
                        for source in &novel {
                            inner.record_source(tables::STEPS, step_id, source, &mut outcome);
                        }
                        outcome.merged += 1;
                        inner.log(
                            run_id,
                            ResolutionAction::Merged,
                            tables::STEPS,
                            Some(step_id),
                            format!("dtc={}", upsert.dtc_code),
                        );
                    }
                }
                None => {
                    let step = DtcDiagnosticStep {
                        id: Uuid::new_v4(),
                        dtc_master_id: master_id,
                        step_order: upsert.step_order,
                        instruction: upsert.instruction.clone(),
                        tools_required: upsert.tools_required.clone(),
                        expected_values: upsert.expected_values.clone(),
                        pass_next_step_id: None,
                        fail_next_step_id: None,
                        aggregates: upsert.aggregates,
                    };
                    let step_id = step.id;
                    inner.steps.insert(step_id, step);
                    for source in &upsert.sources {
                        inner.record_source(tables::STEPS, step_id, source, &mut outcome);
                    }
                    outcome.created += 1;
                    inner.log(
                        run_id,
                        ResolutionAction::Created,
                        tables::STEPS,
                        Some(step_id),
                        format!("dtc={} order={}", upsert.dtc_code, upsert.step_order),
                    );
                }
            }
        }

        // Sensors: reference row plus DTC link
        for upsert in &plan.sensor_upserts {
            let Some(master_id) = inner.master_id_for(&upsert.dtc_code) else {
                outcome.rejected += 1;
                inner.log(
                    run_id,
                    ResolutionAction::Rejected,
                    tables::SENSORS,
                    None,
                    format!("unknown dtc {} for sensor {}", upsert.dtc_code, upsert.name),
                );
                continue;
            };
            touched_masters.insert(master_id);

            let name_key = upsert.name.to_lowercase();
            let sensor_id = match inner.sensor_by_name.get(&name_key) {
                Some(id) => *id,
                None => {
                    let sensor = Sensor {
                        id: Uuid::new_v4(),
                        name: upsert.name.clone(),
                        sensor_type: upsert.sensor_type.clone(),
                    };
                    let id = sensor.id;
                    inner.sensor_by_name.insert(name_key, id);
                    inner.sensors.insert(id, sensor);
                    id
                }
            };

            let existing = inner
                .sensor_links
                .values()
                .find(|l| l.dtc_master_id == master_id && l.sensor_id == sensor_id)
                .map(|l| l.id);

            match existing {
                Some(link_id) => {
                    let novel = inner.novel_sources(tables::SENSORS, link_id, &upsert.sources);
                    if !novel.is_empty() {
                        let observation = observed_aggregates(&novel);
                        let link = inner.sensor_links.get_mut(&link_id).expect("sensor link");
                        link.aggregates = scoring::merge_aggregates(&link.aggregates, &observation);
                        if link.typical_range.is_none() {
                            link.typical_range = upsert.typical_range.clone();
                        }
                        if link.unit.is_none() {
                            link.unit = upsert.unit.clone();
                        }
                        for source in &novel {
                            inner.record_source(tables::SENSORS, link_id, source, &mut outcome);
                        }
                        outcome.merged += 1;
                        inner.log(
                            run_id,
                            ResolutionAction::Merged,
                            tables::SENSORS,
                            Some(link_id),
                            format!("dtc={} sensor={}", upsert.dtc_code, upsert.name),
                        );
                    }
                }
                None => {
                    let link = DtcSensorLink {
                        id: Uuid::new_v4(),
                        dtc_master_id: master_id,
                        sensor_id,
                        typical_range: upsert.typical_range.clone(),
                        unit: upsert.unit.clone(),
                        aggregates: upsert.aggregates,
                    };
                    let link_id = link.id;
                    inner.sensor_links.insert(link_id, link);
                    for source in &upsert.sources {
                        inner.record_source(tables::SENSORS, link_id, source, &mut outcome);
                    }
                    outcome.created += 1;
                    inner.log(
                        run_id,
                        ResolutionAction::Created,
                        tables::SENSORS,
                        Some(link_id),
                        format!("dtc={} sensor={}", upsert.dtc_code, upsert.name),
                    );
                }
            }
        }

        // TSB references
        for upsert in &plan.tsb_upserts {
            let existing = inner.tsb_by_number.get(&upsert.tsb_number).copied();
            match existing {
                Some(tsb_id) => {
                    let novel = inner.novel_sources(tables::TSBS, tsb_id, &upsert.sources);
                    if !novel.is_empty() {
                        let observation = observed_aggregates(&novel);
                        let tsb = inner.tsbs.get_mut(&tsb_id).expect("tsb row");
                        tsb.aggregates = scoring::merge_aggregates(&tsb.aggregates, &observation);
                        if tsb.title.is_empty() {
                            tsb.title = upsert.title.clone();
                        }
                        if tsb.summary.is_empty() {
                            tsb.summary = upsert.summary.clone();
                        }
                        if tsb.affected_models.is_empty() {
                            tsb.affected_models = upsert.affected_models.clone();
                        }
                        for code in &upsert.related_dtc_codes {
                            if !tsb.related_dtc_codes.contains(code) {
                                tsb.related_dtc_codes.push(code.clone());
                            }
                        }
                        for source in &novel {
                            inner.record_source(tables::TSBS, tsb_id, source, &mut outcome);
                        }
                        outcome.merged += 1;
                        inner.log(
                            run_id,
                            ResolutionAction::Merged,
                            tables::TSBS,
                            Some(tsb_id),
                            format!("tsb={}", upsert.tsb_number),
                        );
                    }
                }
                None => {
                    let tsb = TsbReference {
                        id: Uuid::new_v4(),
                        tsb_number: upsert.tsb_number.clone(),
                        title: upsert.title.clone(),
                        affected_models: upsert.affected_models.clone(),
                        summary: upsert.summary.clone(),
                        related_dtc_codes: upsert.related_dtc_codes.clone(),
                        aggregates: upsert.aggregates,
                    };
                    let tsb_id = tsb.id;
                    inner.tsb_by_number.insert(upsert.tsb_number.clone(), tsb_id);
                    inner.tsbs.insert(tsb_id, tsb);
                    for source in &upsert.sources {
                        inner.record_source(tables::TSBS, tsb_id, source, &mut outcome);
                    }
                    outcome.created += 1;
                    inner.log(
                        run_id,
                        ResolutionAction::Created,
                        tables::TSBS,
                        Some(tsb_id),
                        format!("tsb={}", upsert.tsb_number),
                    );
                }
            }
        }

        // Vehicle linking
        for link_plan in &plan.vehicle_links {
            let found = inner
                .vehicles
                .values()
                .find(|v| {
                    v.make.eq_ignore_ascii_case(&link_plan.make)
                        && v.model.eq_ignore_ascii_case(&link_plan.model)
                        && v.years_overlap(link_plan.year_start, link_plan.year_end)
                })
                .map(|v| v.id);

            let vehicle_id = match found {
                Some(id) => id,
                None => {
                    let vehicle = Vehicle {
                        id: Uuid::new_v4(),
                        make: link_plan.make.clone(),
                        model: link_plan.model.clone(),
                        year_start: link_plan.year_start,
                        year_end: link_plan.year_end,
                    };
                    let id = vehicle.id;
                    inner.vehicles.insert(id, vehicle);
                    outcome.vehicles_created += 1;
                    id
                }
            };

            for code in &link_plan.dtc_codes {
                let Some(master_id) = inner.master_id_for(code) else {
                    continue;
                };
                let already = inner
                    .vehicle_links
                    .iter()
                    .any(|l| l.vehicle_id == vehicle_id && l.dtc_master_id == master_id);
                if already {
                    continue;
                }
                let link = VehicleDtcLink {
                    vehicle_id,
                    dtc_master_id: master_id,
                    source_chunk_id: link_plan.source_chunk_id,
                };
                let link_id = Uuid::new_v4();
                inner.vehicle_links.push(link);
                outcome.vehicle_links_created += 1;
                inner.record_source(
                    tables::VEHICLE_LINKS,
                    link_id,
                    &Provenance {
                        chunk_id: link_plan.source_chunk_id,
                        trust: 0.5,
                        relevance: 0.5,
                    },
                    &mut outcome,
                );
                inner.log(
                    run_id,
                    ResolutionAction::Created,
                    tables::VEHICLE_LINKS,
                    Some(link_id),
                    format!(
                        "vehicle={} {} dtc={} specificity={}",
                        link_plan.make, link_plan.model, code, link_plan.specificity
                    ),
                );
            }
        }

        // Rejected entities from planning
        for rejected in &plan.rejected {
            outcome.rejected += 1;
            inner.log(
                run_id,
                ResolutionAction::Rejected,
                &rejected.entity_table,
                None,
                if rejected.details.is_empty() {
                    rejected.reason.clone()
                } else {
                    format!("{}: {}", rejected.reason, rejected.details)
                },
            );
        }

        // Per-DTC confidence over accumulated provenance
        for master_id in touched_masters {
            let sources: Vec<&EntitySource> = inner
                .entity_sources
                .iter()
                .filter(|s| s.entity_table == tables::DTC_MASTER && s.entity_id == master_id)
                .collect();
            let source_count = sources.len() as i64;
            let avg_trust = if sources.is_empty() {
                0.5
            } else {
                sources.iter().map(|s| s.trust_score).sum::<f64>() / sources.len() as f64
            };
            if let Some(master) = inner.dtc_masters.get_mut(&master_id) {
                master.confidence_score = confidence_score(source_count, avg_trust);
                master.updated_at = Utc::now();
            }
        }

        // Document category and confidence
        if let Some(document) = inner.documents.get_mut(&plan.document_id) {
            if plan.document_category.is_some() {
                document.category = plan.document_category;
            }
            if plan.document_confidence.is_some() {
                document.confidence_score = plan.document_confidence;
            }
            document.updated_at = Utc::now();
        }

        Ok(outcome)
    }

    async fn dtc_master_by_code(&self, code: &DtcCode) -> Result<Option<DtcMaster>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .dtc_by_code
            .get(code.as_str())
            .and_then(|id| inner.dtc_masters.get(id))
            .cloned())
    }

    async fn causes_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<DtcCause>> {
        let inner = self.inner.read().unwrap();
        let mut causes: Vec<DtcCause> = inner
            .causes
            .values()
            .filter(|c| c.dtc_master_id == dtc_master_id)
            .cloned()
            .collect();
        causes.sort_by(|a, b| a.cause.cmp(&b.cause));
        Ok(causes)
    }

    async fn steps_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<DtcDiagnosticStep>> {
        let inner = self.inner.read().unwrap();
        let mut steps: Vec<DtcDiagnosticStep> = inner
            .steps
            .values()
            .filter(|s| s.dtc_master_id == dtc_master_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| {
            a.step_order
                .cmp(&b.step_order)
                .then_with(|| a.instruction.cmp(&b.instruction))
        });
        Ok(steps)
    }

    async fn next_diagnostic_step(
        &self,
        step_id: Uuid,
        passed: bool,
    ) -> Result<Option<DtcDiagnosticStep>> {
        let inner = self.inner.read().unwrap();
        let Some(step) = inner.steps.get(&step_id) else {
            return Ok(None);
        };
        let next_id = if passed {
            step.pass_next_step_id
        } else {
            step.fail_next_step_id
        };
        Ok(next_id.and_then(|id| inner.steps.get(&id)).cloned())
    }

    async fn vehicles_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<Vehicle>> {
        let inner = self.inner.read().unwrap();
        let mut vehicles: Vec<Vehicle> = inner
            .vehicle_links
            .iter()
            .filter(|l| l.dtc_master_id == dtc_master_id)
            .filter_map(|l| inner.vehicles.get(&l.vehicle_id))
            .cloned()
            .collect();
        vehicles.sort_by(|a, b| a.make.cmp(&b.make).then_with(|| a.model.cmp(&b.model)));
        Ok(vehicles)
    }

    async fn entity_sources(
        &self,
        entity_table: &str,
        entity_id: Uuid,
    ) -> Result<Vec<EntitySource>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .entity_sources
            .iter()
            .filter(|s| s.entity_table == entity_table && s.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn resolution_log(&self, run_id: Uuid) -> Result<Vec<ResolutionLogEntry>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .resolution_log
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn append_processing_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .processing_log
            .push(entry.clone());
        Ok(())
    }

    async fn processing_log_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<ProcessingLogEntry>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .processing_log
            .iter()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::document::CrawlRequest;

    #[tokio::test]
    async fn crawl_requests_are_unique_on_url() {
        let store = MemoryStore::new();
        let first = CrawlRequest::new("https://example.com/p0301", 1);
        let second = CrawlRequest::new("https://example.com/p0301", 1);

        assert!(store.insert_crawl_request(&first).await.unwrap());
        assert!(!store.insert_crawl_request(&second).await.unwrap());
        assert!(store.crawl_request(first.id).await.unwrap().is_some());
        assert!(store.crawl_request(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stage_update_on_missing_document_fails() {
        let store = MemoryStore::new();
        let result = store
            .set_document_stage(Uuid::new_v4(), ProcessingStage::Chunking, None)
            .await;
        assert!(matches!(result, Err(RefineryError::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn decision_tree_walk_stops_at_unset_pointers() {
        let store = MemoryStore::new();
        let step_id = Uuid::new_v4();
        {
            let mut inner = store.inner.write().unwrap();
            inner.steps.insert(
                step_id,
                DtcDiagnosticStep {
                    id: step_id,
                    dtc_master_id: Uuid::new_v4(),
                    step_order: 1,
                    instruction: "Check fuel pressure".into(),
                    tools_required: None,
                    expected_values: None,
                    pass_next_step_id: None,
                    fail_next_step_id: None,
                    aggregates: Aggregates::new(1, 0.5, 0.5),
                },
            );
        }
        assert!(store.next_diagnostic_step(step_id, true).await.unwrap().is_none());
        assert!(store.next_diagnostic_step(step_id, false).await.unwrap().is_none());
        assert!(store
            .next_diagnostic_step(Uuid::new_v4(), true)
            .await
            .unwrap()
            .is_none());
    }
}
