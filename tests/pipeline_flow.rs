//! End-to-end pipeline tests over the in-memory backends.
//!
//! Each test ingests text, pumps the stage queues through the real
//! stage workers with mock AI clients, and checks the document, the
//! knowledge graph, and the audit trails.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dtc_refinery::pipeline::{
    ingest_text, requeue_stuck_documents, ChunkStage, EmbedStage, EvaluateStage, ExtractStage,
    IngestOutcome, ResolveStage, WorkerRuntime,
};
use dtc_refinery::scoring::confidence_score;
use dtc_refinery::testing::{MockEmbedder, MockReasoner};
use dtc_refinery::types::knowledge::{tables, ResolutionAction};
use dtc_refinery::{
    queues, DtcCode, JobQueue, MemoryBlobStore, MemoryQueue, MemoryStore, PipelineStore,
    ProcessingStage,
};

const POP: Duration = Duration::from_millis(10);

const MISFIRE_TEXT: &str = "P0301: cylinder 1 misfire. Likely spark plug or coil. \
    Replace spark plug (SP-493).";

fn evaluation_json(trust: f64, relevance: f64) -> String {
    format!(
        r#"{{"trust_score": {trust}, "relevance_score": {relevance},
            "automotive_domain": "obd", "reasoning": "test fixture"}}"#
    )
}

fn misfire_extraction_json() -> &'static str {
    r#"{
        "dtc_codes": [
            {"code": "P0301", "description": "Cylinder 1 misfire detected",
             "category": "powertrain", "severity": "moderate"}
        ],
        "causes": [
            {"dtc_code": "P0301", "description": "Worn spark plug", "likelihood": "high"},
            {"dtc_code": "P0301", "description": "Failed ignition coil", "likelihood": "medium"}
        ],
        "diagnostic_steps": [
            {"dtc_code": "P0301", "step_order": 1,
             "description": "Swap spark plug with cylinder 2 and re-test",
             "tools_required": "Spark plug socket", "expected_values": "Misfire follows the plug"}
        ],
        "sensors": [],
        "tsb_references": [],
        "vehicles_mentioned": [],
        "document_category": "diagnostic_guide"
    }"#
}

struct Harness {
    store: Arc<MemoryStore>,
    blob: Arc<MemoryBlobStore>,
    queue: Arc<MemoryQueue>,
    runtime: WorkerRuntime<MemoryStore, MemoryQueue>,
    chunk_stage: ChunkStage<MemoryStore, MemoryBlobStore>,
    embed_stage: EmbedStage<MemoryStore, MockEmbedder>,
    evaluate_stage: EvaluateStage<MemoryStore, MockReasoner>,
    extract_stage: ExtractStage<MemoryStore, MockReasoner>,
    resolve_stage: ResolveStage<MemoryStore>,
}

fn harness(reasoner: MockReasoner) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let reasoner = Arc::new(reasoner);
    let embedder = Arc::new(MockEmbedder::new(768));

    Harness {
        runtime: WorkerRuntime::new(
            store.clone(),
            queue.clone(),
            POP,
            CancellationToken::new(),
        ),
        chunk_stage: ChunkStage::new(store.clone(), blob.clone(), 500, 50),
        embed_stage: EmbedStage::new(store.clone(), embedder),
        evaluate_stage: EvaluateStage::new(store.clone(), reasoner.clone()),
        extract_stage: ExtractStage::new(store.clone(), reasoner, 0.3),
        resolve_stage: ResolveStage::new(store.clone()),
        store,
        blob,
        queue,
    }
}

/// Pump every stage queue once, in pipeline order.
async fn pump(h: &Harness) {
    while let Some(payload) = h.queue.pop(queues::CHUNK, POP).await.unwrap() {
        h.runtime.handle_job(&h.chunk_stage, &payload).await;
    }
    while let Some(payload) = h.queue.pop(queues::EMBED, POP).await.unwrap() {
        h.runtime.handle_job(&h.embed_stage, &payload).await;
    }
    while let Some(payload) = h.queue.pop(queues::EVALUATE, POP).await.unwrap() {
        h.runtime.handle_job(&h.evaluate_stage, &payload).await;
    }
    while let Some(payload) = h.queue.pop(queues::EXTRACT, POP).await.unwrap() {
        h.runtime.handle_job(&h.extract_stage, &payload).await;
    }
    while let Some(payload) = h.queue.pop(queues::RESOLVE, POP).await.unwrap() {
        h.runtime.handle_job(&h.resolve_stage, &payload).await;
    }
}

async fn ingest(h: &Harness, text: &str) -> IngestOutcome {
    ingest_text(
        h.store.as_ref(),
        h.blob.as_ref(),
        h.queue.as_ref(),
        None,
        None,
        text,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn single_high_quality_document_reaches_the_graph() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.9, 0.9))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    let outcome = ingest(&h, MISFIRE_TEXT).await;
    let IngestOutcome::Created(document_id) = outcome else {
        panic!("expected a new document");
    };
    pump(&h).await;

    let document = h.store.document(document_id).await.unwrap().unwrap();
    assert_eq!(document.stage, ProcessingStage::Complete);
    assert!(document.error_message.is_none());
    assert_eq!(document.chunk_count, 1);

    let master = h
        .store
        .dtc_master_by_code(&DtcCode::parse("P0301").unwrap())
        .await
        .unwrap()
        .expect("P0301 master row");
    assert_eq!(master.code.as_str(), "P0301");
    assert!(master.emissions_related);
    assert!(!master.conflict_flag);

    let causes = h.store.causes_for_dtc(master.id).await.unwrap();
    assert_eq!(causes.len(), 2);
    for cause in &causes {
        assert_eq!(cause.aggregates.evidence_count, 1);
        assert!((cause.aggregates.avg_trust - 0.9).abs() < 1e-9);
        // one piece of evidence: probability weight sits at the floor
        assert!((cause.probability_weight - 0.5).abs() < 1e-9);
    }

    let steps = h.store.steps_for_dtc(master.id).await.unwrap();
    assert_eq!(steps.len(), 1);

    // confidence = min(1, 0.3*min(1, sources/5) + 0.7*avg_trust), one source
    let expected = confidence_score(1, 0.9);
    assert!((master.confidence_score - expected).abs() < 1e-9);
    assert!((document.confidence_score.unwrap() - expected).abs() < 1e-9);
}

#[tokio::test]
async fn every_knowledge_row_has_provenance() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.8, 0.8))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    let document_id = ingest(&h, MISFIRE_TEXT).await.document_id();
    pump(&h).await;

    let master = h
        .store
        .dtc_master_by_code(&DtcCode::parse("P0301").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(!h
        .store
        .entity_sources(tables::DTC_MASTER, master.id)
        .await
        .unwrap()
        .is_empty());
    for cause in h.store.causes_for_dtc(master.id).await.unwrap() {
        assert!(!h
            .store
            .entity_sources(tables::CAUSES, cause.id)
            .await
            .unwrap()
            .is_empty());
    }
    for step in h.store.steps_for_dtc(master.id).await.unwrap() {
        assert!(!h
            .store
            .entity_sources(tables::STEPS, step.id)
            .await
            .unwrap()
            .is_empty());
    }

    // chunk_count matches the actual chunk rows
    let document = h.store.document(document_id).await.unwrap().unwrap();
    let chunks = h.store.chunks_for_document(document_id).await.unwrap();
    assert_eq!(document.chunk_count as usize, chunks.len());
    // every chunk got an embedding of the configured dimension
    for chunk in &chunks {
        assert_eq!(chunk.embedding.as_ref().unwrap().len(), 768);
    }
}

#[tokio::test]
async fn duplicate_ingest_is_a_noop() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.9, 0.9))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    let first = ingest(&h, MISFIRE_TEXT).await;
    pump(&h).await;
    let chunk_rows = h.store.chunk_count();
    let log_rows = h.store.resolution_log_len();

    let second = ingest(&h, MISFIRE_TEXT).await;
    assert_eq!(
        second,
        IngestOutcome::Duplicate(first.document_id()),
        "same hash must not create a new document"
    );
    assert_eq!(h.queue.depth(queues::CHUNK).await.unwrap(), 0);

    pump(&h).await;
    assert_eq!(h.store.chunk_count(), chunk_rows);
    assert_eq!(h.store.resolution_log_len(), log_rows, "no new resolve run");
}

#[tokio::test]
async fn low_relevance_chunk_is_gated_out() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.9, 0.2))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    let document_id = ingest(&h, MISFIRE_TEXT).await.document_id();
    pump(&h).await;

    let document = h.store.document(document_id).await.unwrap().unwrap();
    assert_eq!(document.stage, ProcessingStage::Complete);

    // the gate kept the model away from the extraction prompt entirely
    assert!(h
        .store
        .dtc_master_by_code(&DtcCode::parse("P0301").unwrap())
        .await
        .unwrap()
        .is_none());
    assert!(h.store.staged_extraction(document_id).await.unwrap().is_empty());

    let log = h.store.all_resolution_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, ResolutionAction::Rejected);
    assert_eq!(log[0].details, "no eligible chunks");
}

#[tokio::test]
async fn relevance_gate_is_inclusive_at_threshold() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.9, 0.3))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    let document_id = ingest(&h, MISFIRE_TEXT).await.document_id();
    pump(&h).await;

    let document = h.store.document(document_id).await.unwrap().unwrap();
    assert_eq!(document.stage, ProcessingStage::Complete);
    // relevance == 0.3 is eligible, so extraction ran
    assert!(h
        .store
        .dtc_master_by_code(&DtcCode::parse("P0301").unwrap())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn unparseable_evaluation_degrades_to_zero_scores() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", "I cannot help with that request.")
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    let document_id = ingest(&h, MISFIRE_TEXT).await.document_id();
    pump(&h).await;

    let document = h.store.document(document_id).await.unwrap().unwrap();
    assert_eq!(document.stage, ProcessingStage::Complete);

    let evaluations = h.store.evaluations_for_document(document_id).await.unwrap();
    assert_eq!(evaluations.len(), 1);
    assert_eq!(evaluations[0].trust_score, 0.0);
    assert_eq!(evaluations[0].relevance_score, 0.0);
    assert_eq!(
        evaluations[0].domain,
        dtc_refinery::types::chunk::AutomotiveDomain::Unknown
    );

    // zero relevance falls under the gate: no extractions, no graph rows
    assert!(h
        .store
        .dtc_master_by_code(&DtcCode::parse("P0301").unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn reasoner_failure_marks_document_error() {
    let h = harness(MockReasoner::new().failing("model offline"));

    let document_id = ingest(&h, MISFIRE_TEXT).await.document_id();
    pump(&h).await;

    let document = h.store.document(document_id).await.unwrap().unwrap();
    assert_eq!(document.stage, ProcessingStage::Error);
    assert!(document
        .error_message
        .as_deref()
        .unwrap()
        .contains("model offline"));

    // failure is recorded on the processing log too
    let log = h
        .store
        .processing_log_for_document(document_id)
        .await
        .unwrap();
    assert!(log.iter().any(|e| {
        e.stage == "evaluating"
            && e.status == dtc_refinery::types::knowledge::ProcessingStatus::Error
    }));
}

#[tokio::test]
async fn resolve_replay_does_not_double_evidence() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.9, 0.9))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    let document_id = ingest(&h, MISFIRE_TEXT).await.document_id();
    pump(&h).await;

    let master = h
        .store
        .dtc_master_by_code(&DtcCode::parse("P0301").unwrap())
        .await
        .unwrap()
        .unwrap();
    let before: Vec<_> = h.store.causes_for_dtc(master.id).await.unwrap();
    let sources_before = h.store.all_entity_sources().len();

    // replay the same staged data through a fresh resolve run
    let staged = h.store.staged_extraction(document_id).await.unwrap();
    let plan = dtc_refinery::plan_resolution(document_id, &staged);
    h.store.apply_resolution(&plan).await.unwrap();

    let after: Vec<_> = h.store.causes_for_dtc(master.id).await.unwrap();
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(
            b.aggregates.evidence_count, a.aggregates.evidence_count,
            "evidence must not double on replay"
        );
        assert!((b.aggregates.avg_trust - a.aggregates.avg_trust).abs() < 1e-9);
    }
    assert_eq!(h.store.all_entity_sources().len(), sources_before);
}

#[tokio::test]
async fn resolution_log_rows_share_the_run_id() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.9, 0.9))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    ingest(&h, MISFIRE_TEXT).await;
    pump(&h).await;

    let log = h.store.all_resolution_log();
    assert!(!log.is_empty());
    let run_id = log[0].run_id;
    assert!(log.iter().all(|e| e.run_id == run_id));
}

#[tokio::test]
async fn stuck_document_is_reaped_and_resumes() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.9, 0.9))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    let document_id = ingest(&h, MISFIRE_TEXT).await.document_id();

    // chunk the document, then simulate a worker that committed the
    // advance to `embedding` but died before the queue push
    let payload = h.queue.pop(queues::CHUNK, POP).await.unwrap().unwrap();
    h.runtime.handle_job(&h.chunk_stage, &payload).await;
    let _lost_job = h.queue.pop(queues::EMBED, POP).await.unwrap().unwrap();

    let document = h.store.document(document_id).await.unwrap().unwrap();
    assert_eq!(document.stage, ProcessingStage::Embedding);
    assert_eq!(h.queue.depth(queues::EMBED).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let requeued = requeue_stuck_documents(
        h.store.as_ref(),
        h.queue.as_ref(),
        chrono::Duration::milliseconds(10),
    )
    .await
    .unwrap();
    assert_eq!(requeued, 1);

    pump(&h).await;
    let document = h.store.document(document_id).await.unwrap().unwrap();
    assert_eq!(document.stage, ProcessingStage::Complete);
}

#[tokio::test]
async fn poison_payloads_are_discarded() {
    let h = harness(MockReasoner::new());

    h.queue.push(queues::CHUNK, "not-a-uuid").await.unwrap();
    h.queue
        .push(queues::CHUNK, &Uuid::new_v4().to_string())
        .await
        .unwrap();
    pump(&h).await;

    // nothing was created, nothing re-enqueued, nothing crashed
    assert_eq!(h.store.chunk_count(), 0);
    assert_eq!(h.queue.depth(queues::CHUNK).await.unwrap(), 0);
    assert_eq!(h.queue.depth(queues::EMBED).await.unwrap(), 0);
}

#[tokio::test]
async fn vehicle_mentions_link_dtcs_to_vehicles() {
    let extraction = r#"{
        "dtc_codes": [
            {"code": "P0420", "description": "Catalyst efficiency below threshold",
             "category": "powertrain", "severity": "moderate"}
        ],
        "causes": [],
        "diagnostic_steps": [],
        "sensors": [],
        "tsb_references": [],
        "vehicles_mentioned": [
            {"make": "Ford", "model": "F-150", "year_start": 2015, "year_end": 2020,
             "related_dtc_codes": ["P0420"]}
        ],
        "document_category": "dtc_reference"
    }"#;
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.8, 0.8))
            .with_response("Extract all automotive", extraction),
    );

    let document_id = ingest(
        &h,
        "P0420 on 2015-2020 Ford F-150: catalyst system efficiency below threshold bank 1.",
    )
    .await
    .document_id();
    pump(&h).await;

    let master = h
        .store
        .dtc_master_by_code(&DtcCode::parse("P0420").unwrap())
        .await
        .unwrap()
        .unwrap();
    let vehicles = h.store.vehicles_for_dtc(master.id).await.unwrap();
    assert_eq!(vehicles.len(), 1);
    assert_eq!(vehicles[0].make, "Ford");
    assert_eq!(vehicles[0].model, "F-150");
    assert_eq!(vehicles[0].year_start, Some(2015));

    let document = h.store.document(document_id).await.unwrap().unwrap();
    assert_eq!(
        document.category,
        Some(dtc_refinery::DocumentCategory::DtcReference)
    );
}

#[tokio::test]
async fn cross_document_evidence_accumulates() {
    let h = harness(
        MockReasoner::new()
            .with_response("Evaluate this automotive", &evaluation_json(0.6, 0.8))
            .with_response("Extract all automotive", misfire_extraction_json()),
    );

    ingest(&h, MISFIRE_TEXT).await;
    pump(&h).await;
    // a second document with different text but the same extracted facts
    ingest(
        &h,
        "Another write-up on P0301. The usual suspects are a worn spark plug or a \
         failed ignition coil; swap the plug to confirm.",
    )
    .await;
    pump(&h).await;

    let master = h
        .store
        .dtc_master_by_code(&DtcCode::parse("P0301").unwrap())
        .await
        .unwrap()
        .unwrap();
    let causes = h.store.causes_for_dtc(master.id).await.unwrap();
    assert_eq!(causes.len(), 2, "same fingerprints merge across documents");
    for cause in &causes {
        assert_eq!(cause.aggregates.evidence_count, 2);
        // evidence-weighted mean of two 0.6-trust observations
        assert!((cause.aggregates.avg_trust - 0.6).abs() < 1e-9);
        // two pieces of evidence push the probability weight up
        assert!((cause.probability_weight - 0.6).abs() < 1e-9);
    }
    // DTC master now has two contributing chunks
    let sources = h
        .store
        .entity_sources(tables::DTC_MASTER, master.id)
        .await
        .unwrap();
    assert_eq!(sources.len(), 2);
    let expected = confidence_score(2, 0.6);
    assert!((master.confidence_score - expected).abs() < 1e-9);
}
