//! PostgreSQL pipeline store.
//!
//! The production backend. Pool connections are validated with a
//! round-trip before use (`test_before_acquire`); small per-job writes
//! retry once on connection-class errors with a 500 ms backoff. The
//! schema is created on construction. `apply_resolution` runs in a
//! single transaction per document.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RefineryError, Result};
use crate::scoring;
use crate::traits::store::PipelineStore;
use crate::types::chunk::{Chunk, ChunkEvaluation, NewChunk};
use crate::types::document::{CrawlRequest, CrawlStatus, Document, ProcessingStage};
use crate::types::extraction::{DocumentCategory, DtcCode, StagedExtraction};
use crate::types::knowledge::{
    tables, Aggregates, DtcCause, DtcDiagnosticStep, DtcMaster, EntitySource, ProcessingLogEntry,
    ProcessingStatus, ResolutionAction, ResolutionLogEntry, Vehicle,
};
use crate::types::resolution::{Provenance, ResolutionOutcome, ResolutionPlan};
use crate::types::chunk::AutomotiveDomain;

/// PostgreSQL-backed [`PipelineStore`].
pub struct PostgresStore {
    pool: PgPool,
    retry_attempts: u32,
    retry_backoff: std::time::Duration,
}

impl PostgresStore {
    /// Connect with the configured pool bounds and run migrations.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.db_pool_min)
            .max_connections(config.db_pool_max)
            .test_before_acquire(true)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(&config.database_url)
            .await?;
        Self::from_pool(pool, config.retry_attempts, config.retry_backoff()).await
    }

    /// Build from an existing pool (tests, shared pools).
    pub async fn from_pool(
        pool: PgPool,
        retry_attempts: u32,
        retry_backoff: std::time::Duration,
    ) -> Result<Self> {
        let store = Self {
            pool,
            retry_attempts: retry_attempts.max(1),
            retry_backoff,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// The underlying pool, for wiring the queue over the same server.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id UUID PRIMARY KEY,
                title TEXT NOT NULL,
                source_url TEXT,
                content_hash TEXT NOT NULL UNIQUE,
                mime_type TEXT NOT NULL,
                blob_location TEXT NOT NULL,
                processing_stage TEXT NOT NULL,
                error_message TEXT,
                chunk_count INT NOT NULL DEFAULT 0,
                confidence_score FLOAT8,
                category TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_documents_stage ON documents(processing_stage, updated_at)",
            r#"
            CREATE TABLE IF NOT EXISTS crawl_requests (
                id UUID PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                depth INT NOT NULL,
                max_depth INT NOT NULL,
                parent_url TEXT,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS document_chunks (
                id UUID PRIMARY KEY,
                document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_index INT NOT NULL,
                content TEXT NOT NULL,
                char_start INT NOT NULL,
                char_end INT NOT NULL,
                token_count INT NOT NULL,
                embedding REAL[],
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE(document_id, chunk_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chunk_evaluations (
                chunk_id UUID PRIMARY KEY REFERENCES document_chunks(id) ON DELETE CASCADE,
                trust_score FLOAT8 NOT NULL,
                relevance_score FLOAT8 NOT NULL,
                automotive_domain TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                model_used TEXT NOT NULL,
                evaluated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS staged_extractions (
                document_id UUID PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
                staged JSONB NOT NULL,
                staged_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dtc_master (
                id UUID PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                system_category TEXT NOT NULL,
                generic_description TEXT NOT NULL DEFAULT '',
                description_trust FLOAT8 NOT NULL DEFAULT 0,
                severity_level SMALLINT,
                emissions_related BOOL NOT NULL DEFAULT FALSE,
                confidence_score FLOAT8 NOT NULL DEFAULT 0,
                conflict_flag BOOL NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dtc_possible_causes (
                id UUID PRIMARY KEY,
                dtc_master_id UUID NOT NULL REFERENCES dtc_master(id) ON DELETE CASCADE,
                cause TEXT NOT NULL,
                probability_weight FLOAT8 NOT NULL,
                evidence_count BIGINT NOT NULL,
                avg_trust FLOAT8 NOT NULL,
                avg_relevance FLOAT8 NOT NULL,
                conflict_flag BOOL NOT NULL DEFAULT FALSE
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_causes_key ON dtc_possible_causes(dtc_master_id, lower(cause))",
            r#"
            CREATE TABLE IF NOT EXISTS dtc_diagnostic_steps (
                id UUID PRIMARY KEY,
                dtc_master_id UUID NOT NULL REFERENCES dtc_master(id) ON DELETE CASCADE,
                step_order INT NOT NULL,
                instruction TEXT NOT NULL,
                tools_required TEXT,
                expected_values TEXT,
                pass_next_step_id UUID REFERENCES dtc_diagnostic_steps(id),
                fail_next_step_id UUID REFERENCES dtc_diagnostic_steps(id),
                evidence_count BIGINT NOT NULL,
                avg_trust FLOAT8 NOT NULL,
                avg_relevance FLOAT8 NOT NULL
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_steps_key ON dtc_diagnostic_steps(dtc_master_id, lower(instruction))",
            r#"
            CREATE TABLE IF NOT EXISTS sensors (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                sensor_type TEXT
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sensors_name ON sensors(lower(name))",
            r#"
            CREATE TABLE IF NOT EXISTS dtc_related_sensors (
                id UUID PRIMARY KEY,
                dtc_master_id UUID NOT NULL REFERENCES dtc_master(id) ON DELETE CASCADE,
                sensor_id UUID NOT NULL REFERENCES sensors(id) ON DELETE CASCADE,
                typical_range TEXT,
                unit TEXT,
                evidence_count BIGINT NOT NULL,
                avg_trust FLOAT8 NOT NULL,
                avg_relevance FLOAT8 NOT NULL,
                UNIQUE(dtc_master_id, sensor_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tsb_references (
                id UUID PRIMARY KEY,
                tsb_number TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL DEFAULT '',
                affected_models TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                related_dtc_codes TEXT[] NOT NULL DEFAULT '{}',
                evidence_count BIGINT NOT NULL,
                avg_trust FLOAT8 NOT NULL,
                avg_relevance FLOAT8 NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS vehicles (
                id UUID PRIMARY KEY,
                make TEXT NOT NULL,
                model TEXT NOT NULL,
                year_start INT,
                year_end INT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS vehicle_dtc_codes (
                id UUID PRIMARY KEY,
                vehicle_id UUID NOT NULL REFERENCES vehicles(id) ON DELETE CASCADE,
                dtc_master_id UUID NOT NULL REFERENCES dtc_master(id) ON DELETE CASCADE,
                source_chunk_id UUID,
                UNIQUE(vehicle_id, dtc_master_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dtc_entity_sources (
                id BIGSERIAL PRIMARY KEY,
                entity_table TEXT NOT NULL,
                entity_id UUID NOT NULL,
                chunk_id UUID NOT NULL REFERENCES document_chunks(id) ON DELETE CASCADE,
                trust_score FLOAT8 NOT NULL,
                relevance_score FLOAT8 NOT NULL,
                extracted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE(entity_table, entity_id, chunk_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS resolution_log (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                action TEXT NOT NULL,
                entity_table TEXT NOT NULL,
                entity_id UUID,
                details TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_resolution_log_run ON resolution_log(run_id)",
            r#"
            CREATE TABLE IF NOT EXISTS processing_log (
                id UUID PRIMARY KEY,
                document_id UUID NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                duration_ms BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_processing_log_doc ON processing_log(document_id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Bounded retry on connection-class errors for small per-job
    /// writes.
    async fn retrying<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(self.pool.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.retry_attempts => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, "retrying query after connection error");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn map_document(row: &PgRow) -> Document {
    let stage: String = row.get("processing_stage");
    let category: Option<String> = row.get("category");
    Document {
        id: row.get("id"),
        title: row.get("title"),
        source_url: row.get("source_url"),
        content_hash: row.get("content_hash"),
        mime_type: row.get("mime_type"),
        blob_location: row.get("blob_location"),
        stage: ProcessingStage::parse(&stage).unwrap_or(ProcessingStage::Error),
        error_message: row.get("error_message"),
        chunk_count: row.get("chunk_count"),
        confidence_score: row.get("confidence_score"),
        category: category.as_deref().and_then(DocumentCategory::parse),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_crawl_request(row: &PgRow) -> CrawlRequest {
    let status: String = row.get("status");
    CrawlRequest {
        id: row.get("id"),
        url: row.get("url"),
        status: CrawlStatus::parse(&status).unwrap_or(CrawlStatus::Failed),
        depth: row.get("depth"),
        max_depth: row.get("max_depth"),
        parent_url: row.get("parent_url"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_chunk(row: &PgRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        char_start: row.get("char_start"),
        char_end: row.get("char_end"),
        token_count: row.get("token_count"),
        embedding: row.get("embedding"),
        created_at: row.get("created_at"),
    }
}

fn map_evaluation(row: &PgRow) -> ChunkEvaluation {
    let domain: String = row.get("automotive_domain");
    ChunkEvaluation {
        chunk_id: row.get("chunk_id"),
        trust_score: row.get("trust_score"),
        relevance_score: row.get("relevance_score"),
        domain: AutomotiveDomain::parse(&domain),
        reasoning: row.get("reasoning"),
        model_used: row.get("model_used"),
        evaluated_at: row.get("evaluated_at"),
    }
}

fn map_dtc_master(row: &PgRow) -> Option<DtcMaster> {
    let code: String = row.get("code");
    Some(DtcMaster {
        id: row.get("id"),
        code: DtcCode::parse(&code)?,
        system_category: row.get("system_category"),
        generic_description: row.get("generic_description"),
        description_trust: row.get("description_trust"),
        severity_level: row.get("severity_level"),
        emissions_related: row.get("emissions_related"),
        confidence_score: row.get("confidence_score"),
        conflict_flag: row.get("conflict_flag"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_cause(row: &PgRow) -> DtcCause {
    DtcCause {
        id: row.get("id"),
        dtc_master_id: row.get("dtc_master_id"),
        cause: row.get("cause"),
        probability_weight: row.get("probability_weight"),
        aggregates: Aggregates {
            evidence_count: row.get("evidence_count"),
            avg_trust: row.get("avg_trust"),
            avg_relevance: row.get("avg_relevance"),
        },
        conflict_flag: row.get("conflict_flag"),
    }
}

fn map_step(row: &PgRow) -> DtcDiagnosticStep {
    DtcDiagnosticStep {
        id: row.get("id"),
        dtc_master_id: row.get("dtc_master_id"),
        step_order: row.get("step_order"),
        instruction: row.get("instruction"),
        tools_required: row.get("tools_required"),
        expected_values: row.get("expected_values"),
        pass_next_step_id: row.get("pass_next_step_id"),
        fail_next_step_id: row.get("fail_next_step_id"),
        aggregates: Aggregates {
            evidence_count: row.get("evidence_count"),
            avg_trust: row.get("avg_trust"),
            avg_relevance: row.get("avg_relevance"),
        },
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

type Tx<'a> = Transaction<'a, Postgres>;

/// Insert a provenance row if the `(table, entity, chunk)` key is new.
/// Returns whether a row was written.
async fn record_source(
    tx: &mut Tx<'_>,
    entity_table: &str,
    entity_id: Uuid,
    source: &Provenance,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO dtc_entity_sources
            (entity_table, entity_id, chunk_id, trust_score, relevance_score)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (entity_table, entity_id, chunk_id) DO NOTHING
        "#,
    )
    .bind(entity_table)
    .bind(entity_id)
    .bind(source.chunk_id)
    .bind(source.trust)
    .bind(source.relevance)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Split sources into those without an existing provenance row.
async fn novel_sources(
    tx: &mut Tx<'_>,
    entity_table: &str,
    entity_id: Uuid,
    sources: &[Provenance],
) -> Result<Vec<Provenance>> {
    let chunk_ids: Vec<Uuid> = sources.iter().map(|s| s.chunk_id).collect();
    let seen: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT chunk_id FROM dtc_entity_sources
        WHERE entity_table = $1 AND entity_id = $2 AND chunk_id = ANY($3)
        "#,
    )
    .bind(entity_table)
    .bind(entity_id)
    .bind(&chunk_ids)
    .fetch_all(&mut **tx)
    .await?;
    Ok(sources
        .iter()
        .filter(|s| !seen.contains(&s.chunk_id))
        .copied()
        .collect())
}

async fn append_resolution_log(
    tx: &mut Tx<'_>,
    run_id: Uuid,
    action: ResolutionAction,
    entity_table: &str,
    entity_id: Option<Uuid>,
    details: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO resolution_log (id, run_id, action, entity_table, entity_id, details)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(run_id)
    .bind(action.as_str())
    .bind(entity_table)
    .bind(entity_id)
    .bind(details)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn master_id_for(tx: &mut Tx<'_>, code: &DtcCode) -> Result<Option<Uuid>> {
    let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM dtc_master WHERE code = $1")
        .bind(code.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    Ok(id)
}

#[async_trait]
impl PipelineStore for PostgresStore {
    async fn insert_document(&self, document: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, title, source_url, content_hash, mime_type, blob_location,
                 processing_stage, error_message, chunk_count, confidence_score,
                 category, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(document.id)
        .bind(&document.title)
        .bind(&document.source_url)
        .bind(&document.content_hash)
        .bind(&document.mime_type)
        .bind(&document.blob_location)
        .bind(document.stage.as_str())
        .bind(&document.error_message)
        .bind(document.chunk_count)
        .bind(document.confidence_score)
        .bind(document.category.map(|c| c.as_str()))
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_document))
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_document))
    }

    async fn set_document_stage(
        &self,
        id: Uuid,
        stage: ProcessingStage,
        error: Option<&str>,
    ) -> Result<()> {
        let error = error.map(str::to_string);
        self.retrying(|pool| {
            let error = error.clone();
            async move {
                let result = sqlx::query(
                    r#"
                    UPDATE documents
                    SET processing_stage = $1, error_message = $2, updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(stage.as_str())
                .bind(error)
                .bind(id)
                .execute(&pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(RefineryError::DocumentNotFound(id));
                }
                Ok(())
            }
        })
        .await
    }

    async fn documents_in_stage_longer_than(
        &self,
        stage: ProcessingStage,
        older_than: Duration,
    ) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - older_than;
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE processing_stage = $1 AND updated_at < $2",
        )
        .bind(stage.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn insert_crawl_request(&self, request: &CrawlRequest) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO crawl_requests
                (id, url, status, depth, max_depth, parent_url, error_message,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(request.id)
        .bind(&request.url)
        .bind(request.status.as_str())
        .bind(request.depth)
        .bind(request.max_depth)
        .bind(&request.parent_url)
        .bind(&request.error_message)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn crawl_request(&self, id: Uuid) -> Result<Option<CrawlRequest>> {
        let row = sqlx::query("SELECT * FROM crawl_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_crawl_request))
    }

    async fn set_crawl_request_status(
        &self,
        id: Uuid,
        status: CrawlStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let error = error.map(str::to_string);
        self.retrying(|pool| {
            let error = error.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE crawl_requests
                    SET status = $1, error_message = $2, updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(status.as_str())
                .bind(error)
                .bind(id)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    async fn insert_chunks(&self, document_id: Uuid, chunks: &[NewChunk]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO document_chunks
                    (id, document_id, chunk_index, content, char_start, char_end, token_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.char_start)
            .bind(chunk.char_end)
            .bind(chunk.token_count)
            .execute(&mut *tx)
            .await?;
        }

        let result =
            sqlx::query("UPDATE documents SET chunk_count = $1, updated_at = NOW() WHERE id = $2")
                .bind(chunks.len() as i32)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RefineryError::DocumentNotFound(document_id));
        }

        tx.commit().await?;
        Ok(chunks.len())
    }

    async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let rows =
            sqlx::query("SELECT * FROM document_chunks WHERE document_id = $1 ORDER BY chunk_index")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(map_chunk).collect())
    }

    async fn chunks_missing_embedding(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM document_chunks
            WHERE document_id = $1 AND embedding IS NULL
            ORDER BY chunk_index
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_chunk).collect())
    }

    async fn store_chunk_embedding(&self, chunk_id: Uuid, embedding: &[f32]) -> Result<()> {
        let embedding = embedding.to_vec();
        self.retrying(|pool| {
            let embedding = embedding.clone();
            async move {
                sqlx::query("UPDATE document_chunks SET embedding = $1 WHERE id = $2")
                    .bind(embedding)
                    .bind(chunk_id)
                    .execute(&pool)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn upsert_evaluation(&self, evaluation: &ChunkEvaluation) -> Result<()> {
        let evaluation = evaluation.clone();
        self.retrying(|pool| {
            let evaluation = evaluation.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_evaluations
                        (chunk_id, trust_score, relevance_score, automotive_domain,
                         reasoning, model_used, evaluated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (chunk_id) DO UPDATE SET
                        trust_score = EXCLUDED.trust_score,
                        relevance_score = EXCLUDED.relevance_score,
                        automotive_domain = EXCLUDED.automotive_domain,
                        reasoning = EXCLUDED.reasoning,
                        model_used = EXCLUDED.model_used,
                        evaluated_at = EXCLUDED.evaluated_at
                    "#,
                )
                .bind(evaluation.chunk_id)
                .bind(evaluation.trust_score)
                .bind(evaluation.relevance_score)
                .bind(evaluation.domain.as_str())
                .bind(&evaluation.reasoning)
                .bind(&evaluation.model_used)
                .bind(evaluation.evaluated_at)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    async fn evaluations_for_document(&self, document_id: Uuid) -> Result<Vec<ChunkEvaluation>> {
        let rows = sqlx::query(
            r#"
            SELECT ce.* FROM chunk_evaluations ce
            JOIN document_chunks dc ON ce.chunk_id = dc.id
            WHERE dc.document_id = $1
            ORDER BY dc.chunk_index
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_evaluation).collect())
    }

    async fn eligible_chunks(
        &self,
        document_id: Uuid,
        relevance_threshold: f64,
    ) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT dc.* FROM document_chunks dc
            JOIN chunk_evaluations ce ON ce.chunk_id = dc.id
            WHERE dc.document_id = $1 AND ce.relevance_score >= $2
            ORDER BY dc.chunk_index
            "#,
        )
        .bind(document_id)
        .bind(relevance_threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_chunk).collect())
    }

    async fn stage_extraction(&self, document_id: Uuid, staged: &StagedExtraction) -> Result<()> {
        let value = serde_json::to_value(staged)
            .map_err(|e| RefineryError::Config(format!("staged extraction encode: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO staged_extractions (document_id, staged, staged_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (document_id) DO UPDATE SET
                staged = EXCLUDED.staged,
                staged_at = NOW()
            "#,
        )
        .bind(document_id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn staged_extraction(&self, document_id: Uuid) -> Result<StagedExtraction> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT staged FROM staged_extractions WHERE document_id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    async fn apply_resolution(&self, plan: &ResolutionPlan) -> Result<ResolutionOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ResolutionOutcome::default();
        let run_id = plan.run_id;
        let mut touched_masters: Vec<Uuid> = Vec::new();

        for upsert in &plan.dtc_upserts {
            let existing = master_id_for(&mut tx, &upsert.code).await?;
            let (master_id, action) = match existing {
                Some(id) => {
                    sqlx::query(
                        r#"
                        UPDATE dtc_master SET
                            generic_description = CASE
                                WHEN $2 <> '' AND $3 > description_trust THEN $2
                                ELSE generic_description END,
                            description_trust = CASE
                                WHEN $2 <> '' AND $3 > description_trust THEN $3
                                ELSE description_trust END,
                            severity_level = COALESCE(severity_level, $4),
                            conflict_flag = conflict_flag OR $5,
                            updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(&upsert.description)
                    .bind(upsert.description_trust)
                    .bind(upsert.severity_level)
                    .bind(upsert.severity_conflict)
                    .execute(&mut *tx)
                    .await?;
                    (id, ResolutionAction::Updated)
                }
                None => {
                    let id = Uuid::new_v4();
                    sqlx::query(
                        r#"
                        INSERT INTO dtc_master
                            (id, code, system_category, generic_description,
                             description_trust, severity_level, emissions_related,
                             conflict_flag)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(id)
                    .bind(upsert.code.as_str())
                    .bind(&upsert.system_category)
                    .bind(&upsert.description)
                    .bind(upsert.description_trust)
                    .bind(upsert.severity_level)
                    .bind(upsert.emissions_related)
                    .bind(upsert.severity_conflict)
                    .execute(&mut *tx)
                    .await?;
                    (id, ResolutionAction::Created)
                }
            };

            touched_masters.push(master_id);
            for source in &upsert.sources {
                if record_source(&mut tx, tables::DTC_MASTER, master_id, source).await? {
                    outcome.sources_recorded += 1;
                }
            }
            match action {
                ResolutionAction::Created => outcome.created += 1,
                _ => outcome.updated += 1,
            }
            append_resolution_log(
                &mut tx,
                run_id,
                action,
                tables::DTC_MASTER,
                Some(master_id),
                &format!("code={}", upsert.code),
            )
            .await?;
        }

        for upsert in &plan.cause_upserts {
            let Some(master_id) = master_id_for(&mut tx, &upsert.dtc_code).await? else {
                outcome.rejected += 1;
                append_resolution_log(
                    &mut tx,
                    run_id,
                    ResolutionAction::Rejected,
                    tables::CAUSES,
                    None,
                    &format!("unknown dtc {} for cause", upsert.dtc_code),
                )
                .await?;
                continue;
            };
            touched_masters.push(master_id);

            let existing: Option<(Uuid, i64, f64, f64)> = sqlx::query_as(
                r#"
                SELECT id, evidence_count, avg_trust, avg_relevance
                FROM dtc_possible_causes
                WHERE dtc_master_id = $1 AND lower(cause) = lower($2)
                "#,
            )
            .bind(master_id)
            .bind(&upsert.cause)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some((cause_id, evidence_count, avg_trust, avg_relevance)) => {
                    let novel =
                        novel_sources(&mut tx, tables::CAUSES, cause_id, &upsert.sources).await?;
                    if !novel.is_empty() {
                        let observation = observed_aggregates(&novel);
                        let merged = scoring::merge_aggregates(
                            &Aggregates::new(evidence_count, avg_trust, avg_relevance),
                            &observation,
                        );
                        sqlx::query(
                            r#"
                            UPDATE dtc_possible_causes SET
                                evidence_count = $2,
                                avg_trust = $3,
                                avg_relevance = $4,
                                probability_weight = $5
                            WHERE id = $1
                            "#,
                        )
                        .bind(cause_id)
                        .bind(merged.evidence_count)
                        .bind(merged.avg_trust)
                        .bind(merged.avg_relevance)
                        .bind(scoring::probability_weight(merged.evidence_count))
                        .execute(&mut *tx)
                        .await?;
                        for source in &novel {
                            if record_source(&mut tx, tables::CAUSES, cause_id, source).await? {
                                outcome.sources_recorded += 1;
                            }
                        }
                        outcome.merged += 1;
                        append_resolution_log(
                            &mut tx,
                            run_id,
                            ResolutionAction::Merged,
                            tables::CAUSES,
                            Some(cause_id),
                            &format!(
                                "dtc={} evidence+={}",
                                upsert.dtc_code, observation.evidence_count
                            ),
                        )
                        .await?;
                    }
                }
                None => {
                    let cause_id = Uuid::new_v4();
                    sqlx::query(
                        r#"
                        INSERT INTO dtc_possible_causes
                            (id, dtc_master_id, cause, probability_weight,
                             evidence_count, avg_trust, avg_relevance)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(cause_id)
                    .bind(master_id)
                    .bind(&upsert.cause)
                    .bind(upsert.probability_weight)
                    .bind(upsert.aggregates.evidence_count)
                    .bind(upsert.aggregates.avg_trust)
                    .bind(upsert.aggregates.avg_relevance)
                    .execute(&mut *tx)
                    .await?;
                    for source in &upsert.sources {
                        if record_source(&mut tx, tables::CAUSES, cause_id, source).await? {
                            outcome.sources_recorded += 1;
                        }
                    }
                    outcome.created += 1;
                    append_resolution_log(
                        &mut tx,
                        run_id,
                        ResolutionAction::Created,
                        tables::CAUSES,
                        Some(cause_id),
                        &format!(
                            "dtc={} likelihood={}",
                            upsert.dtc_code,
                            upsert.likelihood.as_str()
                        ),
                    )
                    .await?;
                }
            }
        }

        for upsert in &plan.step_upserts {
            let Some(master_id) = master_id_for(&mut tx, &upsert.dtc_code).await? else {
                outcome.rejected += 1;
                append_resolution_log(
                    &mut tx,
                    run_id,
                    ResolutionAction::Rejected,
                    tables::STEPS,
                    None,
                    &format!("unknown dtc {} for step", upsert.dtc_code),
                )
                .await?;
                continue;
            };
            touched_masters.push(master_id);

            let existing: Option<(Uuid, i64, f64, f64)> = sqlx::query_as(
                r#"
                SELECT id, evidence_count, avg_trust, avg_relevance
                FROM dtc_diagnostic_steps
                WHERE dtc_master_id = $1 AND lower(instruction) = lower($2)
                "#,
            )
            .bind(master_id)
            .bind(&upsert.instruction)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some((step_id, evidence_count, avg_trust, avg_relevance)) => {
                    let novel =
                        novel_sources(&mut tx, tables::STEPS, step_id, &upsert.sources).await?;
                    if !novel.is_empty() {
                        let observation = observed_aggregates(&novel);
                        let merged = scoring::merge_aggregates(
                            &Aggregates::new(evidence_count, avg_trust, avg_relevance),
                            &observation,
                        );
                        sqlx::query(
                            r#"
                            UPDATE dtc_diagnostic_steps SET
                                evidence_count = $2,
                                avg_trust = $3,
                                avg_relevance = $4,
                                step_order = LEAST(step_order, $5)
                            WHERE id = $1
                            "#,
                        )
                        .bind(step_id)
                        .bind(merged.evidence_count)
                        .bind(merged.avg_trust)
                        .bind(merged.avg_relevance)
                        .bind(upsert.step_order)
                        .execute(&mut *tx)
                        .await?;
                        for source in &novel {
                            if record_source(&mut tx, tables::STEPS, step_id, source).await? {
                                outcome.sources_recorded += 1;
                            }
                        }
                        outcome.merged += 1;
                        append_resolution_log(
                            &mut tx,
                            run_id,
                            ResolutionAction::Merged,
                            tables::STEPS,
                            Some(step_id),
                            &format!("dtc={}", upsert.dtc_code),
                        )
                        .await?;
                    }
                }
                None => {
                    let step_id = Uuid::new_v4();
                    sqlx::query(
                        r#"
                        INSERT INTO dtc_diagnostic_steps
                            (id, dtc_master_id, step_order, instruction, tools_required,
                             expected_values, evidence_count, avg_trust, avg_relevance)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#,
                    )
                    .bind(step_id)
                    .bind(master_id)
                    .bind(upsert.step_order)
                    .bind(&upsert.instruction)
                    .bind(&upsert.tools_required)
                    .bind(&upsert.expected_values)
                    .bind(upsert.aggregates.evidence_count)
                    .bind(upsert.aggregates.avg_trust)
                    .bind(upsert.aggregates.avg_relevance)
                    .execute(&mut *tx)
                    .await?;
                    for source in &upsert.sources {
                        if record_source(&mut tx, tables::STEPS, step_id, source).await? {
                            outcome.sources_recorded += 1;
                        }
                    }
                    outcome.created += 1;
                    append_resolution_log(
                        &mut tx,
                        run_id,
                        ResolutionAction::Created,
                        tables::STEPS,
                        Some(step_id),
                        &format!("dtc={} order={}", upsert.dtc_code, upsert.step_order),
                    )
                    .await?;
                }
            }
        }

        for upsert in &plan.sensor_upserts {
            let Some(master_id) = master_id_for(&mut tx, &upsert.dtc_code).await? else {
                outcome.rejected += 1;
                append_resolution_log(
                    &mut tx,
                    run_id,
                    ResolutionAction::Rejected,
                    tables::SENSORS,
                    None,
                    &format!("unknown dtc {} for sensor {}", upsert.dtc_code, upsert.name),
                )
                .await?;
                continue;
            };
            touched_masters.push(master_id);

            let sensor_id: Option<Uuid> =
                sqlx::query_scalar("SELECT id FROM sensors WHERE lower(name) = lower($1)")
                    .bind(&upsert.name)
                    .fetch_optional(&mut *tx)
                    .await?;
            let sensor_id = match sensor_id {
                Some(id) => id,
                None => {
                    let id = Uuid::new_v4();
                    sqlx::query("INSERT INTO sensors (id, name, sensor_type) VALUES ($1, $2, $3)")
                        .bind(id)
                        .bind(&upsert.name)
                        .bind(&upsert.sensor_type)
                        .execute(&mut *tx)
                        .await?;
                    id
                }
            };

            let existing: Option<(Uuid, i64, f64, f64)> = sqlx::query_as(
                r#"
                SELECT id, evidence_count, avg_trust, avg_relevance
                FROM dtc_related_sensors
                WHERE dtc_master_id = $1 AND sensor_id = $2
                "#,
            )
            .bind(master_id)
            .bind(sensor_id)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some((link_id, evidence_count, avg_trust, avg_relevance)) => {
                    let novel =
                        novel_sources(&mut tx, tables::SENSORS, link_id, &upsert.sources).await?;
                    if !novel.is_empty() {
                        let observation = observed_aggregates(&novel);
                        let merged = scoring::merge_aggregates(
                            &Aggregates::new(evidence_count, avg_trust, avg_relevance),
                            &observation,
                        );
                        sqlx::query(
                            r#"
                            UPDATE dtc_related_sensors SET
                                evidence_count = $2,
                                avg_trust = $3,
                                avg_relevance = $4,
                                typical_range = COALESCE(typical_range, $5),
                                unit = COALESCE(unit, $6)
                            WHERE id = $1
                            "#,
                        )
                        .bind(link_id)
                        .bind(merged.evidence_count)
                        .bind(merged.avg_trust)
                        .bind(merged.avg_relevance)
                        .bind(&upsert.typical_range)
                        .bind(&upsert.unit)
                        .execute(&mut *tx)
                        .await?;
                        for source in &novel {
                            if record_source(&mut tx, tables::SENSORS, link_id, source).await? {
                                outcome.sources_recorded += 1;
                            }
                        }
                        outcome.merged += 1;
                        append_resolution_log(
                            &mut tx,
                            run_id,
                            ResolutionAction::Merged,
                            tables::SENSORS,
                            Some(link_id),
                            &format!("dtc={} sensor={}", upsert.dtc_code, upsert.name),
                        )
                        .await?;
                    }
                }
                None => {
                    let link_id = Uuid::new_v4();
                    sqlx::query(
                        r#"
                        INSERT INTO dtc_related_sensors
                            (id, dtc_master_id, sensor_id, typical_range, unit,
                             evidence_count, avg_trust, avg_relevance)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(link_id)
                    .bind(master_id)
                    .bind(sensor_id)
                    .bind(&upsert.typical_range)
                    .bind(&upsert.unit)
                    .bind(upsert.aggregates.evidence_count)
                    .bind(upsert.aggregates.avg_trust)
                    .bind(upsert.aggregates.avg_relevance)
                    .execute(&mut *tx)
                    .await?;
                    for source in &upsert.sources {
                        if record_source(&mut tx, tables::SENSORS, link_id, source).await? {
                            outcome.sources_recorded += 1;
                        }
                    }
                    outcome.created += 1;
                    append_resolution_log(
                        &mut tx,
                        run_id,
                        ResolutionAction::Created,
                        tables::SENSORS,
                        Some(link_id),
                        &format!("dtc={} sensor={}", upsert.dtc_code, upsert.name),
                    )
                    .await?;
                }
            }
        }

        for upsert in &plan.tsb_upserts {
            let existing: Option<(Uuid, i64, f64, f64)> = sqlx::query_as(
                r#"
                SELECT id, evidence_count, avg_trust, avg_relevance
                FROM tsb_references WHERE tsb_number = $1
                "#,
            )
            .bind(&upsert.tsb_number)
            .fetch_optional(&mut *tx)
            .await?;

            let codes: Vec<String> = upsert
                .related_dtc_codes
                .iter()
                .map(|c| c.as_str().to_string())
                .collect();

            match existing {
                Some((tsb_id, evidence_count, avg_trust, avg_relevance)) => {
                    let novel =
                        novel_sources(&mut tx, tables::TSBS, tsb_id, &upsert.sources).await?;
                    if !novel.is_empty() {
                        let observation = observed_aggregates(&novel);
                        let merged = scoring::merge_aggregates(
                            &Aggregates::new(evidence_count, avg_trust, avg_relevance),
                            &observation,
                        );
                        sqlx::query(
                            r#"
                            UPDATE tsb_references SET
                                evidence_count = $2,
                                avg_trust = $3,
                                avg_relevance = $4,
                                title = CASE WHEN title = '' THEN $5 ELSE title END,
                                summary = CASE WHEN summary = '' THEN $6 ELSE summary END,
                                affected_models = CASE WHEN affected_models = '' THEN $7
                                    ELSE affected_models END,
                                related_dtc_codes = (
                                    SELECT ARRAY(SELECT DISTINCT unnest(related_dtc_codes || $8))
                                )
                            WHERE id = $1
                            "#,
                        )
                        .bind(tsb_id)
                        .bind(merged.evidence_count)
                        .bind(merged.avg_trust)
                        .bind(merged.avg_relevance)
                        .bind(&upsert.title)
                        .bind(&upsert.summary)
                        .bind(&upsert.affected_models)
                        .bind(&codes)
                        .execute(&mut *tx)
                        .await?;
                        for source in &novel {
                            if record_source(&mut tx, tables::TSBS, tsb_id, source).await? {
                                outcome.sources_recorded += 1;
                            }
                        }
                        outcome.merged += 1;
                        append_resolution_log(
                            &mut tx,
                            run_id,
                            ResolutionAction::Merged,
                            tables::TSBS,
                            Some(tsb_id),
                            &format!("tsb={}", upsert.tsb_number),
                        )
                        .await?;
                    }
                }
                None => {
                    let tsb_id = Uuid::new_v4();
                    sqlx::query(
                        r#"
                        INSERT INTO tsb_references
                            (id, tsb_number, title, affected_models, summary,
                             related_dtc_codes, evidence_count, avg_trust, avg_relevance)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#,
                    )
                    .bind(tsb_id)
                    .bind(&upsert.tsb_number)
                    .bind(&upsert.title)
                    .bind(&upsert.affected_models)
                    .bind(&upsert.summary)
                    .bind(&codes)
                    .bind(upsert.aggregates.evidence_count)
                    .bind(upsert.aggregates.avg_trust)
                    .bind(upsert.aggregates.avg_relevance)
                    .execute(&mut *tx)
                    .await?;
                    for source in &upsert.sources {
                        if record_source(&mut tx, tables::TSBS, tsb_id, source).await? {
                            outcome.sources_recorded += 1;
                        }
                    }
                    outcome.created += 1;
                    append_resolution_log(
                        &mut tx,
                        run_id,
                        ResolutionAction::Created,
                        tables::TSBS,
                        Some(tsb_id),
                        &format!("tsb={}", upsert.tsb_number),
                    )
                    .await?;
                }
            }
        }

        for link_plan in &plan.vehicle_links {
            let rows = sqlx::query(
                r#"
                SELECT id, year_start, year_end FROM vehicles
                WHERE lower(make) = lower($1) AND lower(model) = lower($2)
                "#,
            )
            .bind(&link_plan.make)
            .bind(&link_plan.model)
            .fetch_all(&mut *tx)
            .await?;

            let found = rows.iter().find_map(|row| {
                let vehicle = Vehicle {
                    id: row.get("id"),
                    make: link_plan.make.clone(),
                    model: link_plan.model.clone(),
                    year_start: row.get("year_start"),
                    year_end: row.get("year_end"),
                };
                vehicle
                    .years_overlap(link_plan.year_start, link_plan.year_end)
                    .then_some(vehicle.id)
            });

            let vehicle_id = match found {
                Some(id) => id,
                None => {
                    let id = Uuid::new_v4();
                    sqlx::query(
                        r#"
                        INSERT INTO vehicles (id, make, model, year_start, year_end)
                        VALUES ($1, $2, $3, $4, $5)
                        "#,
                    )
                    .bind(id)
                    .bind(&link_plan.make)
                    .bind(&link_plan.model)
                    .bind(link_plan.year_start)
                    .bind(link_plan.year_end)
                    .execute(&mut *tx)
                    .await?;
                    outcome.vehicles_created += 1;
                    id
                }
            };

            for code in &link_plan.dtc_codes {
                let Some(master_id) = master_id_for(&mut tx, code).await? else {
                    continue;
                };
                let link_id = Uuid::new_v4();
                let result = sqlx::query(
                    r#"
                    INSERT INTO vehicle_dtc_codes (id, vehicle_id, dtc_master_id, source_chunk_id)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (vehicle_id, dtc_master_id) DO NOTHING
                    "#,
                )
                .bind(link_id)
                .bind(vehicle_id)
                .bind(master_id)
                .bind(link_plan.source_chunk_id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    continue;
                }
                outcome.vehicle_links_created += 1;
                let source = Provenance {
                    chunk_id: link_plan.source_chunk_id,
                    trust: 0.5,
                    relevance: 0.5,
                };
                if record_source(&mut tx, tables::VEHICLE_LINKS, link_id, &source).await? {
                    outcome.sources_recorded += 1;
                }
                append_resolution_log(
                    &mut tx,
                    run_id,
                    ResolutionAction::Created,
                    tables::VEHICLE_LINKS,
                    Some(link_id),
                    &format!(
                        "vehicle={} {} dtc={} specificity={}",
                        link_plan.make, link_plan.model, code, link_plan.specificity
                    ),
                )
                .await?;
            }
        }

        for rejected in &plan.rejected {
            outcome.rejected += 1;
            let details = if rejected.details.is_empty() {
                rejected.reason.clone()
            } else {
                format!("{}: {}", rejected.reason, rejected.details)
            };
            append_resolution_log(
                &mut tx,
                run_id,
                ResolutionAction::Rejected,
                &rejected.entity_table,
                None,
                &details,
            )
            .await?;
        }

        touched_masters.sort();
        touched_masters.dedup();
        for master_id in touched_masters {
            sqlx::query(
                r#"
                UPDATE dtc_master d SET
                    confidence_score = LEAST(1.0,
                        0.3 * LEAST(1.0, (
                            SELECT COUNT(*)::FLOAT8 FROM dtc_entity_sources s
                            WHERE s.entity_table = $2 AND s.entity_id = d.id
                        ) / 5.0) +
                        0.7 * COALESCE((
                            SELECT AVG(s.trust_score) FROM dtc_entity_sources s
                            WHERE s.entity_table = $2 AND s.entity_id = d.id
                        ), 0.5)
                    ),
                    updated_at = NOW()
                WHERE d.id = $1
                "#,
            )
            .bind(master_id)
            .bind(tables::DTC_MASTER)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE documents SET
                category = COALESCE($2, category),
                confidence_score = COALESCE($3, confidence_score),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(plan.document_id)
        .bind(plan.document_category.map(|c| c.as_str()))
        .bind(plan.document_confidence)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn dtc_master_by_code(&self, code: &DtcCode) -> Result<Option<DtcMaster>> {
        let row = sqlx::query("SELECT * FROM dtc_master WHERE code = $1")
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().and_then(map_dtc_master))
    }

    async fn causes_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<DtcCause>> {
        let rows =
            sqlx::query("SELECT * FROM dtc_possible_causes WHERE dtc_master_id = $1 ORDER BY cause")
                .bind(dtc_master_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(map_cause).collect())
    }

    async fn steps_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<DtcDiagnosticStep>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM dtc_diagnostic_steps
            WHERE dtc_master_id = $1
            ORDER BY step_order, instruction
            "#,
        )
        .bind(dtc_master_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_step).collect())
    }

    async fn next_diagnostic_step(
        &self,
        step_id: Uuid,
        passed: bool,
    ) -> Result<Option<DtcDiagnosticStep>> {
        let column = if passed {
            "pass_next_step_id"
        } else {
            "fail_next_step_id"
        };
        let query = format!(
            "SELECT n.* FROM dtc_diagnostic_steps s \
             JOIN dtc_diagnostic_steps n ON n.id = s.{column} \
             WHERE s.id = $1"
        );
        let row = sqlx::query(&query)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_step))
    }

    async fn vehicles_for_dtc(&self, dtc_master_id: Uuid) -> Result<Vec<Vehicle>> {
        let rows = sqlx::query(
            r#"
            SELECT v.* FROM vehicles v
            JOIN vehicle_dtc_codes l ON l.vehicle_id = v.id
            WHERE l.dtc_master_id = $1
            ORDER BY v.make, v.model
            "#,
        )
        .bind(dtc_master_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Vehicle {
                id: row.get("id"),
                make: row.get("make"),
                model: row.get("model"),
                year_start: row.get("year_start"),
                year_end: row.get("year_end"),
            })
            .collect())
    }

    async fn entity_sources(
        &self,
        entity_table: &str,
        entity_id: Uuid,
    ) -> Result<Vec<EntitySource>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM dtc_entity_sources
            WHERE entity_table = $1 AND entity_id = $2
            ORDER BY extracted_at
            "#,
        )
        .bind(entity_table)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| EntitySource {
                entity_table: row.get("entity_table"),
                entity_id: row.get("entity_id"),
                chunk_id: row.get("chunk_id"),
                trust_score: row.get("trust_score"),
                relevance_score: row.get("relevance_score"),
                extracted_at: row.get("extracted_at"),
            })
            .collect())
    }

    async fn resolution_log(&self, run_id: Uuid) -> Result<Vec<ResolutionLogEntry>> {
        let rows = sqlx::query("SELECT * FROM resolution_log WHERE run_id = $1 ORDER BY created_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let action: String = row.get("action");
                ResolutionLogEntry {
                    id: row.get("id"),
                    run_id: row.get("run_id"),
                    action: match action.as_str() {
                        "created" => ResolutionAction::Created,
                        "updated" => ResolutionAction::Updated,
                        "merged" => ResolutionAction::Merged,
                        _ => ResolutionAction::Rejected,
                    },
                    entity_table: row.get("entity_table"),
                    entity_id: row.get("entity_id"),
                    details: row.get("details"),
                    created_at: row.get("created_at"),
                }
            })
            .collect())
    }

    async fn append_processing_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        let entry = entry.clone();
        self.retrying(|pool| {
            let entry = entry.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO processing_log
                        (id, document_id, stage, status, message, duration_ms, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(entry.id)
                .bind(entry.document_id)
                .bind(&entry.stage)
                .bind(entry.status.as_str())
                .bind(&entry.message)
                .bind(entry.duration_ms)
                .bind(entry.created_at)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    async fn processing_log_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<ProcessingLogEntry>> {
        let rows =
            sqlx::query("SELECT * FROM processing_log WHERE document_id = $1 ORDER BY created_at")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let status: String = row.get("status");
                ProcessingLogEntry {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    stage: row.get("stage"),
                    status: match status.as_str() {
                        "started" => ProcessingStatus::Started,
                        "completed" => ProcessingStatus::Completed,
                        _ => ProcessingStatus::Error,
                    },
                    message: row.get("message"),
                    duration_ms: row.get("duration_ms"),
                    created_at: row.get("created_at"),
                }
            })
            .collect())
    }
}
