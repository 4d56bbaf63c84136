//! Stage worker entrypoint.
//!
//! Runs a single pipeline stage worker, selected by the first CLI
//! argument or the `WORKER_STAGE` environment variable: one of
//! `crawl`, `chunk`, `embed`, `evaluate`, `extract`, `resolve`, or
//! `reaper` (a one-shot pass that re-enqueues stuck documents).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dtc_refinery::pipeline::{
    requeue_stuck_documents, ChunkStage, CrawlStage, EmbedStage, EvaluateStage, ExtractStage,
    ResolveStage, WorkerRuntime,
};
use dtc_refinery::{Config, FsBlobStore, OllamaClient, PostgresQueue, PostgresStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dtc_refinery=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env().context("loading configuration")?;

    let stage_name = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WORKER_STAGE").ok())
        .context("stage name required (argument or WORKER_STAGE)")?;

    let store = Arc::new(
        PostgresStore::connect(&config)
            .await
            .context("connecting to database")?,
    );
    let queue = Arc::new(
        PostgresQueue::new(store.pool().clone())
            .await
            .context("initializing job queue")?,
    );
    let blob = Arc::new(FsBlobStore::new(&config.blob_root));
    let ollama = Arc::new(
        OllamaClient::new(&config.ollama_base_url)
            .with_reasoning_model(&config.reasoning_model)
            .with_embedding_model(&config.embedding_model, config.embedding_dim)
            .with_timeouts(
                Duration::from_secs(config.reasoning_timeout_s),
                Duration::from_secs(config.embedding_timeout_s),
            ),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let runtime = WorkerRuntime::new(
        store.clone(),
        queue.clone(),
        config.pop_timeout(),
        shutdown.clone(),
    );

    tracing::info!(stage = %stage_name, "starting worker");
    match stage_name.as_str() {
        "crawl" => {
            let stage = CrawlStage::new(
                store.clone(),
                blob.clone(),
                queue.clone(),
                Duration::from_secs(config.http_timeout_s),
            );
            stage.run(config.pop_timeout(), shutdown).await;
        }
        "chunk" => {
            let stage = ChunkStage::new(
                store.clone(),
                blob.clone(),
                config.chunk_size_chars,
                config.chunk_overlap_chars,
            );
            runtime.run(&stage).await;
        }
        "embed" => {
            let stage = EmbedStage::new(store.clone(), ollama.clone());
            runtime.run(&stage).await;
        }
        "evaluate" => {
            let stage = EvaluateStage::new(store.clone(), ollama.clone());
            runtime.run(&stage).await;
        }
        "extract" => {
            let stage = ExtractStage::new(
                store.clone(),
                ollama.clone(),
                config.relevance_gate_threshold,
            );
            runtime.run(&stage).await;
        }
        "resolve" => {
            let stage = ResolveStage::new(store.clone());
            runtime.run(&stage).await;
        }
        "reaper" => {
            let requeued =
                requeue_stuck_documents(store.as_ref(), queue.as_ref(), chrono::Duration::minutes(15))
                    .await
                    .context("requeueing stuck documents")?;
            tracing::info!(requeued, "reaper pass complete");
        }
        other => bail!("unknown stage: {other}"),
    }

    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received, finishing in-flight job");
        shutdown.cancel();
    });
}
