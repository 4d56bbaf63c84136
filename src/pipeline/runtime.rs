//! Stage worker runtime.
//!
//! One worker handles one job at a time, end to end. The loop pops a
//! document id, records a `started` log row, runs the stage, then
//! either advances the document (stage-transition commit first, queue
//! push after) or marks it terminally failed. Errors never cross the
//! stage boundary.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::traits::queue::JobQueue;
use crate::traits::store::PipelineStore;
use crate::types::document::ProcessingStage;
use crate::types::knowledge::{ProcessingLogEntry, ProcessingStatus};

/// A pipeline stage that processes one document at a time.
#[async_trait::async_trait]
pub trait DocumentStage: Send + Sync {
    /// Stage the document is in while this worker holds it.
    fn stage(&self) -> ProcessingStage;

    /// Stage the document moves to on success.
    fn next_stage(&self) -> ProcessingStage;

    /// Process one document. The returned string becomes the
    /// `completed` log message.
    async fn run(&self, document_id: Uuid) -> Result<String>;
}

/// Shared worker loop for all document stages.
pub struct WorkerRuntime<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    pop_timeout: Duration,
    shutdown: CancellationToken,
}

impl<S: PipelineStore, Q: JobQueue> WorkerRuntime<S, Q> {
    pub fn new(
        store: Arc<S>,
        queue: Arc<Q>,
        pop_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            pop_timeout,
            shutdown,
        }
    }

    /// Run the worker loop until shutdown. In-flight jobs complete;
    /// no new job is picked up after the token fires.
    pub async fn run<T: DocumentStage>(&self, stage: &T) {
        let input_queue = stage
            .stage()
            .queue()
            .expect("document stages consume from a queue");
        info!(stage = %stage.stage(), queue = input_queue, "worker started");

        while !self.shutdown.is_cancelled() {
            let popped = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.queue.pop(input_queue, self.pop_timeout) => result,
            };

            let payload = match popped {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, queue = input_queue, "queue pop failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            self.handle_job(stage, &payload).await;
        }

        info!(stage = %stage.stage(), "worker stopped");
    }

    /// Process exactly one payload. Exposed so tests can drive stages
    /// without a long-running loop.
    pub async fn handle_job<T: DocumentStage>(&self, stage: &T, payload: &str) {
        let Ok(document_id) = Uuid::parse_str(payload.trim()) else {
            warn!(payload, "discarding poison job payload");
            return;
        };
        match self.store.document(document_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(%document_id, "discarding job for missing document");
                return;
            }
            Err(e) => {
                warn!(%document_id, error = %e, "document lookup failed, dropping job");
                return;
            }
        }

        let started = Instant::now();
        if let Err(e) = self
            .store
            .set_document_stage(document_id, stage.stage(), None)
            .await
        {
            warn!(%document_id, error = %e, "failed to claim document for stage");
            return;
        }
        self.log(
            ProcessingLogEntry::new(document_id, stage.stage().as_str(), ProcessingStatus::Started),
        )
        .await;

        match stage.run(document_id).await {
            Ok(message) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                self.log(
                    ProcessingLogEntry::new(
                        document_id,
                        stage.stage().as_str(),
                        ProcessingStatus::Completed,
                    )
                    .with_message(&message)
                    .with_duration_ms(duration_ms),
                )
                .await;
                if let Err(e) = self.advance(stage, document_id).await {
                    warn!(%document_id, error = %e, "stage advance failed");
                }
                info!(%document_id, stage = %stage.stage(), duration_ms, "{message}");
            }
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                let reason = truncate(&e.to_string(), 500);
                if let Err(set_err) = self
                    .store
                    .set_document_stage(document_id, ProcessingStage::Error, Some(&reason))
                    .await
                {
                    warn!(%document_id, error = %set_err, "failed to record error state");
                }
                self.log(
                    ProcessingLogEntry::new(
                        document_id,
                        stage.stage().as_str(),
                        ProcessingStatus::Error,
                    )
                    .with_message(&reason)
                    .with_duration_ms(duration_ms),
                )
                .await;
                warn!(%document_id, stage = %stage.stage(), error = %e, "stage failed");
            }
        }
    }

    /// Advance a document: commit the stage transition, then push the
    /// id to the next queue. A crash between the two leaves the
    /// document in the new stage with no job; the reaper re-enqueues
    /// it.
    async fn advance<T: DocumentStage>(&self, stage: &T, document_id: Uuid) -> Result<()> {
        let next = stage.next_stage();
        self.store.set_document_stage(document_id, next, None).await?;
        if let Some(queue_name) = next.queue() {
            if let Err(e) = self
                .queue
                .push(queue_name, &document_id.to_string())
                .await
            {
                warn!(
                    %document_id,
                    queue = queue_name,
                    error = %e,
                    "queue push failed after stage commit"
                );
            }
        }
        Ok(())
    }

    async fn log(&self, entry: ProcessingLogEntry) {
        if let Err(e) = self.store.append_processing_log(&entry).await {
            warn!(error = %e, "failed to append processing log");
        }
    }
}

/// Re-enqueue documents that advanced their stage column but lost the
/// queue push (worker killed between commit and push). Returns how many
/// jobs were pushed.
pub async fn requeue_stuck_documents<S: PipelineStore, Q: JobQueue>(
    store: &S,
    queue: &Q,
    stuck_after: chrono::Duration,
) -> Result<usize> {
    let mut requeued = 0;
    for stage in [
        ProcessingStage::Chunking,
        ProcessingStage::Embedding,
        ProcessingStage::Evaluating,
        ProcessingStage::Extracting,
        ProcessingStage::Resolving,
    ] {
        let queue_name = stage.queue().expect("worker stages have queues");
        for document_id in store.documents_in_stage_longer_than(stage, stuck_after).await? {
            queue.push(queue_name, &document_id.to_string()).await?;
            requeued += 1;
            info!(%document_id, stage = %stage, "re-enqueued stuck document");
        }
    }
    Ok(requeued)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 500), "short");
        let long = "é".repeat(300);
        let cut = truncate(&long, 500);
        assert!(cut.len() <= 500);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
