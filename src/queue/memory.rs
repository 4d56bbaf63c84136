//! In-memory job queue for tests and single-process runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::traits::queue::JobQueue;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// In-memory FIFO queues. Pop polls under the timeout the same way the
/// durable backend does, so worker loops behave identically in tests.
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop(&self, queue: &str) -> Option<String> {
        self.queues
            .lock()
            .unwrap()
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, queue: &str, payload: &str) -> Result<()> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_pop(queue) {
                return Ok(Some(payload));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::queue::queues;

    #[tokio::test]
    async fn push_pop_is_fifo() {
        let queue = MemoryQueue::new();
        queue.push(queues::CHUNK, "a").await.unwrap();
        queue.push(queues::CHUNK, "b").await.unwrap();

        assert_eq!(queue.depth(queues::CHUNK).await.unwrap(), 2);
        let first = queue
            .pop(queues::CHUNK, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        let second = queue
            .pop(queues::CHUNK, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(second.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn pop_times_out_empty() {
        let queue = MemoryQueue::new();
        let result = queue
            .pop(queues::EMBED, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn queues_are_independent() {
        let queue = MemoryQueue::new();
        queue.push(queues::CHUNK, "doc-1").await.unwrap();
        assert_eq!(queue.depth(queues::EMBED).await.unwrap(), 0);
        assert_eq!(
            queue
                .pop(queues::EMBED, Duration::from_millis(10))
                .await
                .unwrap(),
            None
        );
    }
}
