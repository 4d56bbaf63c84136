//! Job queue seam.
//!
//! Queues hold no authoritative state; a lost message is recoverable
//! from the document's stage column. Delivery is at-least-once to a
//! single consumer; FIFO is best-effort.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Stable queue names, one per pipeline stage.
pub mod queues {
    pub const CRAWL: &str = "jobs:crawl";
    pub const CHUNK: &str = "jobs:chunk";
    pub const EMBED: &str = "jobs:embed";
    pub const EVALUATE: &str = "jobs:evaluate";
    pub const EXTRACT: &str = "jobs:extract";
    pub const RESOLVE: &str = "jobs:resolve";

    pub const ALL: [&str; 6] = [CRAWL, CHUNK, EMBED, EVALUATE, EXTRACT, RESOLVE];
}

/// Named FIFO job queues. Payloads are UTF-8 strings carrying a single
/// UUID.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job to the tail of a queue.
    async fn push(&self, queue: &str, payload: &str) -> Result<()>;

    /// Block up to `timeout` for a job; removes it exactly once from
    /// exactly one consumer. Returns `None` when the timeout expires.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;

    /// Number of jobs currently waiting in a queue.
    async fn depth(&self, queue: &str) -> Result<u64>;
}
