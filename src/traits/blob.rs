//! Blob store seam.
//!
//! Content-addressed raw document storage. Written once per document by
//! the crawl stage (or direct ingestion), read by the chunk stage. No
//! atomicity beyond a single object write.

use async_trait::async_trait;

use crate::error::Result;

/// Raw content blob storage keyed by caller-chosen keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under a key and return the location to read them
    /// back from.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String>;

    /// Fetch bytes by location.
    async fn get(&self, location: &str) -> Result<Vec<u8>>;
}
