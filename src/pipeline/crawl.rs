//! Crawl stage: fetch a URL, extract text, create the document, and
//! discover links.
//!
//! The crawl worker is the pipeline's entry point and the only stage
//! whose job payload is a crawl-request id rather than a document id.
//! Duplicate content (same SHA-256) is benign: the request completes
//! without re-ingesting. Discovered links stay on the same host and are
//! only followed while `depth < max_depth`.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{RefineryError, Result};
use crate::traits::blob::BlobStore;
use crate::traits::queue::{queues, JobQueue};
use crate::traits::store::PipelineStore;
use crate::types::document::{hash_content, CrawlRequest, CrawlStatus, Document, ProcessingStage};

const USER_AGENT: &str = "dtc-refinery/0.1 (automotive knowledge pipeline)";
const MIN_TEXT_CHARS: usize = 50;

/// What one crawl job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// A new document entered the pipeline.
    Ingested { document_id: Uuid, links_queued: usize },
    /// Content hash already known; nothing ingested.
    Duplicate { existing_document_id: Uuid },
}

/// The crawl stage worker.
pub struct CrawlStage<S, B, Q> {
    store: Arc<S>,
    blob: Arc<B>,
    queue: Arc<Q>,
    http: reqwest::Client,
}

impl<S: PipelineStore, B: BlobStore, Q: JobQueue> CrawlStage<S, B, Q> {
    pub fn new(store: Arc<S>, blob: Arc<B>, queue: Arc<Q>, http_timeout: Duration) -> Self {
        Self {
            store,
            blob,
            queue,
            http: reqwest::Client::builder()
                .timeout(http_timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fetch with the stage's retry split: one extra attempt on 4xx,
    /// up to three on 5xx with linear backoff.
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch_once(url).await {
                Ok(ok) => return Ok(ok),
                Err(e @ RefineryError::HttpStatus { status, .. }) => {
                    let budget = if status >= 500 { 3 } else { 2 };
                    if attempt >= budget {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e @ RefineryError::Http(_)) => {
                    if attempt >= 3 {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let response = self
            .http
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefineryError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_lowercase();
        let bytes = response.bytes().await?.to_vec();
        Ok((bytes, content_type))
    }

    /// Run one crawl job.
    pub async fn process_request(&self, request_id: Uuid) -> Result<CrawlOutcome> {
        let request = self
            .store
            .crawl_request(request_id)
            .await?
            .ok_or(RefineryError::CrawlRequestNotFound(request_id))?;

        self.store
            .set_crawl_request_status(request_id, CrawlStatus::Active, None)
            .await?;

        let (bytes, content_type) = self.fetch(&request.url).await?;

        let (text, title, mime_type, html) = if content_type.contains("text/html") {
            let html = String::from_utf8_lossy(&bytes).into_owned();
            let title = extract_title(&html);
            (html_to_text(&html), title, "text/html", Some(html))
        } else if content_type.contains("text/plain") {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (text, None, "text/plain", None)
        } else {
            return Err(RefineryError::UnsupportedMime(content_type));
        };

        let text = text.trim().to_string();
        if text.chars().count() < MIN_TEXT_CHARS {
            return Err(RefineryError::EmptyDocument(text.chars().count()));
        }

        let content_hash = hash_content(&text);
        if let Some(existing) = self.store.find_document_by_hash(&content_hash).await? {
            info!(url = %request.url, document_id = %existing.id, "duplicate content, skipping");
            self.store
                .set_crawl_request_status(request_id, CrawlStatus::Completed, None)
                .await?;
            return Ok(CrawlOutcome::Duplicate {
                existing_document_id: existing.id,
            });
        }

        let title = title
            .or_else(|| first_line_title(&text))
            .unwrap_or_else(|| "Untitled".to_string());

        let document = Document::new(
            title,
            content_hash,
            mime_type,
            String::new(),
            ProcessingStage::Chunking,
        )
        .with_source_url(&request.url);
        let key = format!("raw/{}.txt", document.id);
        let location = self.blob.put(&key, text.as_bytes(), mime_type).await?;
        let document = Document {
            blob_location: location,
            ..document
        };
        self.store.insert_document(&document).await?;

        // Link discovery while the depth budget allows
        let mut links_queued = 0usize;
        if request.depth < request.max_depth {
            if let Some(html) = &html {
                links_queued = self.discover_links(&request, html).await?;
            }
        }

        self.queue
            .push(queues::CHUNK, &document.id.to_string())
            .await?;
        self.store
            .set_crawl_request_status(request_id, CrawlStatus::Completed, None)
            .await?;

        info!(
            url = %request.url,
            document_id = %document.id,
            chars = text.chars().count(),
            links_queued,
            "crawled"
        );
        Ok(CrawlOutcome::Ingested {
            document_id: document.id,
            links_queued,
        })
    }

    async fn discover_links(&self, request: &CrawlRequest, html: &str) -> Result<usize> {
        let Ok(base) = Url::parse(&request.url) else {
            return Ok(0);
        };
        let mut queued = 0usize;
        for link in extract_links(&base, html) {
            let child = request.child(&link);
            if self.store.insert_crawl_request(&child).await? {
                self.queue.push(queues::CRAWL, &child.id.to_string()).await?;
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Worker loop for the crawl queue. Errors mark the crawl request
    /// failed; they never take the worker down.
    pub async fn run(&self, pop_timeout: Duration, shutdown: CancellationToken) {
        info!(queue = queues::CRAWL, "crawl worker started");
        while !shutdown.is_cancelled() {
            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.queue.pop(queues::CRAWL, pop_timeout) => result,
            };
            let payload = match popped {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "queue pop failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            self.handle_job(&payload).await;
        }
        info!("crawl worker stopped");
    }

    /// Process one payload; exposed for tests.
    pub async fn handle_job(&self, payload: &str) {
        let Ok(request_id) = Uuid::parse_str(payload.trim()) else {
            warn!(payload, "discarding poison crawl payload");
            return;
        };
        if let Err(e) = self.process_request(request_id).await {
            if e.is_poison() {
                warn!(%request_id, error = %e, "discarding poison crawl job");
                return;
            }
            let reason: String = e.to_string().chars().take(500).collect();
            if let Err(status_err) = self
                .store
                .set_crawl_request_status(request_id, CrawlStatus::Failed, Some(&reason))
                .await
            {
                warn!(%request_id, error = %status_err, "failed to mark crawl request failed");
            }
            warn!(%request_id, error = %e, "crawl failed");
        }
    }
}

/// Submit a URL for crawling: insert the request row and enqueue it.
/// Returns `None` when the URL is already queued.
pub async fn submit_url<S: PipelineStore, Q: JobQueue>(
    store: &S,
    queue: &Q,
    url: &str,
    max_depth: i32,
) -> Result<Option<Uuid>> {
    let request = CrawlRequest::new(url, max_depth);
    if !store.insert_crawl_request(&request).await? {
        return Ok(None);
    }
    queue.push(queues::CRAWL, &request.id.to_string()).await?;
    Ok(Some(request.id))
}

/// Extract the `<title>` text from HTML.
pub fn extract_title(html: &str) -> Option<String> {
    let pattern = regex::Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok()?;
    pattern
        .captures(html)
        .and_then(|cap| cap.get(1))
        .map(|m| decode_entities(m.as_str()).trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Strip markup down to readable text, dropping script, style, and
/// chrome sections first.
pub fn html_to_text(html: &str) -> String {
    let mut text = html.to_string();

    for tag in ["script", "style", "nav", "footer", "header"] {
        let pattern = regex::Regex::new(&format!(r"(?is)<{tag}[^>]*>.*?</{tag}>")).unwrap();
        text = pattern.replace_all(&text, " ").to_string();
    }

    let comments = regex::Regex::new(r"(?s)<!--.*?-->").unwrap();
    text = comments.replace_all(&text, " ").to_string();

    let breaks = regex::Regex::new(r"(?i)<(br|/p|/div|/li|/h[1-6]|/tr)[^>]*>").unwrap();
    text = breaks.replace_all(&text, "\n").to_string();

    let tags = regex::Regex::new(r"<[^>]+>").unwrap();
    text = tags.replace_all(&text, " ").to_string();

    text = decode_entities(&text);

    let blank_runs = regex::Regex::new(r"\n\s*\n+").unwrap();
    let spaced = regex::Regex::new(r"[ \t]+").unwrap();
    text = spaced.replace_all(&text, " ").to_string();
    text = blank_runs.replace_all(&text, "\n").to_string();

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Extract same-host outbound links, canonicalized against the base
/// URL. Anchors, javascript, and mail/tel links are skipped.
pub fn extract_links(base: &Url, html: &str) -> Vec<String> {
    let pattern = regex::Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).unwrap();
    let mut links = Vec::new();

    for cap in pattern.captures_iter(html) {
        let Some(href) = cap.get(1) else { continue };
        let href = href.as_str();
        if href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        if resolved.host_str() != base.host_str() {
            continue;
        }
        let resolved = resolved.to_string();
        if resolved != base.as_str() && !links.contains(&resolved) {
            links.push(resolved);
        }
    }

    links
}

fn first_line_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(100).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_extracted_case_insensitively() {
        let html = "<html><head><TITLE> P0301 Misfire Guide </TITLE></head></html>";
        assert_eq!(extract_title(html), Some("P0301 Misfire Guide".to_string()));
        assert_eq!(extract_title("<body>no title</body>"), None);
    }

    #[test]
    fn html_to_text_drops_chrome() {
        let html = r#"
            <html><head><script>var x = 1;</script><style>.a{}</style></head>
            <body><nav>menu</nav>
            <h1>P0301</h1>
            <p>Cylinder 1 misfire detected.</p>
            <footer>copyright</footer></body></html>
        "#;
        let text = html_to_text(html);
        assert!(text.contains("P0301"));
        assert!(text.contains("Cylinder 1 misfire detected."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("menu"));
        assert!(!text.contains("copyright"));
    }

    #[test]
    fn entities_are_decoded() {
        let text = html_to_text("<p>2&nbsp;&ndash;7 g/s &amp; 14.7:1</p>");
        assert!(text.contains("& 14.7:1"));
    }

    #[test]
    fn links_stay_on_host_and_canonicalize() {
        let base = Url::parse("https://example.com/dtc/p0301").unwrap();
        let html = r##"
            <a href="/dtc/p0420">P0420</a>
            <a href="https://example.com/dtc/p0171#causes">P0171</a>
            <a href="https://other.org/dtc/p0300">offsite</a>
            <a href="#top">anchor</a>
            <a href="javascript:void(0)">js</a>
            <a href="mailto:shop@example.com">mail</a>
        "##;
        let links = extract_links(&base, html);
        assert_eq!(
            links,
            vec![
                "https://example.com/dtc/p0420".to_string(),
                "https://example.com/dtc/p0171".to_string(),
            ]
        );
    }

    #[test]
    fn first_line_fallback_title() {
        assert_eq!(
            first_line_title("\n  P0301 cylinder 1 misfire\nmore"),
            Some("P0301 cylinder 1 misfire".to_string())
        );
    }
}
