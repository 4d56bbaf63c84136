//! Chunk stage: split document text into overlapping chunks.
//!
//! Chunks are ~`chunk_size` characters with ~`overlap` characters of
//! overlap, cut at word boundaries so no word is split. The splitter is
//! a lazy iterator; the stage streams it into a single-transaction
//! insert and records the count on the document.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{RefineryError, Result};
use crate::pipeline::runtime::DocumentStage;
use crate::traits::blob::BlobStore;
use crate::traits::store::PipelineStore;
use crate::types::chunk::NewChunk;
use crate::types::document::ProcessingStage;

/// Word-boundary text splitter.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSplitter {
    size: usize,
    overlap: usize,
}

impl ChunkSplitter {
    pub fn new(size: usize, overlap: usize) -> Self {
        Self {
            size: size.max(2),
            overlap: overlap.min(size / 2),
        }
    }

    /// Lazily split text into chunks.
    pub fn split(&self, text: &str) -> ChunkIter {
        ChunkIter {
            chars: text.chars().collect(),
            size: self.size,
            overlap: self.overlap,
            pos: 0,
            index: 0,
        }
    }
}

/// Lazy chunk producer; each `next()` computes one chunk.
pub struct ChunkIter {
    chars: Vec<char>,
    size: usize,
    overlap: usize,
    pos: usize,
    index: i32,
}

impl ChunkIter {
    /// Walk back from the hard limit to the last whitespace so the cut
    /// lands between words. Falls back to the hard limit for unbroken
    /// runs longer than half a chunk.
    fn break_point(&self, start: usize, hard_end: usize) -> usize {
        if hard_end >= self.chars.len() {
            return self.chars.len();
        }
        if self.chars[hard_end].is_whitespace() || self.chars[hard_end - 1].is_whitespace() {
            return hard_end;
        }
        let floor = start + self.size / 2;
        let mut end = hard_end;
        while end > floor {
            if self.chars[end - 1].is_whitespace() {
                return end;
            }
            end -= 1;
        }
        hard_end
    }

    /// Move an overlap start forward onto a word boundary.
    fn align_start(&self, candidate: usize, end: usize) -> usize {
        let mut start = candidate;
        while start < end {
            if start == 0 || self.chars[start - 1].is_whitespace() {
                return start;
            }
            start += 1;
        }
        end
    }
}

impl Iterator for ChunkIter {
    type Item = NewChunk;

    fn next(&mut self) -> Option<NewChunk> {
        loop {
            if self.pos >= self.chars.len() {
                return None;
            }

            let start = self.pos;
            let hard_end = (start + self.size).min(self.chars.len());
            let end = self.break_point(start, hard_end);

            if end >= self.chars.len() {
                self.pos = self.chars.len();
            } else {
                let overlap_start = self.align_start(end.saturating_sub(self.overlap), end);
                // guarantee forward progress
                self.pos = if overlap_start > start { overlap_start } else { end };
            }

            let content: String = self.chars[start..end].iter().collect();
            if content.trim().is_empty() {
                continue;
            }

            let chunk = NewChunk {
                chunk_index: self.index,
                char_start: start as i32,
                char_end: end as i32,
                token_count: ((end - start) as i32 + 3) / 4,
                content,
            };
            self.index += 1;
            return Some(chunk);
        }
    }
}

/// The chunk stage worker.
pub struct ChunkStage<S, B> {
    store: Arc<S>,
    blob: Arc<B>,
    splitter: ChunkSplitter,
}

impl<S: PipelineStore, B: BlobStore> ChunkStage<S, B> {
    pub fn new(store: Arc<S>, blob: Arc<B>, chunk_size: usize, overlap: usize) -> Self {
        Self {
            store,
            blob,
            splitter: ChunkSplitter::new(chunk_size, overlap),
        }
    }
}

#[async_trait::async_trait]
impl<S: PipelineStore, B: BlobStore> DocumentStage for ChunkStage<S, B> {
    fn stage(&self) -> ProcessingStage {
        ProcessingStage::Chunking
    }

    fn next_stage(&self) -> ProcessingStage {
        ProcessingStage::Embedding
    }

    async fn run(&self, document_id: Uuid) -> Result<String> {
        let document = self
            .store
            .document(document_id)
            .await?
            .ok_or(RefineryError::DocumentNotFound(document_id))?;

        let bytes = self.blob.get(&document.blob_location).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if text.trim().is_empty() {
            return Err(RefineryError::EmptyDocument(text.len()));
        }

        let chunks: Vec<NewChunk> = self.splitter.split(&text).collect();
        let count = self.store.insert_chunks(document_id, &chunks).await?;
        Ok(format!("created {count} chunks"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter() -> ChunkSplitter {
        ChunkSplitter::new(500, 50)
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks: Vec<_> = splitter().split("P0301 indicates a cylinder 1 misfire.").collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(
            chunks[0].char_end as usize,
            "P0301 indicates a cylinder 1 misfire.".chars().count()
        );
    }

    #[test]
    fn chunks_do_not_split_words() {
        let words: Vec<String> = (0..400).map(|i| format!("word{i}")).collect();
        let text = words.join(" ");
        let chunks: Vec<_> = splitter().split(&text).collect();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            for word in chunk.content.split_whitespace() {
                assert!(
                    words.iter().any(|w| w == word),
                    "word {word:?} was cut mid-word"
                );
            }
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let words: Vec<String> = (0..400).map(|i| format!("word{i}")).collect();
        let text = words.join(" ");
        let chunks: Vec<_> = splitter().split(&text).collect();
        for pair in chunks.windows(2) {
            assert!(
                pair[1].char_start < pair[0].char_end,
                "chunks {} and {} do not overlap",
                pair[0].chunk_index,
                pair[1].chunk_index
            );
            assert!(pair[1].char_start > pair[0].char_start);
        }
    }

    #[test]
    fn chunk_sizes_stay_near_target() {
        let words: Vec<String> = (0..1000).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        for chunk in splitter().split(&text) {
            assert!(chunk.content.chars().count() <= 500);
        }
    }

    #[test]
    fn indices_are_dense_and_ordered() {
        let text = "lorem ipsum ".repeat(300);
        let chunks: Vec<_> = splitter().split(&text).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i32);
        }
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert_eq!(splitter().split("").count(), 0);
        assert_eq!(splitter().split("   \n\t ").count(), 0);
    }

    #[test]
    fn unbroken_run_falls_back_to_hard_cut() {
        let text = "x".repeat(1200);
        let chunks: Vec<_> = splitter().split(&text).collect();
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].content.chars().count(), 500);
    }

    #[test]
    fn token_count_approximates_quarter_chars() {
        let chunks: Vec<_> = splitter().split("abcdefgh").collect();
        assert_eq!(chunks[0].token_count, 2);
    }
}
