//! Domain types for documents, chunks, extractions, and the knowledge graph.

pub mod chunk;
pub mod document;
pub mod extraction;
pub mod knowledge;
pub mod resolution;
