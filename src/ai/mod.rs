//! AI clients and response parsing.

pub mod ollama;
pub mod parse;

pub use ollama::OllamaClient;
pub use parse::parse_lenient_json;
