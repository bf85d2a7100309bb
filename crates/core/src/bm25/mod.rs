//! BM25 full-text search.
//!
//! A tokenizer pipeline (split, lowercase, minimum length, stop words,
//! light suffix stemming) feeds an inverted index scored with Okapi BM25.

/// Inverted index and Okapi BM25 scoring.
pub mod engine;
/// Tokenizer pipeline.
pub mod tokenizer;

pub use engine::{Bm25Config, Bm25Engine};
pub use tokenizer::tokenize;
