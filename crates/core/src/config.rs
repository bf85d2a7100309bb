//! Tuning defaults and input validation limits.
//!
//! Compile-time constants only; runtime knobs live in the per-component
//! config structs (`HnswConfig`, `Bm25Config`) which default to these.

/// BM25 Okapi term frequency saturation parameter.
///
/// Controls how quickly term frequency saturates. Standard value is 1.2.
pub const BM25_K1: f32 = 1.2;

/// BM25 Okapi document length normalization parameter.
///
/// 0.0 = no normalization, 1.0 = full normalization. Standard value is 0.75.
pub const BM25_B: f32 = 0.75;

/// Minimum token length kept by the tokenizer. Shorter tokens are dropped.
pub const BM25_MIN_TERM_LENGTH: usize = 2;

/// Default number of bidirectional links per HNSW node per layer.
/// Layer 0 allows twice this many.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default beam width during HNSW index construction.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default beam width during HNSW search. Runtime-tunable via
/// `set_ef_search`; higher values improve recall at the cost of latency.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 50;

/// Default capacity of a freshly created HNSW index.
pub const HNSW_DEFAULT_MAX_ELEMENTS: usize = 1_000_000;

/// Hard cap on the number of layers in the HNSW graph.
pub const HNSW_MAX_LAYERS: usize = 16;

/// Reciprocal Rank Fusion constant `k` in `1 / (k + rank)`.
/// Standard value is 60 (from the original RRF paper).
pub const RRF_K: f32 = 60.0;

/// Maximum allowed vector dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum number of results (`k`) per search request.
pub const MAX_K: usize = 10_000;

/// Magnitudes below this are treated as zero by the cosine kernels.
pub const MIN_NORM: f32 = 1e-12;
