//! Shared identifier and result types.

use serde::{Deserialize, Serialize};

/// Identifier for a stored vector. Unique within a database. The indices
/// treat ids as opaque; assignment policy belongs to the caller.
pub type VectorId = u64;

/// A single search hit.
///
/// `distance` is the raw value under the index metric (lower is better).
/// `score` is the monotone mapping used for cross-index merging: for cosine
/// `1 - distance`, for L2 and negated dot product `1 / (1 + distance)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: VectorId,
    pub distance: f32,
    pub score: f32,
}
