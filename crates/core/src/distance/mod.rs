//! Distance metrics for vector similarity.
//!
//! [`DistanceMetric`] maps vector pairs to distances (lower is better) and
//! distances to merge scores (higher is better). The arithmetic lives in
//! [`kernels`], which dispatches to the best SIMD width available.

pub mod kernels;

pub use kernels::{
    cosine_distance, cosine_similarity, dot, l2, l2_norm, normalize, normalized, squared_l2,
};

use crate::config::MIN_NORM;
use serde::{Deserialize, Serialize};

/// Distance function used by an index.
///
/// All metrics produce a distance where **lower is better**:
/// cosine distance in `[0, 2]`, Euclidean distance in `[0, ∞)`, and the
/// negated dot product for maximum-inner-product search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Cosine distance: `1 - cosine_similarity`.
    Cosine,
    /// Euclidean (L2) distance.
    L2,
    /// Negated dot product.
    DotProduct,
}

impl DistanceMetric {
    /// Distance between two equal-length vectors.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => kernels::cosine_distance(a, b),
            DistanceMetric::L2 => kernels::l2(a, b),
            DistanceMetric::DotProduct => -kernels::dot(a, b),
        }
    }

    /// Distance with both L2 norms already known. For cosine this saves the
    /// two norm computations on the hot path; other metrics ignore the norms.
    pub fn distance_prenorm(&self, a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                if a_norm < MIN_NORM || b_norm < MIN_NORM {
                    return 1.0;
                }
                1.0 - kernels::dot(a, b) / (a_norm * b_norm)
            }
            _ => self.distance(a, b),
        }
    }

    /// Monotone-decreasing-in-distance score used when merging results
    /// across indices and shards.
    pub fn score(&self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::L2 | DistanceMetric::DotProduct => 1.0 / (1.0 + distance),
        }
    }

    /// Single-byte tag for the snapshot format.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            DistanceMetric::Cosine => 0,
            DistanceMetric::L2 => 1,
            DistanceMetric::DotProduct => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DistanceMetric::Cosine),
            1 => Some(DistanceMetric::L2),
            2 => Some(DistanceMetric::DotProduct),
            _ => None,
        }
    }
}
