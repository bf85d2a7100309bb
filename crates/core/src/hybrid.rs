//! Fusion of vector and lexical rankings.
//!
//! Both inputs are ranked `(id, score)` lists produced for the same query —
//! the vector list from an ANN index, the lexical list from the BM25
//! engine. The strategy is chosen per call; every strategy breaks fused
//! ties by ascending id.

use crate::config;
use crate::types::VectorId;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// How to combine the two rankings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionStrategy {
    /// Reciprocal rank fusion: `score = Σ 1 / (k + rank)`, rank 1-based.
    /// Rank-only, parameter `k` defaults to 60.
    ReciprocalRank { k: f32 },
    /// Min-max normalize each list, then
    /// `score = w · vector + (1 - w) · lexical`.
    WeightedSum { vector_weight: f32 },
    /// Sum of min-max normalized scores.
    CombSum,
    /// CombSum multiplied by the number of lists the id appears in.
    CombMnz,
    /// Positional voting: an id ranked r (1-based) in a list of n
    /// contributes `n - r` points.
    Borda,
}

impl Default for FusionStrategy {
    fn default() -> Self {
        FusionStrategy::ReciprocalRank { k: config::RRF_K }
    }
}

/// Fuse two ranked lists into the top `k` ids by descending fused score.
pub fn fuse(
    vector_results: &[(VectorId, f32)],
    lexical_results: &[(VectorId, f32)],
    strategy: FusionStrategy,
    k: usize,
) -> Vec<(VectorId, f32)> {
    let scores = match strategy {
        FusionStrategy::ReciprocalRank { k: rrf_k } => {
            reciprocal_rank(vector_results, lexical_results, rrf_k)
        }
        FusionStrategy::WeightedSum { vector_weight } => {
            weighted_sum(vector_results, lexical_results, vector_weight)
        }
        FusionStrategy::CombSum => comb(vector_results, lexical_results, false),
        FusionStrategy::CombMnz => comb(vector_results, lexical_results, true),
        FusionStrategy::Borda => borda(vector_results, lexical_results),
    };
    top_k(scores, k)
}

fn reciprocal_rank(
    vector_results: &[(VectorId, f32)],
    lexical_results: &[(VectorId, f32)],
    rrf_k: f32,
) -> HashMap<VectorId, f32> {
    let mut scores = HashMap::with_capacity(vector_results.len() + lexical_results.len());
    for list in [vector_results, lexical_results] {
        for (rank, &(id, _)) in list.iter().enumerate() {
            *scores.entry(id).or_insert(0.0) += 1.0 / (rrf_k + rank as f32 + 1.0);
        }
    }
    scores
}

fn weighted_sum(
    vector_results: &[(VectorId, f32)],
    lexical_results: &[(VectorId, f32)],
    vector_weight: f32,
) -> HashMap<VectorId, f32> {
    let w = vector_weight.clamp(0.0, 1.0);
    let mut scores = HashMap::with_capacity(vector_results.len() + lexical_results.len());
    accumulate_normalized(&mut scores, vector_results, w);
    accumulate_normalized(&mut scores, lexical_results, 1.0 - w);
    scores
}

fn comb(
    vector_results: &[(VectorId, f32)],
    lexical_results: &[(VectorId, f32)],
    multiply_by_hits: bool,
) -> HashMap<VectorId, f32> {
    let mut scores = HashMap::with_capacity(vector_results.len() + lexical_results.len());
    accumulate_normalized(&mut scores, vector_results, 1.0);
    accumulate_normalized(&mut scores, lexical_results, 1.0);
    if multiply_by_hits {
        let mut hits: HashMap<VectorId, f32> = HashMap::with_capacity(scores.len());
        for list in [vector_results, lexical_results] {
            for &(id, _) in list {
                *hits.entry(id).or_insert(0.0) += 1.0;
            }
        }
        for (id, score) in scores.iter_mut() {
            *score *= hits.get(id).copied().unwrap_or(1.0);
        }
    }
    scores
}

fn borda(
    vector_results: &[(VectorId, f32)],
    lexical_results: &[(VectorId, f32)],
) -> HashMap<VectorId, f32> {
    let mut scores = HashMap::with_capacity(vector_results.len() + lexical_results.len());
    for list in [vector_results, lexical_results] {
        let n = list.len();
        for (rank, &(id, _)) in list.iter().enumerate() {
            *scores.entry(id).or_insert(0.0) += (n - rank - 1) as f32;
        }
    }
    scores
}

/// Min-max normalize a list to [0, 1] and add it in with the given weight.
/// A constant list normalizes to all ones.
fn accumulate_normalized(scores: &mut HashMap<VectorId, f32>, list: &[(VectorId, f32)], weight: f32) {
    let Some((min, max)) = min_max(list) else {
        return;
    };
    let range = max - min;
    for &(id, score) in list {
        let norm = if range < f32::EPSILON {
            1.0
        } else {
            (score - min) / range
        };
        *scores.entry(id).or_insert(0.0) += weight * norm;
    }
}

fn min_max(list: &[(VectorId, f32)]) -> Option<(f32, f32)> {
    if list.is_empty() {
        return None;
    }
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for &(_, s) in list {
        min = min.min(s);
        max = max.max(s);
    }
    Some((min, max))
}

/// Bounded top-k, descending by score, ties ascending by id.
fn top_k(scores: HashMap<VectorId, f32>, k: usize) -> Vec<(VectorId, f32)> {
    let mut heap: BinaryHeap<Reverse<(OrderedFloat<f32>, Reverse<VectorId>)>> =
        BinaryHeap::with_capacity(k + 1);
    for (id, score) in scores {
        heap.push(Reverse((OrderedFloat(score), Reverse(id))));
        if heap.len() > k {
            heap.pop();
        }
    }
    let mut results: Vec<(VectorId, f32)> = heap
        .into_iter()
        .map(|Reverse((score, Reverse(id)))| (id, score.0))
        .collect();
    results.sort_unstable_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    results
}
