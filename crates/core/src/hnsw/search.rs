//! HNSW search: greedy descent through the upper layers, beam search at
//! layer 0.
//!
//! An optional predicate can exclude ids from the result set; filtered and
//! tombstoned nodes still participate in navigation so the graph stays
//! connected. Equal distances break toward the lower id everywhere, which
//! makes searches deterministic for a fixed graph.

use crate::config::MAX_K;
use crate::distance::kernels;
use crate::error::{Error, Result};
use crate::hnsw::graph::HnswIndex;
use crate::hnsw::visited::VisitedSet;
use crate::types::{QueryResult, VectorId};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One traversal candidate. Ordering is `(distance, id)` so that ties
/// resolve toward the lower id in every heap below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub dist: OrderedFloat<f32>,
    pub id: VectorId,
    pub slot: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist.cmp(&other.dist).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl HnswIndex {
    /// k nearest neighbors of `query` in ascending distance order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<QueryResult>> {
        self.search_filtered(query, k, |_| true)
    }

    /// k nearest neighbors whose id passes `filter`.
    pub fn search_filtered<F: Fn(VectorId) -> bool>(
        &self,
        query: &[f32],
        k: usize,
        filter: F,
    ) -> Result<Vec<QueryResult>> {
        if query.len() != self.config.dimension {
            return Err(Error::InvalidArgument(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.config.dimension
            )));
        }
        if k == 0 || k > MAX_K {
            return Err(Error::InvalidArgument(format!(
                "k must be in 1..={MAX_K}, got {k}"
            )));
        }
        let Some(mut ep) = self.entry_point else {
            return Ok(Vec::new());
        };

        let query_norm = kernels::l2_norm(query);
        let mut visited = VisitedSet::with_capacity(self.ids.len());

        // Greedy descent with a beam of 1; filtering only matters at layer 0.
        for layer in (1..=self.max_level).rev() {
            let nearest = self.search_layer(query, query_norm, &[ep], 1, layer, &mut visited, &|_| {
                true
            });
            if let Some(&(_, slot)) = nearest.first() {
                ep = slot;
            }
        }

        let ef = self.config.ef_search.max(k);
        let admit = |slot: u32| filter(self.ids[slot as usize]);
        let beam = self.search_layer(query, query_norm, &[ep], ef, 0, &mut visited, &admit);

        Ok(beam
            .into_iter()
            .take(k)
            .map(|(dist, slot)| QueryResult {
                id: self.ids[slot as usize],
                distance: dist,
                score: self.config.metric.score(dist),
            })
            .collect())
    }

    /// Beam search within one layer.
    ///
    /// Expands the closest unexpanded candidate until nothing in the
    /// frontier beats the worst of the best `ef` found; returns up to `ef`
    /// admitted slots ascending by `(distance, id)`. Tombstoned and
    /// non-admitted nodes are traversed but never emitted.
    pub(crate) fn search_layer<F: Fn(u32) -> bool>(
        &self,
        query: &[f32],
        query_norm: f32,
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        visited: &mut VisitedSet,
        admit: &F,
    ) -> Vec<(f32, u32)> {
        visited.clear();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(ef * 2);
        let mut best: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let c = self.candidate(query, query_norm, ep);
            frontier.push(Reverse(c));
            if !self.deleted[ep as usize] && admit(ep) {
                best.push(c);
                if best.len() > ef {
                    best.pop();
                }
            }
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if best.len() >= ef {
                if let Some(worst) = best.peek() {
                    if current > *worst {
                        break;
                    }
                }
            }

            let slot = current.slot as usize;
            if layer >= self.neighbors[slot].len() {
                continue;
            }
            for i in 0..self.neighbors[slot][layer].len() {
                let neighbor = self.neighbors[slot][layer][i];
                if !visited.insert(neighbor) {
                    continue;
                }
                let c = self.candidate(query, query_norm, neighbor);
                let within_beam = best.len() < ef || best.peek().is_none_or(|w| c < *w);
                if within_beam {
                    frontier.push(Reverse(c));
                    if !self.deleted[neighbor as usize] && admit(neighbor) {
                        best.push(c);
                        if best.len() > ef {
                            best.pop();
                        }
                    }
                }
            }
        }

        let mut out = best.into_vec();
        out.sort_unstable();
        out.into_iter().map(|c| (c.dist.0, c.slot)).collect()
    }

    #[inline]
    fn candidate(&self, query: &[f32], query_norm: f32, slot: u32) -> Candidate {
        Candidate {
            dist: OrderedFloat(self.distance_to(query, query_norm, slot)),
            id: self.ids[slot as usize],
            slot,
        }
    }
}
