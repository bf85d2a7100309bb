//! HNSW insertion.
//!
//! Greedy descent to the node's layer, a beam search per layer below it,
//! heuristic neighbor selection, then symmetric edge installation with
//! re-selection for any neighbor pushed over its layer cap.

use crate::distance::kernels;
use crate::error::{Error, Result};
use crate::hnsw::graph::HnswIndex;
use crate::hnsw::visited::VisitedSet;
use crate::types::VectorId;
use rayon::prelude::*;

impl HnswIndex {
    /// Insert a vector under the given id.
    ///
    /// Re-adding an existing id replaces the stored vector in place when
    /// `allow_replace` is set and fails with `AlreadyExists` otherwise.
    /// When the slot table is full, the lowest tombstoned slot is recycled;
    /// with none left the insert fails with `ResourceExhausted`.
    pub fn add(&mut self, id: VectorId, vector: &[f32]) -> Result<()> {
        let dim = self.config.dimension;
        if vector.len() != dim {
            return Err(Error::InvalidArgument(format!(
                "vector dimension {} does not match index dimension {dim}",
                vector.len()
            )));
        }

        if let Some(&slot) = self.id_to_slot.get(&id) {
            if !self.config.allow_replace {
                return Err(Error::AlreadyExists(format!("id {id} is already present")));
            }
            let start = slot as usize * dim;
            self.vectors[start..start + dim].copy_from_slice(vector);
            self.norms[slot as usize] = kernels::l2_norm(vector);
            return Ok(());
        }

        let level = self.random_level();
        let slot = self.alloc_slot(id, vector, level)?;

        let mut ep = match self.entry_point {
            Some(ep) => ep,
            None => {
                self.entry_point = Some(slot);
                self.max_level = level;
                return Ok(());
            }
        };

        let query_norm = self.norm_of(slot);
        let mut visited = VisitedSet::with_capacity(self.ids.len());

        // Descend greedily to one layer above the node's own. The node
        // itself is excluded everywhere: a recycled slot can still be
        // reachable through stale inbound edges.
        for layer in (level + 1..=self.max_level).rev() {
            let nearest =
                self.search_layer(vector, query_norm, &[ep], 1, layer, &mut visited, &|s| s != slot);
            if let Some(&(_, s)) = nearest.first() {
                ep = s;
            }
        }

        // Beam-search each layer the node participates in and pick its
        // neighbors from the candidate pool.
        let top = level.min(self.max_level);
        let mut chosen: Vec<Vec<u32>> = vec![Vec::new(); top + 1];
        let mut eps: Vec<u32> = vec![ep];
        for layer in (0..=top).rev() {
            let candidates = self.search_layer(
                vector,
                query_norm,
                &eps,
                self.config.ef_construction,
                layer,
                &mut visited,
                &|s| s != slot,
            );
            chosen[layer] = self.select_neighbors(&candidates, self.config.m);
            eps = candidates.iter().map(|&(_, s)| s).collect();
            if eps.is_empty() {
                eps.push(ep);
            }
        }

        // Install edges symmetrically; re-select for any neighbor whose
        // out-degree exceeds the layer cap.
        for (layer, selected) in chosen.iter().enumerate() {
            let cap = if layer == 0 {
                self.config.m * 2
            } else {
                self.config.m
            };
            self.neighbors[slot as usize][layer] = selected.clone();
            for &nb in selected {
                {
                    let lists = &mut self.neighbors[nb as usize];
                    while lists.len() <= layer {
                        lists.push(Vec::new());
                    }
                    lists[layer].push(slot);
                }
                if self.neighbors[nb as usize][layer].len() > cap {
                    let over: Vec<u32> = self.neighbors[nb as usize][layer].clone();
                    let pool: Vec<(f32, u32)> = over
                        .iter()
                        .map(|&c| (self.distance_between(nb, c), c))
                        .collect();
                    self.neighbors[nb as usize][layer] = self.select_neighbors(&pool, cap);
                }
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(slot);
        }
        Ok(())
    }

    /// Insert many vectors at once.
    ///
    /// Dimension validation runs data-parallel; graph mutation stays serial
    /// so the per-node neighbor invariants hold throughout.
    pub fn add_batch(&mut self, ids: &[VectorId], vectors: &[Vec<f32>]) -> Result<()> {
        if ids.len() != vectors.len() {
            return Err(Error::InvalidArgument(format!(
                "{} ids but {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        let dim = self.config.dimension;
        if let Some(bad) = vectors.par_iter().position_any(|v| v.len() != dim) {
            return Err(Error::InvalidArgument(format!(
                "vector {bad} has dimension {}, expected {dim}",
                vectors[bad].len()
            )));
        }
        for (&id, vector) in ids.iter().zip(vectors) {
            self.add(id, vector)?;
        }
        Ok(())
    }

    /// Compact tombstones by rebuilding the graph from live vectors with the
    /// same configuration.
    pub fn optimize(&mut self) -> Result<()> {
        let tombstones = self.ids.len() - self.live_count;
        if tombstones == 0 {
            return Ok(());
        }
        let mut rebuilt = HnswIndex::new(self.config.clone())?;
        for slot in 0..self.ids.len() {
            if self.deleted[slot] {
                continue;
            }
            rebuilt.add(self.ids[slot], self.vector_of(slot as u32))?;
        }
        tracing::debug!(compacted = tombstones, "rebuilt graph without tombstones");
        *self = rebuilt;
        Ok(())
    }

    fn alloc_slot(&mut self, id: VectorId, vector: &[f32], level: usize) -> Result<u32> {
        let dim = self.config.dimension;
        let slot = if self.ids.len() < self.config.max_elements {
            self.vectors.extend_from_slice(vector);
            self.norms.push(kernels::l2_norm(vector));
            self.ids.push(id);
            self.levels.push(level as u8);
            self.neighbors.push(vec![Vec::new(); level + 1]);
            self.deleted.push(false);
            (self.ids.len() - 1) as u32
        } else if let Some(free) = self.deleted.iter().position(|&d| d) {
            // Recycle the lowest tombstoned slot. Stale inbound edges keep
            // pointing here; traversal recomputes distances, so the graph
            // stays navigable.
            let start = free * dim;
            self.vectors[start..start + dim].copy_from_slice(vector);
            self.norms[free] = kernels::l2_norm(vector);
            self.ids[free] = id;
            self.levels[free] = level as u8;
            self.neighbors[free] = vec![Vec::new(); level + 1];
            self.deleted[free] = false;
            free as u32
        } else {
            return Err(Error::ResourceExhausted(format!(
                "index is full ({} elements)",
                self.config.max_elements
            )));
        };
        self.id_to_slot.insert(id, slot);
        self.live_count += 1;
        Ok(slot)
    }

    /// Heuristic neighbor selection.
    ///
    /// Walk the pool nearest-first and keep a candidate only if it is
    /// closer to the base than to every neighbor kept so far; this
    /// diversifies long-range edges and preserves navigability. Leftover
    /// budget is filled with the closest unused candidates.
    fn select_neighbors(&self, candidates: &[(f32, u32)], m: usize) -> Vec<u32> {
        let mut sorted = candidates.to_vec();
        sorted.sort_unstable_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.ids[a.1 as usize].cmp(&self.ids[b.1 as usize]))
        });

        let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
        for &(dist, c) in &sorted {
            if selected.len() >= m {
                break;
            }
            let diverse = selected
                .iter()
                .all(|&(_, s)| dist <= self.distance_between(c, s));
            if diverse {
                selected.push((dist, c));
            }
        }
        if selected.len() < m {
            for &(dist, c) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|&(_, s)| s == c) {
                    selected.push((dist, c));
                }
            }
        }
        selected.into_iter().map(|(_, s)| s).collect()
    }
}
