//! HNSW graph structure and configuration.
//!
//! [`HnswIndex`] keeps all per-node state in parallel arrays indexed by slot
//! number: vector payloads in one contiguous arena, cached L2 norms, layer
//! assignments, neighbor lists, and tombstone flags. Ids map to slots
//! through a hash map; everything else is plain array indexing.

use crate::config;
use crate::distance::{kernels, DistanceMetric};
use crate::error::{Error, Result};
use crate::types::VectorId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration parameters for an HNSW index.
///
/// Immutable after construction except `ef_search`, which is tunable at
/// runtime through [`HnswIndex::set_ef_search`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Vector dimension. Fixed for the life of the index.
    pub dimension: usize,
    /// Maximum number of slots. Inserting past this reuses tombstoned slots
    /// and fails with `ResourceExhausted` once none remain.
    pub max_elements: usize,
    /// Maximum connections per node per layer. Layer 0 allows `2 * m`.
    pub m: usize,
    /// Beam width during insertion.
    pub ef_construction: usize,
    /// Beam width during search.
    pub ef_search: usize,
    /// Distance function.
    pub metric: DistanceMetric,
    /// PRNG seed for layer draws. Two indices built with the same seed and
    /// insertion order produce byte-identical snapshots.
    pub seed: u64,
    /// Replace the stored vector in place when an existing id is re-added.
    pub allow_replace: bool,
}

impl HnswConfig {
    /// Defaults (M = 16, ef_construction = 200, cosine) at the given
    /// dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: 0,
            max_elements: config::HNSW_DEFAULT_MAX_ELEMENTS,
            m: config::HNSW_DEFAULT_M,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
            metric: DistanceMetric::Cosine,
            seed: 42,
            allow_replace: false,
        }
    }
}

/// Point-in-time counters for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// Live (non-tombstoned) elements.
    pub element_count: usize,
    /// Tombstoned slots awaiting reuse or compaction.
    pub tombstone_count: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Highest layer currently in use.
    pub max_level: usize,
}

/// HNSW approximate nearest neighbor index.
#[derive(Debug)]
pub struct HnswIndex {
    pub(crate) config: HnswConfig,
    /// Slot-major vector arena, `dimension` floats per slot.
    pub(crate) vectors: Vec<f32>,
    /// Cached L2 norm per slot. Only read on the cosine path.
    pub(crate) norms: Vec<f32>,
    pub(crate) ids: Vec<VectorId>,
    pub(crate) levels: Vec<u8>,
    /// `[slot][layer][neighbor slot]`.
    pub(crate) neighbors: Vec<Vec<Vec<u32>>>,
    pub(crate) deleted: Vec<bool>,
    /// Live ids only; tombstoned slots are not mapped.
    pub(crate) id_to_slot: HashMap<VectorId, u32>,
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_level: usize,
    pub(crate) live_count: usize,
    pub(crate) rng: ChaCha8Rng,
    level_mult: f64,
}

impl HnswIndex {
    /// Create an empty index. Fails with `InvalidArgument` on a zero or
    /// oversized dimension, `m < 2`, or a zero capacity.
    pub fn new(config: HnswConfig) -> Result<Self> {
        if config.dimension == 0 || config.dimension > crate::config::MAX_DIMENSION {
            return Err(Error::InvalidArgument(format!(
                "dimension must be in 1..={}, got {}",
                crate::config::MAX_DIMENSION,
                config.dimension
            )));
        }
        if config.m < 2 {
            return Err(Error::InvalidArgument(format!(
                "m must be at least 2, got {}",
                config.m
            )));
        }
        if config.max_elements == 0 {
            return Err(Error::InvalidArgument(
                "max_elements must be positive".into(),
            ));
        }
        if config.ef_construction == 0 || config.ef_search == 0 {
            return Err(Error::InvalidArgument(
                "ef_construction and ef_search must be positive".into(),
            ));
        }
        let level_mult = 1.0 / (config.m as f64).ln();
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            vectors: Vec::new(),
            norms: Vec::new(),
            ids: Vec::new(),
            levels: Vec::new(),
            neighbors: Vec::new(),
            deleted: Vec::new(),
            id_to_slot: HashMap::new(),
            entry_point: None,
            max_level: 0,
            live_count: 0,
            rng,
            level_mult,
        })
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.live_count
    }

    /// `true` when no live element exists.
    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.config.max_elements
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Current configuration.
    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// `true` if the id is present and not tombstoned.
    pub fn contains(&self, id: VectorId) -> bool {
        self.id_to_slot.contains_key(&id)
    }

    /// Copy of the stored vector, or `None` for missing or removed ids.
    pub fn get_vector(&self, id: VectorId) -> Option<Vec<f32>> {
        let slot = *self.id_to_slot.get(&id)?;
        Some(self.vector_of(slot).to_vec())
    }

    /// Tune the search beam width. Takes effect on the next query.
    pub fn set_ef_search(&mut self, ef: usize) {
        self.config.ef_search = ef.max(1);
    }

    /// Grow the capacity. Shrinking below the current slot count is
    /// `InvalidArgument`.
    pub fn resize(&mut self, new_max_elements: usize) -> Result<()> {
        if new_max_elements < self.ids.len() {
            return Err(Error::InvalidArgument(format!(
                "cannot shrink below {} occupied slots",
                self.ids.len()
            )));
        }
        self.config.max_elements = new_max_elements;
        Ok(())
    }

    /// Tombstone an id. The slot is retained so existing neighbor links
    /// stay valid; the node is skipped in result emission. Returns `false`
    /// if the id was not present.
    pub fn remove(&mut self, id: VectorId) -> bool {
        let Some(slot) = self.id_to_slot.remove(&id) else {
            return false;
        };
        self.deleted[slot as usize] = true;
        self.live_count -= 1;
        if self.entry_point == Some(slot) {
            self.repair_entry_point();
        }
        true
    }

    /// Counters snapshot.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            element_count: self.live_count,
            tombstone_count: self.ids.len() - self.live_count,
            capacity: self.config.max_elements,
            max_level: self.max_level,
        }
    }

    /// Draw a layer for a new node: `floor(-ln(u) / ln(M))`, capped.
    pub(crate) fn random_level(&mut self) -> usize {
        let u: f64 = self.rng.gen();
        let level = (-u.ln() * self.level_mult).floor() as usize;
        level.min(config::HNSW_MAX_LAYERS - 1)
    }

    #[inline]
    pub(crate) fn vector_of(&self, slot: u32) -> &[f32] {
        let dim = self.config.dimension;
        let start = slot as usize * dim;
        &self.vectors[start..start + dim]
    }

    #[inline]
    pub(crate) fn norm_of(&self, slot: u32) -> f32 {
        self.norms[slot as usize]
    }

    /// Distance from an external query (with precomputed norm) to a slot.
    #[inline]
    pub(crate) fn distance_to(&self, query: &[f32], query_norm: f32, slot: u32) -> f32 {
        self.config
            .metric
            .distance_prenorm(query, query_norm, self.vector_of(slot), self.norm_of(slot))
    }

    /// Distance between two stored slots.
    #[inline]
    pub(crate) fn distance_between(&self, a: u32, b: u32) -> f32 {
        self.config.metric.distance_prenorm(
            self.vector_of(a),
            self.norm_of(a),
            self.vector_of(b),
            self.norm_of(b),
        )
    }

    /// Re-point the entry point at the highest-level live node after the
    /// current entry was tombstoned.
    fn repair_entry_point(&mut self) {
        let mut best: Option<(u8, u32)> = None;
        for slot in 0..self.ids.len() {
            if self.deleted[slot] {
                continue;
            }
            let level = self.levels[slot];
            match best {
                None => best = Some((level, slot as u32)),
                Some((b, _)) if level > b => best = Some((level, slot as u32)),
                _ => {}
            }
        }
        match best {
            Some((level, slot)) => {
                self.entry_point = Some(slot);
                self.max_level = level as usize;
            }
            None => {
                self.entry_point = None;
                self.max_level = 0;
            }
        }
    }

    /// Rebuild norms after deserialization.
    pub(crate) fn recompute_norms(&mut self) {
        let dim = self.config.dimension;
        self.norms = self
            .vectors
            .chunks_exact(dim)
            .map(kernels::l2_norm)
            .collect();
    }
}
