//! One partition of the key space.
//!
//! A shard owns an HNSW index, a BM25 engine, and the metadata/text tables
//! for the ids routed to it, all behind a single readers–writer lock:
//! searches take the read side, every mutation takes the write side.
//! Cloning a `Shard` clones the handle, not the data.

use parking_lot::RwLock;
use quiver_core::bm25::{Bm25Config, Bm25Engine};
use quiver_core::error::{Error, Result};
use quiver_core::hnsw::{HnswConfig, HnswIndex};
use quiver_core::metadata::Metadata;
use quiver_core::types::{QueryResult, VectorId};
use std::collections::HashMap;
use std::sync::Arc;

struct ShardData {
    index: HnswIndex,
    bm25: Bm25Engine,
    metadata: HashMap<VectorId, Metadata>,
    texts: HashMap<VectorId, String>,
}

/// Thread-safe shard handle.
#[derive(Clone)]
pub struct Shard {
    id: String,
    data: Arc<RwLock<ShardData>>,
}

impl Shard {
    /// Create an empty shard.
    pub fn new(
        id: impl Into<String>,
        hnsw_config: HnswConfig,
        bm25_config: Bm25Config,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            data: Arc::new(RwLock::new(ShardData {
                index: HnswIndex::new(hnsw_config)?,
                bm25: Bm25Engine::new(bm25_config),
                metadata: HashMap::new(),
                texts: HashMap::new(),
            })),
        })
    }

    /// Rebuild a shard around an index restored from a snapshot. Metadata
    /// and text are attached afterwards via [`attach`](Self::attach).
    pub(crate) fn from_index(
        id: impl Into<String>,
        index: HnswIndex,
        bm25_config: Bm25Config,
    ) -> Self {
        Self {
            id: id.into(),
            data: Arc::new(RwLock::new(ShardData {
                index,
                bm25: Bm25Engine::new(bm25_config),
                metadata: HashMap::new(),
                texts: HashMap::new(),
            })),
        }
    }

    /// Shard identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Live vector count.
    pub fn len(&self) -> usize {
        self.data.read().index.len()
    }

    /// `true` when the shard holds no live vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if the id lives on this shard.
    pub fn contains(&self, id: VectorId) -> bool {
        self.data.read().index.contains(id)
    }

    /// Insert a vector, optionally with text content for lexical search.
    ///
    /// Rejected text (content with no indexable terms) rolls the vector
    /// insert back, so a failed write leaves the shard untouched.
    pub fn insert(
        &self,
        id: VectorId,
        vector: &[f32],
        text: Option<&str>,
        metadata: Metadata,
    ) -> Result<()> {
        let mut data = self.data.write();
        data.index.add(id, vector)?;
        if let Some(text) = text {
            if let Err(err) = data.bm25.add(id, text) {
                data.index.remove(id);
                return Err(err);
            }
            data.texts.insert(id, text.to_string());
        }
        data.metadata.insert(id, metadata);
        Ok(())
    }

    /// Tombstone a vector and erase its lexical and metadata state.
    /// Returns `false` if the id was not present.
    pub fn remove(&self, id: VectorId) -> bool {
        let mut data = self.data.write();
        let removed = data.index.remove(id);
        if removed {
            data.bm25.remove(id);
            data.metadata.remove(&id);
            data.texts.remove(&id);
        }
        removed
    }

    /// Copy of the stored vector, if present.
    pub fn get_vector(&self, id: VectorId) -> Option<Vec<f32>> {
        self.data.read().index.get_vector(id)
    }

    /// Copy of the stored metadata, if present.
    pub fn get_metadata(&self, id: VectorId) -> Option<Metadata> {
        self.data.read().metadata.get(&id).cloned()
    }

    /// Replace the metadata of an existing id.
    pub fn update_metadata(&self, id: VectorId, metadata: Metadata) -> Result<()> {
        let mut data = self.data.write();
        if !data.index.contains(id) {
            return Err(Error::NotFound(format!("id {id} is not on shard {}", self.id)));
        }
        data.metadata.insert(id, metadata);
        Ok(())
    }

    /// Local ANN top-k.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<QueryResult>> {
        self.data.read().index.search(query, k)
    }

    /// Local BM25 top-k.
    pub fn keyword_search(&self, query: &str, k: usize, min_score: f32) -> Vec<(VectorId, f32)> {
        self.data.read().bm25.search(query, k, min_score)
    }

    /// Tune the underlying index's search beam.
    pub fn set_ef_search(&self, ef: usize) {
        self.data.write().index.set_ef_search(ef);
    }

    /// Serialized index snapshot for persistence.
    pub(crate) fn index_bytes(&self) -> Result<Vec<u8>> {
        self.data.read().index.to_bytes()
    }

    /// All live entries, ascending by id, for the metadata journal.
    pub(crate) fn export_entries(&self) -> Vec<(VectorId, Metadata, Option<String>)> {
        let data = self.data.read();
        let mut ids: Vec<VectorId> = data.metadata.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| {
                (
                    id,
                    data.metadata.get(&id).cloned().unwrap_or_default(),
                    data.texts.get(&id).cloned(),
                )
            })
            .collect()
    }

    /// Re-attach journal state to a restored shard.
    pub(crate) fn attach(&self, id: VectorId, metadata: Metadata, text: Option<String>) -> Result<()> {
        let mut data = self.data.write();
        if let Some(text) = text {
            data.bm25.add(id, &text)?;
            data.texts.insert(id, text);
        }
        data.metadata.insert(id, metadata);
        Ok(())
    }
}
