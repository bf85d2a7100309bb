//! Exact brute-force index.
//!
//! Stores vectors in insertion order and answers queries by scanning every
//! element through a bounded max-heap of size k. Slow past a few tens of
//! thousands of vectors, but exact — small collections use it directly and
//! the test suite uses it as the recall oracle for the HNSW graph.

use crate::config::{MAX_DIMENSION, MAX_K};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::types::{QueryResult, VectorId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ordered_float::OrderedFloat;
use std::collections::{BinaryHeap, HashMap};
use std::fs;
use std::io::Cursor;
use std::path::Path;

const MAGIC: &[u8; 4] = b"FLT1";
const VERSION: u32 = 1;

fn short<T>(read: std::io::Result<T>) -> Result<T> {
    read.map_err(|_| Error::InvalidFormat("truncated snapshot".into()))
}

/// Insertion-ordered exact index.
#[derive(Debug)]
pub struct FlatIndex {
    dimension: usize,
    metric: DistanceMetric,
    ids: Vec<VectorId>,
    /// Slot-major arena, `dimension` floats per entry.
    vectors: Vec<f32>,
    id_to_slot: HashMap<VectorId, usize>,
}

impl FlatIndex {
    /// Create an empty index for the given dimension and metric.
    pub fn new(dimension: usize, metric: DistanceMetric) -> Result<Self> {
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(Error::InvalidArgument(format!(
                "dimension must be in 1..={MAX_DIMENSION}, got {dimension}"
            )));
        }
        Ok(Self {
            dimension,
            metric,
            ids: Vec::new(),
            vectors: Vec::new(),
            id_to_slot: HashMap::new(),
        })
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// `true` if the id is present.
    pub fn contains(&self, id: VectorId) -> bool {
        self.id_to_slot.contains_key(&id)
    }

    /// Copy of the stored vector, if present.
    pub fn get_vector(&self, id: VectorId) -> Option<Vec<f32>> {
        let &slot = self.id_to_slot.get(&id)?;
        let start = slot * self.dimension;
        Some(self.vectors[start..start + self.dimension].to_vec())
    }

    /// Store a vector. Duplicate ids are `AlreadyExists`; dimension
    /// mismatches are `InvalidArgument`.
    pub fn add(&mut self, id: VectorId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::InvalidArgument(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        if self.id_to_slot.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("id {id} is already present")));
        }
        self.id_to_slot.insert(id, self.ids.len());
        self.ids.push(id);
        self.vectors.extend_from_slice(vector);
        Ok(())
    }

    /// Drop a vector, preserving insertion order of the rest. Returns
    /// `false` if the id was not present.
    pub fn remove(&mut self, id: VectorId) -> bool {
        let Some(slot) = self.id_to_slot.remove(&id) else {
            return false;
        };
        self.ids.remove(slot);
        let start = slot * self.dimension;
        self.vectors.drain(start..start + self.dimension);
        for (i, &kept) in self.ids.iter().enumerate().skip(slot) {
            self.id_to_slot.insert(kept, i);
        }
        true
    }

    /// Exact k nearest neighbors, ascending by `(distance, id)`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<QueryResult>> {
        if query.len() != self.dimension {
            return Err(Error::InvalidArgument(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 || k > MAX_K {
            return Err(Error::InvalidArgument(format!(
                "k must be in 1..={MAX_K}, got {k}"
            )));
        }

        // Bounded max-heap: worst of the best k on top.
        let mut heap: BinaryHeap<(OrderedFloat<f32>, VectorId)> =
            BinaryHeap::with_capacity(k + 1);
        for (slot, &id) in self.ids.iter().enumerate() {
            let start = slot * self.dimension;
            let dist = self
                .metric
                .distance(query, &self.vectors[start..start + self.dimension]);
            heap.push((OrderedFloat(dist), id));
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut out = heap.into_vec();
        out.sort_unstable();
        Ok(out
            .into_iter()
            .map(|(dist, id)| QueryResult {
                id,
                distance: dist.0,
                score: self.metric.score(dist.0),
            })
            .collect())
    }

    /// Serialize the index, checksum included. Same envelope as the HNSW
    /// snapshot but with no graph structure.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::with_capacity(32 + self.vectors.len() * 4);
        out.extend_from_slice(MAGIC);
        out.write_u32::<LittleEndian>(VERSION)?;
        out.write_u32::<LittleEndian>(self.dimension as u32)?;
        out.push(self.metric.tag());
        out.write_u64::<LittleEndian>(self.ids.len() as u64)?;
        for (slot, &id) in self.ids.iter().enumerate() {
            out.write_u64::<LittleEndian>(id)?;
            let start = slot * self.dimension;
            for &x in &self.vectors[start..start + self.dimension] {
                out.write_f32::<LittleEndian>(x)?;
            }
        }
        let crc = crc32fast::hash(&out);
        out.write_u32::<LittleEndian>(crc)?;
        Ok(out)
    }

    /// Reconstruct from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() + 8 {
            return Err(Error::InvalidFormat("snapshot too short".into()));
        }
        let (payload, footer) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        if stored_crc != crc32fast::hash(payload) {
            return Err(Error::InvalidFormat("checksum mismatch".into()));
        }

        let mut c = Cursor::new(payload);
        let mut magic = [0u8; 4];
        std::io::Read::read_exact(&mut c, &mut magic)
            .map_err(|_| Error::InvalidFormat("truncated snapshot".into()))?;
        if &magic != MAGIC {
            return Err(Error::InvalidFormat("bad magic number".into()));
        }
        let version = short(c.read_u32::<LittleEndian>())?;
        if version != VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let dimension = short(c.read_u32::<LittleEndian>())? as usize;
        let metric_tag = short(c.read_u8())?;
        let metric = DistanceMetric::from_tag(metric_tag)
            .ok_or_else(|| Error::InvalidFormat(format!("unknown metric tag {metric_tag}")))?;
        let count = short(c.read_u64::<LittleEndian>())? as usize;

        let mut index = FlatIndex::new(dimension, metric)
            .map_err(|_| Error::InvalidFormat(format!("snapshot dimension {dimension} invalid")))?;
        for _ in 0..count {
            let id = short(c.read_u64::<LittleEndian>())?;
            let mut v = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                v.push(short(c.read_f32::<LittleEndian>())?);
            }
            index
                .add(id, &v)
                .map_err(|_| Error::InvalidFormat(format!("duplicate id {id} in snapshot")))?;
        }
        if c.position() as usize != payload.len() {
            return Err(Error::InvalidFormat("trailing bytes in snapshot".into()));
        }
        Ok(index)
    }

    /// Write a snapshot atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), elements = self.ids.len(), "saved flat snapshot");
        Ok(())
    }

    /// Load a snapshot written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }
}
