//! Endian-explicit snapshot persistence for the HNSW index.
//!
//! Layout: magic `HSW1` | version u32 | config | entry point | max level |
//! live count | node count | per-slot records (id, level, per-layer
//! neighbor lists, vector payload, tombstone flag) | CRC32 footer. All
//! integers are little-endian; neighbor entries are slot numbers, so the
//! file is a sequential dump of the arena. Loads verify the checksum and
//! every structural bound before the index is handed back.

use crate::config::{HNSW_MAX_LAYERS, MAX_DIMENSION};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::hnsw::graph::{HnswConfig, HnswIndex};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;

const MAGIC: &[u8; 4] = b"HSW1";
const VERSION: u32 = 1;

/// Sentinel for "no entry point" in the serialized form.
const NO_ENTRY: u64 = u64::MAX;

fn short<T>(read: std::io::Result<T>) -> Result<T> {
    read.map_err(|_| Error::InvalidFormat("truncated snapshot".into()))
}

impl HnswIndex {
    /// Serialize the full index state, checksum included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::with_capacity(64 + self.vectors.len() * 4);
        out.extend_from_slice(MAGIC);
        out.write_u32::<LittleEndian>(VERSION)?;

        out.write_u32::<LittleEndian>(self.config.dimension as u32)?;
        out.write_u64::<LittleEndian>(self.config.max_elements as u64)?;
        out.write_u32::<LittleEndian>(self.config.m as u32)?;
        out.write_u32::<LittleEndian>(self.config.ef_construction as u32)?;
        out.write_u32::<LittleEndian>(self.config.ef_search as u32)?;
        out.push(self.config.metric.tag());
        out.write_u64::<LittleEndian>(self.config.seed)?;
        out.push(self.config.allow_replace as u8);

        out.write_u64::<LittleEndian>(self.entry_point.map_or(NO_ENTRY, u64::from))?;
        out.write_u32::<LittleEndian>(self.max_level as u32)?;
        out.write_u64::<LittleEndian>(self.live_count as u64)?;
        out.write_u64::<LittleEndian>(self.ids.len() as u64)?;

        for slot in 0..self.ids.len() {
            out.write_u64::<LittleEndian>(self.ids[slot])?;
            out.write_u32::<LittleEndian>(self.levels[slot] as u32)?;
            for layer in &self.neighbors[slot] {
                out.write_u32::<LittleEndian>(layer.len() as u32)?;
                for &nb in layer {
                    out.write_u64::<LittleEndian>(nb as u64)?;
                }
            }
            for &x in self.vector_of(slot as u32) {
                out.write_f32::<LittleEndian>(x)?;
            }
            out.push(self.deleted[slot] as u8);
        }

        let crc = crc32fast::hash(&out);
        out.write_u32::<LittleEndian>(crc)?;
        Ok(out)
    }

    /// Reconstruct an index from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() + 8 {
            return Err(Error::InvalidFormat("snapshot too short".into()));
        }
        let (payload, footer) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let computed = crc32fast::hash(payload);
        if stored_crc != computed {
            return Err(Error::InvalidFormat(format!(
                "checksum mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"
            )));
        }

        let mut c = Cursor::new(payload);
        let mut magic = [0u8; 4];
        short(std::io::Read::read_exact(&mut c, &mut magic))?;
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
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(Error::InvalidFormat(format!(
                "snapshot dimension {dimension} out of range"
            )));
        }
        let max_elements = short(c.read_u64::<LittleEndian>())? as usize;
        let m = short(c.read_u32::<LittleEndian>())? as usize;
        let ef_construction = short(c.read_u32::<LittleEndian>())? as usize;
        let ef_search = short(c.read_u32::<LittleEndian>())? as usize;
        let metric_tag = short(c.read_u8())?;
        let metric = DistanceMetric::from_tag(metric_tag)
            .ok_or_else(|| Error::InvalidFormat(format!("unknown metric tag {metric_tag}")))?;
        let seed = short(c.read_u64::<LittleEndian>())?;
        let allow_replace = short(c.read_u8())? != 0;

        let entry_raw = short(c.read_u64::<LittleEndian>())?;
        let max_level = short(c.read_u32::<LittleEndian>())? as usize;
        let live_count = short(c.read_u64::<LittleEndian>())? as usize;
        let node_count = short(c.read_u64::<LittleEndian>())? as usize;
        if node_count > max_elements {
            return Err(Error::InvalidFormat(format!(
                "node count {node_count} exceeds capacity {max_elements}"
            )));
        }

        let mut ids = Vec::with_capacity(node_count);
        let mut levels = Vec::with_capacity(node_count);
        let mut neighbors = Vec::with_capacity(node_count);
        let mut vectors = Vec::with_capacity(node_count * dimension);
        let mut deleted = Vec::with_capacity(node_count);

        for _ in 0..node_count {
            let id = short(c.read_u64::<LittleEndian>())?;
            let level = short(c.read_u32::<LittleEndian>())? as usize;
            if level >= HNSW_MAX_LAYERS {
                return Err(Error::InvalidFormat(format!("node level {level} too high")));
            }
            let mut layers = Vec::with_capacity(level + 1);
            for _ in 0..=level {
                let count = short(c.read_u32::<LittleEndian>())? as usize;
                let mut list = Vec::with_capacity(count);
                for _ in 0..count {
                    let nb = short(c.read_u64::<LittleEndian>())?;
                    if nb >= node_count as u64 {
                        return Err(Error::InvalidFormat(format!(
                            "neighbor slot {nb} out of bounds"
                        )));
                    }
                    list.push(nb as u32);
                }
                layers.push(list);
            }
            for _ in 0..dimension {
                vectors.push(short(c.read_f32::<LittleEndian>())?);
            }
            let tombstone = short(c.read_u8())? != 0;
            ids.push(id);
            levels.push(level as u8);
            neighbors.push(layers);
            deleted.push(tombstone);
        }

        if c.position() as usize != payload.len() {
            return Err(Error::InvalidFormat("trailing bytes in snapshot".into()));
        }

        let mut id_to_slot = HashMap::with_capacity(node_count);
        let mut recount = 0usize;
        for slot in 0..node_count {
            if deleted[slot] {
                continue;
            }
            recount += 1;
            if id_to_slot.insert(ids[slot], slot as u32).is_some() {
                return Err(Error::InvalidFormat(format!(
                    "duplicate live id {}",
                    ids[slot]
                )));
            }
        }
        if recount != live_count {
            return Err(Error::InvalidFormat(format!(
                "element count mismatch: header says {live_count}, found {recount}"
            )));
        }

        let entry_point = if entry_raw == NO_ENTRY {
            None
        } else {
            let slot = entry_raw as usize;
            if slot >= node_count || deleted[slot] {
                return Err(Error::InvalidFormat("invalid entry point".into()));
            }
            Some(slot as u32)
        };

        let mut index = HnswIndex::new(HnswConfig {
            dimension,
            max_elements,
            m,
            ef_construction,
            ef_search,
            metric,
            seed,
            allow_replace,
        })?;
        index.vectors = vectors;
        index.ids = ids;
        index.levels = levels;
        index.neighbors = neighbors;
        index.deleted = deleted;
        index.id_to_slot = id_to_slot;
        index.entry_point = entry_point;
        index.max_level = max_level;
        index.live_count = live_count;
        index.rng = ChaCha8Rng::seed_from_u64(seed);
        index.recompute_norms();
        Ok(index)
    }

    /// Write a snapshot atomically (temp file, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        tracing::info!(
            path = %path.display(),
            bytes = bytes.len(),
            elements = self.live_count,
            "saved index snapshot"
        );
        Ok(())
    }

    /// Load a snapshot written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let index = Self::from_bytes(&bytes)?;
        tracing::info!(
            path = %path.display(),
            elements = index.live_count,
            "loaded index snapshot"
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_index(n: u64) -> HnswIndex {
        let mut idx = HnswIndex::new(HnswConfig::new(8)).unwrap();
        for i in 0..n {
            let v: Vec<f32> = (0..8).map(|j| ((i * 31 + j * 7) % 17) as f32 / 17.0).collect();
            idx.add(i, &v).unwrap();
        }
        idx
    }

    #[test]
    fn test_round_trip_preserves_queries() {
        let mut idx = build_index(50);
        idx.remove(3);
        idx.remove(17);
        let bytes = idx.to_bytes().unwrap();
        let loaded = HnswIndex::from_bytes(&bytes).unwrap();

        assert_eq!(loaded.len(), idx.len());
        assert_eq!(loaded.get_vector(5), idx.get_vector(5));
        assert_eq!(loaded.get_vector(3), None);

        let q: Vec<f32> = (0..8).map(|j| j as f32 / 8.0).collect();
        let a = idx.search(&q, 10).unwrap();
        let b = loaded.search(&q, 10).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_round_trip_is_byte_stable() {
        let idx = build_index(20);
        let bytes = idx.to_bytes().unwrap();
        let loaded = HnswIndex::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let idx = build_index(3);
        let mut bytes = idx.to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            HnswIndex::from_bytes(&bytes),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_corruption_detected_by_checksum() {
        let idx = build_index(10);
        let mut bytes = idx.to_bytes().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            HnswIndex::from_bytes(&bytes),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_truncation_detected() {
        let idx = build_index(10);
        let bytes = idx.to_bytes().unwrap();
        let cut = &bytes[..bytes.len() / 2];
        assert!(matches!(
            HnswIndex::from_bytes(cut),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_empty_index_round_trip() {
        let idx = HnswIndex::new(HnswConfig::new(8)).unwrap();
        let bytes = idx.to_bytes().unwrap();
        let loaded = HnswIndex::from_bytes(&bytes).unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.entry_point.is_none());
    }

    #[test]
    fn test_save_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.hsw");
        let idx = build_index(25);
        idx.save(&path).unwrap();
        let loaded = HnswIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 25);
        assert_eq!(loaded.to_bytes().unwrap(), idx.to_bytes().unwrap());
    }

    #[test]
    fn test_load_missing_file_is_io() {
        let err = HnswIndex::load("/nonexistent/quiver/index.hsw").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
