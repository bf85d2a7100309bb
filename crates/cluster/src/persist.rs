//! Whole-database persistence at a root directory.
//!
//! Three files: `config.json` (dimension, metric, id counter, format
//! version), `vectors.bin` (every shard's index snapshot in one
//! container), and `metadata.jsonl` (one line per id with metadata and
//! optional text; the BM25 state is rebuilt from text on load). Each file
//! is written atomically via temp-file + rename.

use crate::database::{DatabaseConfig, DistributedDatabase};
use crate::shard::Shard;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use quiver_core::distance::DistanceMetric;
use quiver_core::error::{Error, Result};
use quiver_core::hnsw::HnswIndex;
use quiver_core::metadata::Metadata;
use quiver_core::types::VectorId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::Path;
use std::sync::atomic::Ordering;

const CONTAINER_MAGIC: &[u8; 4] = b"QVDB";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    dimension: usize,
    metric: DistanceMetric,
    next_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalLine {
    id: VectorId,
    metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn json_err(e: serde_json::Error) -> Error {
    Error::InvalidFormat(e.to_string())
}

fn short<T>(read: std::io::Result<T>) -> Result<T> {
    read.map_err(|_| Error::InvalidFormat("truncated vectors.bin".into()))
}

impl DistributedDatabase {
    /// Persist the open database under `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let guard = self.state.read();
        let st = guard
            .as_ref()
            .ok_or_else(|| Error::Unavailable("database is not open".into()))?;
        fs::create_dir_all(dir)?;

        let manifest = Manifest {
            version: FORMAT_VERSION,
            dimension: st.dimension,
            metric: st.metric,
            next_id: self.next_id.load(Ordering::SeqCst),
        };
        atomic_write(
            &dir.join("config.json"),
            &serde_json::to_vec_pretty(&manifest).map_err(json_err)?,
        )?;

        // Shards in id order so identical databases serialize identically.
        let mut shard_ids: Vec<&String> = st.shards.keys().collect();
        shard_ids.sort();

        let mut container: Vec<u8> = Vec::new();
        container.extend_from_slice(CONTAINER_MAGIC);
        container.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        container.write_u32::<LittleEndian>(shard_ids.len() as u32)?;
        for shard_id in &shard_ids {
            let shard = &st.shards[*shard_id];
            let blob = shard.index_bytes()?;
            container.write_u16::<LittleEndian>(shard_id.len() as u16)?;
            container.extend_from_slice(shard_id.as_bytes());
            container.write_u64::<LittleEndian>(blob.len() as u64)?;
            container.extend_from_slice(&blob);
        }
        atomic_write(&dir.join("vectors.bin"), &container)?;

        let mut entries: Vec<(VectorId, Metadata, Option<String>)> = Vec::new();
        for shard_id in &shard_ids {
            entries.extend(st.shards[*shard_id].export_entries());
        }
        entries.sort_by_key(|(id, _, _)| *id);
        let mut journal = Vec::new();
        for (id, metadata, text) in entries {
            let line = serde_json::to_string(&JournalLine { id, metadata, text }).map_err(json_err)?;
            journal.extend_from_slice(line.as_bytes());
            journal.push(b'\n');
        }
        atomic_write(&dir.join("metadata.jsonl"), &journal)?;

        tracing::info!(dir = %dir.display(), shards = shard_ids.len(), "saved database");
        Ok(())
    }

    /// Open a database persisted by [`save`](Self::save). The router
    /// configuration must describe the same shard set.
    pub fn load(config: DatabaseConfig, dir: impl AsRef<Path>) -> Result<DistributedDatabase> {
        let dir = dir.as_ref();

        let manifest: Manifest =
            serde_json::from_slice(&fs::read(dir.join("config.json"))?).map_err(json_err)?;
        if manifest.version != FORMAT_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported database version {}",
                manifest.version
            )));
        }

        let db = DistributedDatabase::new(config)?;

        let container = fs::read(dir.join("vectors.bin"))?;
        let mut c = Cursor::new(container.as_slice());
        let mut magic = [0u8; 4];
        short(c.read_exact(&mut magic))?;
        if &magic != CONTAINER_MAGIC {
            return Err(Error::InvalidFormat("bad vectors.bin magic".into()));
        }
        let version = short(c.read_u32::<LittleEndian>())?;
        if version != FORMAT_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported vectors.bin version {version}"
            )));
        }
        let shard_count = short(c.read_u32::<LittleEndian>())? as usize;
        let mut shards: HashMap<String, Shard> = HashMap::with_capacity(shard_count);
        for _ in 0..shard_count {
            let name_len = short(c.read_u16::<LittleEndian>())? as usize;
            let mut name = vec![0u8; name_len];
            short(c.read_exact(&mut name))?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::InvalidFormat("shard id is not UTF-8".into()))?;
            let blob_len = short(c.read_u64::<LittleEndian>())? as usize;
            let mut blob = vec![0u8; blob_len];
            short(c.read_exact(&mut blob))?;
            let index = HnswIndex::from_bytes(&blob)?;
            shards.insert(name.clone(), Shard::from_index(name, index, db.bm25_template.clone()));
        }

        let mut expected = db.router.all_shards();
        expected.sort();
        let mut found: Vec<String> = shards.keys().cloned().collect();
        found.sort();
        if expected != found {
            return Err(Error::InvalidFormat(format!(
                "shard set mismatch: router has {expected:?}, snapshot has {found:?}"
            )));
        }

        let journal = fs::File::open(dir.join("metadata.jsonl"))?;
        for line in BufReader::new(journal).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalLine = serde_json::from_str(&line).map_err(json_err)?;
            match shards.values().find(|s| s.contains(entry.id)) {
                Some(shard) => shard.attach(entry.id, entry.metadata, entry.text)?,
                None => {
                    tracing::warn!(id = entry.id, "journal entry has no matching vector, skipping");
                }
            }
        }

        db.open_with_shards(manifest.dimension, manifest.metric, shards)?;
        db.next_id.store(manifest.next_id, Ordering::SeqCst);
        tracing::info!(dir = %dir.display(), "loaded database");
        Ok(db)
    }
}
