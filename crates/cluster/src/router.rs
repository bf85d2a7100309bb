//! Key-space routing.
//!
//! Maps a 64-bit id or a string key to exactly one shard under one of
//! three strategies. Hash is cheapest but remaps everything when the shard
//! count changes; range sharding routes by declared id intervals; the
//! consistent-hash ring (150 virtual nodes per shard) limits the blast
//! radius of a membership change to roughly `1 / shards` of the key space.
//! All routing state sits behind one mutex; reads take it for a hash and a
//! lookup, membership changes take it for the ring rebuild.

use parking_lot::Mutex;
use quiver_core::error::{Error, Result};
use quiver_core::types::VectorId;

/// Virtual nodes per shard on the consistent-hash ring.
const VIRTUAL_NODES_PER_SHARD: usize = 150;

/// How ids are assigned to shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingStrategy {
    /// `hash64(id) mod shard_count`.
    Hash,
    /// First shard whose `[start, end)` range contains the id.
    Range,
    /// Consistent hashing over a ring of virtual nodes.
    Consistent,
}

/// One shard's routing entry.
#[derive(Debug, Clone)]
pub struct ShardSpec {
    pub id: String,
    /// `[start, end)` id bounds, used by range sharding only.
    pub range: Option<(u64, u64)>,
}

impl ShardSpec {
    /// Entry with no range bounds.
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            range: None,
        }
    }

    /// Entry covering `[start, end)`.
    pub fn ranged(id: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            id: id.into(),
            range: Some((start, end)),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub strategy: ShardingStrategy,
    pub shards: Vec<ShardSpec>,
    /// `imbalance()` above this warrants migration.
    pub rebalance_threshold: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: ShardingStrategy::Hash,
            shards: vec![ShardSpec::named("shard0")],
            rebalance_threshold: 0.25,
        }
    }
}

/// Result of a rebalance evaluation. Reports whether migration would be
/// warranted; moving data is left to the deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceReport {
    /// `stdev(item counts) / mean(item counts)`.
    pub imbalance: f32,
    pub migration_warranted: bool,
}

struct RouterState {
    shards: Vec<ShardSpec>,
    /// Sorted `(hash, shard id)` ring. Empty unless consistent hashing.
    ring: Vec<(u64, String)>,
    /// Per-shard live item counters, parallel to `shards`.
    counts: Vec<u64>,
}

/// Shard router. Stateless given the shard table except for the item
/// counters that feed the imbalance metric.
pub struct ShardRouter {
    strategy: ShardingStrategy,
    rebalance_threshold: f32,
    state: Mutex<RouterState>,
}

/// Murmur-style 64-bit finalizer for numeric ids.
fn hash_id(id: VectorId) -> u64 {
    let mut h = id;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Splitmix-style rolling hash for string keys.
fn hash_key(key: &str) -> u64 {
    let mut h: u64 = 0x9e37_79b9_7f4a_7c15;
    for &byte in key.as_bytes() {
        h ^= byte as u64;
        h = h.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        h ^= h >> 33;
    }
    h
}

fn build_ring(shards: &[ShardSpec]) -> Vec<(u64, String)> {
    let mut ring = Vec::with_capacity(shards.len() * VIRTUAL_NODES_PER_SHARD);
    for shard in shards {
        for i in 0..VIRTUAL_NODES_PER_SHARD {
            ring.push((hash_key(&format!("{}:{i}", shard.id)), shard.id.clone()));
        }
    }
    ring.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    ring
}

impl ShardRouter {
    /// Build a router. Duplicate shard ids are rejected.
    pub fn new(config: RouterConfig) -> Result<Self> {
        for (i, a) in config.shards.iter().enumerate() {
            if config.shards[..i].iter().any(|b| b.id == a.id) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate shard id {}",
                    a.id
                )));
            }
        }
        let ring = if config.strategy == ShardingStrategy::Consistent {
            build_ring(&config.shards)
        } else {
            Vec::new()
        };
        if config.strategy == ShardingStrategy::Consistent {
            tracing::info!(
                virtual_nodes = ring.len(),
                shards = config.shards.len(),
                "built consistent-hash ring"
            );
        }
        let counts = vec![0; config.shards.len()];
        Ok(Self {
            strategy: config.strategy,
            rebalance_threshold: config.rebalance_threshold,
            state: Mutex::new(RouterState {
                shards: config.shards,
                ring,
                counts,
            }),
        })
    }

    /// Routing strategy in use.
    pub fn strategy(&self) -> ShardingStrategy {
        self.strategy
    }

    /// Shard owning a numeric id.
    pub fn shard_for_id(&self, id: VectorId) -> Result<String> {
        let state = self.state.lock();
        if state.shards.is_empty() {
            return Err(Error::InvalidArgument("no shards configured".into()));
        }
        let shard = match self.strategy {
            ShardingStrategy::Hash => {
                let index = (hash_id(id) % state.shards.len() as u64) as usize;
                state.shards[index].id.clone()
            }
            ShardingStrategy::Range => state
                .shards
                .iter()
                .find(|s| s.range.is_some_and(|(start, end)| id >= start && id < end))
                // No matching range: fall back to the first shard
                .unwrap_or(&state.shards[0])
                .id
                .clone(),
            ShardingStrategy::Consistent => Self::ring_lookup(&state.ring, hash_id(id)),
        };
        Ok(shard)
    }

    /// Shard owning a string key. Range sharding has no notion of string
    /// keys and routes to the first shard.
    pub fn shard_for_key(&self, key: &str) -> Result<String> {
        let state = self.state.lock();
        if state.shards.is_empty() {
            return Err(Error::InvalidArgument("no shards configured".into()));
        }
        let shard = match self.strategy {
            ShardingStrategy::Hash => {
                let index = (hash_key(key) % state.shards.len() as u64) as usize;
                state.shards[index].id.clone()
            }
            ShardingStrategy::Range => state.shards[0].id.clone(),
            ShardingStrategy::Consistent => Self::ring_lookup(&state.ring, hash_key(key)),
        };
        Ok(shard)
    }

    /// All shard ids in table order.
    pub fn all_shards(&self) -> Vec<String> {
        self.state.lock().shards.iter().map(|s| s.id.clone()).collect()
    }

    /// Append a shard and rebuild the ring. Duplicate ids are rejected.
    pub fn add_shard(&self, spec: ShardSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.shards.iter().any(|s| s.id == spec.id) {
            return Err(Error::InvalidArgument(format!(
                "shard {} already exists",
                spec.id
            )));
        }
        tracing::info!(shard = %spec.id, "adding shard");
        state.shards.push(spec);
        state.counts.push(0);
        if self.strategy == ShardingStrategy::Consistent {
            state.ring = build_ring(&state.shards);
        }
        Ok(())
    }

    /// Drop a shard and rebuild the ring.
    pub fn remove_shard(&self, shard_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let Some(index) = state.shards.iter().position(|s| s.id == shard_id) else {
            return Err(Error::InvalidArgument(format!("unknown shard id {shard_id}")));
        };
        tracing::info!(shard = %shard_id, "removing shard");
        state.shards.remove(index);
        state.counts.remove(index);
        if self.strategy == ShardingStrategy::Consistent {
            state.ring = build_ring(&state.shards);
        }
        Ok(())
    }

    /// Bump a shard's item counter after a local insert.
    pub fn record_insert(&self, shard_id: &str) {
        let mut state = self.state.lock();
        if let Some(index) = state.shards.iter().position(|s| s.id == shard_id) {
            state.counts[index] += 1;
        }
    }

    /// Decrement a shard's item counter after a local remove.
    pub fn record_remove(&self, shard_id: &str) {
        let mut state = self.state.lock();
        if let Some(index) = state.shards.iter().position(|s| s.id == shard_id) {
            state.counts[index] = state.counts[index].saturating_sub(1);
        }
    }

    /// `stdev(item counts) / mean(item counts)`; 0.0 for an empty table.
    pub fn imbalance(&self) -> f32 {
        let state = self.state.lock();
        Self::imbalance_of(&state.counts)
    }

    /// Recompute the imbalance metric and report whether migration would be
    /// warranted under the configured threshold.
    pub fn rebalance(&self) -> RebalanceReport {
        let imbalance = self.imbalance();
        let warranted = imbalance >= self.rebalance_threshold;
        if warranted {
            tracing::warn!(imbalance, "shard imbalance above threshold, migration warranted");
        } else {
            tracing::debug!(imbalance, "shards balanced");
        }
        RebalanceReport {
            imbalance,
            migration_warranted: warranted,
        }
    }

    fn imbalance_of(counts: &[u64]) -> f32 {
        if counts.is_empty() {
            return 0.0;
        }
        let total: u64 = counts.iter().sum();
        let mean = total as f64 / counts.len() as f64;
        if mean == 0.0 {
            return 0.0;
        }
        let variance = counts
            .iter()
            .map(|&c| {
                let diff = c as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / counts.len() as f64;
        (variance.sqrt() / mean) as f32
    }

    /// First ring entry with hash ≥ the key's hash, wrapping to the start.
    fn ring_lookup(ring: &[(u64, String)], hash: u64) -> String {
        let index = ring.partition_point(|(h, _)| *h < hash);
        let (_, shard) = &ring[index % ring.len()];
        shard.clone()
    }
}
