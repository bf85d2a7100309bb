//! The distributed database facade.
//!
//! Composes the shard router, the replication manager, and the local
//! shards behind one add/get/remove/search surface. Writes route to
//! exactly one shard and then stream through the replication manager;
//! searches fan out to every local shard in parallel on a per-database
//! rayon pool, merge by descending score, and truncate to k.
//!
//! The database opens once via [`init`](DistributedDatabase::init) (or
//! [`load`](DistributedDatabase::load)), closes once via
//! [`close`](DistributedDatabase::close), and every operation afterwards
//! is `Unavailable`.

use crate::replication::{
    HealthProbe, NodeConfig, ReplicaTransport, ReplicationConfig, ReplicationManager,
    ReplicationOutcome,
};
use crate::router::{RouterConfig, ShardRouter};
use crate::shard::Shard;
use parking_lot::RwLock;
use quiver_core::bm25::Bm25Config;
use quiver_core::config::{MAX_DIMENSION, MAX_K};
use quiver_core::distance::DistanceMetric;
use quiver_core::error::{Error, Result};
use quiver_core::hnsw::HnswConfig;
use quiver_core::hybrid::{fuse, FusionStrategy};
use quiver_core::metadata::Metadata;
use quiver_core::types::{QueryResult, VectorId};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ids below this are reserved for callers that assign their own; the
/// facade's counter starts here.
const RESERVED_ID_BASE: u64 = 1_000_000;

/// Everything needed to build a database.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub sharding: RouterConfig,
    pub replication: ReplicationConfig,
    /// Template for per-shard indices; `dimension` and `metric` are
    /// overwritten by `init`.
    pub hnsw: HnswConfig,
    pub bm25: Bm25Config,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sharding: RouterConfig::default(),
            replication: ReplicationConfig::default(),
            hnsw: HnswConfig::default(),
            bm25: Bm25Config::default(),
        }
    }
}

pub(crate) struct DbState {
    pub(crate) dimension: usize,
    pub(crate) metric: DistanceMetric,
    pub(crate) shards: HashMap<String, Shard>,
    pub(crate) pool: rayon::ThreadPool,
}

/// Single-surface facade over router, shards, and replication.
pub struct DistributedDatabase {
    pub(crate) router: ShardRouter,
    pub(crate) replication: ReplicationManager,
    pub(crate) state: RwLock<Option<DbState>>,
    pub(crate) next_id: AtomicU64,
    pub(crate) hnsw_template: HnswConfig,
    pub(crate) bm25_template: Bm25Config,
}

fn closed() -> Error {
    Error::Unavailable("database is not open".into())
}

impl DistributedDatabase {
    /// Build an unopened database. Call [`init`](Self::init) next.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        Ok(Self {
            router: ShardRouter::new(config.sharding)?,
            replication: ReplicationManager::new(config.replication),
            state: RwLock::new(None),
            next_id: AtomicU64::new(RESERVED_ID_BASE),
            hnsw_template: config.hnsw,
            bm25_template: config.bm25,
        })
    }

    /// Build with an explicit replication transport and health probe.
    pub fn new_with(
        config: DatabaseConfig,
        transport: Arc<dyn ReplicaTransport>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        Ok(Self {
            router: ShardRouter::new(config.sharding)?,
            replication: ReplicationManager::new_with(config.replication, transport, probe),
            state: RwLock::new(None),
            next_id: AtomicU64::new(RESERVED_ID_BASE),
            hnsw_template: config.hnsw,
            bm25_template: config.bm25,
        })
    }

    /// Create one index per configured shard and start the managers.
    pub fn init(&self, dimension: usize, metric: DistanceMetric) -> Result<()> {
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(Error::InvalidArgument(format!(
                "dimension must be in 1..={MAX_DIMENSION}, got {dimension}"
            )));
        }
        let mut shards = HashMap::new();
        for shard_id in self.router.all_shards() {
            let shard = Shard::new(
                shard_id.clone(),
                HnswConfig {
                    dimension,
                    metric,
                    ..self.hnsw_template.clone()
                },
                self.bm25_template.clone(),
            )?;
            shards.insert(shard_id, shard);
        }
        self.open_with_shards(dimension, metric, shards)?;
        tracing::info!(dimension, ?metric, "database initialized");
        Ok(())
    }

    /// Install shard state and spin up the runtime. Shared by `init` and
    /// `load`.
    pub(crate) fn open_with_shards(
        &self,
        dimension: usize,
        metric: DistanceMetric,
        shards: HashMap<String, Shard>,
    ) -> Result<()> {
        let mut guard = self.state.write();
        if guard.is_some() {
            return Err(Error::InvalidArgument("database is already open".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("quiver-search-{i}"))
            .build()
            .map_err(|e| Error::Unavailable(format!("failed to build search pool: {e}")))?;
        self.replication.start()?;
        *guard = Some(DbState {
            dimension,
            metric,
            shards,
            pool,
        });
        Ok(())
    }

    /// Stop the managers and release the shards. The database must not be
    /// used afterwards.
    pub fn close(&self) -> Result<()> {
        let state = self.state.write().take().ok_or_else(closed)?;
        self.replication.stop()?;
        drop(state); // joins the search pool
        tracing::info!("database closed");
        Ok(())
    }

    /// `true` between a successful `init`/`load` and `close`.
    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    /// Live vector count across all local shards.
    pub fn len(&self) -> usize {
        self.state
            .read()
            .as_ref()
            .map_or(0, |st| st.shards.values().map(Shard::len).sum())
    }

    /// `true` when no live vector exists (or the database is closed).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a vector. Assigns and returns the id.
    pub fn add(&self, vector: &[f32], metadata: Metadata) -> Result<VectorId> {
        self.insert_routed(vector, None, metadata)
    }

    /// Store a vector together with text content for lexical search.
    pub fn add_with_text(
        &self,
        vector: &[f32],
        text: &str,
        metadata: Metadata,
    ) -> Result<VectorId> {
        self.insert_routed(vector, Some(text), metadata)
    }

    fn insert_routed(
        &self,
        vector: &[f32],
        text: Option<&str>,
        metadata: Metadata,
    ) -> Result<VectorId> {
        let guard = self.state.read();
        let st = guard.as_ref().ok_or_else(closed)?;
        if vector.len() != st.dimension {
            return Err(Error::InvalidArgument(format!(
                "vector dimension {} does not match database dimension {}",
                vector.len(),
                st.dimension
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let shard_id = self.router.shard_for_id(id)?;
        let shard = st
            .shards
            .get(&shard_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown shard id {shard_id}")))?;
        shard.insert(id, vector, text, metadata.clone())?;
        self.router.record_insert(&shard_id);

        if let ReplicationOutcome::Incomplete {
            acks,
            required,
            elapsed,
        } = self.replication.replicate_add(id, vector, &metadata)?
        {
            tracing::warn!(
                id,
                acks,
                required,
                elapsed_ms = elapsed.as_millis() as u64,
                "write committed locally but replication is incomplete"
            );
        }
        Ok(id)
    }

    /// Remove a vector. Returns `false` if the id was not present.
    pub fn remove(&self, id: VectorId) -> Result<bool> {
        let guard = self.state.read();
        let st = guard.as_ref().ok_or_else(closed)?;
        let shard_id = self.router.shard_for_id(id)?;
        let Some(shard) = st.shards.get(&shard_id) else {
            return Ok(false);
        };
        let removed = shard.remove(id);
        if removed {
            self.router.record_remove(&shard_id);
            self.replication.replicate_remove(id)?;
        }
        Ok(removed)
    }

    /// Fetch a stored vector. `Ok(None)` when the id is missing.
    pub fn get(&self, id: VectorId) -> Result<Option<Vec<f32>>> {
        let guard = self.state.read();
        let st = guard.as_ref().ok_or_else(closed)?;
        let shard_id = self.router.shard_for_id(id)?;
        Ok(st.shards.get(&shard_id).and_then(|s| s.get_vector(id)))
    }

    /// Replace the metadata of an existing id.
    pub fn update_metadata(&self, id: VectorId, metadata: Metadata) -> Result<()> {
        let guard = self.state.read();
        let st = guard.as_ref().ok_or_else(closed)?;
        let shard_id = self.router.shard_for_id(id)?;
        let shard = st
            .shards
            .get(&shard_id)
            .ok_or_else(|| Error::NotFound(format!("id {id} is not stored")))?;
        shard.update_metadata(id, metadata.clone())?;
        self.replication.replicate_update(id, &metadata)?;
        Ok(())
    }

    /// Global k nearest neighbors across all local shards.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<QueryResult>> {
        self.search_inner(query, k, None)
    }

    /// Global k nearest neighbors whose metadata passes the predicate.
    pub fn search_filtered<F: Fn(&Metadata) -> bool>(
        &self,
        query: &[f32],
        k: usize,
        predicate: F,
    ) -> Result<Vec<QueryResult>> {
        self.search_inner(query, k, Some(&predicate))
    }

    fn search_inner(
        &self,
        query: &[f32],
        k: usize,
        predicate: Option<&dyn Fn(&Metadata) -> bool>,
    ) -> Result<Vec<QueryResult>> {
        let guard = self.state.read();
        let st = guard.as_ref().ok_or_else(closed)?;
        if query.len() != st.dimension {
            return Err(Error::InvalidArgument(format!(
                "query dimension {} does not match database dimension {}",
                query.len(),
                st.dimension
            )));
        }
        if k == 0 || k > MAX_K {
            return Err(Error::InvalidArgument(format!(
                "k must be in 1..={MAX_K}, got {k}"
            )));
        }

        // Scatter: every shard answers its local top-k in parallel.
        let partials: Result<Vec<Vec<(Shard, QueryResult)>>> = st.pool.install(|| {
            st.shards
                .par_iter()
                .map(|(_, shard)| {
                    shard.search(query, k).map(|results| {
                        results
                            .into_iter()
                            .map(|r| (shard.clone(), r))
                            .collect::<Vec<_>>()
                    })
                })
                .collect()
        });

        // Gather: merge by descending score, ascending id on ties.
        let mut merged: Vec<(Shard, QueryResult)> = partials?.into_iter().flatten().collect();
        merged.sort_unstable_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        let mut out = Vec::with_capacity(k.min(merged.len()));
        for (shard, result) in merged {
            if let Some(pred) = predicate {
                let Some(metadata) = shard.get_metadata(result.id) else {
                    continue;
                };
                if !pred(&metadata) {
                    continue;
                }
            }
            out.push(result);
            if out.len() == k {
                break;
            }
        }
        Ok(out)
    }

    /// Fuse the global vector top-k with the global lexical top-k for the
    /// same query.
    pub fn hybrid_search(
        &self,
        query: &[f32],
        text: &str,
        k: usize,
        strategy: FusionStrategy,
    ) -> Result<Vec<(VectorId, f32)>> {
        let ann: Vec<(VectorId, f32)> = self
            .search_inner(query, k, None)?
            .into_iter()
            .map(|r| (r.id, r.score))
            .collect();

        let guard = self.state.read();
        let st = guard.as_ref().ok_or_else(closed)?;
        let mut lexical: Vec<(VectorId, f32)> = st
            .pool
            .install(|| {
                st.shards
                    .par_iter()
                    .map(|(_, shard)| shard.keyword_search(text, k, 0.0))
                    .collect::<Vec<_>>()
            })
            .into_iter()
            .flatten()
            .collect();
        lexical.sort_unstable_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        lexical.truncate(k);

        Ok(fuse(&ann, &lexical, strategy, k))
    }

    /// Register a cluster node.
    pub fn add_node(&self, node: NodeConfig) -> Result<()> {
        self.replication.add_replica(node)
    }

    /// Deregister a cluster node. The current primary is refused.
    pub fn remove_node(&self, node_id: &str) -> Result<()> {
        self.replication.remove_replica(node_id)
    }

    /// All registered cluster nodes.
    pub fn get_all_nodes(&self) -> Vec<NodeConfig> {
        self.replication.nodes()
    }

    /// `true` while at least `min_replicas` nodes are healthy.
    pub fn is_cluster_healthy(&self) -> bool {
        self.replication.is_healthy()
    }

    /// The replication manager, for failover control and stats.
    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    /// The shard router, for membership changes and balance reports.
    pub fn router(&self) -> &ShardRouter {
        &self.router
    }
}

impl Drop for DistributedDatabase {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}
