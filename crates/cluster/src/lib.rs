//! # quiver-cluster
//!
//! Distributed layer over the `quiver-core` engine: shards that pair an
//! HNSW index with a BM25 engine, a router that maps the key space onto
//! shards, a primary/replica replication manager with heartbeat and
//! failover, and the [`DistributedDatabase`] facade that ties them
//! together behind a single add/get/remove/search surface.
//!
//! Concurrency model: plain OS threads and shared memory. Each shard is
//! guarded by one readers–writer lock; searches fan out across shards on a
//! per-database rayon pool and merge by score. Replication ordering is
//! per-replica in primary submission order — there is no global
//! linearizability, and sync-mode shortfalls surface as warnings after the
//! local write has already committed.

/// The add/get/remove/search facade over router, shards, and replication.
pub mod database;
/// Whole-database persistence: config.json, vectors.bin, metadata.jsonl.
pub mod persist;
/// Primary → replica write streaming, heartbeat, and failover.
pub mod replication;
/// Key-space routing: hash, range, and consistent-hash strategies.
pub mod router;
/// One partition of the key space: an HNSW index plus a BM25 engine.
pub mod shard;

pub use database::{DatabaseConfig, DistributedDatabase};
pub use replication::{
    HealthProbe, InMemoryTransport, NodeConfig, OpKind, ReplicaStats, ReplicaTransport,
    ReplicationConfig, ReplicationManager, ReplicationMode, ReplicationOp, ReplicationOutcome,
    TableProbe,
};
pub use router::{RouterConfig, ShardRouter, ShardSpec, ShardingStrategy};
pub use shard::Shard;

pub use quiver_core::hybrid::FusionStrategy;
