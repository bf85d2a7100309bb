//! End-to-end scenarios for the distributed facade: build-and-query,
//! tombstones, scatter-gather over shards, hybrid retrieval, replication
//! delivery order, heartbeat-driven health, and persistence.

use quiver_cluster::{
    DatabaseConfig, DistributedDatabase, FusionStrategy, HealthProbe, InMemoryTransport,
    NodeConfig, OpKind, ReplicaTransport, ReplicationConfig, ReplicationManager, ReplicationMode,
    ReplicationOp, ReplicationOutcome, RouterConfig, ShardSpec, ShardingStrategy, TableProbe,
};
use quiver_core::distance::DistanceMetric;
use quiver_core::error::Result;
use quiver_core::metadata::{Metadata, MetadataValue};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn unit(dim: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[axis] = 1.0;
    v
}

fn meta(key: &str, value: MetadataValue) -> Metadata {
    let mut m = Metadata::new();
    m.insert(key.to_string(), value);
    m
}

fn node(id: &str, priority: i32, primary: bool) -> NodeConfig {
    NodeConfig {
        node_id: id.to_string(),
        host: "localhost".to_string(),
        port: 8080,
        priority,
        is_primary: primary,
    }
}

fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Transport that fails deliveries to a fixed set of nodes.
struct FailingTransport {
    dead: HashSet<String>,
}

impl ReplicaTransport for FailingTransport {
    fn replicate(&self, node: &NodeConfig, _op: &ReplicationOp) -> Result<()> {
        if self.dead.contains(&node.node_id) {
            Err(quiver_core::Error::Unavailable(format!(
                "node {} unreachable",
                node.node_id
            )))
        } else {
            Ok(())
        }
    }
}

#[test]
fn test_build_and_query() {
    let db = DistributedDatabase::new(DatabaseConfig::default()).unwrap();
    db.init(8, DistanceMetric::Cosine).unwrap();

    let first = db.add(&unit(8, 0), Metadata::new()).unwrap();
    let second = db.add(&unit(8, 1), Metadata::new()).unwrap();
    assert!(first >= 1_000_000);
    assert_eq!(second, first + 1);

    let results = db.search(&unit(8, 0), 2).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, first);
    assert!(results[0].score >= 0.999, "score {}", results[0].score);
    assert_eq!(results[1].id, second);
    assert!(results[1].score.abs() < 1e-3, "score {}", results[1].score);

    db.close().unwrap();
}

#[test]
fn test_tombstone_semantics() {
    let db = DistributedDatabase::new(DatabaseConfig::default()).unwrap();
    db.init(8, DistanceMetric::Cosine).unwrap();
    let first = db.add(&unit(8, 0), Metadata::new()).unwrap();
    let second = db.add(&unit(8, 1), Metadata::new()).unwrap();

    assert!(db.remove(first).unwrap());
    assert!(!db.remove(first).unwrap());

    let results = db.search(&unit(8, 0), 2).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, second);
    assert_eq!(db.get(first).unwrap(), None);
    assert!(db.get(second).unwrap().is_some());
    db.close().unwrap();
}

#[test]
fn test_operations_after_close_are_unavailable() {
    let db = DistributedDatabase::new(DatabaseConfig::default()).unwrap();
    db.init(4, DistanceMetric::Cosine).unwrap();
    db.close().unwrap();
    assert!(matches!(
        db.add(&unit(4, 0), Metadata::new()),
        Err(quiver_core::Error::Unavailable(_))
    ));
    assert!(matches!(
        db.search(&unit(4, 0), 1),
        Err(quiver_core::Error::Unavailable(_))
    ));
    assert!(db.close().is_err());
}

#[test]
fn test_search_merges_across_shards() {
    let config = DatabaseConfig {
        sharding: RouterConfig {
            strategy: ShardingStrategy::Hash,
            shards: vec![
                ShardSpec::named("shard0"),
                ShardSpec::named("shard1"),
                ShardSpec::named("shard2"),
            ],
            rebalance_threshold: 0.25,
        },
        ..DatabaseConfig::default()
    };
    let db = DistributedDatabase::new(config).unwrap();
    db.init(8, DistanceMetric::Cosine).unwrap();

    for i in 0..30 {
        let mut v = unit(8, i % 8);
        v[(i + 1) % 8] = 0.3;
        db.add(&v, Metadata::new()).unwrap();
    }
    assert_eq!(db.len(), 30);

    let results = db.search(&unit(8, 0), 10).unwrap();
    assert_eq!(results.len(), 10);
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    db.close().unwrap();
}

#[test]
fn test_predicate_filtering() {
    let db = DistributedDatabase::new(DatabaseConfig::default()).unwrap();
    db.init(4, DistanceMetric::Cosine).unwrap();
    let red = db
        .add(&unit(4, 0), meta("color", MetadataValue::String("red".into())))
        .unwrap();
    let _blue = db
        .add(&[0.9, 0.1, 0.0, 0.0], meta("color", MetadataValue::String("blue".into())))
        .unwrap();

    let results = db
        .search_filtered(&unit(4, 0), 2, |m| {
            m.get("color") == Some(&MetadataValue::String("red".into()))
        })
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, red);
    db.close().unwrap();
}

#[test]
fn test_update_metadata() {
    let db = DistributedDatabase::new(DatabaseConfig::default()).unwrap();
    db.init(4, DistanceMetric::Cosine).unwrap();
    let id = db
        .add(&unit(4, 0), meta("version", MetadataValue::Integer(1)))
        .unwrap();
    db.update_metadata(id, meta("version", MetadataValue::Integer(2)))
        .unwrap();
    let results = db
        .search_filtered(&unit(4, 0), 1, |m| {
            m.get("version") == Some(&MetadataValue::Integer(2))
        })
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(
        db.update_metadata(999, Metadata::new()),
        Err(quiver_core::Error::NotFound(_))
    ));
    db.close().unwrap();
}

#[test]
fn test_hybrid_fusion_prefers_doubly_ranked() {
    let db = DistributedDatabase::new(DatabaseConfig::default()).unwrap();
    db.init(4, DistanceMetric::Cosine).unwrap();
    let gold = db
        .add_with_text(&unit(4, 0), "gold prices rose", Metadata::new())
        .unwrap();
    let silver = db
        .add_with_text(&unit(4, 1), "silver prices fell", Metadata::new())
        .unwrap();

    // Vector side favors `gold`, lexical side only matches `gold`
    let fused = db
        .hybrid_search(&unit(4, 0), "gold", 2, FusionStrategy::default())
        .unwrap();
    assert_eq!(fused[0].0, gold);
    assert!(fused.iter().any(|&(id, _)| id == silver) || fused.len() == 1);

    // Lexical query for silver outweighs the vector preference under RRF
    let fused = db
        .hybrid_search(&[0.6, 0.5, 0.0, 0.0], "silver fell", 2, FusionStrategy::default())
        .unwrap();
    assert_eq!(fused[0].0, silver);
    db.close().unwrap();
}

#[test]
fn test_async_replication_preserves_per_replica_order() {
    let transport = Arc::new(InMemoryTransport::new());
    let config = DatabaseConfig {
        replication: ReplicationConfig {
            mode: ReplicationMode::Async,
            min_replicas: 1,
            nodes: vec![node("primary", 10, true), node("replica", 5, false)],
            ..ReplicationConfig::default()
        },
        ..DatabaseConfig::default()
    };
    let db = DistributedDatabase::new_with(
        config,
        Arc::clone(&transport) as Arc<dyn ReplicaTransport>,
        Arc::new(TableProbe::new()) as Arc<dyn HealthProbe>,
    )
    .unwrap();
    db.init(4, DistanceMetric::Cosine).unwrap();

    let mut expected = Vec::new();
    for i in 0..20 {
        expected.push(db.add(&unit(4, i % 4), Metadata::new()).unwrap());
    }
    assert!(
        wait_until(Duration::from_secs(2), || transport.count_for("replica") == 20),
        "drain worker did not deliver all operations"
    );

    let delivered = transport.ops_for("replica");
    let ids: Vec<u64> = delivered.iter().map(|op| op.id).collect();
    assert_eq!(ids, expected, "delivery order differs from submission order");
    assert!(delivered.iter().all(|op| op.kind == OpKind::Add));
    assert!(delivered.iter().all(|op| op.source_node == "primary"));
    // Primary-assigned timestamps are monotone
    for pair in delivered.windows(2) {
        assert!(pair[0].timestamp_ms <= pair[1].timestamp_ms);
    }
    db.close().unwrap();
}

#[test]
fn test_sync_replication_reports_incomplete() {
    let transport = Arc::new(FailingTransport {
        dead: HashSet::from(["node3".to_string()]),
    });
    let mgr = ReplicationManager::new_with(
        ReplicationConfig {
            mode: ReplicationMode::Sync,
            min_replicas: 2,
            sync_timeout: Duration::from_millis(300),
            nodes: vec![
                node("node1", 10, true),
                node("node2", 5, false),
                node("node3", 3, false),
            ],
            ..ReplicationConfig::default()
        },
        transport,
        Arc::new(TableProbe::new()),
    );
    mgr.start().unwrap();

    match mgr.replicate_add(1, &[1.0], &Metadata::new()).unwrap() {
        ReplicationOutcome::Incomplete { acks, required, .. } => {
            assert_eq!(acks, 1);
            assert_eq!(required, 2);
        }
        other => panic!("expected Incomplete, got {other:?}"),
    }
    // The failure is counted against the dead node
    let stats = mgr.replica_stats("node3").unwrap();
    assert_eq!(stats.operations_failed, 1);
    mgr.stop().unwrap();
}

#[test]
fn test_semisync_tolerates_one_dead_replica() {
    let transport = Arc::new(FailingTransport {
        dead: HashSet::from(["node3".to_string()]),
    });
    let mgr = ReplicationManager::new_with(
        ReplicationConfig {
            mode: ReplicationMode::SemiSync,
            min_replicas: 2, // needs 1 ack beyond the primary
            sync_timeout: Duration::from_millis(300),
            nodes: vec![
                node("node1", 10, true),
                node("node2", 5, false),
                node("node3", 3, false),
            ],
            ..ReplicationConfig::default()
        },
        transport,
        Arc::new(TableProbe::new()),
    );
    mgr.start().unwrap();
    match mgr.replicate_remove(1).unwrap() {
        ReplicationOutcome::Acknowledged { acks } => assert!(acks >= 1),
        other => panic!("expected Acknowledged, got {other:?}"),
    }
    mgr.stop().unwrap();
}

#[test]
fn test_heartbeat_marks_unhealthy_then_recovers() {
    let probe = Arc::new(TableProbe::new());
    let mgr = ReplicationManager::new_with(
        ReplicationConfig {
            mode: ReplicationMode::Async,
            min_replicas: 2,
            heartbeat_interval: Duration::from_millis(20),
            nodes: vec![
                node("node1", 10, true),
                node("node2", 5, false),
                node("node3", 3, false),
            ],
            ..ReplicationConfig::default()
        },
        Arc::new(InMemoryTransport::new()),
        Arc::clone(&probe) as Arc<dyn HealthProbe>,
    );
    mgr.start().unwrap();
    assert!(mgr.is_healthy());

    // Three consecutive missed heartbeats take one replica down
    probe.set("node3", false);
    assert!(
        wait_until(Duration::from_secs(2), || {
            !mgr.replica_stats("node3").unwrap().healthy
        }),
        "node3 never went unhealthy"
    );
    assert!(mgr.is_healthy()); // 2 healthy >= min_replicas

    probe.set("node2", false);
    assert!(
        wait_until(Duration::from_secs(2), || !mgr.is_healthy()),
        "cluster health never dropped below the threshold"
    );

    // Recovery flips the flag back on the next successful probe
    probe.set("node2", true);
    probe.set("node3", true);
    assert!(
        wait_until(Duration::from_secs(2), || mgr.is_healthy()),
        "cluster never recovered"
    );
    mgr.stop().unwrap();
}

#[test]
fn test_failover_loop_promotes_automatically() {
    let probe = Arc::new(TableProbe::new());
    let mgr = ReplicationManager::new_with(
        ReplicationConfig {
            mode: ReplicationMode::Async,
            min_replicas: 1,
            heartbeat_interval: Duration::from_millis(20),
            nodes: vec![node("node1", 10, true), node("node2", 5, false)],
            ..ReplicationConfig::default()
        },
        Arc::new(InMemoryTransport::new()),
        Arc::clone(&probe) as Arc<dyn HealthProbe>,
    );
    mgr.start().unwrap();
    assert_eq!(mgr.primary().as_deref(), Some("node1"));

    probe.set("node1", false);
    assert!(
        wait_until(Duration::from_secs(3), || {
            mgr.primary().as_deref() == Some("node2")
        }),
        "failover loop never promoted node2"
    );
    mgr.stop().unwrap();
}

#[test]
fn test_cluster_health_via_facade() {
    let config = DatabaseConfig {
        replication: ReplicationConfig {
            min_replicas: 2,
            nodes: vec![node("node1", 10, true), node("node2", 5, false)],
            ..ReplicationConfig::default()
        },
        ..DatabaseConfig::default()
    };
    let db = DistributedDatabase::new(config).unwrap();
    db.init(4, DistanceMetric::Cosine).unwrap();
    assert!(db.is_cluster_healthy());
    assert_eq!(db.get_all_nodes().len(), 2);

    db.add_node(node("node3", 1, false)).unwrap();
    assert_eq!(db.get_all_nodes().len(), 3);
    assert!(db.remove_node("node1").is_err()); // current primary
    db.remove_node("node3").unwrap();
    db.close().unwrap();
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        sharding: RouterConfig {
            strategy: ShardingStrategy::Hash,
            shards: vec![ShardSpec::named("shard0"), ShardSpec::named("shard1")],
            rebalance_threshold: 0.25,
        },
        ..DatabaseConfig::default()
    };

    let db = DistributedDatabase::new(config.clone()).unwrap();
    db.init(8, DistanceMetric::Cosine).unwrap();
    let mut ids = Vec::new();
    for i in 0..20 {
        let id = if i % 2 == 0 {
            db.add_with_text(
                &unit(8, i % 8),
                &format!("document number {i} about gold"),
                meta("index", MetadataValue::Integer(i as i64)),
            )
            .unwrap()
        } else {
            db.add(&unit(8, i % 8), meta("index", MetadataValue::Integer(i as i64)))
                .unwrap()
        };
        ids.push(id);
    }
    let query = unit(8, 0);
    let before = db.search(&query, 5).unwrap();
    let lexical_before = db
        .hybrid_search(&query, "gold", 5, FusionStrategy::default())
        .unwrap();
    db.save(dir.path()).unwrap();
    db.close().unwrap();

    let restored = DistributedDatabase::load(config, dir.path()).unwrap();
    assert_eq!(restored.len(), 20);
    assert_eq!(restored.search(&query, 5).unwrap(), before);
    assert_eq!(
        restored
            .hybrid_search(&query, "gold", 5, FusionStrategy::default())
            .unwrap(),
        lexical_before
    );
    // The id counter continues past the loaded ids
    let next = restored.add(&unit(8, 3), Metadata::new()).unwrap();
    assert!(next > *ids.last().unwrap());
    restored.close().unwrap();
}

#[test]
fn test_load_rejects_mismatched_shard_set() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::default();
    let db = DistributedDatabase::new(config).unwrap();
    db.init(4, DistanceMetric::Cosine).unwrap();
    db.add(&unit(4, 0), Metadata::new()).unwrap();
    db.save(dir.path()).unwrap();
    db.close().unwrap();

    let other = DatabaseConfig {
        sharding: RouterConfig {
            strategy: ShardingStrategy::Hash,
            shards: vec![ShardSpec::named("alpha"), ShardSpec::named("beta")],
            rebalance_threshold: 0.25,
        },
        ..DatabaseConfig::default()
    };
    assert!(matches!(
        DistributedDatabase::load(other, dir.path()),
        Err(quiver_core::Error::InvalidFormat(_))
    ));
}
