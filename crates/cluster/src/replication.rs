//! Primary → replica write streaming with heartbeat and failover.
//!
//! Writes are wrapped as [`ReplicationOp`] records, ordered only by the
//! primary-assigned timestamp. Async mode enqueues onto a mutex+condvar
//! queue drained by a worker thread; the worker finishes one operation's
//! fan-out before popping the next, which is what preserves per-replica
//! delivery order. Sync and semi-sync modes fan out on the caller thread
//! and block until enough acknowledgments arrive or the timeout elapses —
//! a shortfall is reported as [`ReplicationOutcome::Incomplete`], never as
//! an error, because the local write has already committed.
//!
//! The wire protocol is a deployment concern: implement
//! [`ReplicaTransport`] over your RPC of choice. The bundled
//! [`InMemoryTransport`] serves embedded use and tests.

use parking_lot::{Condvar, Mutex};
use quiver_core::error::{Error, Result};
use quiver_core::metadata::Metadata;
use quiver_core::types::VectorId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Durability mode. Chosen at configuration time, constant for the life of
/// the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// No replication; writes return immediately.
    None,
    /// Enqueue and return; a worker drains in the background. Failures are
    /// counted, never surfaced.
    Async,
    /// Block until `min_replicas - 1` acknowledgments or the timeout.
    SemiSync,
    /// Block until every healthy replica acknowledges or the timeout.
    Sync,
}

/// Static description of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    /// Failover preference; higher wins, ties break toward the lower id.
    pub priority: i32,
    pub is_primary: bool,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub mode: ReplicationMode,
    /// Cluster is healthy while at least this many nodes are healthy; also
    /// sets the semi-sync acknowledgment requirement.
    pub min_replicas: usize,
    pub heartbeat_interval: Duration,
    pub sync_timeout: Duration,
    pub nodes: Vec<NodeConfig>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::Async,
            min_replicas: 2,
            heartbeat_interval: Duration::from_millis(500),
            sync_timeout: Duration::from_millis(1000),
            nodes: Vec::new(),
        }
    }
}

/// Kind of replicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Add,
    Remove,
    Update,
}

/// One replicated write. Carries the primary-assigned timestamp verbatim.
#[derive(Debug, Clone)]
pub struct ReplicationOp {
    pub kind: OpKind,
    pub id: VectorId,
    pub vector: Option<Vec<f32>>,
    pub metadata: Option<Metadata>,
    pub timestamp_ms: u64,
    pub source_node: String,
}

/// What happened to a submitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Mode is `None`; nothing to do.
    Skipped,
    /// Async mode: enqueued for the drain worker.
    Queued,
    /// Enough replicas acknowledged in time.
    Acknowledged { acks: usize },
    /// Warning, not an error: the required acknowledgment count did not
    /// arrive within the timeout. The local write has already committed.
    Incomplete {
        acks: usize,
        required: usize,
        elapsed: Duration,
    },
}

/// Sends one operation to one replica. Implementations must be cheap to
/// call concurrently; per-replica ordering is the manager's job.
pub trait ReplicaTransport: Send + Sync {
    fn replicate(&self, node: &NodeConfig, op: &ReplicationOp) -> Result<()>;
}

/// Answers "is this node alive right now?" for the heartbeat loop.
pub trait HealthProbe: Send + Sync {
    fn probe(&self, node: &NodeConfig) -> bool;
}

/// Transport that appends every delivered operation to an in-memory,
/// per-node log. Used for embedded deployments and tests; the log doubles
/// as a delivery-order witness.
#[derive(Default)]
pub struct InMemoryTransport {
    log: Mutex<HashMap<String, Vec<ReplicationOp>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations delivered to a node, in delivery order.
    pub fn ops_for(&self, node_id: &str) -> Vec<ReplicationOp> {
        self.log.lock().get(node_id).cloned().unwrap_or_default()
    }

    pub fn count_for(&self, node_id: &str) -> usize {
        self.log.lock().get(node_id).map_or(0, Vec::len)
    }
}

impl ReplicaTransport for InMemoryTransport {
    fn replicate(&self, node: &NodeConfig, op: &ReplicationOp) -> Result<()> {
        self.log
            .lock()
            .entry(node.node_id.clone())
            .or_default()
            .push(op.clone());
        Ok(())
    }
}

/// Probe backed by a mutable table; nodes default to alive. The failure
/// injection seam for tests and operational tooling.
#[derive(Default)]
pub struct TableProbe {
    alive: Mutex<HashMap<String, bool>>,
}

impl TableProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, node_id: &str, alive: bool) {
        self.alive.lock().insert(node_id.to_string(), alive);
    }
}

impl HealthProbe for TableProbe {
    fn probe(&self, node: &NodeConfig) -> bool {
        *self.alive.lock().get(&node.node_id).unwrap_or(&true)
    }
}

/// Transport that always succeeds without delivering anywhere.
struct NoopTransport;

impl ReplicaTransport for NoopTransport {
    fn replicate(&self, _node: &NodeConfig, _op: &ReplicationOp) -> Result<()> {
        Ok(())
    }
}

/// Probe that always reports alive.
struct AlwaysHealthy;

impl HealthProbe for AlwaysHealthy {
    fn probe(&self, _node: &NodeConfig) -> bool {
        true
    }
}

/// Per-node observability counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStats {
    pub node_id: String,
    pub healthy: bool,
    pub lag: Duration,
    pub operations_replicated: u64,
    pub operations_failed: u64,
}

/// Immutable config plus the mutable health/counter state of one node.
/// Counters live behind the manager lock and are only read or written
/// through it.
struct NodeState {
    config: NodeConfig,
    healthy: bool,
    last_heartbeat: Instant,
    lag: Duration,
    replicated: u64,
    failed: u64,
}

impl NodeState {
    fn new(config: NodeConfig) -> Self {
        Self {
            config,
            healthy: true,
            last_heartbeat: Instant::now(),
            lag: Duration::ZERO,
            replicated: 0,
            failed: 0,
        }
    }
}

type FailoverCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct State {
    /// BTreeMap so iteration order is ascending node id, which is what
    /// breaks failover ties.
    nodes: BTreeMap<String, NodeState>,
    queue: VecDeque<Arc<ReplicationOp>>,
    current_primary: Option<String>,
    failover_callback: Option<FailoverCallback>,
}

struct Shared {
    state: Mutex<State>,
    /// Signals queue arrivals to the drain worker.
    queue_cv: Condvar,
    /// Paces the heartbeat and failover loops; woken on stop.
    tick_cv: Condvar,
    running: AtomicBool,
}

struct DispatchOutcome {
    acks: usize,
    total: usize,
    required: usize,
    elapsed: Duration,
}

/// Streams writes from the primary to replicas, runs heartbeat and
/// failover loops, and tracks per-node health.
pub struct ReplicationManager {
    mode: ReplicationMode,
    min_replicas: usize,
    heartbeat_interval: Duration,
    sync_timeout: Duration,
    shared: Arc<Shared>,
    transport: Arc<dyn ReplicaTransport>,
    probe: Arc<dyn HealthProbe>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fan one operation out to every healthy non-primary replica in parallel.
/// Each send runs on its own thread and reports through a channel; node
/// counters update as results land. With a timeout the collector stops at
/// the deadline or once `required` acknowledgments arrived.
fn dispatch(
    shared: &Arc<Shared>,
    transport: &Arc<dyn ReplicaTransport>,
    op: &Arc<ReplicationOp>,
    timeout: Option<Duration>,
    required_acks: Option<usize>,
) -> DispatchOutcome {
    let targets: Vec<NodeConfig> = {
        let state = shared.state.lock();
        state
            .nodes
            .values()
            .filter(|n| n.healthy && Some(&n.config.node_id) != state.current_primary.as_ref())
            .map(|n| n.config.clone())
            .collect()
    };
    let total = targets.len();
    let required = required_acks.map_or(total, |n| n.min(total));
    let started = Instant::now();

    let (tx, rx) = mpsc::channel::<bool>();
    for node in targets {
        let shared = Arc::clone(shared);
        let transport = Arc::clone(transport);
        let op = Arc::clone(op);
        let tx = tx.clone();
        std::thread::spawn(move || {
            let send_start = Instant::now();
            let ok = match transport.replicate(&node, &op) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(node = %node.node_id, %err, "replication to replica failed");
                    false
                }
            };
            let elapsed = send_start.elapsed();
            {
                let mut state = shared.state.lock();
                if let Some(ns) = state.nodes.get_mut(&node.node_id) {
                    ns.lag = elapsed;
                    if ok {
                        ns.replicated += 1;
                    } else {
                        ns.failed += 1;
                    }
                }
            }
            let _ = tx.send(ok);
        });
    }
    drop(tx);

    let mut acks = 0usize;
    let mut received = 0usize;
    match timeout {
        None => {
            while received < total {
                match rx.recv() {
                    Ok(ok) => {
                        received += 1;
                        if ok {
                            acks += 1;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        Some(limit) => {
            let deadline = started + limit;
            while received < total && acks < required {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match rx.recv_timeout(deadline - now) {
                    Ok(ok) => {
                        received += 1;
                        if ok {
                            acks += 1;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }

    DispatchOutcome {
        acks,
        total,
        required,
        elapsed: started.elapsed(),
    }
}

/// Promote the highest-priority healthy replica (ties: lowest node id).
/// Returns the new primary and the callback to invoke once the lock is
/// released. Leaves the primary unchanged when no healthy candidate exists.
fn failover_locked(state: &mut State) -> Option<(String, Option<FailoverCallback>)> {
    let current = state.current_primary.clone();
    let mut best: Option<(i32, String)> = None;
    for (node_id, node) in &state.nodes {
        if !node.healthy || Some(node_id) == current.as_ref() {
            continue;
        }
        match &best {
            None => best = Some((node.config.priority, node_id.clone())),
            Some((priority, _)) if node.config.priority > *priority => {
                best = Some((node.config.priority, node_id.clone()))
            }
            _ => {}
        }
    }
    match best {
        Some((priority, new_primary)) => {
            tracing::info!(node = %new_primary, priority, "promoting replica to primary");
            if let Some(old) = &current {
                if let Some(node) = state.nodes.get_mut(old) {
                    node.config.is_primary = false;
                }
            }
            if let Some(node) = state.nodes.get_mut(&new_primary) {
                node.config.is_primary = true;
            }
            state.current_primary = Some(new_primary.clone());
            Some((new_primary, state.failover_callback.clone()))
        }
        None => {
            tracing::error!("no healthy replica available for failover");
            None
        }
    }
}

impl ReplicationManager {
    /// Manager with a transport that acknowledges without delivering and a
    /// probe that always reports alive. Real deployments use
    /// [`new_with`](Self::new_with).
    pub fn new(config: ReplicationConfig) -> Self {
        Self::new_with(config, Arc::new(NoopTransport), Arc::new(AlwaysHealthy))
    }

    /// Manager with explicit transport and health probe.
    pub fn new_with(
        config: ReplicationConfig,
        transport: Arc<dyn ReplicaTransport>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let mut nodes = BTreeMap::new();
        let mut current_primary = None;
        for node in &config.nodes {
            if node.is_primary {
                current_primary = Some(node.node_id.clone());
            }
            nodes.insert(node.node_id.clone(), NodeState::new(node.clone()));
        }
        // No explicit primary: highest priority wins, ties lowest id
        if current_primary.is_none() {
            let mut best: Option<(i32, String)> = None;
            for (node_id, node) in &nodes {
                match &best {
                    None => best = Some((node.config.priority, node_id.clone())),
                    Some((priority, _)) if node.config.priority > *priority => {
                        best = Some((node.config.priority, node_id.clone()))
                    }
                    _ => {}
                }
            }
            if let Some((_, node_id)) = best {
                tracing::info!(node = %node_id, "selected initial primary by priority");
                current_primary = Some(node_id);
            }
        }
        if let Some(primary) = &current_primary {
            if let Some(node) = nodes.get_mut(primary) {
                node.config.is_primary = true;
            }
        }

        Self {
            mode: config.mode,
            min_replicas: config.min_replicas,
            heartbeat_interval: config.heartbeat_interval,
            sync_timeout: config.sync_timeout,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    nodes,
                    queue: VecDeque::new(),
                    current_primary,
                    failover_callback: None,
                }),
                queue_cv: Condvar::new(),
                tick_cv: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            transport,
            probe,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Configured durability mode.
    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    /// Spawn the drain, heartbeat, and failover workers.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidArgument(
                "replication manager is already running".into(),
            ));
        }
        let mut workers = self.workers.lock();

        let shared = Arc::clone(&self.shared);
        let transport = Arc::clone(&self.transport);
        workers.push(
            std::thread::Builder::new()
                .name("quiver-repl-drain".into())
                .spawn(move || drain_loop(shared, transport))?,
        );

        let shared = Arc::clone(&self.shared);
        let probe = Arc::clone(&self.probe);
        let interval = self.heartbeat_interval;
        workers.push(
            std::thread::Builder::new()
                .name("quiver-repl-heartbeat".into())
                .spawn(move || heartbeat_loop(shared, probe, interval))?,
        );

        let shared = Arc::clone(&self.shared);
        workers.push(
            std::thread::Builder::new()
                .name("quiver-repl-failover".into())
                .spawn(move || failover_loop(shared))?,
        );

        tracing::info!(mode = ?self.mode, primary = ?self.primary(), "replication manager started");
        Ok(())
    }

    /// Stop cooperatively: clear the running flag, wake every condvar,
    /// join all workers.
    pub fn stop(&self) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidArgument(
                "replication manager is not running".into(),
            ));
        }
        self.shared.queue_cv.notify_all();
        self.shared.tick_cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        tracing::info!("replication manager stopped");
        Ok(())
    }

    /// `true` while the workers run.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Replicate an insert.
    pub fn replicate_add(
        &self,
        id: VectorId,
        vector: &[f32],
        metadata: &Metadata,
    ) -> Result<ReplicationOutcome> {
        self.submit(ReplicationOp {
            kind: OpKind::Add,
            id,
            vector: Some(vector.to_vec()),
            metadata: Some(metadata.clone()),
            timestamp_ms: now_ms(),
            source_node: self.primary().unwrap_or_default(),
        })
    }

    /// Replicate a removal.
    pub fn replicate_remove(&self, id: VectorId) -> Result<ReplicationOutcome> {
        self.submit(ReplicationOp {
            kind: OpKind::Remove,
            id,
            vector: None,
            metadata: None,
            timestamp_ms: now_ms(),
            source_node: self.primary().unwrap_or_default(),
        })
    }

    /// Replicate a metadata update.
    pub fn replicate_update(&self, id: VectorId, metadata: &Metadata) -> Result<ReplicationOutcome> {
        self.submit(ReplicationOp {
            kind: OpKind::Update,
            id,
            vector: None,
            metadata: Some(metadata.clone()),
            timestamp_ms: now_ms(),
            source_node: self.primary().unwrap_or_default(),
        })
    }

    fn submit(&self, op: ReplicationOp) -> Result<ReplicationOutcome> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Unavailable("replication manager is stopped".into()));
        }
        if self.mode == ReplicationMode::None {
            return Ok(ReplicationOutcome::Skipped);
        }
        let op = Arc::new(op);
        match self.mode {
            ReplicationMode::Async => {
                self.shared.state.lock().queue.push_back(op);
                self.shared.queue_cv.notify_one();
                Ok(ReplicationOutcome::Queued)
            }
            ReplicationMode::Sync => {
                let out = dispatch(&self.shared, &self.transport, &op, Some(self.sync_timeout), None);
                Ok(self.outcome_of(out))
            }
            ReplicationMode::SemiSync => {
                let out = dispatch(
                    &self.shared,
                    &self.transport,
                    &op,
                    Some(self.sync_timeout),
                    Some(self.min_replicas.saturating_sub(1)),
                );
                Ok(self.outcome_of(out))
            }
            ReplicationMode::None => Ok(ReplicationOutcome::Skipped),
        }
    }

    fn outcome_of(&self, out: DispatchOutcome) -> ReplicationOutcome {
        if out.acks >= out.required {
            ReplicationOutcome::Acknowledged { acks: out.acks }
        } else {
            tracing::warn!(
                acks = out.acks,
                required = out.required,
                total = out.total,
                elapsed_ms = out.elapsed.as_millis() as u64,
                "replication incomplete within timeout"
            );
            ReplicationOutcome::Incomplete {
                acks: out.acks,
                required: out.required,
                elapsed: out.elapsed,
            }
        }
    }

    /// Register a node. Duplicate ids are rejected. The first node ever
    /// registered becomes primary if none is set.
    pub fn add_replica(&self, node: NodeConfig) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.nodes.contains_key(&node.node_id) {
            return Err(Error::InvalidArgument(format!(
                "node {} already exists",
                node.node_id
            )));
        }
        tracing::info!(node = %node.node_id, "added replica");
        let node_id = node.node_id.clone();
        state.nodes.insert(node_id.clone(), NodeState::new(node));
        if state.current_primary.is_none() {
            if let Some(ns) = state.nodes.get_mut(&node_id) {
                ns.config.is_primary = true;
            }
            state.current_primary = Some(node_id);
        }
        Ok(())
    }

    /// Deregister a node. Removing the current primary is refused.
    pub fn remove_replica(&self, node_id: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.nodes.contains_key(node_id) {
            return Err(Error::NotFound(format!("node {node_id} does not exist")));
        }
        if state.current_primary.as_deref() == Some(node_id) {
            return Err(Error::InvalidArgument(
                "cannot remove the current primary".into(),
            ));
        }
        state.nodes.remove(node_id);
        tracing::info!(node = %node_id, "removed replica");
        Ok(())
    }

    /// All registered nodes, ascending by id.
    pub fn nodes(&self) -> Vec<NodeConfig> {
        self.shared
            .state
            .lock()
            .nodes
            .values()
            .map(|n| n.config.clone())
            .collect()
    }

    /// Current primary node id, if any node is registered.
    pub fn primary(&self) -> Option<String> {
        self.shared.state.lock().current_primary.clone()
    }

    /// `true` while at least `min_replicas` nodes are healthy.
    pub fn is_healthy(&self) -> bool {
        let state = self.shared.state.lock();
        let healthy = state.nodes.values().filter(|n| n.healthy).count();
        healthy >= self.min_replicas
    }

    /// Health and counter snapshot for one node.
    pub fn replica_stats(&self, node_id: &str) -> Option<ReplicaStats> {
        let state = self.shared.state.lock();
        state.nodes.get(node_id).map(|n| ReplicaStats {
            node_id: n.config.node_id.clone(),
            healthy: n.healthy,
            lag: n.lag,
            operations_replicated: n.replicated,
            operations_failed: n.failed,
        })
    }

    /// Force a node's health flag. Administrative seam; the heartbeat loop
    /// may overrule it on the next probe.
    pub fn set_node_health(&self, node_id: &str, healthy: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        let Some(node) = state.nodes.get_mut(node_id) else {
            return Err(Error::NotFound(format!("node {node_id} does not exist")));
        };
        node.healthy = healthy;
        if healthy {
            node.last_heartbeat = Instant::now();
        }
        Ok(())
    }

    /// Invoked with the new primary's id after every promotion.
    pub fn set_failover_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.state.lock().failover_callback = Some(Arc::new(callback));
    }

    /// Promote the best healthy replica now. No-op (with an error log) when
    /// no healthy candidate exists.
    pub fn trigger_failover(&self) -> Result<()> {
        let promoted = {
            let mut state = self.shared.state.lock();
            failover_locked(&mut state)
        };
        if let Some((new_primary, Some(callback))) = promoted {
            callback(&new_primary);
        }
        Ok(())
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Async-mode queue drain. One operation is fanned out completely before
/// the next is popped; that serialization is the per-replica order
/// guarantee.
fn drain_loop(shared: Arc<Shared>, transport: Arc<dyn ReplicaTransport>) {
    tracing::debug!("replication drain worker started");
    loop {
        let op = {
            let mut state = shared.state.lock();
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    tracing::debug!("replication drain worker stopped");
                    return;
                }
                if let Some(op) = state.queue.pop_front() {
                    break op;
                }
                shared
                    .queue_cv
                    .wait_for(&mut state, Duration::from_millis(100));
            }
        };
        let out = dispatch(&shared, &transport, &op, None, None);
        if out.acks < out.total {
            tracing::warn!(
                acks = out.acks,
                total = out.total,
                "async replication fan-out had failures"
            );
        }
    }
}

/// Probe every node each interval. A node whose last heartbeat is older
/// than three intervals goes unhealthy; a successful probe brings it back.
fn heartbeat_loop(shared: Arc<Shared>, probe: Arc<dyn HealthProbe>, interval: Duration) {
    tracing::debug!("heartbeat worker started");
    loop {
        {
            let mut state = shared.state.lock();
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            shared.tick_cv.wait_for(&mut state, interval);
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let targets: Vec<NodeConfig> = {
            let state = shared.state.lock();
            state.nodes.values().map(|n| n.config.clone()).collect()
        };
        for node in targets {
            let alive = probe.probe(&node);
            let mut state = shared.state.lock();
            let Some(ns) = state.nodes.get_mut(&node.node_id) else {
                continue;
            };
            if alive {
                ns.last_heartbeat = Instant::now();
                if !ns.healthy {
                    tracing::info!(node = %node.node_id, "replica recovered");
                    ns.healthy = true;
                }
            } else if ns.healthy && ns.last_heartbeat.elapsed() > interval * 3 {
                tracing::warn!(node = %node.node_id, "replica missed heartbeats, marking unhealthy");
                ns.healthy = false;
            }
        }
    }
    tracing::debug!("heartbeat worker stopped");
}

/// Poll the primary's health once per second and fail over when it drops.
fn failover_loop(shared: Arc<Shared>) {
    tracing::debug!("failover worker started");
    loop {
        let promoted = {
            let mut state = shared.state.lock();
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            shared.tick_cv.wait_for(&mut state, Duration::from_secs(1));
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            let primary_down = state
                .current_primary
                .as_ref()
                .and_then(|p| state.nodes.get(p))
                .map(|n| !n.healthy)
                .unwrap_or(false);
            if primary_down {
                tracing::warn!(primary = ?state.current_primary, "primary unhealthy, failing over");
                failover_locked(&mut state)
            } else {
                None
            }
        };
        if let Some((new_primary, Some(callback))) = promoted {
            callback(&new_primary);
        }
    }
    tracing::debug!("failover worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, priority: i32, primary: bool) -> NodeConfig {
        NodeConfig {
            node_id: id.to_string(),
            host: "localhost".to_string(),
            port: 8080,
            priority,
            is_primary: primary,
        }
    }

    fn three_node_config(mode: ReplicationMode) -> ReplicationConfig {
        ReplicationConfig {
            mode,
            min_replicas: 2,
            heartbeat_interval: Duration::from_millis(20),
            sync_timeout: Duration::from_millis(500),
            nodes: vec![
                node("node1", 10, true),
                node("node2", 5, false),
                node("node3", 3, false),
            ],
        }
    }

    #[test]
    fn test_primary_detection_from_flag() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::Async));
        assert_eq!(mgr.primary().as_deref(), Some("node1"));
    }

    #[test]
    fn test_primary_by_priority_when_unflagged() {
        let mut config = three_node_config(ReplicationMode::Async);
        for n in &mut config.nodes {
            n.is_primary = false;
        }
        let mgr = ReplicationManager::new(config);
        assert_eq!(mgr.primary().as_deref(), Some("node1"));
    }

    #[test]
    fn test_submit_when_stopped_is_unavailable() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::Async));
        let err = mgr.replicate_remove(1).unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[test]
    fn test_mode_none_skips() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::None));
        mgr.start().unwrap();
        assert_eq!(
            mgr.replicate_remove(1).unwrap(),
            ReplicationOutcome::Skipped
        );
        mgr.stop().unwrap();
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::Async));
        mgr.start().unwrap();
        assert!(mgr.is_running());
        assert!(mgr.start().is_err());
        mgr.stop().unwrap();
        assert!(!mgr.is_running());
        assert!(mgr.stop().is_err());
    }

    #[test]
    fn test_sync_replication_acknowledges() {
        let transport = Arc::new(InMemoryTransport::new());
        let mgr = ReplicationManager::new_with(
            three_node_config(ReplicationMode::Sync),
            Arc::clone(&transport) as Arc<dyn ReplicaTransport>,
            Arc::new(AlwaysHealthy),
        );
        mgr.start().unwrap();
        let outcome = mgr.replicate_add(7, &[1.0, 2.0], &Metadata::new()).unwrap();
        assert_eq!(outcome, ReplicationOutcome::Acknowledged { acks: 2 });
        assert_eq!(transport.count_for("node2"), 1);
        assert_eq!(transport.count_for("node3"), 1);
        assert_eq!(transport.count_for("node1"), 0); // never to the primary
        mgr.stop().unwrap();
    }

    #[test]
    fn test_add_remove_replica() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::Async));
        mgr.add_replica(node("node4", 1, false)).unwrap();
        assert!(matches!(
            mgr.add_replica(node("node4", 1, false)),
            Err(Error::InvalidArgument(_))
        ));
        mgr.remove_replica("node4").unwrap();
        assert!(matches!(
            mgr.remove_replica("node4"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            mgr.remove_replica("node1"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_first_replica_becomes_primary() {
        let mgr = ReplicationManager::new(ReplicationConfig::default());
        assert_eq!(mgr.primary(), None);
        mgr.add_replica(node("solo", 1, false)).unwrap();
        assert_eq!(mgr.primary().as_deref(), Some("solo"));
    }

    #[test]
    fn test_failover_priority_order() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::Async));
        let promoted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&promoted);
        mgr.set_failover_callback(move |name| seen.lock().push(name.to_string()));

        mgr.set_node_health("node1", false).unwrap();
        mgr.trigger_failover().unwrap();
        assert_eq!(mgr.primary().as_deref(), Some("node2"));

        mgr.set_node_health("node2", false).unwrap();
        mgr.trigger_failover().unwrap();
        assert_eq!(mgr.primary().as_deref(), Some("node3"));

        assert_eq!(*promoted.lock(), vec!["node2".to_string(), "node3".to_string()]);
    }

    #[test]
    fn test_failover_without_candidates_keeps_primary() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::Async));
        for n in ["node1", "node2", "node3"] {
            mgr.set_node_health(n, false).unwrap();
        }
        mgr.trigger_failover().unwrap();
        assert_eq!(mgr.primary().as_deref(), Some("node1"));
    }

    #[test]
    fn test_failover_tie_breaks_to_lowest_id() {
        let config = ReplicationConfig {
            nodes: vec![
                node("alpha", 5, false),
                node("beta", 5, false),
                node("primary", 10, true),
            ],
            ..ReplicationConfig::default()
        };
        let mgr = ReplicationManager::new(config);
        mgr.set_node_health("primary", false).unwrap();
        mgr.trigger_failover().unwrap();
        assert_eq!(mgr.primary().as_deref(), Some("alpha"));
    }

    #[test]
    fn test_is_healthy_counts_nodes() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::Async));
        assert!(mgr.is_healthy());
        mgr.set_node_health("node3", false).unwrap();
        assert!(mgr.is_healthy()); // 2 healthy >= min_replicas 2
        mgr.set_node_health("node2", false).unwrap();
        assert!(!mgr.is_healthy());
    }

    #[test]
    fn test_replica_stats() {
        let mgr = ReplicationManager::new(three_node_config(ReplicationMode::Async));
        let stats = mgr.replica_stats("node2").unwrap();
        assert!(stats.healthy);
        assert_eq!(stats.operations_replicated, 0);
        assert!(mgr.replica_stats("ghost").is_none());
    }
}
