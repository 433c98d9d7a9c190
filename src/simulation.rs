use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::SimulationConfig;
use crate::events::EventSink;
use crate::metrics::{CountersSnapshot, ElectionCounters, MetricsSink};
use crate::network::{InMemoryTransport, TransportStats};
use crate::raft::{
    Clock, Coordinator, NodeId, NodeRunner, NodeStatus, PeerRegistry, RaftError, RaftNode,
    SystemClock,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Distinct, reproducible per-node seed derived from the run seed.
fn node_seed(seed: u64, id: NodeId) -> u64 {
    seed ^ id.0.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

pub struct NodeHandle {
    id: NodeId,
    status: watch::Receiver<NodeStatus>,
    counters: Arc<ElectionCounters>,
    task: Option<JoinHandle<NodeStatus>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub status: NodeStatus,
    pub counters: CountersSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub nodes: Vec<NodeReport>,
    pub transport: TransportStats,
    pub elapsed_ms: u64,
}

impl SimulationReport {
    pub fn leaders(&self) -> Vec<&NodeStatus> {
        self.nodes
            .iter()
            .map(|n| &n.status)
            .filter(|s| s.is_leader())
            .collect()
    }
}

/// An in-process cluster: one task per node, all talking over an
/// [`InMemoryTransport`].
pub struct Simulation {
    config: SimulationConfig,
    registry: Arc<PeerRegistry>,
    transport: Arc<InMemoryTransport>,
    shutdown: CancellationToken,
    pending: Vec<NodeRunner>,
    nodes: Vec<NodeHandle>,
    started_at: Option<Instant>,
}

impl Simulation {
    pub fn new(
        config: SimulationConfig,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, RaftError> {
        config.validate()?;

        let registry = Arc::new(PeerRegistry::with_size(config.cluster_size)?);
        let transport = Arc::new(InMemoryTransport::new(
            config.network.conditions(),
            config.seed,
        ));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let shutdown = CancellationToken::new();

        let mut pending = Vec::with_capacity(registry.cluster_size());
        let mut nodes = Vec::with_capacity(registry.cluster_size());
        for &id in registry.members() {
            let inbox = transport.register(id);
            let coordinator = Coordinator::new(id, Arc::clone(&registry), transport.clone())?;
            let counters = coordinator.counters();

            let mut node = RaftNode::new(&config.raft, coordinator, Arc::clone(&clock))?
                .with_event_sink(Arc::clone(&events))
                .with_metrics_sink(Arc::clone(&metrics));
            if let Some(seed) = config.seed {
                node = node.with_seed(node_seed(seed, id));
            }

            let (runner, status) = NodeRunner::new(node, inbox, shutdown.child_token());
            pending.push(runner);
            nodes.push(NodeHandle {
                id,
                status,
                counters,
                task: None,
            });
        }

        Ok(Self {
            config,
            registry,
            transport,
            shutdown,
            pending,
            nodes,
            started_at: None,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &InMemoryTransport {
        &self.transport
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Spawns one task per node. Must be called inside a tokio runtime.
    pub fn start(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        info!(
            "Starting simulation with {} nodes (election timeout {}-{}ms, heartbeat {}ms)",
            self.registry.cluster_size(),
            self.config.raft.election_timeout_min,
            self.config.raft.election_timeout_max,
            self.config.raft.heartbeat_interval
        );
        self.started_at = Some(Instant::now());
        for (runner, handle) in self.pending.drain(..).zip(self.nodes.iter_mut()) {
            handle.task = Some(tokio::spawn(runner.run()));
        }
    }

    pub fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.nodes.iter().find(|n| n.id == id).map(NodeHandle::status)
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(NodeHandle::status).collect()
    }

    pub fn leaders(&self) -> Vec<NodeStatus> {
        self.statuses().into_iter().filter(|s| s.is_leader()).collect()
    }

    /// Waits until some node reports itself leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeStatus> {
        let all: Vec<NodeId> = self.registry.members().to_vec();
        self.wait_for_leader_among(&all, timeout).await
    }

    /// Waits until one of `ids` reports itself leader. Leaders outside the
    /// group (say, on the far side of a partition) are not considered.
    pub async fn wait_for_leader_among(
        &self,
        ids: &[NodeId],
        timeout: Duration,
    ) -> Option<NodeStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let leader = self
                .statuses()
                .into_iter()
                .filter(|s| ids.contains(&s.id) && s.is_leader())
                .max_by_key(|s| s.term);
            if leader.is_some() {
                return leader;
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn run_for(&self, duration: Duration) {
        sleep(duration).await;
    }

    pub fn isolate(&self, id: NodeId) {
        info!("Isolating {id}");
        self.transport.isolate(id);
    }

    pub fn partition(&self, groups: &[&[NodeId]]) {
        info!("Partitioning cluster into {} groups", groups.len());
        self.transport.partition(groups);
    }

    pub fn heal(&self) {
        info!("Healing network");
        self.transport.heal();
    }

    /// Crashes a node: its inbox disappears and its task stops.
    pub fn crash(&self, id: NodeId) {
        info!("Crashing {id}");
        self.transport.deregister(id);
    }

    /// Signals every node to stop after its current iteration and collects
    /// their final state.
    pub async fn shutdown(mut self) -> SimulationReport {
        self.shutdown.cancel();

        let mut reports = Vec::with_capacity(self.nodes.len());
        for handle in self.nodes.iter_mut() {
            let status = match handle.task.take() {
                Some(task) => match task.await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("{} task failed: {e}", handle.id);
                        handle.status()
                    }
                },
                None => handle.status(),
            };
            reports.push(NodeReport {
                status,
                counters: handle.counters(),
            });
        }

        let elapsed_ms = self
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        info!("Simulation stopped after {elapsed_ms}ms");

        SimulationReport {
            nodes: reports,
            transport: self.transport.stats(),
            elapsed_ms,
        }
    }
}
