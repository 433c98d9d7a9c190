use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::{Envelope, Transport, TransportError};
use crate::raft::NodeId;

/// Loss and delay applied to every message sent over the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConditions {
    /// Probability in `[0, 1]` that a message is silently lost.
    pub drop_rate: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
        }
    }
}

impl NetworkConditions {
    pub fn lossy(drop_rate: f64) -> Self {
        Self {
            drop_rate,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max.max(min);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Faults {
    isolated: HashSet<NodeId>,
    groups: HashMap<NodeId, usize>,
    blocked: HashSet<(NodeId, NodeId)>,
}

impl Faults {
    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return false;
        }
        if self.blocked.contains(&(from, to)) {
            return false;
        }
        match (self.groups.get(&from), self.groups.get(&to)) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Channel-backed transport for nodes sharing one process.
///
/// Every registered node owns an unbounded inbox. Faults (isolation,
/// partitions, one-way link blocks) and random loss are applied on send.
pub struct InMemoryTransport {
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    conditions: RwLock<NetworkConditions>,
    faults: RwLock<Faults>,
    rng: Mutex<StdRng>,
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl InMemoryTransport {
    pub fn new(conditions: NetworkConditions, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            inboxes: RwLock::new(HashMap::new()),
            conditions: RwLock::new(conditions),
            faults: RwLock::new(Faults::default()),
            rng: Mutex::new(rng),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Creates the inbox for `id`, replacing any previous one.
    pub fn register(&self, id: NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    /// Removes the inbox of `id`; later sends to it fail as closed.
    pub fn deregister(&self, id: NodeId) {
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn set_conditions(&self, conditions: NetworkConditions) {
        *self.conditions.write().unwrap_or_else(PoisonError::into_inner) = conditions;
    }

    /// Cuts every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .isolated
            .insert(id);
    }

    /// Splits the cluster into groups that can only talk among themselves.
    /// Nodes not listed in any group keep talking to everyone.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut faults = self.faults.write().unwrap_or_else(PoisonError::into_inner);
        faults.groups.clear();
        for (index, group) in groups.iter().enumerate() {
            for id in group.iter() {
                faults.groups.insert(*id, index);
            }
        }
    }

    /// Drops messages travelling from `from` to `to` (one direction only).
    pub fn block_link(&self, from: NodeId, to: NodeId) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .blocked
            .insert((from, to));
    }

    /// Removes every isolation, partition, and link block.
    pub fn heal(&self) {
        *self.faults.write().unwrap_or_else(PoisonError::into_inner) = Faults::default();
    }

    pub fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        self.faults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reachable(from, to)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Decides the fate of one message: `None` when lost, otherwise the delay.
    fn roll(&self) -> Option<Duration> {
        let conditions = self
            .conditions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        if conditions.drop_rate > 0.0 && rng.random_bool(conditions.drop_rate.clamp(0.0, 1.0)) {
            return None;
        }
        if conditions.max_latency.is_zero() || conditions.min_latency >= conditions.max_latency {
            return Some(conditions.min_latency);
        }
        Some(rng.random_range(conditions.min_latency..=conditions.max_latency))
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let to = envelope.to;

        let inbox = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&to)
            .cloned();
        let Some(inbox) = inbox else {
            self.record_drop();
            return Err(TransportError::Closed(to));
        };

        if !self.is_reachable(envelope.from, to) {
            trace!("Dropping {} from {} to {}: unreachable", envelope.message.kind(), envelope.from, to);
            self.record_drop();
            return Err(TransportError::Unreachable(to));
        }

        let Some(latency) = self.roll() else {
            trace!("Dropping {} from {} to {}: lost", envelope.message.kind(), envelope.from, to);
            self.record_drop();
            return Ok(());
        };

        if latency.is_zero() {
            return match inbox.send(envelope) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => {
                    self.record_drop();
                    Err(TransportError::Closed(to))
                }
            };
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // Counted as delivered on hand-off; a receiver that goes away
                // in the meantime just never sees it.
                self.delivered.fetch_add(1, Ordering::Relaxed);
                handle.spawn(async move {
                    sleep(latency).await;
                    if inbox.send(envelope).is_err() {
                        debug!("Delayed message to {to} arrived after its inbox closed");
                    }
                });
                Ok(())
            }
            Err(_) => match inbox.send(envelope) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => {
                    self.record_drop();
                    Err(TransportError::Closed(to))
                }
            },
        }
    }
}
