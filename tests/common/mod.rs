#![allow(dead_code)]

//! Lockstep cluster harness: every node shares one manual clock and one
//! message queue, so tests decide exactly when timers fire and in which
//! order messages arrive. Safety invariants are checked after every step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use elector::events::{EventKind, MemoryEventSink};
use elector::metrics::MemoryMetricsSink;
use elector::network::{Envelope, Transport, TransportError};
use elector::raft::{Clock, Coordinator, ManualClock, PeerRegistry};
use elector::{NodeId, NodeRole, RaftConfig, RaftNode, Term};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

// Upper bound on deliveries in one drain; only a livelock gets near it.
const MAX_DRAIN: usize = 100_000;

struct QueueState {
    queue: VecDeque<Envelope>,
    isolated: HashSet<NodeId>,
    drop_rate: f64,
    rng: StdRng,
    dropped: u64,
}

/// Transport that parks every envelope in a FIFO until the harness delivers it.
pub struct QueueTransport {
    state: Mutex<QueueState>,
}

impl QueueTransport {
    fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                isolated: HashSet::new(),
                drop_rate: 0.0,
                rng: StdRng::seed_from_u64(seed),
                dropped: 0,
            }),
        }
    }

    pub fn pending(&self) -> Vec<Envelope> {
        self.state.lock().unwrap().queue.iter().cloned().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }

    /// Removes the envelope at `index`. Returns None if it was lost to a
    /// fault that appeared after it was sent.
    fn take(&self, index: usize) -> Option<Envelope> {
        let mut state = self.state.lock().unwrap();
        let envelope = state.queue.remove(index)?;
        if state.isolated.contains(&envelope.from) || state.isolated.contains(&envelope.to) {
            state.dropped += 1;
            return None;
        }
        Some(envelope)
    }

    fn position<F: Fn(&Envelope) -> bool>(&self, pred: F) -> Option<usize> {
        self.state.lock().unwrap().queue.iter().position(pred)
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

impl Transport for QueueTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.isolated.contains(&envelope.from) || state.isolated.contains(&envelope.to) {
            return Err(TransportError::Unreachable(envelope.to));
        }
        let drop_rate = state.drop_rate;
        if drop_rate > 0.0 && state.rng.random_bool(drop_rate) {
            state.dropped += 1;
            return Ok(());
        }
        state.queue.push_back(envelope);
        Ok(())
    }
}

pub struct Cluster {
    pub clock: ManualClock,
    pub transport: Arc<QueueTransport>,
    pub events: MemoryEventSink,
    pub metrics: MemoryMetricsSink,
    nodes: Vec<RaftNode>,
    leaders_by_term: HashMap<Term, NodeId>,
    votes: HashMap<(NodeId, Term), NodeId>,
    last_terms: Vec<Term>,
}

impl Cluster {
    pub fn new(size: usize, seed: u64) -> Self {
        Self::with_config(size, &RaftConfig::default(), seed)
    }

    pub fn with_config(size: usize, config: &RaftConfig, seed: u64) -> Self {
        let clock = ManualClock::new();
        let transport = Arc::new(QueueTransport::new(seed));
        let events = MemoryEventSink::new();
        let metrics = MemoryMetricsSink::new();
        let registry = Arc::new(PeerRegistry::with_size(size).expect("registry"));

        let nodes = registry
            .members()
            .iter()
            .map(|&id| {
                let coordinator =
                    Coordinator::new(id, Arc::clone(&registry), transport.clone()).expect("member");
                RaftNode::new(config, coordinator, Arc::new(clock.clone()))
                    .expect("valid config")
                    .with_seed(seed.wrapping_mul(31).wrapping_add(id.0))
                    .with_event_sink(Arc::new(events.clone()))
                    .with_metrics_sink(Arc::new(metrics.clone()))
            })
            .collect();

        Self {
            clock,
            transport,
            events,
            metrics,
            nodes,
            leaders_by_term: HashMap::new(),
            votes: HashMap::new(),
            last_terms: vec![0; size],
        }
    }

    pub fn start(&mut self) {
        for node in self.nodes.iter_mut() {
            node.start();
        }
        self.check_invariants();
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: u64) -> &RaftNode {
        &self.nodes[id as usize]
    }

    pub fn isolate(&self, id: u64) {
        self.transport.state.lock().unwrap().isolated.insert(NodeId(id));
    }

    pub fn heal(&self) {
        self.transport.state.lock().unwrap().isolated.clear();
    }

    pub fn set_drop_rate(&self, drop_rate: f64) {
        self.transport.state.lock().unwrap().drop_rate = drop_rate;
    }

    /// Fires a node's election timer right now, whatever its deadline.
    pub fn fire_timeout(&mut self, id: u64) {
        self.nodes[id as usize].on_election_timeout();
        self.check_invariants();
    }

    fn deliver_at(&mut self, index: usize) -> bool {
        if index >= self.transport.len() {
            return false;
        }
        if let Some(envelope) = self.transport.take(index) {
            let to = envelope.to.0 as usize;
            self.nodes[to].handle_envelope(envelope);
            self.check_invariants();
        }
        true
    }

    /// Delivers the oldest queued envelope. Returns false if the queue was empty.
    pub fn deliver_one(&mut self) -> bool {
        self.deliver_at(0)
    }

    /// Delivers the `n`th queued envelope (modulo queue length), reordering traffic.
    pub fn deliver_nth(&mut self, n: usize) -> bool {
        match self.transport.len() {
            0 => false,
            len => self.deliver_at(n % len),
        }
    }

    /// Delivers the first queued envelope matching `pred`, out of order.
    pub fn deliver_first<F: Fn(&Envelope) -> bool>(&mut self, pred: F) -> bool {
        match self.transport.position(pred) {
            Some(index) => self.deliver_at(index),
            None => false,
        }
    }

    /// Delivers until the queue is empty, replies included.
    pub fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        while self.deliver_one() {
            delivered += 1;
            assert!(delivered < MAX_DRAIN, "message storm: queue never drained");
        }
        delivered
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.nodes
            .iter()
            .filter_map(|n| n.next_deadline().map(|(at, _)| at))
            .min()
    }

    /// Moves the clock to the earliest armed timer and fires everything due,
    /// in node id order, before any message is delivered.
    pub fn advance(&mut self) -> Option<Instant> {
        let at = self.next_deadline()?;
        self.clock.advance_to(at);
        for i in 0..self.nodes.len() {
            self.nodes[i].fire_due_timers();
            self.check_invariants();
        }
        Some(at)
    }

    /// One round: fire the next timers, then drain the network.
    pub fn step(&mut self) -> bool {
        let advanced = self.advance().is_some();
        self.deliver_all();
        advanced
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Steps until `pred` holds or `limit` of virtual time has passed.
    pub fn run_until<F: Fn(&Cluster) -> bool>(&mut self, limit: Duration, pred: F) -> bool {
        let stop_at = self.clock.now() + limit;
        loop {
            if pred(self) {
                return true;
            }
            match self.next_deadline() {
                Some(at) if at <= stop_at => {
                    self.step();
                }
                _ => return pred(self),
            }
        }
    }

    pub fn run_for(&mut self, duration: Duration) {
        let target = self.clock.now() + duration;
        self.run_until(duration, |_| false);
        self.clock.advance_to(target);
    }

    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leader())
            .map(|n| n.id())
            .collect()
    }

    /// Leader with the highest term among `ids`, if any.
    pub fn leader_among(&self, ids: &[u64]) -> Option<(NodeId, Term)> {
        ids.iter()
            .map(|&id| self.node(id))
            .filter(|n| n.is_leader())
            .map(|n| (n.id(), n.current_term()))
            .max_by_key(|&(_, term)| term)
    }

    pub fn roles(&self) -> Vec<NodeRole> {
        self.nodes.iter().map(|n| n.role()).collect()
    }

    pub fn count_events(&self, kind: EventKind) -> usize {
        self.events.of_kind(kind).len()
    }

    pub fn leaders_by_term(&self) -> &HashMap<Term, NodeId> {
        &self.leaders_by_term
    }

    fn check_invariants(&mut self) {
        for node in &self.nodes {
            let id = node.id();
            let term = node.current_term();

            let last = &mut self.last_terms[id.0 as usize];
            assert!(term >= *last, "{id} term went backwards: {last} -> {term}");
            *last = term;

            if node.is_leader() {
                let elected = *self.leaders_by_term.entry(term).or_insert(id);
                assert_eq!(elected, id, "two leaders in term {term}");
            }

            if let Some(candidate) = node.state().voted_for {
                let vote = *self.votes.entry((id, term)).or_insert(candidate);
                assert_eq!(
                    vote, candidate,
                    "{id} voted for both {vote} and {candidate} in term {term}"
                );
            }
        }
    }
}
