use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use super::{NodeId, RaftError, RaftMessage, Term};
use crate::metrics::ElectionCounters;
use crate::network::{Envelope, Transport};

/// Fixed membership of the cluster, built once before any node starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRegistry {
    members: Vec<NodeId>,
}

impl PeerRegistry {
    pub fn new<I: IntoIterator<Item = NodeId>>(ids: I) -> Result<Self, RaftError> {
        let unique: BTreeSet<NodeId> = ids.into_iter().collect();
        if unique.is_empty() {
            return Err(RaftError::InvalidConfig(
                "cluster must have at least one member".to_string(),
            ));
        }
        Ok(Self {
            members: unique.into_iter().collect(),
        })
    }

    /// Registry of `size` members with ids `0..size`.
    pub fn with_size(size: usize) -> Result<Self, RaftError> {
        Self::new((0..size as u64).map(NodeId))
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.binary_search(&id).is_ok()
    }

    pub fn cluster_size(&self) -> usize {
        self.members.len()
    }

    /// Strictly more than half of all configured members.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// Distinct voters that granted a vote in one term.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    term: Term,
    voters: BTreeSet<NodeId>,
}

impl VoteTally {
    /// Starts a fresh tally for `term` holding only the self-vote.
    pub fn reset(&mut self, term: Term, self_id: NodeId) {
        self.term = term;
        self.voters.clear();
        self.voters.insert(self_id);
    }

    pub fn clear(&mut self) {
        self.voters.clear();
    }

    pub fn term(&self) -> Term {
        self.term
    }

    /// Returns false when `voter` was already counted.
    pub fn record(&mut self, voter: NodeId) -> bool {
        self.voters.insert(voter)
    }

    pub fn count(&self) -> usize {
        self.voters.len()
    }

    pub fn has_majority(&self, registry: &PeerRegistry) -> bool {
        self.count() >= registry.majority()
    }
}

/// A node's view of the cluster: who its peers are and how to reach them.
pub struct Coordinator {
    self_id: NodeId,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn Transport>,
    counters: Arc<ElectionCounters>,
}

impl Coordinator {
    pub fn new(
        self_id: NodeId,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RaftError> {
        if !registry.contains(self_id) {
            return Err(RaftError::UnknownPeer(self_id));
        }
        Ok(Self {
            self_id,
            registry,
            transport,
            counters: Arc::new(ElectionCounters::new()),
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn counters(&self) -> Arc<ElectionCounters> {
        Arc::clone(&self.counters)
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let me = self.self_id;
        self.registry.members().iter().copied().filter(move |id| *id != me)
    }

    pub fn broadcast_vote_request(&self, term: Term, candidate_id: NodeId) {
        let message = RaftMessage::RequestVote { term, candidate_id };
        for peer in self.peers() {
            self.counters.record_vote_request_sent();
            self.send(peer, message.clone());
        }
    }

    pub fn broadcast_heartbeat(&self, term: Term, leader_id: NodeId) {
        let message = RaftMessage::Heartbeat { term, leader_id };
        for peer in self.peers() {
            self.counters.record_heartbeat_sent();
            self.send(peer, message.clone());
        }
    }

    /// Fire-and-forget send. Failures are only counted; the next election or
    /// heartbeat round is the retry.
    pub fn send(&self, to: NodeId, message: RaftMessage) {
        let kind = message.kind();
        if let Err(e) = self.transport.send(Envelope::new(self.self_id, to, message)) {
            self.counters.record_send_failure();
            debug!("{} failed to send {kind} to {to}: {e}", self.self_id);
        }
    }
}
