use std::fmt;

use serde::{Deserialize, Serialize};

use super::{NodeId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Term and vote bookkeeping owned by a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub role: NodeRole,
    pub leader_id: Option<NodeId>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: NodeRole::Follower,
            leader_id: None,
        }
    }
}

impl NodeState {
    /// Moves to a strictly higher term, forgetting the vote and the leader of
    /// the previous one. Returns false when `term` is not ahead of us.
    pub fn adopt_term(&mut self, term: Term) -> bool {
        if term <= self.current_term {
            return false;
        }
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        true
    }
}

/// Point-in-time view of a node, published by its runner for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeRole,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub votes_received: usize,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}
