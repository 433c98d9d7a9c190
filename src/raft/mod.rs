mod config;
mod coordinator;
mod error;
mod node;
mod runner;
mod state;
pub mod timer;

pub use self::config::RaftConfig;
pub use self::coordinator::{Coordinator, PeerRegistry, VoteTally};
pub use self::error::RaftError;
pub use self::node::{RaftNode, TimerKind};
pub use self::runner::NodeRunner;
pub use self::state::{NodeRole, NodeState, NodeStatus};
pub use self::timer::{Clock, ManualClock, SystemClock, TimeoutRange, Timer};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical epoch of the cluster. At most one leader is elected per term.
pub type Term = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Message types for leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote { term: Term, candidate_id: NodeId },
    RequestVoteResponse { term: Term, vote_granted: bool },
    Heartbeat { term: Term, leader_id: NodeId },
    HeartbeatAck { term: Term },
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::Heartbeat { term, .. }
            | RaftMessage::HeartbeatAck { term } => *term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "RequestVote",
            RaftMessage::RequestVoteResponse { .. } => "RequestVoteResponse",
            RaftMessage::Heartbeat { .. } => "Heartbeat",
            RaftMessage::HeartbeatAck { .. } => "HeartbeatAck",
        }
    }
}
