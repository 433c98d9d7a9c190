pub mod error;
pub mod memory;

pub use error::TransportError;
pub use memory::{InMemoryTransport, NetworkConditions, TransportStats};

use serde::{Deserialize, Serialize};

use crate::raft::{NodeId, RaftMessage};

/// A message in flight between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, message: RaftMessage) -> Self {
        Self { from, to, message }
    }
}

/// Delivers envelopes to peers' inboxes.
///
/// Sends are fire-and-forget: a returned error only tells the caller the
/// message was not handed over, and a successful send may still be lost.
pub trait Transport: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}
