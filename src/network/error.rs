use thiserror::Error;

use crate::raft::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(NodeId),

    #[error("Inbox closed: {0}")]
    Closed(NodeId),
}
