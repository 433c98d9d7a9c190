// Election core
pub mod raft;
pub mod network;

// Collaborator interfaces and the simulation driver
pub mod config;
pub mod events;
pub mod metrics;
pub mod simulation;

// Public exports
pub use config::{NetworkConfig, SimulationConfig};
pub use raft::{NodeId, NodeRole, RaftConfig, RaftError, RaftMessage, RaftNode, Term};
pub use simulation::{Simulation, SimulationReport};
