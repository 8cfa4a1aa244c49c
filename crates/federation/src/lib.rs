//! Hashgraph federation
//!
//! This crate implements the replicated side of Weave: the validated event
//! DAG, virtual-voting consensus over it, the peer registry and the gossip
//! relay, plus a node runtime that ties them to a transport.

pub mod consensus;
pub mod gossip;
pub mod hashgraph;
pub mod log;
pub mod node;
pub mod registry;
pub mod simulation;
pub mod storage;
pub mod transport;

// Re-export key types
pub use consensus::{ConsensusEngine, ConsensusUpdate};
pub use gossip::{GossipConfig, GossipRelay, GossipStats, Outbound, RelayOutcome, Target};
pub use hashgraph::Hashgraph;
pub use log::{ConsensusCheckpoint, EventLog, MemoryLog, NullLog, SledLog, StorageError};
pub use node::{Node, NodeConfig, NodeStats, PeerSession, RelayError};
pub use registry::{
    is_supermajority, ChannelSink, DeliveryError, PeerEntry, PeerRegistry, PeerSink, PeerSnapshot,
};
pub use simulation::{Simulation, SimulationConfig, SimulationReport};
pub use storage::{Ancestors, EventStore, InsertError, InsertOutcome, StoreConfig};
pub use transport::{connect, link_in_memory, spawn_listener};
