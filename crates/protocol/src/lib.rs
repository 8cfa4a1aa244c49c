//! Weave protocol types
//!
//! This crate defines the hashgraph event format, the signing identity of a
//! node, the messages exchanged between peers and the shared consensus
//! metadata types used across the federation and adapter crates.

pub mod crypto;
pub mod dag;
pub mod errors;
pub mod events;
pub mod wire;

pub use crypto::{node_id_for, parse_public_key, verify, CryptoError, Identity};
pub use dag::{ConsensusPosition, DagStats, EventView, Fame, RoundSummary, WitnessSummary};
pub use errors::ProtocolError;
pub use events::{Event, EventHash, EventSignature, NodeId};
pub use wire::{EventMessage, WireMessage};

// Re-export key types for convenience
pub use ed25519_dalek::VerifyingKey;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Version of the Weave protocol
pub const PROTOCOL_VERSION: &str = "0.1.0";
