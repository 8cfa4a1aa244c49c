//! Peer Registry Module
//!
//! Tracks the nodes this node is connected to, the key each one signs with,
//! and a capability for handing it bytes. The member set is copy-on-write:
//! every change publishes a new immutable map and bumps the version, so a
//! snapshot taken for a consensus round never shifts underneath it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use weave_protocol::NodeId;

/// Errors raised when handing bytes to a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Peer connection is closed")]
    Closed,
}

/// Something that can accept bytes destined for a peer.
pub trait PeerSink: Send + Sync {
    /// Queue `bytes` for delivery without blocking.
    fn deliver(&self, bytes: Vec<u8>) -> Result<(), DeliveryError>;
}

/// Sink feeding a bounded channel drained by the peer's writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl PeerSink for ChannelSink {
    fn deliver(&self, bytes: Vec<u8>) -> Result<(), DeliveryError> {
        self.tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// A registered peer.
pub struct PeerEntry {
    pub node_id: NodeId,
    pub public_key: VerifyingKey,
    pub sink: Arc<dyn PeerSink>,
}

impl std::fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEntry")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Strictly more than two thirds of `total`.
pub fn is_supermajority(count: usize, total: usize) -> bool {
    count * 3 > total.max(1) * 2
}

/// Immutable view of the member set at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    version: u64,
    members: BTreeSet<NodeId>,
}

impl PeerSnapshot {
    /// Snapshot over a fixed member set, outside of any registry.
    pub fn from_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            version: 0,
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of members, never less than one.
    pub fn size(&self) -> usize {
        self.members.len().max(1)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.members.contains(node_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter()
    }

    pub fn is_supermajority(&self, count: usize) -> bool {
        is_supermajority(count, self.size())
    }
}

struct RegistryState {
    version: u64,
    peers: Arc<BTreeMap<NodeId, Arc<PeerEntry>>>,
}

/// Registry of connected peers. Cloning shares the same registry.
#[derive(Clone)]
pub struct PeerRegistry {
    local_id: NodeId,
    state: Arc<RwLock<RegistryState>>,
}

impl PeerRegistry {
    /// Create a registry for the node `local_id`, which is always a member.
    pub fn new(local_id: impl Into<NodeId>) -> Self {
        Self {
            local_id: local_id.into(),
            state: Arc::new(RwLock::new(RegistryState {
                version: 0,
                peers: Arc::new(BTreeMap::new()),
            })),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Insert or replace the entry for `node_id`.
    pub async fn register(
        &self,
        node_id: NodeId,
        public_key: VerifyingKey,
        sink: Arc<dyn PeerSink>,
    ) {
        let mut state = self.state.write().await;
        let mut peers = (*state.peers).clone();
        let is_new = !peers.contains_key(&node_id);
        peers.insert(
            node_id.clone(),
            Arc::new(PeerEntry {
                node_id: node_id.clone(),
                public_key,
                sink,
            }),
        );
        state.peers = Arc::new(peers);
        if is_new {
            state.version += 1;
            info!("Registered peer {} (registry v{})", short_id(&node_id), state.version);
        }
    }

    /// Remove `node_id`. Returns whether it was registered.
    pub async fn unregister(&self, node_id: &str) -> bool {
        let mut state = self.state.write().await;
        if !state.peers.contains_key(node_id) {
            return false;
        }
        let mut peers = (*state.peers).clone();
        peers.remove(node_id);
        state.peers = Arc::new(peers);
        state.version += 1;
        info!("Unregistered peer {} (registry v{})", short_id(node_id), state.version);
        true
    }

    /// Current member set: the local node plus every registered peer.
    pub async fn snapshot(&self) -> PeerSnapshot {
        let state = self.state.read().await;
        let mut members: BTreeSet<NodeId> = state.peers.keys().cloned().collect();
        members.insert(self.local_id.clone());
        PeerSnapshot {
            version: state.version,
            members,
        }
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<PeerEntry>> {
        self.state.read().await.peers.get(node_id).cloned()
    }

    /// Registered peers, excluding the local node.
    pub async fn peers(&self) -> Vec<Arc<PeerEntry>> {
        self.state.read().await.peers.values().cloned().collect()
    }

    /// Directory listing of member ids in order.
    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.snapshot().await.members.into_iter().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.len()
    }
}

pub(crate) fn short_id(node_id: &str) -> &str {
    node_id.get(..8).unwrap_or(node_id)
}
