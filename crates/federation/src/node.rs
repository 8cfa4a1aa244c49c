//! Node Management Module
//!
//! This module implements a Weave node: its identity, the shared hashgraph
//! behind one read/write lock, the peer registry, the gossip relay and the
//! background tasks that drive them (consensus recompute, anti-entropy and
//! local event creation).
//!
//! Lock order is relay, then graph. The registry lock is never held while
//! either of the other two is taken.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};
use weave_protocol::{
    node_id_for, DagStats, Event, EventHash, EventView, Identity, NodeId, ProtocolError,
    RoundSummary, VerifyingKey, WireMessage,
};

use crate::consensus::ConsensusUpdate;
use crate::gossip::{GossipConfig, GossipRelay, GossipStats, Outbound, Target};
use crate::hashgraph::Hashgraph;
use crate::log::SledLog;
use crate::registry::{short_id, ChannelSink, DeliveryError, PeerRegistry};
use crate::storage::StoreConfig;
use crate::transport;

/// How long `start` waits for initial peers to finish their handshakes.
const HANDSHAKE_WAIT: Duration = Duration::from_secs(10);

/// Configuration for a Weave node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node's listen address for peer connections
    pub listen_addr: SocketAddr,
    /// Address of the read-only HTTP query API, if enabled
    pub http_addr: Option<SocketAddr>,
    /// Database path for the event log (in-memory when unset)
    pub db_path: Option<String>,
    /// Node's human-readable name
    pub name: String,
    /// Initial peers to connect to
    pub initial_peers: Vec<SocketAddr>,
    /// Registered peers required before consensus runs. Defaults to the
    /// number of initial peers.
    pub min_peers: Option<usize>,
    /// Hex-encoded Ed25519 secret key (generated when unset)
    pub secret_key: Option<String>,
    /// Gossip settings
    pub gossip: GossipConfig,
    /// Event store settings
    pub store: StoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            http_addr: None,
            db_path: None,
            name: "weave-node".to_string(),
            initial_peers: Vec::new(),
            min_peers: None,
            secret_key: None,
            gossip: GossipConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Routing failures when sending to a peer.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Unknown target peer: {peer}")]
    PeerUnknownTarget { peer: NodeId },

    #[error("Delivery to {peer} failed: {source}")]
    DeliveryFailed { peer: NodeId, source: DeliveryError },

    #[error("Failed to encode message: {source}")]
    Encoding { source: ProtocolError },
}

/// Node-wide statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub name: String,
    pub peers: usize,
    pub dag: DagStats,
    pub gossip: GossipStats,
}

/// Channels the transport uses to talk to one peer session.
pub struct PeerSession {
    pub node_id: NodeId,
    /// Raw inbound messages from the peer
    pub inbound: mpsc::Sender<Vec<u8>>,
    /// Raw outbound messages for the peer
    pub outbound: mpsc::Receiver<Vec<u8>>,
}

struct SessionHandle {
    id: u64,
    task: JoinHandle<()>,
}

struct NodeInner {
    config: NodeConfig,
    identity: Identity,
    graph: RwLock<Hashgraph>,
    registry: PeerRegistry,
    relay: Mutex<GossipRelay>,
    /// Transactions waiting for the next local event
    pending: Mutex<Vec<Vec<u8>>>,
    /// Other parent of the last local event
    last_other_parent: Mutex<Option<EventHash>>,
    recompute: Notify,
    sessions: Mutex<HashMap<NodeId, SessionHandle>>,
    next_session: Mutex<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// A Weave federation node. Cloning shares the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a new Weave node
    pub fn new(config: NodeConfig) -> Result<Self> {
        let identity = match &config.secret_key {
            Some(secret) => Identity::from_secret_hex(secret).context("Invalid secret key")?,
            None => Identity::generate().context("Failed to generate node identity")?,
        };

        let graph = match &config.db_path {
            Some(path) => {
                let log = SledLog::open(path)
                    .with_context(|| format!("Failed to open event log at {}", path))?;
                Hashgraph::with_log(config.store.clone(), Box::new(log))
                    .context("Failed to restore event log")?
            }
            None => Hashgraph::new(config.store.clone()),
        };

        let registry = PeerRegistry::new(identity.node_id());
        let relay = GossipRelay::new(config.gossip.clone());
        let (shutdown, _) = watch::channel(false);

        info!("Created node {} ({})", config.name, short_id(identity.node_id()));

        Ok(Node {
            inner: Arc::new(NodeInner {
                config,
                identity,
                graph: RwLock::new(graph),
                registry,
                relay: Mutex::new(relay),
                pending: Mutex::new(Vec::new()),
                last_other_parent: Mutex::new(None),
                recompute: Notify::new(),
                sessions: Mutex::new(HashMap::new()),
                next_session: Mutex::new(0),
                tasks: Mutex::new(Vec::new()),
                shutdown,
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        self.inner.identity.node_id()
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.inner.identity.verifying_key()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// Shared hashgraph state. Queries take the read side.
    pub fn graph(&self) -> &RwLock<Hashgraph> {
        &self.inner.graph
    }

    /// Start networking and the background tasks
    pub async fn start(&self) -> Result<SocketAddr> {
        let listen_addr = self.inner.config.listen_addr;
        info!("Starting Weave node on {}", listen_addr);

        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", listen_addr))?;
        let local_addr = listener.local_addr()?;
        info!("Node listening on {}", local_addr);

        let accept = transport::spawn_listener(self.clone(), listener);
        self.inner.tasks.lock().await.push(accept);

        let mut connected = 0;
        for peer_addr in &self.inner.config.initial_peers {
            match transport::connect(self, *peer_addr).await {
                Ok(()) => connected += 1,
                Err(e) => warn!("Failed to connect to initial peer {}: {}", peer_addr, e),
            }
        }
        self.wait_for_peers(connected, HANDSHAKE_WAIT).await;

        self.start_timers().await;
        Ok(local_addr)
    }

    /// Wait until `count` peers are registered or `limit` elapses. Returns
    /// whether enough peers showed up.
    pub async fn wait_for_peers(&self, count: usize, limit: Duration) -> bool {
        let registry = &self.inner.registry;
        let ready = timeout(limit, async {
            while registry.peer_count().await < count {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok();
        if !ready {
            warn!(
                "Only {} of {} initial peers finished their handshake",
                registry.peer_count().await,
                count
            );
        }
        ready
    }

    /// Registered peers required before consensus runs.
    pub fn min_peers(&self) -> usize {
        let config = &self.inner.config;
        config.min_peers.unwrap_or(config.initial_peers.len())
    }

    /// Start the recompute, anti-entropy and event creation timers.
    pub async fn start_timers(&self) {
        let gossip = &self.inner.config.gossip;
        let recompute_every = Duration::from_millis(gossip.recompute_interval_ms.max(1));
        let sync_every = Duration::from_millis(gossip.sync_interval_ms.max(1));
        let event_every = Duration::from_millis(gossip.event_interval_ms.max(1));

        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let recompute = tokio::spawn(async move {
            let mut timer = interval(recompute_every);
            loop {
                tokio::select! {
                    _ = node.inner.recompute.notified() => {}
                    _ = timer.tick() => {}
                    _ = shutdown.changed() => break,
                }
                node.recompute().await;
            }
        });

        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let sync = tokio::spawn(async move {
            let mut timer = interval(sync_every);
            loop {
                tokio::select! {
                    _ = timer.tick() => node.sync_tick().await,
                    _ = shutdown.changed() => break,
                }
            }
        });

        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let events = tokio::spawn(async move {
            let mut timer = interval(event_every);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = node.create_event().await {
                            warn!("Failed to create event: {:#}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        self.inner.tasks.lock().await.extend([recompute, sync, events]);
    }

    /// Shutdown the node gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down Weave node");
        self.inner.shutdown.send_replace(true);

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        let peers: Vec<NodeId> = self.inner.sessions.lock().await.keys().cloned().collect();
        for peer in peers {
            self.disconnect(&peer).await;
        }
        info!("Node shutdown complete");
    }

    // ----- sessions -----

    /// Register a connected peer and spawn the task that handles its
    /// inbound messages. The transport feeds `inbound` and drains
    /// `outbound`.
    pub async fn open_session(&self, peer_id: NodeId, public_key: VerifyingKey) -> Result<PeerSession> {
        if node_id_for(&public_key) != peer_id {
            bail!("Peer id {} does not match its public key", short_id(&peer_id));
        }
        if peer_id == self.node_id() {
            bail!("Refusing a session with ourselves");
        }

        let capacity = self.inner.config.gossip.outbound_queue_capacity.max(1);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(capacity);

        self.inner
            .registry
            .register(peer_id.clone(), public_key, Arc::new(ChannelSink::new(out_tx)))
            .await;
        {
            let mut relay = self.inner.relay.lock().await;
            relay.add_peer(peer_id.clone());
            self.inner.graph.write().await.register_key(peer_id.clone(), public_key);
        }

        let session_id = {
            let mut next = self.inner.next_session.lock().await;
            *next += 1;
            *next
        };

        let node = self.clone();
        let peer = peer_id.clone();
        let task = tokio::spawn(async move {
            while let Some(bytes) = in_rx.recv().await {
                node.handle_incoming(&peer, &bytes).await;
            }
            node.close_session(&peer, Some(session_id)).await;
        });

        if let Some(previous) = self.inner.sessions.lock().await.insert(
            peer_id.clone(),
            SessionHandle {
                id: session_id,
                task,
            },
        ) {
            previous.task.abort();
        }

        // Catch the new peer up straight away.
        let sync = WireMessage::Sync {
            known: self.inner.graph.read().await.store().heights(),
            limit: self.inner.config.gossip.max_events_per_sync,
        };
        if let Err(e) = self.send_to(&peer_id, &sync).await {
            debug!("Initial sync to {} failed: {}", short_id(&peer_id), e);
        }

        Ok(PeerSession {
            node_id: peer_id,
            inbound: in_tx,
            outbound: out_rx,
        })
    }

    /// Cancel a peer's session and forget the peer.
    pub async fn disconnect(&self, peer: &str) {
        if let Some(handle) = self.inner.sessions.lock().await.get(peer) {
            handle.task.abort();
        }
        self.close_session(peer, None).await;
    }

    /// Tear down `peer`'s state. With `session` set, only if that session
    /// is still the current one.
    async fn close_session(&self, peer: &str, session: Option<u64>) {
        {
            let mut sessions = self.inner.sessions.lock().await;
            match (sessions.get(peer), session) {
                (Some(current), Some(id)) if current.id != id => return,
                (None, Some(_)) => return,
                _ => {}
            }
            sessions.remove(peer);
        }
        self.inner.relay.lock().await.remove_peer(peer);
        if self.inner.registry.unregister(peer).await {
            info!("Peer {} disconnected", short_id(peer));
        }
    }

    /// Decode and handle one raw message from `from`.
    pub async fn handle_incoming(&self, from: &str, bytes: &[u8]) {
        let message = match WireMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed message from {}: {}", short_id(from), e);
                return;
            }
        };

        let outbound = {
            let mut relay = self.inner.relay.lock().await;
            match message {
                WireMessage::Request { hash } => {
                    let graph = self.inner.graph.read().await;
                    relay.handle_request(&graph, from, &hash)
                }
                WireMessage::Sync { known, limit } => {
                    let graph = self.inner.graph.read().await;
                    relay.handle_sync(&graph, from, &known, limit)
                }
                message => {
                    let mut graph = self.inner.graph.write().await;
                    let outcome = relay.handle_message(&mut graph, from, message);
                    if !outcome.inserted.is_empty() {
                        self.inner.recompute.notify_one();
                    }
                    outcome.outbound
                }
            }
        };

        self.dispatch(outbound).await;
    }

    // ----- sending -----

    /// Hand outbound messages to their peers. Failures are logged, never
    /// propagated: a slow or vanished peer must not stall the relay.
    pub async fn dispatch(&self, outbound: Vec<Outbound>) {
        for Outbound { target, message } in outbound {
            let peers = match target {
                Target::Peer(peer) => vec![peer],
                Target::Broadcast => self
                    .inner
                    .registry
                    .peers()
                    .await
                    .iter()
                    .map(|entry| entry.node_id.clone())
                    .collect(),
            };
            for peer in peers {
                match self.send_to(&peer, &message).await {
                    Ok(()) => {}
                    Err(RelayError::DeliveryFailed {
                        source: DeliveryError::QueueFull,
                        ..
                    }) => self.inner.relay.lock().await.record_queue_full(&peer),
                    Err(e @ RelayError::DeliveryFailed { .. }) => debug!("{}", e),
                    Err(e) => warn!("Dropping {} message: {}", message.kind(), e),
                }
            }
        }
    }

    /// Queue `message` for `peer` without waiting.
    pub async fn send_to(&self, peer: &str, message: &WireMessage) -> Result<(), RelayError> {
        let entry = self
            .inner
            .registry
            .get(peer)
            .await
            .ok_or_else(|| RelayError::PeerUnknownTarget {
                peer: peer.to_string(),
            })?;
        let bytes = message
            .to_bytes()
            .map_err(|source| RelayError::Encoding { source })?;
        entry
            .sink
            .deliver(bytes)
            .map_err(|source| RelayError::DeliveryFailed {
                peer: peer.to_string(),
                source,
            })
    }

    // ----- local events -----

    /// Queue a transaction for the next local event.
    pub async fn submit_transaction(&self, transaction: Vec<u8>) {
        self.inner.pending.lock().await.push(transaction);
    }

    /// Create, insert and gossip a local event if there is anything new to
    /// say: pending transactions, a new foreign event, or no event yet.
    pub async fn create_event(&self) -> Result<Option<EventHash>> {
        let (hash, outbound) = {
            let mut relay = self.inner.relay.lock().await;
            let mut graph = self.inner.graph.write().await;
            let mut pending = self.inner.pending.lock().await;
            let mut last_other = self.inner.last_other_parent.lock().await;

            let me = self.node_id();
            let self_parent = graph.store().latest_by_creator(me).map(|e| e.hash);
            let other_parent = graph.store().latest_foreign(me).map(|e| e.hash);
            let has_news = self_parent.is_none() || other_parent != *last_other;
            if pending.is_empty() && !has_news {
                return Ok(None);
            }

            let transactions = std::mem::take(&mut *pending);
            let event = match Event::new(
                &self.inner.identity,
                self_parent,
                other_parent,
                transactions.clone(),
                Utc::now(),
            ) {
                Ok(event) => event,
                Err(e) => {
                    *pending = transactions;
                    return Err(e).context("Failed to sign local event");
                }
            };

            let hash = event.hash;
            graph.insert(event).context("Failed to insert local event")?;
            *last_other = other_parent;
            debug!(
                "Created event {} with {} transactions",
                hash.short(),
                transactions.len()
            );
            (hash, relay.forward(&graph, &hash, None))
        };

        self.inner.recompute.notify_one();
        self.dispatch(outbound).await;
        Ok(Some(hash))
    }

    /// Run consensus against the current peer snapshot. Skipped while fewer
    /// than [`Node::min_peers`] peers are registered, so no round is voted
    /// against a partial peer set.
    pub async fn recompute(&self) -> ConsensusUpdate {
        let peers = self.inner.registry.snapshot().await;
        let required = self.min_peers();
        if peers.size() - 1 < required {
            debug!(
                "Holding consensus: {} of {} peers registered",
                peers.size() - 1,
                required
            );
            return ConsensusUpdate::default();
        }
        let update = self.inner.graph.write().await.recompute(&peers);
        if !update.ordered.is_empty() {
            info!(
                "{} events reached consensus ({} peers)",
                update.ordered.len(),
                peers.size()
            );
        }
        update
    }

    /// One anti-entropy round.
    pub async fn sync_tick(&self) {
        let outbound = {
            let mut relay = self.inner.relay.lock().await;
            let mut graph = self.inner.graph.write().await;
            relay.on_sync_tick(&mut graph)
        };
        self.dispatch(outbound).await;
    }

    // ----- queries -----

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.inner.registry.node_ids().await
    }

    pub async fn event_view(&self, hash: &EventHash) -> Option<EventView> {
        self.inner.graph.read().await.event_view(hash)
    }

    pub async fn round_summary(&self, round: u64) -> Option<RoundSummary> {
        self.inner.graph.read().await.round_summary(round)
    }

    pub async fn ordered_events(&self, since: usize) -> Vec<EventView> {
        self.inner.graph.read().await.ordered_events(since)
    }

    pub async fn ordered_transactions(&self, since: usize) -> Vec<Vec<u8>> {
        self.inner.graph.read().await.ordered_transactions(since)
    }

    pub async fn strikes(&self, peer: &str) -> u32 {
        self.inner.relay.lock().await.strikes(peer)
    }

    pub async fn stats(&self) -> NodeStats {
        let gossip = self.inner.relay.lock().await.stats().clone();
        let dag = self.inner.graph.read().await.stats();
        NodeStats {
            node_id: self.node_id().to_string(),
            name: self.inner.config.name.clone(),
            peers: self.inner.registry.peer_count().await,
            dag,
            gossip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_node_config() {
        let config = NodeConfig::default();
        assert_eq!(config.name, "weave-node");
        assert_eq!(config.initial_peers.len(), 0);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_node_config_from_partial_json() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"name": "alpha", "gossip": {"sync_interval_ms": 50}}"#).unwrap();
        assert_eq!(config.name, "alpha");
        assert_eq!(config.gossip.sync_interval_ms, 50);
        assert_eq!(config.gossip.max_events_per_sync, 100);
        assert_eq!(config.store.buffer_capacity, 1024);
    }

    #[tokio::test]
    async fn test_node_creation() {
        let node = Node::new(NodeConfig::default()).unwrap();
        assert_eq!(node.node_ids().await, vec![node.node_id().to_string()]);
        assert_eq!(node.stats().await.peers, 0);
    }

    #[tokio::test]
    async fn test_secret_key_fixes_identity() {
        let identity = Identity::generate().unwrap();
        let config = NodeConfig {
            secret_key: Some(identity.secret_hex()),
            ..Default::default()
        };
        let node = Node::new(config).unwrap();
        assert_eq!(node.node_id(), identity.node_id());
    }

    #[tokio::test]
    async fn test_local_events_and_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let identity = Identity::generate().unwrap();
        let config = NodeConfig {
            db_path: Some(temp_dir.path().to_string_lossy().to_string()),
            secret_key: Some(identity.secret_hex()),
            ..Default::default()
        };

        let first = {
            let node = Node::new(config.clone()).unwrap();
            node.submit_transaction(b"hello".to_vec()).await;
            let first = node.create_event().await.unwrap().unwrap();
            // Nothing new to say: no event.
            assert!(node.create_event().await.unwrap().is_none());
            node.submit_transaction(b"again".to_vec()).await;
            assert!(node.create_event().await.unwrap().is_some());
            first
        };

        let node = Node::new(config).unwrap();
        let stats = node.stats().await;
        assert_eq!(stats.dag.total_events, 2);
        node.recompute().await;
        let view = node.event_view(&first).await.unwrap();
        assert_eq!(view.round, Some(0));
    }

    fn ring_events(ids: &[Identity], passes: usize) -> Vec<Event> {
        let mut latest: Vec<Option<EventHash>> = vec![None; ids.len()];
        let mut events: Vec<Event> = Vec::new();
        let start = Utc::now();
        for step in 0..ids.len() * (passes + 1) {
            let creator = step % ids.len();
            let event = Event::new(
                &ids[creator],
                latest[creator],
                events.last().filter(|_| step >= ids.len()).map(|e| e.hash),
                vec![format!("tx-{}", step).into_bytes()],
                start + chrono::Duration::milliseconds(step as i64),
            )
            .unwrap();
            latest[creator] = Some(event.hash);
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_restart_keeps_decided_order() {
        let temp_dir = TempDir::new().unwrap();
        let ids: Vec<Identity> = (0..4).map(|_| Identity::generate().unwrap()).collect();
        let events = ring_events(&ids, 8);
        let peers = crate::registry::PeerSnapshot::from_members(ids.iter().map(|id| id.node_id()));

        let (ordered, decided) = {
            let log = SledLog::open(temp_dir.path()).unwrap();
            let mut graph = Hashgraph::with_log(StoreConfig::default(), Box::new(log)).unwrap();
            for event in &events {
                graph.insert_and_recompute(event.clone(), &peers).unwrap();
            }
            (graph.ordered_hashes(), graph.last_decided_round())
        };
        assert!(decided.is_some());

        let config = NodeConfig {
            db_path: Some(temp_dir.path().to_string_lossy().to_string()),
            secret_key: Some(ids[0].secret_hex()),
            ..Default::default()
        };
        let node = Node::new(config).unwrap();
        node.recompute().await;

        let graph = node.graph().read().await;
        let round_of_last_pass = graph.round_of(&events[7].hash);
        assert_eq!(round_of_last_pass, Some(1));
        assert_eq!(graph.last_decided_round(), decided);
        assert_eq!(graph.ordered_hashes(), ordered);
    }

    #[tokio::test]
    async fn test_consensus_waits_for_min_peers() {
        let config = NodeConfig {
            min_peers: Some(1),
            ..Default::default()
        };
        let node = Node::new(config).unwrap();
        assert_eq!(node.min_peers(), 1);
        node.submit_transaction(b"early".to_vec()).await;
        let root = node.create_event().await.unwrap().unwrap();

        assert!(node.recompute().await.is_empty());
        assert_eq!(node.event_view(&root).await.unwrap().round, None);
        assert!(!node.wait_for_peers(1, Duration::from_millis(50)).await);

        let peer = Identity::generate().unwrap();
        let _session = node
            .open_session(peer.node_id().to_string(), peer.verifying_key())
            .await
            .unwrap();
        assert!(node.wait_for_peers(1, Duration::from_millis(50)).await);
        assert_eq!(node.recompute().await.assigned, 1);
        assert_eq!(node.event_view(&root).await.unwrap().round, Some(0));
    }

    #[test]
    fn test_min_peers_defaults_to_initial_peers() {
        let config = NodeConfig {
            initial_peers: vec![SocketAddr::from(([127, 0, 0, 1], 9001))],
            ..Default::default()
        };
        let node = Node::new(config).unwrap();
        assert_eq!(node.min_peers(), 1);
        assert_eq!(Node::new(NodeConfig::default()).unwrap().min_peers(), 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let node = Node::new(NodeConfig::default()).unwrap();
        let message = WireMessage::Request {
            hash: EventHash::from_bytes([7; 32]),
        };
        assert!(matches!(
            node.send_to("nobody", &message).await,
            Err(RelayError::PeerUnknownTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_rejects_mismatched_id() {
        let node = Node::new(NodeConfig::default()).unwrap();
        let other = Identity::generate().unwrap();
        assert!(node
            .open_session("not-the-key".to_string(), other.verifying_key())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_session_registers_and_disconnects() {
        let node = Node::new(NodeConfig::default()).unwrap();
        let peer = Identity::generate().unwrap();

        let mut session = node
            .open_session(peer.node_id().to_string(), peer.verifying_key())
            .await
            .unwrap();
        assert_eq!(node.stats().await.peers, 1);

        // The opening sync request is waiting in the outbound queue.
        let bytes = session.outbound.recv().await.unwrap();
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap().kind(), "sync");

        node.disconnect(peer.node_id()).await;
        assert_eq!(node.stats().await.peers, 0);
        assert!(session.outbound.recv().await.is_none());
    }
}
