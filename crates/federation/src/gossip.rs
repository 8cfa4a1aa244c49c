//! Gossip Protocol Module
//!
//! This module implements the relay that moves events between Weave nodes.
//! The relay never touches the network: it is handed decoded messages, feeds
//! them into the local [`Hashgraph`] and answers with the messages the
//! transport should send and where to send them.
//!
//! Push: every newly inserted event is forwarded at most once to each peer.
//! Pull: an event with unknown parents triggers a request for each of them.
//! Anti-entropy: a periodic `sync` exchange fills whatever push missed.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use weave_protocol::{Event, EventHash, EventMessage, NodeId, WireMessage};

use crate::hashgraph::Hashgraph;
use crate::registry::short_id;
use crate::storage::{InsertError, InsertOutcome};

/// Configuration for the gossip protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// How often to run anti-entropy with peers (milliseconds)
    pub sync_interval_ms: u64,
    /// Maximum number of events to send per sync response
    pub max_events_per_sync: usize,
    /// Sync ticks a missing parent is re-requested before giving up
    pub max_pull_attempts: u32,
    /// Per-peer outbound queue bound
    pub outbound_queue_capacity: usize,
    /// Fallback consensus recompute timer (milliseconds)
    pub recompute_interval_ms: u64,
    /// How often the node creates its own event (milliseconds)
    pub event_interval_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5000,       // 5 seconds
            max_events_per_sync: 100,     // 100 events
            max_pull_attempts: 3,         // 3 sync ticks
            outbound_queue_capacity: 256, // 256 messages
            recompute_interval_ms: 1000,  // 1 second
            event_interval_ms: 500,       // 0.5 seconds
        }
    }
}

/// Statistics for monitoring gossip behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipStats {
    /// Events received from peers
    pub events_received: u64,
    /// Events inserted into the DAG, including released buffered events
    pub events_inserted: u64,
    /// Duplicate events received
    pub duplicate_events: u64,
    /// Events rejected as invalid
    pub rejected_events: u64,
    /// Events forwarded to peers
    pub events_forwarded: u64,
    /// Missing parents requested from peers
    pub pulls_requested: u64,
    /// Missing parents given up on
    pub pulls_abandoned: u64,
    /// Messages dropped because a peer's queue was full
    pub queue_full_drops: u64,
    /// Sync requests answered
    pub syncs_answered: u64,
}

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Peer(NodeId),
    Broadcast,
}

/// A message the transport should deliver.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: Target,
    pub message: WireMessage,
}

impl Outbound {
    fn to_peer(peer: &str, message: WireMessage) -> Self {
        Self {
            target: Target::Peer(peer.to_string()),
            message,
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Default)]
pub struct RelayOutcome {
    /// Events that entered the DAG, including released buffered events
    pub inserted: Vec<EventHash>,
    pub outbound: Vec<Outbound>,
}

#[derive(Debug, Default)]
struct PeerState {
    /// Hashes this peer already has or was already sent. Pruned once the
    /// event's round is in the consensus order.
    sent: HashSet<EventHash>,
    /// Invalid events received from this peer
    strikes: u32,
}

#[derive(Debug)]
struct PullState {
    peer: NodeId,
    attempts: u32,
}

/// Push/pull gossip relay over a local [`Hashgraph`].
pub struct GossipRelay {
    config: GossipConfig,
    peers: BTreeMap<NodeId, PeerState>,
    /// Outstanding requests for missing parents
    pulls: BTreeMap<EventHash, PullState>,
    stats: GossipStats,
}

impl GossipRelay {
    /// Create a new relay
    pub fn new(config: GossipConfig) -> Self {
        Self {
            config,
            peers: BTreeMap::new(),
            pulls: BTreeMap::new(),
            stats: GossipStats::default(),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Add a peer to the gossip network
    pub fn add_peer(&mut self, peer: impl Into<NodeId>) {
        let peer = peer.into();
        info!("Added peer to gossip network: {}", short_id(&peer));
        self.peers.entry(peer).or_default();
    }

    /// Remove a peer together with every pull waiting on it
    pub fn remove_peer(&mut self, peer: &str) {
        if self.peers.remove(peer).is_none() {
            return;
        }
        let before = self.pulls.len();
        self.pulls.retain(|_, pull| pull.peer != peer);
        info!(
            "Removed peer from gossip network: {} ({} pulls discarded)",
            short_id(peer),
            before - self.pulls.len()
        );
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }

    /// Invalid events received from `peer`.
    pub fn strikes(&self, peer: &str) -> u32 {
        self.peers.get(peer).map_or(0, |state| state.strikes)
    }

    pub fn pending_pulls(&self) -> usize {
        self.pulls.len()
    }

    /// Hashes remembered as known to `peer`.
    pub fn sent_count(&self, peer: &str) -> usize {
        self.peers.get(peer).map_or(0, |state| state.sent.len())
    }

    /// Get gossip statistics
    pub fn stats(&self) -> &GossipStats {
        &self.stats
    }

    /// Count a message the transport had to drop.
    pub fn record_queue_full(&mut self, peer: &str) {
        self.stats.queue_full_drops += 1;
        warn!("Outbound queue to {} is full, dropping message", short_id(peer));
    }

    /// Handle any inbound message from `from`.
    pub fn handle_message(
        &mut self,
        graph: &mut Hashgraph,
        from: &str,
        message: WireMessage,
    ) -> RelayOutcome {
        match message {
            WireMessage::Handshake { .. } => {
                debug!("Ignoring handshake from {} after session start", short_id(from));
                RelayOutcome::default()
            }
            WireMessage::Event(message) => self.handle_event_message(graph, from, message),
            WireMessage::Request { hash } => RelayOutcome {
                inserted: Vec::new(),
                outbound: self.handle_request(graph, from, &hash),
            },
            WireMessage::Sync { known, limit } => RelayOutcome {
                inserted: Vec::new(),
                outbound: self.handle_sync(graph, from, &known, limit),
            },
            WireMessage::Events { events, has_more } => {
                let mut outcome = RelayOutcome::default();
                for message in events {
                    let next = self.handle_event_message(graph, from, message);
                    outcome.inserted.extend(next.inserted);
                    outcome.outbound.extend(next.outbound);
                }
                if has_more {
                    outcome.outbound.push(Outbound::to_peer(from, self.sync_request(graph)));
                }
                outcome
            }
        }
    }

    /// Decode and handle a single pushed event.
    pub fn handle_event_message(
        &mut self,
        graph: &mut Hashgraph,
        from: &str,
        message: EventMessage,
    ) -> RelayOutcome {
        match Event::try_from(message) {
            Ok(event) => self.handle_event(graph, from, event),
            Err(e) => {
                self.stats.events_received += 1;
                self.reject(from, &e.to_string());
                RelayOutcome::default()
            }
        }
    }

    /// Insert an event received from `from` and work out what to send next.
    pub fn handle_event(&mut self, graph: &mut Hashgraph, from: &str, event: Event) -> RelayOutcome {
        self.stats.events_received += 1;
        let hash = event.hash;
        let mut outcome = RelayOutcome::default();

        match graph.insert(event) {
            Ok(InsertOutcome::Inserted { released }) => {
                // The sender has it, so it never goes back there.
                if let Some(state) = self.peers.get_mut(from) {
                    state.sent.insert(hash);
                }
                for inserted in std::iter::once(hash).chain(released) {
                    self.pulls.remove(&inserted);
                    self.stats.events_inserted += 1;
                    outcome.outbound.extend(self.forward(graph, &inserted, Some(from)));
                    outcome.inserted.push(inserted);
                }
            }
            Ok(InsertOutcome::Duplicate) => {
                self.stats.duplicate_events += 1;
                self.pulls.remove(&hash);
                if let Some(state) = self.peers.get_mut(from) {
                    state.sent.insert(hash);
                }
            }
            Ok(InsertOutcome::MissingParent { missing }) => {
                if let Some(state) = self.peers.get_mut(from) {
                    state.sent.insert(hash);
                }
                for parent in missing {
                    // A buffered parent is already waiting on its own pulls.
                    if graph.store().is_buffered(&parent) {
                        continue;
                    }
                    if let Some(request) = self.request_parent(from, parent) {
                        outcome.outbound.push(request);
                    }
                }
            }
            Err(InsertError::Persistence { source }) => {
                error!("Failed to persist event {}: {}", hash.short(), source);
            }
            Err(e) => self.reject(from, &e.to_string()),
        }

        outcome
    }

    fn reject(&mut self, from: &str, reason: &str) {
        self.stats.rejected_events += 1;
        let strikes = self.peers.get_mut(from).map(|state| {
            state.strikes += 1;
            state.strikes
        });
        warn!(
            "Dropped invalid event from {} ({} strikes): {}",
            short_id(from),
            strikes.unwrap_or(0),
            reason
        );
    }

    fn request_parent(&mut self, from: &str, missing: EventHash) -> Option<Outbound> {
        if self.pulls.contains_key(&missing) {
            return None;
        }
        if !self.peers.contains_key(from) {
            return None;
        }
        debug!("Requesting missing parent {} from {}", missing.short(), short_id(from));
        self.pulls.insert(
            missing,
            PullState {
                peer: from.to_string(),
                attempts: 0,
            },
        );
        self.stats.pulls_requested += 1;
        Some(Outbound::to_peer(from, WireMessage::Request { hash: missing }))
    }

    /// Send `hash` to every peer that has not seen it, except `except`.
    pub fn forward(
        &mut self,
        graph: &Hashgraph,
        hash: &EventHash,
        except: Option<&str>,
    ) -> Vec<Outbound> {
        let Some(event) = graph.get_event(hash) else {
            return Vec::new();
        };
        let message = EventMessage::from(event);

        let mut outbound = Vec::new();
        for (peer, state) in self.peers.iter_mut() {
            if Some(peer.as_str()) == except || !state.sent.insert(*hash) {
                continue;
            }
            outbound.push(Outbound::to_peer(peer, WireMessage::Event(message.clone())));
        }
        if !outbound.is_empty() {
            debug!("Forwarding event {} to {} peers", hash.short(), outbound.len());
        }
        self.stats.events_forwarded += outbound.len() as u64;
        outbound
    }

    /// Answer a pull request with the event, if it is known.
    pub fn handle_request(&mut self, graph: &Hashgraph, from: &str, hash: &EventHash) -> Vec<Outbound> {
        let Some(event) = graph.get_event(hash) else {
            debug!("Peer {} requested unknown event {}", short_id(from), hash.short());
            return Vec::new();
        };
        if let Some(state) = self.peers.get_mut(from) {
            state.sent.insert(*hash);
        }
        vec![Outbound::to_peer(from, WireMessage::from(event))]
    }

    /// Answer an anti-entropy request with the events the peer lacks.
    pub fn handle_sync(
        &mut self,
        graph: &Hashgraph,
        from: &str,
        known: &BTreeMap<NodeId, u64>,
        limit: usize,
    ) -> Vec<Outbound> {
        let limit = limit.min(self.config.max_events_per_sync);
        let (events, has_more) = graph.store().events_after(known, limit);
        self.stats.syncs_answered += 1;
        if events.is_empty() {
            return Vec::new();
        }

        debug!("Sending {} events to {} for sync", events.len(), short_id(from));
        if let Some(state) = self.peers.get_mut(from) {
            state.sent.extend(events.iter().map(|e| e.hash));
        }
        let events = events.into_iter().map(EventMessage::from).collect();
        vec![Outbound::to_peer(from, WireMessage::Events { events, has_more })]
    }

    fn sync_request(&self, graph: &Hashgraph) -> WireMessage {
        WireMessage::Sync {
            known: graph.store().heights(),
            limit: self.config.max_events_per_sync,
        }
    }

    /// Periodic work: broadcast a sync request, retry or abandon pulls and
    /// forget sent hashes that consensus has ordered past.
    pub fn on_sync_tick(&mut self, graph: &mut Hashgraph) -> Vec<Outbound> {
        self.prune_sent(graph);
        let mut outbound = Vec::new();
        if !self.peers.is_empty() {
            outbound.push(Outbound {
                target: Target::Broadcast,
                message: self.sync_request(graph),
            });
        }

        let max_attempts = self.config.max_pull_attempts;
        let mut abandoned = Vec::new();
        for (hash, pull) in self.pulls.iter_mut() {
            if graph.store().contains(hash) {
                continue;
            }
            pull.attempts += 1;
            if pull.attempts > max_attempts {
                abandoned.push(*hash);
            } else {
                outbound.push(Outbound::to_peer(&pull.peer, WireMessage::Request { hash: *hash }));
            }
        }
        self.pulls.retain(|hash, _| !graph.store().contains(hash));

        for hash in abandoned {
            self.pulls.remove(&hash);
            self.stats.pulls_abandoned += 1;
            let dropped = graph.store_mut().discard_waiting_on(&hash);
            warn!(
                "Gave up on missing event {} after {} attempts, dropped {} waiting events",
                hash.short(),
                max_attempts,
                dropped
            );
        }
        outbound
    }

    /// Drop sent hashes of events in decided rounds and of events that are
    /// neither in the DAG nor buffered. Neither is forwarded again.
    fn prune_sent(&mut self, graph: &Hashgraph) {
        let decided = graph.last_decided_round();
        let store = graph.store();
        let keep = |hash: &EventHash| {
            if store.is_buffered(hash) {
                return true;
            }
            if !store.contains(hash) {
                return false;
            }
            match (graph.round_of(hash), decided) {
                (Some(round), Some(last)) => round > last,
                _ => true,
            }
        };

        let mut pruned = 0;
        for state in self.peers.values_mut() {
            let before = state.sent.len();
            state.sent.retain(|hash| keep(hash));
            pruned += before - state.sent.len();
        }
        if pruned > 0 {
            debug!("Pruned {} sent hashes at or below round {:?}", pruned, decided);
        }
    }
}
