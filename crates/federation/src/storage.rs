//! Event DAG and Storage Module
//!
//! This module implements the content-addressed DAG of validated events.
//! Events are validated on insert (hash, signature, parent links), indexed
//! by hash, by creator and, once consensus has assigned one, by round.
//! Events that arrive before their parents wait in a bounded buffer and are
//! replayed as soon as the missing parents land.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use weave_protocol::{
    parse_public_key, ConsensusPosition, Event, EventHash, Fame, NodeId,
};

use crate::log::{ConsensusCheckpoint, EventLog, NullLog, StorageError};
use crate::registry::{is_supermajority, PeerSnapshot};

/// Reasons an event is refused by [`EventStore::insert`].
#[derive(Error, Debug)]
pub enum InsertError {
    #[error("Hash mismatch: claimed {claimed}, computed {computed}")]
    HashMismatch {
        claimed: EventHash,
        computed: EventHash,
    },

    #[error("Invalid signature on event {hash}")]
    InvalidSignature { hash: EventHash },

    #[error("Invalid event {hash}: {reason}")]
    InvalidEvent { hash: EventHash, reason: String },

    #[error("Failed to persist event: {source}")]
    Persistence { source: StorageError },
}

/// Result of a successful [`EventStore::insert`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Event was added. `released` lists buffered events that were added
    /// in turn because their missing parents are now present.
    Inserted { released: Vec<EventHash> },
    /// Event was already present; nothing changed.
    Duplicate,
    /// Parents are unknown; the event was buffered for replay. `missing`
    /// lists every absent parent, self parent first.
    MissingParent { missing: Vec<EventHash> },
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of events waiting on missing parents
    pub buffer_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
        }
    }
}

/// An accepted event plus everything derived about it.
#[derive(Debug, Clone)]
pub(crate) struct EventRecord {
    pub event: Event,
    pub self_parent: Option<usize>,
    pub other_parent: Option<usize>,
    pub lamport: u64,
    /// Position in the creator's self-parent chain
    pub seq: u64,
    pub round: Option<u64>,
    pub witness: bool,
    pub fame: Fame,
    pub consensus: Option<ConsensusPosition>,
}

impl EventRecord {
    fn parents(&self) -> impl Iterator<Item = usize> {
        self.self_parent.into_iter().chain(self.other_parent)
    }
}

/// Events of one round, with the witnesses grouped by creator.
#[derive(Debug, Clone, Default)]
pub(crate) struct RoundBucket {
    pub events: Vec<usize>,
    pub witnesses: BTreeMap<NodeId, Vec<usize>>,
}

/// Content-addressed DAG of validated events.
pub struct EventStore {
    config: StoreConfig,
    records: Vec<EventRecord>,
    by_hash: HashMap<EventHash, usize>,
    by_creator: HashMap<NodeId, Vec<usize>>,
    by_creator_round: BTreeMap<(NodeId, u64), Vec<usize>>,
    rounds: BTreeMap<u64, RoundBucket>,
    children: Vec<Vec<usize>>,
    tips: HashSet<usize>,
    /// Accepted events still waiting for a round, in acceptance order
    unassigned: VecDeque<usize>,
    /// Consensus order
    ordered: Vec<usize>,
    buffer: VecDeque<Event>,
    buffered: HashSet<EventHash>,
    dropped: u64,
    keys: HashMap<NodeId, VerifyingKey>,
    log: Box<dyn EventLog>,
    replaying: bool,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl EventStore {
    /// Create an empty store that persists nothing.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_log(config, Box::new(NullLog))
    }

    /// Create an empty store that appends accepted events to `log`.
    pub fn with_log(config: StoreConfig, log: Box<dyn EventLog>) -> Self {
        Self {
            config,
            records: Vec::new(),
            by_hash: HashMap::new(),
            by_creator: HashMap::new(),
            by_creator_round: BTreeMap::new(),
            rounds: BTreeMap::new(),
            children: Vec::new(),
            tips: HashSet::new(),
            unassigned: VecDeque::new(),
            ordered: Vec::new(),
            buffer: VecDeque::new(),
            buffered: HashSet::new(),
            dropped: 0,
            keys: HashMap::new(),
            log,
            replaying: false,
        }
    }

    /// Re-insert every event from the log. Returns the number restored.
    pub fn restore(&mut self) -> Result<usize, StorageError> {
        let events = self.log.load()?;
        self.replaying = true;
        let mut restored = 0;
        for event in events {
            let hash = event.hash;
            match self.insert(event) {
                Ok(InsertOutcome::Inserted { released }) => restored += 1 + released.len(),
                Ok(_) => {}
                Err(e) => warn!("Skipping logged event {}: {}", hash.short(), e),
            }
        }
        self.replaying = false;
        Ok(restored)
    }

    /// Pin the verifying key used for `node_id`'s events.
    ///
    /// Without a pinned key the creator id is decoded as a hex public key.
    pub fn register_key(&mut self, node_id: NodeId, public_key: VerifyingKey) {
        self.keys.insert(node_id, public_key);
    }

    /// Validate and add an event.
    pub fn insert(&mut self, event: Event) -> Result<InsertOutcome, InsertError> {
        let outcome = self.insert_one(event)?;
        if let InsertOutcome::Inserted { .. } = outcome {
            let released = self.replay_buffered();
            return Ok(InsertOutcome::Inserted { released });
        }
        Ok(outcome)
    }

    fn insert_one(&mut self, event: Event) -> Result<InsertOutcome, InsertError> {
        self.validate(&event)?;

        if self.by_hash.contains_key(&event.hash) {
            debug!("Duplicate event {}", event.hash.short());
            return Ok(InsertOutcome::Duplicate);
        }

        let missing = self.missing_parents(&event);
        if !missing.is_empty() {
            debug!(
                "Event {} waiting on {} parent(s), first {}",
                event.hash.short(),
                missing.len(),
                missing[0].short()
            );
            self.defer(event);
            return Ok(InsertOutcome::MissingParent { missing });
        }

        self.check_parent_links(&event)?;

        if !self.replaying {
            self.log
                .append(&event)
                .map_err(|source| InsertError::Persistence { source })?;
        }

        debug!("Inserted event {} from {}", event.hash.short(), short(&event.creator));
        self.index(event);
        Ok(InsertOutcome::Inserted {
            released: Vec::new(),
        })
    }

    fn validate(&self, event: &Event) -> Result<(), InsertError> {
        let computed = event.recompute_hash();
        if computed != event.hash {
            warn!(
                "Rejecting event: claimed hash {} but content hashes to {}",
                event.hash.short(),
                computed.short()
            );
            return Err(InsertError::HashMismatch {
                claimed: event.hash,
                computed,
            });
        }

        let verified = self
            .public_key_for(&event.creator)
            .is_some_and(|key| event.verify_signature(&key));
        if !verified {
            warn!("Rejecting event {}: bad signature", event.hash.short());
            return Err(InsertError::InvalidSignature { hash: event.hash });
        }

        Ok(())
    }

    fn public_key_for(&self, creator: &str) -> Option<VerifyingKey> {
        self.keys
            .get(creator)
            .copied()
            .or_else(|| parse_public_key(creator).ok())
    }

    fn missing_parents(&self, event: &Event) -> Vec<EventHash> {
        let mut missing: Vec<EventHash> = Vec::new();
        for parent in event.parents() {
            if !self.by_hash.contains_key(parent) && !missing.contains(parent) {
                missing.push(*parent);
            }
        }
        missing
    }

    fn has_all_parents(&self, event: &Event) -> bool {
        event.parents().all(|parent| self.by_hash.contains_key(parent))
    }

    fn check_parent_links(&self, event: &Event) -> Result<(), InsertError> {
        if let Some(self_parent) = event.self_parent.and_then(|h| self.index_of(&h)) {
            if self.records[self_parent].event.creator != event.creator {
                return Err(InsertError::InvalidEvent {
                    hash: event.hash,
                    reason: "self parent has a different creator".to_string(),
                });
            }
        }
        Ok(())
    }

    fn defer(&mut self, event: Event) {
        if !self.buffered.insert(event.hash) {
            return;
        }
        if self.buffer.len() >= self.config.buffer_capacity {
            if let Some(evicted) = self.buffer.pop_front() {
                self.buffered.remove(&evicted.hash);
                self.dropped += 1;
                warn!(
                    "Dropped unresolved event {} (buffer full)",
                    evicted.hash.short()
                );
            }
        }
        self.buffer.push_back(event);
    }

    /// Insert buffered events whose parents are all present, repeatedly.
    fn replay_buffered(&mut self) -> Vec<EventHash> {
        let mut released = Vec::new();
        while let Some(position) = self
            .buffer
            .iter()
            .position(|event| self.has_all_parents(event))
        {
            let Some(event) = self.buffer.remove(position) else {
                break;
            };
            self.buffered.remove(&event.hash);
            let hash = event.hash;
            match self.insert_one(event) {
                Ok(InsertOutcome::Inserted { .. }) => released.push(hash),
                Ok(_) => {}
                Err(e) => warn!("Dropped buffered event {}: {}", hash.short(), e),
            }
        }
        released
    }

    /// Drop every buffered event that waits, directly or through another
    /// buffered event, on `missing`. Returns how many were dropped.
    pub fn discard_waiting_on(&mut self, missing: &EventHash) -> usize {
        let mut doomed: HashSet<EventHash> = HashSet::from([*missing]);
        loop {
            let before = doomed.len();
            for event in &self.buffer {
                if event.parents().any(|p| doomed.contains(p)) {
                    doomed.insert(event.hash);
                }
            }
            if doomed.len() == before {
                break;
            }
        }

        let before = self.buffer.len();
        self.buffer.retain(|event| {
            if doomed.contains(&event.hash) {
                warn!(
                    "Dropped unresolved event {} waiting on {}",
                    event.hash.short(),
                    missing.short()
                );
                false
            } else {
                true
            }
        });
        let dropped = before - self.buffer.len();
        self.buffered.retain(|hash| !doomed.contains(hash));
        self.dropped += dropped as u64;
        dropped
    }

    fn index(&mut self, event: Event) {
        let idx = self.records.len();
        let self_parent = event.self_parent.and_then(|h| self.index_of(&h));
        let other_parent = event.other_parent.and_then(|h| self.index_of(&h));

        let lamport = self_parent
            .into_iter()
            .chain(other_parent)
            .map(|p| self.records[p].lamport + 1)
            .max()
            .unwrap_or(0);
        let seq = self_parent.map_or(0, |p| self.records[p].seq + 1);

        for parent in self_parent.into_iter().chain(other_parent) {
            self.children[parent].push(idx);
            self.tips.remove(&parent);
        }
        self.children.push(Vec::new());
        self.tips.insert(idx);

        self.by_hash.insert(event.hash, idx);
        self.by_creator
            .entry(event.creator.clone())
            .or_default()
            .push(idx);
        self.unassigned.push_back(idx);

        self.records.push(EventRecord {
            event,
            self_parent,
            other_parent,
            lamport,
            seq,
            round: None,
            witness: false,
            fame: Fame::Pending,
            consensus: None,
        });
    }

    // ----- queries -----

    pub fn get_event(&self, hash: &EventHash) -> Option<&Event> {
        self.index_of(hash).map(|idx| &self.records[idx].event)
    }

    pub fn contains(&self, hash: &EventHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_buffered(&self, hash: &EventHash) -> bool {
        self.buffered.contains(hash)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Lamport time of an accepted event.
    pub fn lamport(&self, hash: &EventHash) -> Option<u64> {
        self.index_of(hash).map(|idx| self.records[idx].lamport)
    }

    /// Events with no children, ordered by hash.
    pub fn tips(&self) -> Vec<&Event> {
        let mut tips: Vec<&Event> = self.tips.iter().map(|&i| &self.records[i].event).collect();
        tips.sort_by_key(|event| event.hash);
        tips
    }

    /// Events accepted so far, in acceptance order.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.records.iter().map(|record| &record.event)
    }

    /// Latest event in `creator`'s self-parent chain.
    pub fn latest_by_creator(&self, creator: &str) -> Option<&Event> {
        self.by_creator
            .get(creator)
            .and_then(|events| events.last())
            .map(|&idx| &self.records[idx].event)
    }

    /// Most recently accepted event created by anyone but `creator`.
    pub fn latest_foreign(&self, creator: &str) -> Option<&Event> {
        self.records
            .iter()
            .rev()
            .find(|record| record.event.creator != creator)
            .map(|record| &record.event)
    }

    /// Events created by `creator` with the given round.
    pub fn events_by_creator_round(&self, creator: &str, round: u64) -> Vec<&Event> {
        self.by_creator_round
            .get(&(creator.to_string(), round))
            .map(|events| events.iter().map(|&i| &self.records[i].event).collect())
            .unwrap_or_default()
    }

    /// Number of accepted events per creator.
    pub fn heights(&self) -> BTreeMap<NodeId, u64> {
        self.by_creator
            .iter()
            .map(|(creator, events)| (creator.clone(), events.len() as u64))
            .collect()
    }

    /// Events a peer with the given per-creator `known` counts is missing,
    /// in (lamport, hash) order, at most `limit` of them. The flag reports
    /// whether more were left out.
    pub fn events_after(&self, known: &BTreeMap<NodeId, u64>, limit: usize) -> (Vec<&Event>, bool) {
        let mut missing: Vec<&EventRecord> = self
            .records
            .iter()
            .filter(|record| record.seq >= known.get(&record.event.creator).copied().unwrap_or(0))
            .collect();
        missing.sort_by_key(|record| (record.lamport, record.event.hash));
        let has_more = missing.len() > limit;
        let events = missing
            .into_iter()
            .take(limit)
            .map(|record| &record.event)
            .collect();
        (events, has_more)
    }

    /// Ancestors of `hash`, excluding the event itself.
    ///
    /// The walk is lazy and visits every ancestor exactly once even when it
    /// is reachable along several paths. Cloning the iterator, or calling
    /// this again, restarts the walk.
    pub fn ancestors(&self, hash: &EventHash) -> Ancestors<'_> {
        let walk = match self.index_of(hash) {
            Some(idx) => self.ancestor_walk(idx),
            None => AncestorWalk {
                store: self,
                stack: Vec::new(),
                visited: HashSet::new(),
            },
        };
        Ancestors { walk }
    }

    /// Whether `b` is `a` or an ancestor of `a`.
    pub fn sees(&self, a: &EventHash, b: &EventHash) -> bool {
        match (self.index_of(a), self.index_of(b)) {
            (Some(a), Some(b)) => self.sees_idx(a, b),
            _ => false,
        }
    }

    /// Whether `a` sees `b` through events by a supermajority of
    /// `peer_count` distinct creators.
    pub fn strongly_sees(&self, a: &EventHash, b: &EventHash, peer_count: usize) -> bool {
        match (self.index_of(a), self.index_of(b)) {
            (Some(a), Some(b)) => self.strongly_sees_idx(a, b, peer_count),
            _ => false,
        }
    }

    // ----- crate-internal access for consensus -----

    /// Persisted round snapshots and fame decisions.
    pub(crate) fn load_checkpoint(&self) -> Result<ConsensusCheckpoint, StorageError> {
        self.log.load_checkpoint()
    }

    pub(crate) fn log_round(&mut self, round: u64, peers: &PeerSnapshot) {
        if let Err(e) = self.log.record_round(round, peers) {
            warn!("Failed to persist snapshot of round {}: {}", round, e);
        }
    }

    pub(crate) fn log_fame(&mut self, idx: usize, fame: Fame) {
        let hash = self.records[idx].event.hash;
        if let Err(e) = self.log.record_fame(&hash, fame) {
            warn!("Failed to persist fame of {}: {}", hash.short(), e);
        }
    }

    pub(crate) fn index_of(&self, hash: &EventHash) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    pub(crate) fn record(&self, idx: usize) -> &EventRecord {
        &self.records[idx]
    }

    pub(crate) fn record_mut(&mut self, idx: usize) -> &mut EventRecord {
        &mut self.records[idx]
    }

    pub(crate) fn parent_indices(&self, idx: usize) -> impl Iterator<Item = usize> {
        self.records[idx].parents()
    }

    pub(crate) fn next_unassigned(&mut self) -> Option<usize> {
        self.unassigned.pop_front()
    }

    pub(crate) fn assign_round(&mut self, idx: usize, round: u64, witness: bool) {
        let creator = self.records[idx].event.creator.clone();
        let record = &mut self.records[idx];
        record.round = Some(round);
        record.witness = witness;

        let bucket = self.rounds.entry(round).or_default();
        bucket.events.push(idx);
        if witness {
            bucket.witnesses.entry(creator.clone()).or_default().push(idx);
        }
        self.by_creator_round.entry((creator, round)).or_default().push(idx);
    }

    pub(crate) fn round_bucket(&self, round: u64) -> Option<&RoundBucket> {
        self.rounds.get(&round)
    }

    pub(crate) fn max_round(&self) -> Option<u64> {
        self.rounds.keys().next_back().copied()
    }

    /// Witnesses of `round`, ordered by hash.
    pub(crate) fn round_witnesses(&self, round: u64) -> Vec<usize> {
        let mut witnesses: Vec<usize> = self
            .rounds
            .get(&round)
            .map(|bucket| bucket.witnesses.values().flatten().copied().collect())
            .unwrap_or_default();
        witnesses.sort_by_key(|&idx| self.records[idx].event.hash);
        witnesses
    }

    pub(crate) fn push_ordered(&mut self, idx: usize, position: ConsensusPosition) {
        self.records[idx].consensus = Some(position);
        self.ordered.push(idx);
    }

    pub(crate) fn ordered(&self) -> &[usize] {
        &self.ordered
    }

    pub(crate) fn ancestor_walk(&self, idx: usize) -> AncestorWalk<'_> {
        let mut visited = HashSet::from([idx]);
        let stack = self
            .parent_indices(idx)
            .filter(|&p| visited.insert(p))
            .collect();
        AncestorWalk {
            store: self,
            stack,
            visited,
        }
    }

    pub(crate) fn sees_idx(&self, a: usize, b: usize) -> bool {
        if a == b {
            return true;
        }
        let floor = self.records[b].lamport;
        if self.records[a].lamport <= floor {
            return false;
        }

        let mut visited = HashSet::from([a]);
        let mut stack = vec![a];
        while let Some(current) = stack.pop() {
            for parent in self.parent_indices(current) {
                if parent == b {
                    return true;
                }
                // Ancestors of an event at or below b's lamport time cannot reach b.
                if self.records[parent].lamport > floor && visited.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        false
    }

    /// Counts the distinct creators of events that lie on some path from
    /// `b` up to `a`: the intersection of `a`'s ancestry with `b`'s
    /// descendants.
    pub(crate) fn strongly_sees_idx(&self, a: usize, b: usize, peer_count: usize) -> bool {
        if !self.sees_idx(a, b) {
            return false;
        }
        let floor = self.records[b].lamport;

        let mut ancestry = HashSet::from([a]);
        let mut stack = vec![a];
        while let Some(current) = stack.pop() {
            for parent in self.parent_indices(current) {
                if self.records[parent].lamport >= floor && ancestry.insert(parent) {
                    stack.push(parent);
                }
            }
        }

        let mut creators: HashSet<&str> = HashSet::new();
        let mut visited = HashSet::from([b]);
        let mut stack = vec![b];
        while let Some(current) = stack.pop() {
            creators.insert(self.records[current].event.creator.as_str());
            for &child in &self.children[current] {
                if ancestry.contains(&child) && visited.insert(child) {
                    stack.push(child);
                }
            }
        }

        is_supermajority(creators.len(), peer_count)
    }
}

/// Depth-first walk over ancestor indices with a per-walk visited set.
#[derive(Clone)]
pub(crate) struct AncestorWalk<'a> {
    store: &'a EventStore,
    stack: Vec<usize>,
    visited: HashSet<usize>,
}

impl Iterator for AncestorWalk<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.stack.pop()?;
        for parent in self.store.parent_indices(idx) {
            if self.visited.insert(parent) {
                self.stack.push(parent);
            }
        }
        Some(idx)
    }
}

/// Lazy walk over the ancestors of an event. See [`EventStore::ancestors`].
#[derive(Clone)]
pub struct Ancestors<'a> {
    walk: AncestorWalk<'a>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<&'a Event> {
        let store = self.walk.store;
        self.walk.next().map(|idx| &store.records[idx].event)
    }
}

fn short(node_id: &str) -> &str {
    crate::registry::short_id(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;
    use weave_protocol::{EventSignature, Identity};

    use crate::log::SledLog;

    fn at(step: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(step)
    }

    fn event(
        identity: &Identity,
        self_parent: Option<&Event>,
        other_parent: Option<&Event>,
        step: i64,
    ) -> Event {
        Event::new(
            identity,
            self_parent.map(|e| e.hash),
            other_parent.map(|e| e.hash),
            vec![format!("tx-{}", step).into_bytes()],
            at(step),
        )
        .unwrap()
    }

    fn inserted(outcome: Result<InsertOutcome, InsertError>) -> Vec<EventHash> {
        match outcome {
            Ok(InsertOutcome::Inserted { released }) => released,
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_dag_basic_operations() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();

        let root = event(&alice, None, None, 0);
        inserted(store.insert(root.clone()));

        assert_eq!(store.get_event(&root.hash), Some(&root));
        assert!(store.contains(&root.hash));
        assert_eq!(store.lamport(&root.hash), Some(0));
        assert_eq!(store.tips().len(), 1);
        assert_eq!(store.latest_by_creator(alice.node_id()), Some(&root));
    }

    #[test]
    fn test_dag_parent_child_relationships() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let a0 = event(&alice, None, None, 0);
        let b0 = event(&bob, None, None, 1);
        let a1 = event(&alice, Some(&a0), Some(&b0), 2);
        for e in [&a0, &b0, &a1] {
            inserted(store.insert(e.clone()));
        }

        let tips = store.tips();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].hash, a1.hash);
        assert_eq!(store.lamport(&a1.hash), Some(1));
        assert_eq!(store.latest_foreign(alice.node_id()), Some(&b0));
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let root = event(&alice, None, None, 0);

        inserted(store.insert(root.clone()));
        let heights = store.heights();
        assert_eq!(store.insert(root.clone()).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.len(), 1);
        assert_eq!(store.heights(), heights);
    }

    #[test]
    fn test_tampered_event_rejected() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();

        let mut tampered = event(&alice, None, None, 0);
        tampered.transactions.push(b"extra".to_vec());

        assert!(matches!(
            store.insert(tampered),
            Err(InsertError::HashMismatch { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_forged_signature_rejected() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let mallory = Identity::generate().unwrap();

        let mut forged = event(&alice, None, None, 0);
        forged.signature = mallory.sign(&forged.hash).unwrap();
        assert!(matches!(
            store.insert(forged),
            Err(InsertError::InvalidSignature { .. })
        ));

        let mut garbled = event(&alice, None, None, 1);
        garbled.signature = EventSignature::from_bytes(vec![1, 2, 3]);
        assert!(matches!(
            store.insert(garbled),
            Err(InsertError::InvalidSignature { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_pinned_key_overrides_creator_id() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let other = Identity::generate().unwrap();
        store.register_key(alice.node_id().to_string(), other.verifying_key());

        let root = event(&alice, None, None, 0);
        assert!(matches!(
            store.insert(root),
            Err(InsertError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_self_parent_must_share_creator() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let a0 = event(&alice, None, None, 0);
        inserted(store.insert(a0.clone()));

        let bad = event(&bob, Some(&a0), None, 1);
        assert!(matches!(
            store.insert(bad),
            Err(InsertError::InvalidEvent { .. })
        ));
    }

    #[test]
    fn test_missing_parent_is_buffered_and_released() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let a0 = event(&alice, None, None, 0);
        let b0 = event(&bob, None, None, 1);
        let a1 = event(&alice, Some(&a0), Some(&b0), 2);
        let a2 = event(&alice, Some(&a1), None, 3);

        assert_eq!(
            store.insert(a2.clone()).unwrap(),
            InsertOutcome::MissingParent {
                missing: vec![a1.hash]
            }
        );
        // Both parents of a1 are reported, not just the self parent.
        assert_eq!(
            store.insert(a1.clone()).unwrap(),
            InsertOutcome::MissingParent {
                missing: vec![a0.hash, b0.hash]
            }
        );
        // Re-sending a buffered event does not buffer it twice.
        store.insert(a1.clone()).unwrap();
        assert_eq!(store.buffered_len(), 2);

        assert!(inserted(store.insert(a0.clone())).is_empty());
        assert_eq!(
            store.insert(b0.clone()).unwrap(),
            InsertOutcome::Inserted {
                released: vec![a1.hash, a2.hash]
            }
        );
        assert_eq!(store.buffered_len(), 0);
        assert_eq!(store.len(), 4);
        assert_eq!(store.lamport(&a2.hash), Some(2));
    }

    #[test]
    fn test_buffer_evicts_oldest_first() {
        let mut store = EventStore::new(StoreConfig { buffer_capacity: 2 });
        let alice = Identity::generate().unwrap();

        let root = event(&alice, None, None, 0);
        let waiting: Vec<Event> = (1..=3).map(|i| event(&alice, Some(&root), None, i)).collect();
        for e in &waiting {
            store.insert(e.clone()).unwrap();
        }

        assert_eq!(store.buffered_len(), 2);
        assert_eq!(store.dropped_count(), 1);
        assert!(!store.is_buffered(&waiting[0].hash));
        assert!(store.is_buffered(&waiting[2].hash));
    }

    #[test]
    fn test_discard_waiting_on_cascades() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let a0 = event(&alice, None, None, 0);
        let a1 = event(&alice, Some(&a0), None, 1);
        let a2 = event(&alice, Some(&a1), None, 2);
        let b0 = event(&bob, None, None, 3);
        let b1 = event(&bob, Some(&b0), None, 4);

        store.insert(a1).unwrap();
        store.insert(a2).unwrap();
        store.insert(b1).unwrap();
        assert_eq!(store.buffered_len(), 3);

        assert_eq!(store.discard_waiting_on(&a0.hash), 2);
        assert_eq!(store.buffered_len(), 1);
        assert_eq!(store.dropped_count(), 2);
    }

    #[test]
    fn test_ancestors_visit_diamond_once() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        // a0 <- a1, a0 <- b1 (other parent), a2 joins both paths.
        let a0 = event(&alice, None, None, 0);
        let b0 = event(&bob, None, None, 1);
        let a1 = event(&alice, Some(&a0), None, 2);
        let b1 = event(&bob, Some(&b0), Some(&a0), 3);
        let a2 = event(&alice, Some(&a1), Some(&b1), 4);
        for e in [&a0, &b0, &a1, &b1, &a2] {
            inserted(store.insert(e.clone()));
        }

        let walk = store.ancestors(&a2.hash);
        let mut seen: Vec<EventHash> = walk.clone().map(|e| e.hash).collect();
        assert_eq!(seen.len(), 4);
        seen.sort();
        let mut expected = vec![a0.hash, b0.hash, a1.hash, b1.hash];
        expected.sort();
        assert_eq!(seen, expected);

        // Restarting yields the same sequence.
        let again: Vec<EventHash> = walk.map(|e| e.hash).collect();
        let first: Vec<EventHash> = store.ancestors(&a2.hash).map(|e| e.hash).collect();
        assert_eq!(again, first);

        assert_eq!(store.ancestors(&a0.hash).count(), 0);
        assert_eq!(store.ancestors(&EventHash::from_bytes([0; 32])).count(), 0);
    }

    #[test]
    fn test_sees_and_strongly_sees() {
        let mut store = EventStore::default();
        let ids: Vec<Identity> = (0..4).map(|_| Identity::generate().unwrap()).collect();

        let roots: Vec<Event> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| event(id, None, None, i as i64))
            .collect();
        for root in &roots {
            inserted(store.insert(root.clone()));
        }

        // c0 reaches a2 through b1 and a1: creators {c, b, a}.
        let b1 = event(&ids[1], Some(&roots[1]), Some(&roots[2]), 10);
        let a1 = event(&ids[0], Some(&roots[0]), Some(&b1), 11);
        let a2 = event(&ids[0], Some(&a1), Some(&roots[3]), 12);
        for e in [&b1, &a1, &a2] {
            inserted(store.insert(e.clone()));
        }

        assert!(store.sees(&a2.hash, &a2.hash));
        assert!(store.sees(&a2.hash, &roots[2].hash));
        assert!(!store.sees(&roots[2].hash, &a2.hash));
        assert!(!store.sees(&b1.hash, &roots[3].hash));

        assert!(store.strongly_sees(&a2.hash, &roots[2].hash, 4));
        assert!(!store.strongly_sees(&a2.hash, &roots[3].hash, 4));
        assert!(!store.strongly_sees(&a2.hash, &roots[0].hash, 4));
        // With three members two creators are not enough either.
        assert!(!store.strongly_sees(&a2.hash, &roots[1].hash, 3));
        assert!(store.strongly_sees(&a2.hash, &roots[1].hash, 2));
    }

    #[test]
    fn test_events_after_for_anti_entropy() {
        let mut store = EventStore::default();
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let a0 = event(&alice, None, None, 0);
        let a1 = event(&alice, Some(&a0), None, 1);
        let b0 = event(&bob, None, None, 2);
        for e in [&a0, &a1, &b0] {
            inserted(store.insert(e.clone()));
        }

        let known = BTreeMap::from([(alice.node_id().to_string(), 1)]);
        let (events, has_more) = store.events_after(&known, 10);
        let hashes: Vec<EventHash> = events.iter().map(|e| e.hash).collect();
        assert!(!has_more);
        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains(&a1.hash) && hashes.contains(&b0.hash));

        let (events, has_more) = store.events_after(&BTreeMap::new(), 2);
        assert_eq!(events.len(), 2);
        assert!(has_more);
    }

    #[test]
    fn test_restore_from_sled_log() {
        let temp_dir = TempDir::new().unwrap();
        let alice = Identity::generate().unwrap();
        let a0 = event(&alice, None, None, 0);
        let a1 = event(&alice, Some(&a0), None, 1);

        {
            let log = SledLog::open(temp_dir.path()).unwrap();
            let mut store = EventStore::with_log(StoreConfig::default(), Box::new(log));
            inserted(store.insert(a0.clone()));
            inserted(store.insert(a1.clone()));
        }

        let log = SledLog::open(temp_dir.path()).unwrap();
        let mut store = EventStore::with_log(StoreConfig::default(), Box::new(log));
        assert_eq!(store.restore().unwrap(), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.tips()[0].hash, a1.hash);
        drop(store);

        // Restoring does not append the replayed events a second time.
        let log = SledLog::open(temp_dir.path()).unwrap();
        assert_eq!(log.load().unwrap().len(), 2);
    }
}
