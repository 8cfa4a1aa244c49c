//! Hashgraph state
//!
//! Pairs the event store with the consensus engine. A node keeps one
//! `Hashgraph` behind a single read/write lock: inserts and recomputation
//! take the write side, every query here only needs `&self`.

use tracing::info;
use weave_protocol::{
    DagStats, Event, EventHash, EventMessage, EventView, Fame, RoundSummary, VerifyingKey,
    WitnessSummary,
};

use crate::consensus::{ConsensusEngine, ConsensusUpdate};
use crate::log::{EventLog, StorageError};
use crate::registry::PeerSnapshot;
use crate::storage::{EventStore, InsertError, InsertOutcome, StoreConfig};

/// Event DAG plus the consensus derived from it.
#[derive(Default)]
pub struct Hashgraph {
    store: EventStore,
    engine: ConsensusEngine,
}

impl Hashgraph {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            store: EventStore::new(config),
            engine: ConsensusEngine::new(),
        }
    }

    /// Open a hashgraph over a persistent log, replaying what it holds.
    ///
    /// Rounds for the restored events are assigned on the first
    /// [`Hashgraph::recompute`], against the round snapshots and fame
    /// decisions the log recorded, so decided rounds come back unchanged
    /// whatever peer set that first recompute sees.
    pub fn with_log(config: StoreConfig, log: Box<dyn EventLog>) -> Result<Self, StorageError> {
        let mut store = EventStore::with_log(config, log);
        let restored = store.restore()?;
        if restored > 0 {
            info!("Restored {} events from log", restored);
        }
        let mut engine = ConsensusEngine::new();
        engine.restore(store.load_checkpoint()?);
        Ok(Self { store, engine })
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EventStore {
        &mut self.store
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn register_key(&mut self, node_id: String, public_key: VerifyingKey) {
        self.store.register_key(node_id, public_key);
    }

    pub fn insert(&mut self, event: Event) -> Result<InsertOutcome, InsertError> {
        self.store.insert(event)
    }

    pub fn recompute(&mut self, peers: &PeerSnapshot) -> ConsensusUpdate {
        self.engine.recompute(&mut self.store, peers)
    }

    /// Insert, then recompute if anything was added.
    pub fn insert_and_recompute(
        &mut self,
        event: Event,
        peers: &PeerSnapshot,
    ) -> Result<(InsertOutcome, ConsensusUpdate), InsertError> {
        let outcome = self.insert(event)?;
        let update = match outcome {
            InsertOutcome::Inserted { .. } => self.recompute(peers),
            _ => ConsensusUpdate::default(),
        };
        Ok((outcome, update))
    }

    // ----- queries -----

    pub fn get_event(&self, hash: &EventHash) -> Option<&Event> {
        self.store.get_event(hash)
    }

    /// Event plus its derived consensus metadata.
    pub fn event_view(&self, hash: &EventHash) -> Option<EventView> {
        self.store.index_of(hash).map(|idx| self.view(idx))
    }

    fn view(&self, idx: usize) -> EventView {
        let record = self.store.record(idx);
        EventView {
            event: EventMessage::from(&record.event),
            lamport: record.lamport,
            round: record.round,
            witness: record.witness,
            fame: record.fame,
            consensus: record.consensus.clone(),
        }
    }

    pub fn round_of(&self, hash: &EventHash) -> Option<u64> {
        self.store
            .index_of(hash)
            .and_then(|idx| self.store.record(idx).round)
    }

    pub fn is_witness(&self, hash: &EventHash) -> bool {
        self.store
            .index_of(hash)
            .is_some_and(|idx| self.store.record(idx).witness)
    }

    /// Fame of a witness. `None` for unknown hashes and non-witnesses.
    pub fn fame(&self, hash: &EventHash) -> Option<Fame> {
        let idx = self.store.index_of(hash)?;
        let record = self.store.record(idx);
        record.witness.then_some(record.fame)
    }

    /// Witnesses of `round`, ordered by hash.
    pub fn witnesses(&self, round: u64) -> Vec<WitnessSummary> {
        self.store
            .round_witnesses(round)
            .into_iter()
            .map(|idx| {
                let record = self.store.record(idx);
                WitnessSummary {
                    hash: record.event.hash,
                    creator: record.event.creator.clone(),
                    fame: record.fame,
                }
            })
            .collect()
    }

    pub fn round_summary(&self, round: u64) -> Option<RoundSummary> {
        let bucket = self.store.round_bucket(round)?;
        let witnesses = self.witnesses(round);
        let decided = witnesses.iter().all(|w| w.fame.is_decided());
        Some(RoundSummary {
            round,
            event_count: bucket.events.len(),
            witnesses,
            decided,
            received: self
                .engine
                .received(round)
                .map(<[EventHash]>::to_vec)
                .unwrap_or_default(),
            peer_count: self.engine.peer_count(round),
        })
    }

    pub fn max_round(&self) -> Option<u64> {
        self.store.max_round()
    }

    /// Highest round whose events have been placed in the consensus order.
    pub fn last_decided_round(&self) -> Option<u64> {
        self.engine.last_extracted()
    }

    /// Ordered events from position `since` on.
    pub fn ordered_events(&self, since: usize) -> Vec<EventView> {
        self.store
            .ordered()
            .iter()
            .skip(since)
            .map(|&idx| self.view(idx))
            .collect()
    }

    pub fn ordered_hashes(&self) -> Vec<EventHash> {
        self.store
            .ordered()
            .iter()
            .map(|&idx| self.store.record(idx).event.hash)
            .collect()
    }

    /// Transactions of the ordered events from position `since` on, in
    /// consensus order.
    pub fn ordered_transactions(&self, since: usize) -> Vec<Vec<u8>> {
        self.store
            .ordered()
            .iter()
            .skip(since)
            .flat_map(|&idx| self.store.record(idx).event.transactions.iter().cloned())
            .collect()
    }

    pub fn tips(&self) -> Vec<EventHash> {
        self.store.tips().into_iter().map(|e| e.hash).collect()
    }

    pub fn stats(&self) -> DagStats {
        DagStats {
            total_events: self.store.len(),
            tip_count: self.store.tips().len(),
            node_count: self.store.heights().len(),
            max_round: self.store.max_round(),
            last_decided_round: self.engine.last_extracted(),
            ordered_events: self.store.ordered().len(),
            buffered_events: self.store.buffered_len(),
            dropped_events: self.store.dropped_count(),
            earliest_timestamp: self.store.events().map(|e| e.timestamp).min(),
            latest_timestamp: self.store.events().map(|e| e.timestamp).max(),
        }
    }
}
