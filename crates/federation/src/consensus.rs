//! Consensus Engine Module
//!
//! Derives rounds, witnesses and famous witnesses from the local DAG and
//! extracts the total order of events. Everything here is a pure function of
//! the DAG plus the peer snapshot recorded for each round, so two nodes that
//! hold the same events reach the same conclusions whatever order the events
//! arrived in.
//!
//! A round's snapshot is taken the first time an event is tested for
//! promotion out of it, which is when voting on that round starts. Snapshots
//! and fame decisions are written to the store's log and handed back through
//! [`ConsensusEngine::restore`] after a restart.
//!
//! The engine runs in three phases on every [`ConsensusEngine::recompute`]:
//!
//! 1. round assignment for events accepted since the last run,
//! 2. virtual voting on the fame of every still-pending witness,
//! 3. order extraction for each leading round whose witnesses are all decided.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use weave_protocol::{ConsensusPosition, EventHash, Fame};

use crate::log::ConsensusCheckpoint;
use crate::registry::{is_supermajority, PeerSnapshot};
use crate::storage::EventStore;

/// What a single recompute pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusUpdate {
    /// Number of events that received a round
    pub assigned: usize,
    /// Witnesses whose fame settled, in decision order
    pub decided: Vec<(EventHash, Fame)>,
    /// Events appended to the consensus order
    pub ordered: Vec<EventHash>,
}

impl ConsensusUpdate {
    pub fn is_empty(&self) -> bool {
        self.assigned == 0 && self.decided.is_empty() && self.ordered.is_empty()
    }
}

/// Round, fame and order state derived on top of an [`EventStore`].
#[derive(Debug, Default)]
pub struct ConsensusEngine {
    /// Member set each round is voted against
    round_snapshots: BTreeMap<u64, PeerSnapshot>,
    /// Persisted fame, applied when the witness gets its round again
    restored_fame: HashMap<EventHash, Fame>,
    /// Highest round whose order has been extracted
    last_extracted: Option<u64>,
    /// Events received in each extracted round, in consensus order
    received: BTreeMap<u64, Vec<EventHash>>,
}

impl ConsensusEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_extracted(&self) -> Option<u64> {
        self.last_extracted
    }

    /// Reload round snapshots and fame decisions persisted by an earlier run.
    /// Must be called before the first recompute over the restored events.
    pub fn restore(&mut self, checkpoint: ConsensusCheckpoint) {
        if !checkpoint.is_empty() {
            info!(
                "Restored {} round snapshots and {} fame decisions",
                checkpoint.rounds.len(),
                checkpoint.fame.len()
            );
        }
        self.round_snapshots = checkpoint.rounds;
        self.restored_fame = checkpoint.fame;
    }

    /// Size of the peer set `round` is voted against, once voting on it has
    /// started.
    pub fn peer_count(&self, round: u64) -> Option<usize> {
        self.round_snapshots.get(&round).map(PeerSnapshot::size)
    }

    /// Events received in `round`, in consensus order.
    pub fn received(&self, round: u64) -> Option<&[EventHash]> {
        self.received.get(&round).map(Vec::as_slice)
    }

    /// Run all three phases against the current DAG.
    ///
    /// `peers` becomes the snapshot of any round whose first promotion test
    /// happens during this pass. Rounds that already have a snapshot keep it.
    pub fn recompute(&mut self, store: &mut EventStore, peers: &PeerSnapshot) -> ConsensusUpdate {
        let mut update = ConsensusUpdate::default();
        self.assign_rounds(store, peers, &mut update);
        self.decide_fame(store, &mut update);
        self.extract_order(store, &mut update);

        if !update.is_empty() {
            debug!(
                "Consensus pass: {} assigned, {} decided, {} ordered",
                update.assigned,
                update.decided.len(),
                update.ordered.len()
            );
        }
        update
    }

    fn snapshot_for(
        &mut self,
        store: &mut EventStore,
        round: u64,
        peers: &PeerSnapshot,
    ) -> PeerSnapshot {
        if let Some(snapshot) = self.round_snapshots.get(&round) {
            return snapshot.clone();
        }
        debug!("Round {} voted against {} peers", round, peers.size());
        store.log_round(round, peers);
        self.round_snapshots.insert(round, peers.clone());
        peers.clone()
    }

    // ----- phase 1: rounds -----

    fn assign_rounds(
        &mut self,
        store: &mut EventStore,
        peers: &PeerSnapshot,
        update: &mut ConsensusUpdate,
    ) {
        // Acceptance order is topological, so parents always have a round here.
        while let Some(idx) = store.next_unassigned() {
            let parent_round = store
                .parent_indices(idx)
                .filter_map(|p| store.record(p).round)
                .max();

            let round = match parent_round {
                None => 0,
                Some(r) => {
                    let snapshot = self.snapshot_for(store, r, peers);
                    if self.strongly_sees_round(store, idx, r, &snapshot) {
                        r + 1
                    } else {
                        r
                    }
                }
            };

            let witness = match store.record(idx).self_parent {
                None => true,
                Some(sp) => store.record(sp).round.map_or(true, |sp_round| round > sp_round),
            };

            store.assign_round(idx, round, witness);
            update.assigned += 1;
            if !witness {
                continue;
            }

            let hash = store.record(idx).event.hash;
            if let Some(fame) = self.restored_fame.remove(&hash) {
                store.record_mut(idx).fame = fame;
            } else if self.last_extracted.is_some_and(|last| round <= last) {
                debug!("Late witness {} for extracted round {}", hash.short(), round);
                store.record_mut(idx).fame = Fame::NotFamous;
                store.log_fame(idx, Fame::NotFamous);
                update.decided.push((hash, Fame::NotFamous));
            }
        }
    }

    /// Whether `idx` strongly sees witnesses of `round` by a supermajority
    /// of distinct creators.
    fn strongly_sees_round(
        &self,
        store: &EventStore,
        idx: usize,
        round: u64,
        snapshot: &PeerSnapshot,
    ) -> bool {
        let n = snapshot.size();
        let creators: HashSet<&str> = store
            .round_witnesses(round)
            .into_iter()
            .filter(|&w| store.strongly_sees_idx(idx, w, n))
            .map(|w| store.record(w).event.creator.as_str())
            .collect();
        snapshot.is_supermajority(creators.len())
    }

    // ----- phase 2: fame -----

    fn decide_fame(&mut self, store: &mut EventStore, update: &mut ConsensusUpdate) {
        let Some(max_round) = store.max_round() else {
            return;
        };
        let first = self.last_extracted.map_or(0, |last| last + 1);
        let mut voting = Voting::default();

        for round in first..max_round {
            let n = self
                .round_snapshots
                .get(&round)
                .map_or(1, PeerSnapshot::size);

            for w in store.round_witnesses(round) {
                if store.record(w).fame.is_decided() {
                    continue;
                }
                let Some(famous) = voting.decide(store, w, round, max_round, n) else {
                    continue;
                };
                let fame = Fame::from_vote(famous);
                let record = store.record_mut(w);
                record.fame = fame;
                let hash = record.event.hash;
                debug!("Witness {} of round {} is {:?}", hash.short(), round, fame);
                store.log_fame(w, fame);
                update.decided.push((hash, fame));
            }
        }
    }

    // ----- phase 3: order -----

    fn extract_order(&mut self, store: &mut EventStore, update: &mut ConsensusUpdate) {
        loop {
            let round = self.last_extracted.map_or(0, |last| last + 1);
            let witnesses = store.round_witnesses(round);
            if witnesses.is_empty() {
                return;
            }
            if witnesses.iter().any(|&w| !store.record(w).fame.is_decided()) {
                return;
            }

            let famous: Vec<usize> = witnesses
                .into_iter()
                .filter(|&w| store.record(w).fame == Fame::Famous)
                .collect();

            let view: &EventStore = store;
            let mut batch: Vec<(DateTime<Utc>, EventHash, usize)> = received_in(view, &famous)
                .into_iter()
                .map(|idx| (consensus_timestamp(view, &famous, idx), view.record(idx).event.hash, idx))
                .collect();
            batch.sort_by_key(|&(timestamp, hash, _)| (timestamp, hash));

            let mut hashes = Vec::with_capacity(batch.len());
            for (timestamp, hash, idx) in batch {
                let position = ConsensusPosition {
                    index: store.ordered().len() as u64,
                    round_received: round,
                    timestamp,
                };
                store.push_ordered(idx, position);
                hashes.push(hash);
            }

            info!(
                "Round {} decided: {} famous witnesses, {} events ordered",
                round,
                famous.len(),
                hashes.len()
            );
            update.ordered.extend(hashes.iter().copied());
            self.received.insert(round, hashes);
            self.last_extracted = Some(round);
        }
    }
}

/// Per-pass memo of strongly-sees answers shared by every witness vote.
#[derive(Default)]
struct Voting {
    strongly: HashMap<(usize, usize, usize), bool>,
}

impl Voting {
    fn strongly_sees(&mut self, store: &EventStore, a: usize, b: usize, n: usize) -> bool {
        *self
            .strongly
            .entry((a, b, n))
            .or_insert_with(|| store.strongly_sees_idx(a, b, n))
    }

    /// Run the election for witness `w` of `round`. `None` while undecided.
    fn decide(
        &mut self,
        store: &EventStore,
        w: usize,
        round: u64,
        max_round: u64,
        n: usize,
    ) -> Option<bool> {
        // First voting round: a witness votes for w exactly when it sees w.
        let mut votes: Vec<(usize, bool)> = store
            .round_witnesses(round + 1)
            .into_iter()
            .map(|x| (x, store.sees_idx(x, w)))
            .collect();

        for voting_round in round + 2..=max_round {
            let mut next = Vec::new();
            for y in store.round_witnesses(voting_round) {
                let (mut yes, mut no) = (0, 0);
                for &(x, vote) in &votes {
                    if self.strongly_sees(store, y, x, n) {
                        if vote {
                            yes += 1;
                        } else {
                            no += 1;
                        }
                    }
                }

                if !is_supermajority(yes + no, n) {
                    continue;
                }
                if is_supermajority(yes, n) {
                    return Some(true);
                }
                if is_supermajority(no, n) {
                    return Some(false);
                }
                next.push((y, yes >= no));
            }
            votes = next;
        }
        None
    }
}

/// Unordered events seen by every famous witness in `famous`.
fn received_in(store: &EventStore, famous: &[usize]) -> Vec<usize> {
    let Some((&first, rest)) = famous.split_first() else {
        return Vec::new();
    };

    // Ancestors of an ordered event are ordered too, so the walk stops there.
    let mut candidates = Vec::new();
    let mut visited = HashSet::from([first]);
    let mut stack = vec![first];
    while let Some(idx) = stack.pop() {
        if store.record(idx).consensus.is_some() {
            continue;
        }
        candidates.push(idx);
        for parent in store.parent_indices(idx) {
            if visited.insert(parent) {
                stack.push(parent);
            }
        }
    }

    candidates.retain(|&idx| rest.iter().all(|&w| store.sees_idx(w, idx)));
    candidates
}

/// Median over the famous witnesses of the time each first learned of `idx`:
/// the timestamp of its earliest self-ancestor that sees the event.
fn consensus_timestamp(store: &EventStore, famous: &[usize], idx: usize) -> DateTime<Utc> {
    let mut times: Vec<DateTime<Utc>> = famous
        .iter()
        .map(|&w| {
            let mut earliest = w;
            while let Some(sp) = store.record(earliest).self_parent {
                if !store.sees_idx(sp, idx) {
                    break;
                }
                earliest = sp;
            }
            store.record(earliest).event.timestamp
        })
        .collect();
    times.sort();
    times[times.len() / 2]
}
