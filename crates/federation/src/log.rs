//! Event persistence log.
//!
//! The store appends every accepted event to an [`EventLog`] and replays the
//! log on startup. Events are kept in acceptance order, which is always a
//! topological order of the DAG, so replay never hits a missing parent.
//!
//! Consensus state that depends on more than the DAG goes into the same log:
//! the peer snapshot each round was voted against and every settled fame.
//! Reloading both before the first recompute keeps decided rounds decided.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use sled::{Db, Tree};
use thiserror::Error;
use weave_protocol::{Event, EventHash, EventMessage, Fame};

use crate::registry::PeerSnapshot;

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {source}")]
    DatabaseError { source: sled::Error },

    #[error("Serialization error: {source}")]
    SerializationError { source: serde_json::Error },

    #[error("Invalid event in log: {reason}")]
    InvalidEvent { reason: String },
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::DatabaseError { source: err }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError { source: err }
    }
}

/// Consensus state reloaded alongside the events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusCheckpoint {
    /// Peer snapshot each round was voted against
    pub rounds: BTreeMap<u64, PeerSnapshot>,
    /// Settled fame of witnesses
    pub fame: HashMap<EventHash, Fame>,
}

impl ConsensusCheckpoint {
    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty() && self.fame.is_empty()
    }
}

/// Append-only log of accepted events.
pub trait EventLog: Send + Sync {
    /// Persist an accepted event.
    fn append(&mut self, event: &Event) -> Result<(), StorageError>;

    /// Load every persisted event in append order.
    fn load(&self) -> Result<Vec<Event>, StorageError>;

    /// Persist the peer snapshot `round` is voted against.
    fn record_round(&mut self, round: u64, peers: &PeerSnapshot) -> Result<(), StorageError>;

    /// Persist a settled fame.
    fn record_fame(&mut self, witness: &EventHash, fame: Fame) -> Result<(), StorageError>;

    /// Load the persisted round snapshots and fame decisions.
    fn load_checkpoint(&self) -> Result<ConsensusCheckpoint, StorageError>;
}

/// Log that persists nothing. Used when the node runs without a database.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl EventLog for NullLog {
    fn append(&mut self, _event: &Event) -> Result<(), StorageError> {
        Ok(())
    }

    fn load(&self) -> Result<Vec<Event>, StorageError> {
        Ok(Vec::new())
    }

    fn record_round(&mut self, _round: u64, _peers: &PeerSnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    fn record_fame(&mut self, _witness: &EventHash, _fame: Fame) -> Result<(), StorageError> {
        Ok(())
    }

    fn load_checkpoint(&self) -> Result<ConsensusCheckpoint, StorageError> {
        Ok(ConsensusCheckpoint::default())
    }
}

/// Log that keeps everything in memory, for tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryLog {
    events: Vec<Event>,
    checkpoint: ConsensusCheckpoint,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventLog for MemoryLog {
    fn append(&mut self, event: &Event) -> Result<(), StorageError> {
        self.events.push(event.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<Event>, StorageError> {
        Ok(self.events.clone())
    }

    fn record_round(&mut self, round: u64, peers: &PeerSnapshot) -> Result<(), StorageError> {
        self.checkpoint.rounds.insert(round, peers.clone());
        Ok(())
    }

    fn record_fame(&mut self, witness: &EventHash, fame: Fame) -> Result<(), StorageError> {
        self.checkpoint.fame.insert(*witness, fame);
        Ok(())
    }

    fn load_checkpoint(&self) -> Result<ConsensusCheckpoint, StorageError> {
        Ok(self.checkpoint.clone())
    }
}

/// Log backed by sled. Events sit in a tree keyed by a big-endian append
/// counter; round snapshots and fame decisions get a tree each.
pub struct SledLog {
    /// Main database
    db: Db,
    /// Events tree (counter -> EventMessage JSON)
    events: Tree,
    /// Rounds tree (round -> PeerSnapshot JSON)
    rounds: Tree,
    /// Fame tree (witness hash -> Fame JSON)
    fame: Tree,
    /// Key for the next append
    next: u64,
}

impl SledLog {
    /// Create or open a log at the given database path
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        let db = sled::open(db_path)?;
        let events = db.open_tree("events")?;
        let rounds = db.open_tree("rounds")?;
        let fame = db.open_tree("fame")?;

        let next = match events.last()? {
            Some((key, _)) => decode_counter(&key)? + 1,
            None => 0,
        };

        Ok(SledLog {
            db,
            events,
            rounds,
            fame,
            next,
        })
    }
}

impl EventLog for SledLog {
    fn append(&mut self, event: &Event) -> Result<(), StorageError> {
        let json = serde_json::to_vec(&EventMessage::from(event))?;
        self.events.insert(self.next.to_be_bytes(), json)?;
        self.next += 1;
        self.db.flush()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<Event>, StorageError> {
        let mut events = Vec::new();
        for result in self.events.iter() {
            let (_, bytes) = result?;
            let message: EventMessage = serde_json::from_slice(&bytes)?;
            let event = Event::try_from(message).map_err(|e| StorageError::InvalidEvent {
                reason: e.to_string(),
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn record_round(&mut self, round: u64, peers: &PeerSnapshot) -> Result<(), StorageError> {
        self.rounds.insert(round.to_be_bytes(), serde_json::to_vec(peers)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn record_fame(&mut self, witness: &EventHash, fame: Fame) -> Result<(), StorageError> {
        self.fame.insert(witness.as_bytes(), serde_json::to_vec(&fame)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn load_checkpoint(&self) -> Result<ConsensusCheckpoint, StorageError> {
        let mut checkpoint = ConsensusCheckpoint::default();
        for result in self.rounds.iter() {
            let (key, bytes) = result?;
            let peers: PeerSnapshot = serde_json::from_slice(&bytes)?;
            checkpoint.rounds.insert(decode_counter(&key)?, peers);
        }
        for result in self.fame.iter() {
            let (key, bytes) = result?;
            let fame: Fame = serde_json::from_slice(&bytes)?;
            checkpoint.fame.insert(decode_hash(&key)?, fame);
        }
        Ok(checkpoint)
    }
}

fn decode_counter(key: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| StorageError::InvalidEvent {
        reason: "Invalid log key format".to_string(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_hash(key: &[u8]) -> Result<EventHash, StorageError> {
    let bytes: [u8; 32] = key.try_into().map_err(|_| StorageError::InvalidEvent {
        reason: "Invalid fame key format".to_string(),
    })?;
    Ok(EventHash::from_bytes(bytes))
}
