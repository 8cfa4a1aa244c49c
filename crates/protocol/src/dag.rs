//! Shared DAG-related structures.
//!
//! These helper types describe consensus metadata and statistics that the
//! federation crate produces and the query adapters expose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{EventHash, NodeId};
use crate::wire::EventMessage;

/// Fame of a witness. Settles once from `Pending` and never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Fame {
    #[default]
    Pending,
    Famous,
    NotFamous,
}

impl Fame {
    pub fn is_decided(&self) -> bool {
        !matches!(self, Fame::Pending)
    }

    pub fn from_vote(famous: bool) -> Self {
        if famous {
            Fame::Famous
        } else {
            Fame::NotFamous
        }
    }
}

/// Where an event landed in the consensus order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPosition {
    /// Index in the node's total order
    pub index: u64,
    /// Round whose famous witnesses ordered the event
    pub round_received: u64,
    /// Median of the famous witnesses' receive times
    pub timestamp: DateTime<Utc>,
}

/// An event together with the metadata consensus derived for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventView {
    pub event: EventMessage,
    pub lamport: u64,
    pub round: Option<u64>,
    pub witness: bool,
    pub fame: Fame,
    pub consensus: Option<ConsensusPosition>,
}

/// A witness as listed in a round summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSummary {
    pub hash: EventHash,
    pub creator: NodeId,
    pub fame: Fame,
}

/// State of one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u64,
    /// Number of events assigned to the round
    pub event_count: usize,
    pub witnesses: Vec<WitnessSummary>,
    /// Every known witness has a settled fame
    pub decided: bool,
    /// Events ordered by this round's famous witnesses, in consensus order
    pub received: Vec<EventHash>,
    /// Size of the peer set the round was voted against
    pub peer_count: Option<usize>,
}

/// DAG statistics for monitoring and observability.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DagStats {
    /// Total number of events in the DAG
    pub total_events: usize,
    /// Number of tips (events with no children)
    pub tip_count: usize,
    /// Number of unique creators seen
    pub node_count: usize,
    /// Highest assigned round
    pub max_round: Option<u64>,
    /// Highest round whose order has been extracted
    pub last_decided_round: Option<u64>,
    /// Events placed in the consensus order
    pub ordered_events: usize,
    /// Events waiting on a missing parent
    pub buffered_events: usize,
    /// Buffered events given up on
    pub dropped_events: u64,
    /// Earliest event timestamp
    pub earliest_timestamp: Option<DateTime<Utc>>,
    /// Latest event timestamp
    pub latest_timestamp: Option<DateTime<Utc>>,
}
