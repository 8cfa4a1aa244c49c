//! Hashgraph event definitions.
//!
//! An event is a signed batch of transactions that references at most two
//! earlier events: the previous event by the same creator (`self_parent`) and
//! the latest event the creator heard from someone else (`other_parent`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{self, Identity};
use crate::errors::ProtocolError;

/// Node identifier: hex encoding of the creator's Ed25519 verifying key.
pub type NodeId = String;

/// Domain tag mixed into every event hash.
const EVENT_HASH_DOMAIN: &[u8] = b"WEAVE_EVENT_V1";

/// Blake3 content hash of an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHash([u8; 32]);

impl EventHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHash({})", self.short())
    }
}

impl FromStr for EventHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ProtocolError::InvalidFormat {
            reason: format!("Event hash is not valid hex: {}", s),
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| ProtocolError::InvalidFormat {
            reason: "Event hash must be 32 bytes".to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for EventHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Raw signature bytes as received. Length is only checked at verification.
#[derive(Clone, PartialEq, Eq)]
pub struct EventSignature(Vec<u8>);

impl EventSignature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for EventSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "EventSignature({}..)", &hex[..hex.len().min(16)])
    }
}

/// A single signed event in the hashgraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Id of the node that created this event
    pub creator: NodeId,
    /// Previous event by the same creator, `None` for a root event
    pub self_parent: Option<EventHash>,
    /// Latest event received from another creator
    pub other_parent: Option<EventHash>,
    /// Opaque transaction payloads, in submission order
    pub transactions: Vec<Vec<u8>>,
    /// Creation time, truncated to microseconds
    pub timestamp: DateTime<Utc>,
    /// Content hash over the fields above
    pub hash: EventHash,
    /// Creator's signature over `hash`
    pub signature: EventSignature,
}

impl Event {
    /// Create and sign a new event for `identity`.
    pub fn new(
        identity: &Identity,
        self_parent: Option<EventHash>,
        other_parent: Option<EventHash>,
        transactions: Vec<Vec<u8>>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ProtocolError> {
        let timestamp = canonicalize(timestamp);
        let creator = identity.node_id().to_string();
        let hash = Self::compute_hash(
            &creator,
            self_parent.as_ref(),
            other_parent.as_ref(),
            &timestamp,
            &transactions,
        );
        let signature = identity.sign(&hash)?;

        Ok(Event {
            creator,
            self_parent,
            other_parent,
            transactions,
            timestamp,
            hash,
            signature,
        })
    }

    /// Create a root event stamped with the current time.
    pub fn new_root(identity: &Identity, transactions: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        Self::new(identity, None, None, transactions, Utc::now())
    }

    /// Digest over (creator, self parent, other parent, timestamp, transactions).
    ///
    /// Every field is length-prefixed so that adjacent fields cannot bleed into
    /// each other. An absent parent contributes an empty field.
    pub fn compute_hash(
        creator: &str,
        self_parent: Option<&EventHash>,
        other_parent: Option<&EventHash>,
        timestamp: &DateTime<Utc>,
        transactions: &[Vec<u8>],
    ) -> EventHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(EVENT_HASH_DOMAIN);
        write_field(&mut hasher, creator.as_bytes());
        write_field(&mut hasher, self_parent.map_or(&[][..], |h| &h.as_bytes()[..]));
        write_field(&mut hasher, other_parent.map_or(&[][..], |h| &h.as_bytes()[..]));
        write_field(&mut hasher, canonical_timestamp(timestamp).as_bytes());
        hasher.update(&(transactions.len() as u64).to_le_bytes());
        for tx in transactions {
            write_field(&mut hasher, tx);
        }
        EventHash(*hasher.finalize().as_bytes())
    }

    /// Hash recomputed from the event's fields, ignoring the claimed hash.
    pub fn recompute_hash(&self) -> EventHash {
        Self::compute_hash(
            &self.creator,
            self.self_parent.as_ref(),
            self.other_parent.as_ref(),
            &self.timestamp,
            &self.transactions,
        )
    }

    pub fn verify_hash(&self) -> bool {
        self.recompute_hash() == self.hash
    }

    /// Verify the signature over the claimed hash.
    pub fn verify_signature(&self, public_key: &VerifyingKey) -> bool {
        crypto::verify(&self.hash, &self.signature, public_key)
    }

    pub fn is_root(&self) -> bool {
        self.self_parent.is_none()
    }

    /// Parents that are present, self parent first.
    pub fn parents(&self) -> impl Iterator<Item = &EventHash> {
        self.self_parent.iter().chain(self.other_parent.iter())
    }
}

fn write_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Truncate a timestamp to the precision carried on the wire.
pub fn canonicalize(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(6)
}

/// RFC 3339 rendering with fixed microsecond precision and a `Z` suffix.
pub fn canonical_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a wire timestamp into its canonical form.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ProtocolError> {
    let parsed = DateTime::parse_from_rfc3339(s).map_err(|_| ProtocolError::InvalidFormat {
        reason: format!("Invalid timestamp: {}", s),
    })?;
    Ok(canonicalize(parsed.with_timezone(&Utc)))
}
