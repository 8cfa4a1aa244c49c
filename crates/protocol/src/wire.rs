//! Wire messages exchanged between peers.
//!
//! Messages are JSON objects tagged by `type`. Handshake payloads belong to
//! the transport and pass through untouched. Event fields travel as strings:
//! hashes and signatures hex-encoded, an empty parent meaning "no parent".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::events::{canonical_timestamp, parse_timestamp, Event, EventHash, EventSignature, NodeId};

/// A message on the peer transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Connection setup, opaque to the core
    Handshake { payload: serde_json::Value },
    /// A single gossiped event
    Event(EventMessage),
    /// Pull request for a specific event
    Request { hash: EventHash },
    /// Anti-entropy request carrying the sender's per-creator event counts
    Sync {
        known: BTreeMap<NodeId, u64>,
        limit: usize,
    },
    /// Batch of events answering a `Sync`
    Events {
        events: Vec<EventMessage>,
        has_more: bool,
    },
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Handshake { .. } => "handshake",
            WireMessage::Event(_) => "event",
            WireMessage::Request { .. } => "request",
            WireMessage::Sync { .. } => "sync",
            WireMessage::Events { .. } => "events",
        }
    }
}

impl From<&Event> for WireMessage {
    fn from(event: &Event) -> Self {
        WireMessage::Event(EventMessage::from(event))
    }
}

/// String form of an [`Event`] as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub creator: String,
    pub self_parent: String,
    pub other_parent: String,
    /// Hex-encoded transaction payloads
    pub transactions: Vec<String>,
    pub timestamp: String,
    pub hash: String,
    pub signature: String,
}

impl From<&Event> for EventMessage {
    fn from(event: &Event) -> Self {
        EventMessage {
            creator: event.creator.clone(),
            self_parent: encode_parent(event.self_parent.as_ref()),
            other_parent: encode_parent(event.other_parent.as_ref()),
            transactions: event.transactions.iter().map(hex::encode).collect(),
            timestamp: canonical_timestamp(&event.timestamp),
            hash: event.hash.to_hex(),
            signature: event.signature.to_hex(),
        }
    }
}

impl TryFrom<EventMessage> for Event {
    type Error = ProtocolError;

    fn try_from(message: EventMessage) -> Result<Self, Self::Error> {
        let transactions = message
            .transactions
            .iter()
            .map(|tx| {
                hex::decode(tx).map_err(|_| ProtocolError::InvalidFormat {
                    reason: "Transaction payload is not valid hex".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let signature = hex::decode(&message.signature).map_err(|_| ProtocolError::InvalidFormat {
            reason: "Invalid signature hex".to_string(),
        })?;

        Ok(Event {
            creator: message.creator,
            self_parent: decode_parent(&message.self_parent)?,
            other_parent: decode_parent(&message.other_parent)?,
            transactions,
            timestamp: parse_timestamp(&message.timestamp)?,
            hash: message.hash.parse()?,
            signature: EventSignature::from_bytes(signature),
        })
    }
}

fn encode_parent(parent: Option<&EventHash>) -> String {
    parent.map(EventHash::to_hex).unwrap_or_default()
}

fn decode_parent(parent: &str) -> Result<Option<EventHash>, ProtocolError> {
    if parent.is_empty() {
        Ok(None)
    } else {
        parent.parse().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    #[test]
    fn test_event_message_preserves_hash() {
        let identity = Identity::generate().unwrap();
        let root = Event::new_root(&identity, vec![b"hello".to_vec()]).unwrap();
        let child = Event::new(
            &identity,
            Some(root.hash),
            None,
            vec![vec![0, 1, 2], vec![]],
            chrono::Utc::now(),
        )
        .unwrap();

        let message = EventMessage::from(&child);
        assert_eq!(message.self_parent, root.hash.to_hex());
        assert_eq!(message.other_parent, "");

        let decoded = Event::try_from(message).unwrap();
        assert_eq!(decoded, child);
        assert!(decoded.verify_hash());
        assert!(decoded.verify_signature(&identity.verifying_key()));
    }

    #[test]
    fn test_wire_json_shape() {
        let identity = Identity::generate().unwrap();
        let event = Event::new_root(&identity, vec![]).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&WireMessage::from(&event).to_bytes().unwrap()).unwrap();

        assert_eq!(json["type"], "event");
        assert_eq!(json["selfParent"], "");
        assert_eq!(json["hash"], event.hash.to_hex());
    }

    #[test]
    fn test_malformed_fields_rejected() {
        let identity = Identity::generate().unwrap();
        let event = Event::new_root(&identity, vec![]).unwrap();

        let mut message = EventMessage::from(&event);
        message.self_parent = "not-hex".to_string();
        assert!(Event::try_from(message).is_err());

        let mut message = EventMessage::from(&event);
        message.signature = "zz".to_string();
        assert!(Event::try_from(message).is_err());

        // Valid hex of the wrong length decodes; verification rejects it later.
        let mut message = EventMessage::from(&event);
        message.signature = "abcd".to_string();
        let decoded = Event::try_from(message).unwrap();
        assert!(!decoded.verify_signature(&identity.verifying_key()));
    }

    #[test]
    fn test_sync_message_parses() {
        let bytes = br#"{"type":"sync","known":{"abc":3},"limit":10}"#;
        match WireMessage::from_bytes(bytes).unwrap() {
            WireMessage::Sync { known, limit } => {
                assert_eq!(known.get("abc"), Some(&3));
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected message {}", other.kind()),
        }
    }
}
