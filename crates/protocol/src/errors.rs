//! Protocol errors module

use thiserror::Error;

use crate::crypto::CryptoError;

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {source}")]
    SerializationError { source: serde_json::Error },

    #[error("Invalid format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Cryptographic error: {source}")]
    CryptographicError { source: CryptoError },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::SerializationError { source: err }
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        ProtocolError::CryptographicError { source: err }
    }
}
