//! Node signing identity.
//!
//! Every node is identified by the hex encoding of its Ed25519 verifying key.
//! Events are signed over their 32-byte content hash, never over the raw
//! fields, so a signature only has to be checked after the hash itself has
//! been recomputed and matched.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::events::{EventHash, EventSignature, NodeId};

/// Errors raised while creating keys or signing.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    #[error("Signing failed: {reason}")]
    SigningFailed { reason: String },

    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },
}

/// A node's Ed25519 keypair together with its derived node id.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    node_id: NodeId,
}

impl Identity {
    /// Generate a fresh keypair from the operating system's randomness source.
    ///
    /// Failure here is only expected at startup and callers treat it as fatal.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut secret = [0u8; SECRET_KEY_LENGTH];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|e| CryptoError::KeyGeneration {
                reason: e.to_string(),
            })?;
        Ok(Self::from_secret(secret))
    }

    /// Build an identity from raw secret key bytes.
    pub fn from_secret(secret: [u8; SECRET_KEY_LENGTH]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let node_id = node_id_for(&signing_key.verifying_key());
        Self {
            signing_key,
            node_id,
        }
    }

    /// Build an identity from a hex-encoded secret key.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|_| CryptoError::InvalidKey {
            reason: "Secret key is not valid hex".to_string(),
        })?;
        let secret: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!("Secret key must be {} bytes", SECRET_KEY_LENGTH),
            })?;
        Ok(Self::from_secret(secret))
    }

    /// Hex encoding of the secret key, for `weave keygen`.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign an event hash.
    pub fn sign(&self, hash: &EventHash) -> Result<EventSignature, CryptoError> {
        let signature = self
            .signing_key
            .try_sign(hash.as_bytes())
            .map_err(|e| CryptoError::SigningFailed {
                reason: e.to_string(),
            })?;
        Ok(EventSignature::from_bytes(signature.to_bytes().to_vec()))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `hash` with `public_key`.
///
/// Malformed signature encodings verify as `false`.
pub fn verify(hash: &EventHash, signature: &EventSignature, public_key: &VerifyingKey) -> bool {
    let Ok(signature) = Signature::from_slice(signature.as_bytes()) else {
        return false;
    };
    public_key.verify(hash.as_bytes(), &signature).is_ok()
}

/// Node id derived from a verifying key.
pub fn node_id_for(public_key: &VerifyingKey) -> NodeId {
    hex::encode(public_key.as_bytes())
}

/// Parse a hex-encoded Ed25519 verifying key.
pub fn parse_public_key(public_key_hex: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(public_key_hex).map_err(|_| CryptoError::InvalidKey {
        reason: "Public key is not valid hex".to_string(),
    })?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
        reason: "Public key must be 32 bytes".to_string(),
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey {
        reason: e.to_string(),
    })
}
