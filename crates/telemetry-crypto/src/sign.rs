//! Agent-side signing (§4.B).
//!
//! The private key is loaded once at agent startup and held in memory for
//! the process lifetime — there is no key rotation mid-process.

use ed25519_dalek::{Signer as _, SigningKey};
use telemetry_types::{codec, Envelope};

use crate::error::{CryptoError, Result};

/// Holds the agent's Ed25519 signing key for its lifetime.
pub struct Signer {
    signing_key: SigningKey,
}

impl Signer {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load a 32-byte raw seed from a hex-encoded file, the private-key
    /// loading convention this workspace uses for agent identity.
    pub fn from_hex_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::InvalidKey(format!("{}: {}", path.display(), e)))?;
        let bytes = hex::decode(contents.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signing key must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign `envelope`'s canonical bytes and populate its `signature` field.
    pub fn sign(&self, mut envelope: Envelope) -> Envelope {
        let bytes = codec::canonical(&envelope);
        let signature = self.signing_key.sign(&bytes);
        envelope.signature = Some(signature.to_bytes().to_vec());
        envelope
    }
}
