//! Ed25519 signing keys for node identities

use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::NodeError;
use crate::types::PubKey;

/// Ed25519 keypair used to sign objects and messages.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Result<Self, NodeError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| NodeError::Storage(format!("no entropy available: {}", e)))?;
        Ok(Self::from_seed(&seed))
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The seed this keypair was built from, for persistence
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Public half of the keypair
    pub fn public_key(&self) -> PubKey {
        PubKey::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.seed())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// Verify a 64-byte ed25519 signature against a public key.
pub fn verify_signature(pub_key: &PubKey, message: &[u8], signature: &[u8]) -> Result<(), NodeError> {
    let key = VerifyingKey::from_bytes(pub_key.as_bytes())
        .map_err(|e| NodeError::InvalidSignature(format!("bad public key: {}", e)))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| NodeError::InvalidSignature("signature must be 64 bytes".to_string()))?;
    let sig = Ed25519Signature::from_bytes(&sig_bytes);
    key.verify(message, &sig)
        .map_err(|e| NodeError::InvalidSignature(e.to_string()))
}

/// Hex fingerprint of a public key (blake3 of the key bytes)
pub fn fingerprint(pub_key: &PubKey) -> String {
    blake3::hash(pub_key.as_bytes()).to_hex().to_string()
}
