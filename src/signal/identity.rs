use crate::crypto::xed25519;
use crate::signal::ecc::{self, KeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The long-term Curve25519 public key identifying an account's device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey {
    public_key: [u8; 32],
}

impl IdentityKey {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self { public_key }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Type-prefixed wire form, the byte string MACs and signatures
    /// bind to.
    pub fn serialize(&self) -> [u8; 33] {
        ecc::serialize_point(&self.public_key)
    }

    /// Verifies an XEd25519 signature made by this identity key.
    pub fn verify_signature(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        xed25519::verify(&self.public_key, message, signature)
    }
}

/// The account's long-term identity key pair. Created once, never
/// rotated.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    pub public: IdentityKey,
    pub key_pair: KeyPair,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let key_pair = KeyPair::generate();
        Self {
            public: IdentityKey::new(key_pair.public_key),
            key_pair,
        }
    }

    /// Signs the type-prefixed form of a prekey public half.
    pub fn sign_prekey(&self, prekey_public: &[u8; 32]) -> [u8; 64] {
        let message = ecc::serialize_point(prekey_public);
        xed25519::sign(&self.key_pair.private_key, &message)
    }

    /// Registration id derived from the public identity key. Stable
    /// across restarts; the own device id is derived from it.
    pub fn registration_id(&self) -> u32 {
        let digest = Sha256::digest(self.public.public_key());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}
