use crate::signal::ecc::KeyPair;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// A one-time prekey. Consumed exactly once, when a remote party
/// completes a handshake against it.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub id: u32,
    pub key_pair: KeyPair,
}

impl PreKeyRecord {
    pub fn generate(id: u32) -> Self {
        Self {
            id,
            key_pair: KeyPair::generate(),
        }
    }
}

/// A medium-lived prekey whose public half is signed by the identity
/// key. Exactly one is current; older ones linger until archived so
/// in-flight handshakes still decrypt.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub key_pair: KeyPair,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
    /// Unix seconds.
    pub created_at: i64,
}

impl SignedPreKeyRecord {
    pub fn new(id: u32, key_pair: KeyPair, signature: [u8; 64], created_at: i64) -> Self {
        Self {
            id,
            key_pair,
            signature,
            created_at,
        }
    }
}
