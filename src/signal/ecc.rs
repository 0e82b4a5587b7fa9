use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{x25519, PublicKey, StaticSecret};

/// Type byte prefixed to serialized Curve25519 points on the wire.
pub const DJB_TYPE: u8 = 0x05;

#[derive(Debug, Error)]
pub enum CurveError {
    #[error("bad key type: {0}")]
    BadKeyType(u8),
    #[error("bad key length: {0}")]
    BadKeyLength(usize),
}

/// An X25519 key pair. Stored and serialized as raw 32-byte halves.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub private_key: [u8; 32],
}

impl KeyPair {
    /// Generates a fresh random key pair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.try_fill_bytes(&mut bytes).expect("OS RNG failure");
        Self::from_private_key(bytes)
    }

    pub fn from_private_key(private_key: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_key);
        let public = PublicKey::from(&secret);
        Self {
            public_key: *public.as_bytes(),
            private_key: secret.to_bytes(),
        }
    }

    /// X25519 Diffie-Hellman agreement against a remote public key.
    pub fn agree(&self, their_public: &[u8; 32]) -> [u8; 32] {
        x25519(self.private_key, *their_public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log private key material.
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Serializes a public key with the DJB type prefix.
pub fn serialize_point(public_key: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = DJB_TYPE;
    out[1..].copy_from_slice(public_key);
    out
}

/// Parses a type-prefixed public key point.
pub fn decode_point(bytes: &[u8]) -> Result<[u8; 32], CurveError> {
    match bytes {
        [] => Err(CurveError::BadKeyType(0)),
        [DJB_TYPE, rest @ ..] => rest
            .try_into()
            .map_err(|_| CurveError::BadKeyLength(bytes.len())),
        [t, ..] => Err(CurveError::BadKeyType(*t)),
    }
}
