use crate::crypto::hkdf;
use crate::signal::chain_key::ChainKey;
use crate::signal::ecc::KeyPair;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DERIVED_SECRETS_SIZE: usize = 64;
const KDF_INFO: &str = "WhisperRatchet";

#[derive(Debug, Error)]
pub enum RootKeyError {
    #[error("KDF error: {0}")]
    Kdf(#[from] hkdf::HkdfError),
}

/// The root of the DH ratchet. Each DH step folds a fresh shared secret
/// into it and spins off a new chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootKey {
    key: [u8; 32],
}

/// A root key with the chain it derived.
pub struct SessionKeyPair {
    pub root_key: RootKey,
    pub chain_key: ChainKey,
}

impl RootKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn create_chain(
        &self,
        their_ratchet_key: &[u8; 32],
        our_ratchet_key: &KeyPair,
    ) -> Result<SessionKeyPair, RootKeyError> {
        let shared_secret = our_ratchet_key.agree(their_ratchet_key);
        let derived = hkdf::derive_secrets(
            &shared_secret,
            Some(&self.key),
            KDF_INFO.as_bytes(),
            DERIVED_SECRETS_SIZE,
        )?;

        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&derived[0..32]);
        chain.copy_from_slice(&derived[32..64]);

        Ok(SessionKeyPair {
            root_key: RootKey::new(root),
            chain_key: ChainKey::new(chain, 0),
        })
    }
}
