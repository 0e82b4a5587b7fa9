use serde::{Deserialize, Serialize};

pub const DERIVED_SECRETS_SIZE: usize = 80;
pub const KDF_SALT: &str = "WhisperMessageKeys";

/// Symmetric material for exactly one ratchet message, derived from the
/// chain key at a given index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageKeys {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    iv: [u8; 16],
    index: u32,
}

impl MessageKeys {
    pub fn new(cipher_key: [u8; 32], mac_key: [u8; 32], iv: [u8; 16], index: u32) -> Self {
        Self {
            cipher_key,
            mac_key,
            iv,
            index,
        }
    }

    pub fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    pub fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}
