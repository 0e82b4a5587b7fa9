use crate::crypto::hkdf;
use crate::signal::message_key::{self, MessageKeys};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];

/// One link of a sending or receiving chain. Stepping the chain is a
/// one-way HMAC derivation; message keys branch off each link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn next_key(&self) -> ChainKey {
        ChainKey::new(self.base_material(CHAIN_KEY_SEED), self.index + 1)
    }

    pub fn message_keys(&self) -> MessageKeys {
        let input = self.base_material(MESSAGE_KEY_SEED);
        let derived = hkdf::derive_secrets(
            &input,
            None,
            message_key::KDF_SALT.as_bytes(),
            message_key::DERIVED_SECRETS_SIZE,
        )
        .expect("fixed-size HKDF expand cannot fail");

        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut iv = [0u8; 16];
        cipher_key.copy_from_slice(&derived[0..32]);
        mac_key.copy_from_slice(&derived[32..64]);
        iv.copy_from_slice(&derived[64..80]);

        MessageKeys::new(cipher_key, mac_key, iv, self.index)
    }

    fn base_material(&self, seed: &[u8]) -> [u8; 32] {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(seed);
        mac.finalize().into_bytes().into()
    }
}
