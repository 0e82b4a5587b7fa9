use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::TryRngCore;
use thiserror::Error;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum GcmError {
    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),
    #[error("invalid IV length: {0}")]
    InvalidIvLength(usize),
    #[error("AES-GCM decryption failed (tag mismatch)")]
    DecryptionFailed,
    #[error("AES-GCM encryption failed")]
    EncryptionFailed,
}

/// Result of sealing a message payload: the fresh key and IV travel to
/// each recipient device inside the ratchet, the ciphertext (with the
/// tag appended) goes on the wire once.
pub struct SealedPayload {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

/// AES-128-GCM with a freshly random key and IV per call.
pub fn seal(plaintext: &[u8]) -> Result<SealedPayload, GcmError> {
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.try_fill_bytes(&mut key).expect("OS RNG failure");
    OsRng.try_fill_bytes(&mut iv).expect("OS RNG failure");

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| GcmError::EncryptionFailed)?;
    Ok(SealedPayload {
        key,
        iv,
        ciphertext,
    })
}

/// Opens a sealed payload. The tag is expected appended to the
/// ciphertext; any mismatch yields `DecryptionFailed`.
pub fn open(key: &[u8], iv: &[u8], payload: &[u8]) -> Result<Vec<u8>, GcmError> {
    if key.len() != KEY_LEN {
        return Err(GcmError::InvalidKeyLength(key.len()));
    }
    if iv.len() != IV_LEN {
        return Err(GcmError::InvalidIvLength(iv.len()));
    }
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), payload)
        .map_err(|_| GcmError::DecryptionFailed)
}
