use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use thiserror::Error;

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

#[derive(Debug, Error)]
pub enum CbcError {
    #[error("invalid key or IV length for CBC mode: {0}")]
    InvalidLength(#[from] cipher::InvalidLength),
    #[error("cipher operation failed")]
    CipherError,
    #[error("invalid padding")]
    InvalidPadding,
}

type Result<T> = std::result::Result<T, CbcError>;

/// AES-256-CBC with PKCS#7 padding; used for the ratchet-interior
/// ciphertext, keyed per-message by the chain-derived message key.
pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv)?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CbcError::InvalidLength(cipher::InvalidLength));
    }
    let mut buf = ciphertext.to_vec();
    Aes256CbcDec::new_from_slices(key, iv)?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| CbcError::CipherError)?;

    // Manual unpad keeps padding errors distinct from cipher errors.
    let pad_len = *buf.last().ok_or(CbcError::InvalidPadding)? as usize;
    if pad_len == 0 || pad_len > buf.len() || pad_len > 16 {
        return Err(CbcError::InvalidPadding);
    }
    buf.truncate(buf.len() - pad_len);
    Ok(buf)
}
