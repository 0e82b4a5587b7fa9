// SPDX-FileCopyrightText: 2023 Dominik George <nik@naturalnet.de>
// SPDX-FileCopyrightText: 2024 Tulir Asokan
//
// SPDX-License-Identifier: Apache-2.0
//
// This file is a consolidated and simplified version of the `xeddsa` crate,
// vendored for use within this project to provide XEd25519 signing and
// verification over X25519 (Montgomery) keys. Signed prekeys are signed
// with the account's Curve25519 identity key using this scheme.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::{Digest, Sha512};

/// Derives the Ed25519 key pair for an X25519 private key, negating the
/// scalar when needed so the public point matches the requested sign bit.
fn calculate_key_pair(private_key: &[u8; 32], sign: u8) -> ([u8; 32], [u8; 32]) {
    let clamped = clamp_integer(*private_key);
    let scalar = Scalar::from_bytes_mod_order(clamped);
    let point = EdwardsPoint::mul_base(&scalar);

    if (point.compress().to_bytes()[31] & 0x80) >> 7 == sign {
        (clamped, point.compress().to_bytes())
    } else {
        let negated = -scalar;
        let negated_point = EdwardsPoint::mul_base(&negated);
        (negated.to_bytes(), negated_point.compress().to_bytes())
    }
}

/// Signs `message` with a 32-byte X25519 private key, producing a
/// 64-byte XEd25519 signature.
pub fn sign(private_key: &[u8; 32], message: &[u8]) -> [u8; 64] {
    let (ed_private, ed_public) = calculate_key_pair(private_key, 0);

    let mut nonce = [0u8; 64];
    OsRng.try_fill_bytes(&mut nonce).expect("OS RNG failure");

    // r = H(pad || a || M || Z), with the domain-separation padding
    // prescribed for hash index 1.
    let padding = hash_i_padding::<32>(1);
    let mut hasher = Sha512::new();
    hasher.update(padding);
    hasher.update(ed_private);
    hasher.update(message);
    hasher.update(nonce);
    let r_hash: [u8; 64] = hasher.finalize().into();

    let r_scalar = Scalar::from_bytes_mod_order_wide(&r_hash);
    let r_point = EdwardsPoint::mul_base(&r_scalar);

    let mut hasher = Sha512::new();
    hasher.update(r_point.compress().to_bytes());
    hasher.update(ed_public);
    hasher.update(message);
    let h: [u8; 64] = hasher.finalize().into();

    let h_scalar = Scalar::from_bytes_mod_order_wide(&h);
    let s_scalar = r_scalar + h_scalar * Scalar::from_bytes_mod_order(ed_private);

    let mut signature = [0u8; 64];
    signature[0..32].copy_from_slice(&r_point.compress().to_bytes());
    signature[32..64].copy_from_slice(&s_scalar.to_bytes());
    signature
}

/// Verifies an XEd25519 signature against a 32-byte X25519 public key.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let sign_bit = (signature[63] & 0x80) >> 7;

    let edwards_point = match MontgomeryPoint(*public_key).to_edwards(sign_bit) {
        Some(p) => p,
        None => return false,
    };
    let verifying_key = match VerifyingKey::from_bytes(&edwards_point.compress().to_bytes()) {
        Ok(vk) => vk,
        Err(_) => return false,
    };

    let mut cleaned = *signature;
    cleaned[63] &= 0x7F;
    verifying_key
        .verify(message, &Signature::from_bytes(&cleaned))
        .is_ok()
}

const fn hash_i_padding<const S: usize>(i: u128) -> [u8; S] {
    let mut padding = [0xffu8; S];
    let bytes = (u128::MAX - i).to_le_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        padding[idx] = bytes[idx];
        idx += 1;
    }
    padding
}
