use crate::crypto::hkdf;
use crate::signal::chain_key::ChainKey;
use crate::signal::ecc::KeyPair;
use crate::signal::identity::{IdentityKey, IdentityKeyPair};
use crate::signal::root_key::{RootKey, RootKeyError};

const KDF_INFO: &str = "WhisperText";
const DISCONTINUITY: [u8; 32] = [0xFF; 32];

/// X3DH inputs when we initiate the session from a fetched bundle.
pub struct SenderParameters<'a> {
    pub our_identity: &'a IdentityKeyPair,
    pub our_base_key: &'a KeyPair,
    pub their_identity: &'a IdentityKey,
    pub their_signed_prekey: [u8; 32],
    pub their_one_time_prekey: Option<[u8; 32]>,
}

/// X3DH inputs when we respond to an incoming prekey message.
pub struct ReceiverParameters<'a> {
    pub our_identity: &'a IdentityKeyPair,
    pub our_signed_prekey: &'a KeyPair,
    pub our_one_time_prekey: Option<&'a KeyPair>,
    pub their_identity: &'a IdentityKey,
    pub their_base_key: [u8; 32],
}

/// The sender's freshly initialized ratchet: the post-step root key, the
/// sending chain, and the ratchet key pair that chain is bound to.
pub struct SenderSession {
    pub root_key: RootKey,
    pub chain_key: ChainKey,
    pub ratchet_key: KeyPair,
}

/// The receiver's ratchet: the initial root key and the chain the peer
/// will be sending on once they complete their first DH step against
/// our signed prekey.
pub struct ReceiverSession {
    pub root_key: RootKey,
    pub chain_key: ChainKey,
}

fn derive_initial_keys(master_secret: &[u8]) -> Result<(RootKey, ChainKey), RootKeyError> {
    let derived = hkdf::derive_secrets(master_secret, None, KDF_INFO.as_bytes(), 64)?;
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&derived[0..32]);
    chain.copy_from_slice(&derived[32..64]);
    Ok((RootKey::new(root), ChainKey::new(chain, 0)))
}

/// Computes the session the initiating side derives from a bundle:
/// DH1(IKa, SPKb) ‖ DH2(EKa, IKb) ‖ DH3(EKa, SPKb) ‖ DH4(EKa, OPKb),
/// then an immediate DH step with a fresh ratchet key so our first
/// message already advances the chain.
pub fn calculate_sender_session(
    params: &SenderParameters<'_>,
) -> Result<SenderSession, RootKeyError> {
    let mut master_secret = Vec::with_capacity(32 * 5);
    master_secret.extend_from_slice(&DISCONTINUITY);
    master_secret.extend_from_slice(
        &params
            .our_identity
            .key_pair
            .agree(&params.their_signed_prekey),
    );
    master_secret.extend_from_slice(
        &params
            .our_base_key
            .agree(&params.their_identity.public_key()),
    );
    master_secret.extend_from_slice(&params.our_base_key.agree(&params.their_signed_prekey));
    if let Some(otpk) = params.their_one_time_prekey {
        master_secret.extend_from_slice(&params.our_base_key.agree(&otpk));
    }

    let (root_key, _their_chain) = derive_initial_keys(&master_secret)?;

    let ratchet_key = KeyPair::generate();
    let stepped = root_key.create_chain(&params.their_signed_prekey, &ratchet_key)?;

    Ok(SenderSession {
        root_key: stepped.root_key,
        chain_key: stepped.chain_key,
        ratchet_key,
    })
}

/// Computes the mirrored session on the responding side.
pub fn calculate_receiver_session(
    params: &ReceiverParameters<'_>,
) -> Result<ReceiverSession, RootKeyError> {
    let mut master_secret = Vec::with_capacity(32 * 5);
    master_secret.extend_from_slice(&DISCONTINUITY);
    master_secret.extend_from_slice(
        &params
            .our_signed_prekey
            .agree(&params.their_identity.public_key()),
    );
    master_secret.extend_from_slice(&params.our_identity.key_pair.agree(&params.their_base_key));
    master_secret.extend_from_slice(&params.our_signed_prekey.agree(&params.their_base_key));
    if let Some(otpk) = params.our_one_time_prekey {
        master_secret.extend_from_slice(&otpk.agree(&params.their_base_key));
    }

    let (root_key, chain_key) = derive_initial_keys(&master_secret)?;
    Ok(ReceiverSession {
        root_key,
        chain_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs X3DH from both ends and checks the sender's first chain is
    /// exactly what the receiver derives by stepping its root against
    /// the sender's ratchet key.
    #[test]
    fn sender_and_receiver_sessions_agree() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let alice_base = KeyPair::generate();
        let bob_spk = KeyPair::generate();
        let bob_otpk = KeyPair::generate();

        let sender = calculate_sender_session(&SenderParameters {
            our_identity: &alice_identity,
            our_base_key: &alice_base,
            their_identity: &bob_identity.public,
            their_signed_prekey: bob_spk.public_key,
            their_one_time_prekey: Some(bob_otpk.public_key),
        })
        .unwrap();

        let receiver = calculate_receiver_session(&ReceiverParameters {
            our_identity: &bob_identity,
            our_signed_prekey: &bob_spk,
            our_one_time_prekey: Some(&bob_otpk),
            their_identity: &alice_identity.public,
            their_base_key: alice_base.public_key,
        })
        .unwrap();

        let bob_receiving = receiver
            .root_key
            .create_chain(&sender.ratchet_key.public_key, &bob_spk)
            .unwrap();

        assert_eq!(
            sender.chain_key.message_keys().cipher_key(),
            bob_receiving.chain_key.message_keys().cipher_key()
        );
    }

    #[test]
    fn omitting_the_one_time_prekey_still_agrees() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let alice_base = KeyPair::generate();
        let bob_spk = KeyPair::generate();

        let sender = calculate_sender_session(&SenderParameters {
            our_identity: &alice_identity,
            our_base_key: &alice_base,
            their_identity: &bob_identity.public,
            their_signed_prekey: bob_spk.public_key,
            their_one_time_prekey: None,
        })
        .unwrap();

        let receiver = calculate_receiver_session(&ReceiverParameters {
            our_identity: &bob_identity,
            our_signed_prekey: &bob_spk,
            our_one_time_prekey: None,
            their_identity: &alice_identity.public,
            their_base_key: alice_base.public_key,
        })
        .unwrap();

        let bob_receiving = receiver
            .root_key
            .create_chain(&sender.ratchet_key.public_key, &bob_spk)
            .unwrap();
        assert_eq!(
            sender.chain_key.message_keys().cipher_key(),
            bob_receiving.chain_key.message_keys().cipher_key()
        );
    }

    #[test]
    fn different_base_keys_disagree() {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_spk = KeyPair::generate();

        let a = calculate_sender_session(&SenderParameters {
            our_identity: &alice_identity,
            our_base_key: &KeyPair::generate(),
            their_identity: &bob_identity.public,
            their_signed_prekey: bob_spk.public_key,
            their_one_time_prekey: None,
        })
        .unwrap();
        let b = calculate_sender_session(&SenderParameters {
            our_identity: &alice_identity,
            our_base_key: &KeyPair::generate(),
            their_identity: &bob_identity.public,
            their_signed_prekey: bob_spk.public_key,
            their_one_time_prekey: None,
        })
        .unwrap();

        assert_ne!(
            a.chain_key.message_keys().cipher_key(),
            b.chain_key.message_keys().cipher_key()
        );
    }
}
