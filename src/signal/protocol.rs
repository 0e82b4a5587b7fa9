use crate::signal::ecc::CurveError;
use crate::signal::identity::IdentityKey;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const CURRENT_VERSION: u8 = 3;
const MAC_LENGTH: usize = 8;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad MAC")]
    BadMac,
    #[error("invalid message version: {0}")]
    InvalidVersion(u8),
    #[error("incomplete message")]
    IncompleteMessage,
    #[error("malformed message body: {0}")]
    Malformed(String),
    #[error("invalid key: {0}")]
    InvalidKey(#[from] CurveError),
}

fn encode_body<T: Serialize>(body: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(body, bincode::config::standard())
        .expect("in-memory encoding cannot fail")
}

fn decode_body<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (body, consumed) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if consumed != bytes.len() {
        return Err(ProtocolError::Malformed("trailing bytes".into()));
    }
    Ok(body)
}

#[derive(Serialize, Deserialize)]
struct SignalMessageBody {
    ratchet_key: [u8; 32],
    counter: u32,
    previous_counter: u32,
    ciphertext: Vec<u8>,
}

/// An ordinary ratchet message: versioned body plus a truncated
/// HMAC-SHA256 binding both parties' identity keys.
pub struct SignalMessage {
    pub ratchet_key: [u8; 32],
    pub counter: u32,
    pub previous_counter: u32,
    pub ciphertext: Vec<u8>,
    serialized: Vec<u8>,
}

impl SignalMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mac_key: &[u8],
        ratchet_key: [u8; 32],
        counter: u32,
        previous_counter: u32,
        ciphertext: Vec<u8>,
        sender_identity: &IdentityKey,
        receiver_identity: &IdentityKey,
    ) -> Self {
        let version_byte = (CURRENT_VERSION << 4) | CURRENT_VERSION;
        let body = encode_body(&SignalMessageBody {
            ratchet_key,
            counter,
            previous_counter,
            ciphertext: ciphertext.clone(),
        });

        let mut serialized = Vec::with_capacity(1 + body.len() + MAC_LENGTH);
        serialized.push(version_byte);
        serialized.extend_from_slice(&body);
        let mac = compute_mac(
            mac_key,
            sender_identity,
            receiver_identity,
            &serialized[..1 + body.len()],
        );
        serialized.extend_from_slice(&mac);

        Self {
            ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized,
        }
    }

    pub fn deserialize(serialized: &[u8]) -> Result<Self, ProtocolError> {
        if serialized.len() < 1 + MAC_LENGTH + 1 {
            return Err(ProtocolError::IncompleteMessage);
        }
        let version = serialized[0] >> 4;
        if version != CURRENT_VERSION {
            return Err(ProtocolError::InvalidVersion(version));
        }
        let body: SignalMessageBody =
            decode_body(&serialized[1..serialized.len() - MAC_LENGTH])?;
        Ok(Self {
            ratchet_key: body.ratchet_key,
            counter: body.counter,
            previous_counter: body.previous_counter,
            ciphertext: body.ciphertext,
            serialized: serialized.to_vec(),
        })
    }

    pub fn serialize(&self) -> &[u8] {
        &self.serialized
    }

    /// Recomputes the MAC with the message keys for this counter and
    /// compares in constant time.
    pub fn verify_mac(
        &self,
        mac_key: &[u8],
        sender_identity: &IdentityKey,
        receiver_identity: &IdentityKey,
    ) -> Result<(), ProtocolError> {
        let body_len = self.serialized.len() - MAC_LENGTH;
        let expected = compute_mac(
            mac_key,
            sender_identity,
            receiver_identity,
            &self.serialized[..body_len],
        );
        let received = &self.serialized[body_len..];
        if expected.ct_eq(received).into() {
            Ok(())
        } else {
            Err(ProtocolError::BadMac)
        }
    }
}

fn compute_mac(
    mac_key: &[u8],
    sender_identity: &IdentityKey,
    receiver_identity: &IdentityKey,
    data: &[u8],
) -> [u8; MAC_LENGTH] {
    let mut mac = Hmac::<Sha256>::new_from_slice(mac_key).expect("HMAC accepts any key length");
    mac.update(&sender_identity.serialize());
    mac.update(&receiver_identity.serialize());
    mac.update(data);
    let full: [u8; 32] = mac.finalize().into_bytes().into();
    let mut out = [0u8; MAC_LENGTH];
    out.copy_from_slice(&full[..MAC_LENGTH]);
    out
}

#[derive(Serialize, Deserialize)]
struct PreKeyMessageBody {
    registration_id: u32,
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
    base_key: [u8; 32],
    identity_key: [u8; 32],
    message: Vec<u8>,
}

/// A handshake message: carries the X3DH public material plus an
/// ordinary [`SignalMessage`] encrypted under the freshly derived chain.
pub struct PreKeySignalMessage {
    pub registration_id: u32,
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
    pub identity_key: IdentityKey,
    pub message: SignalMessage,
    serialized: Vec<u8>,
}

impl PreKeySignalMessage {
    pub fn new(
        registration_id: u32,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
        base_key: [u8; 32],
        identity_key: IdentityKey,
        message: SignalMessage,
    ) -> Self {
        let version_byte = (CURRENT_VERSION << 4) | CURRENT_VERSION;
        let body = encode_body(&PreKeyMessageBody {
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key: identity_key.public_key(),
            message: message.serialize().to_vec(),
        });
        let mut serialized = Vec::with_capacity(1 + body.len());
        serialized.push(version_byte);
        serialized.extend_from_slice(&body);

        Self {
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
            serialized,
        }
    }

    pub fn deserialize(serialized: &[u8]) -> Result<Self, ProtocolError> {
        if serialized.len() < 2 {
            return Err(ProtocolError::IncompleteMessage);
        }
        let version = serialized[0] >> 4;
        if version != CURRENT_VERSION {
            return Err(ProtocolError::InvalidVersion(version));
        }
        let body: PreKeyMessageBody = decode_body(&serialized[1..])?;
        let message = SignalMessage::deserialize(&body.message)?;
        Ok(Self {
            registration_id: body.registration_id,
            pre_key_id: body.pre_key_id,
            signed_pre_key_id: body.signed_pre_key_id,
            base_key: body.base_key,
            identity_key: IdentityKey::new(body.identity_key),
            message,
            serialized: serialized.to_vec(),
        })
    }

    pub fn serialize(&self) -> &[u8] {
        &self.serialized
    }
}
