//! The entities that cross the wire: published device lists, key
//! bundles, and the per-message envelope carrying the wrapped keys.

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::signal::identity::IdentityKey;
use crate::signal::session::PreKeyBundle;

/// PubSub node holding a user's device id list.
pub const DEVICE_LIST_NODE: &str = "eu.siacs.conversations.axolotl.devicelist";
/// Prefix of the per-device bundle nodes; the device id is appended.
pub const BUNDLE_NODE_PREFIX: &str = "eu.siacs.conversations.axolotl.bundles:";

pub fn bundle_node(device_id: u32) -> String {
    format!("{BUNDLE_NODE_PREFIX}{device_id}")
}

/// The list of active device ids a user announces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    pub devices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyEntry {
    pub id: u32,
    pub public_key: [u8; 32],
}

/// A device's published key bundle: identity key, the current signed
/// prekey with its signature, and the one-time prekey pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmemoBundle {
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: [u8; 32],
    #[serde(with = "BigArray")]
    pub signed_pre_key_signature: [u8; 64],
    pub pre_keys: Vec<PreKeyEntry>,
}

impl OmemoBundle {
    /// Converts into the signal-layer bundle, picking one one-time
    /// prekey uniformly at random so the pool drains evenly.
    pub fn to_signal_bundle(&self) -> PreKeyBundle {
        let picked = self.pre_keys.choose(&mut rand::rng());
        PreKeyBundle {
            pre_key_id: picked.map(|p| p.id),
            pre_key_public: picked.map(|p| p.public_key),
            signed_pre_key_id: self.signed_pre_key_id,
            signed_pre_key_public: self.signed_pre_key_public,
            signed_pre_key_signature: self.signed_pre_key_signature,
            identity_key: IdentityKey::new(self.identity_key),
        }
    }
}

/// One wrapped copy of the message key, addressed to a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKeyEntry {
    /// Recipient device id.
    pub rid: u32,
    /// Whether `value` is a prekey message (un-acknowledged session).
    pub is_prekey: bool,
    /// Serialized signal message wrapping the payload key and GCM tag.
    pub value: Vec<u8>,
}

/// The encrypted envelope embedded in an outgoing message: the GCM
/// payload once, plus one wrapped key per recipient device. A missing
/// payload makes this a key-transport message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmemoCipher {
    pub sender_device_id: u32,
    pub iv: [u8; 12],
    pub keys: Vec<MessageKeyEntry>,
    pub payload: Option<Vec<u8>>,
}

impl OmemoCipher {
    pub fn key_for(&self, device_id: u32) -> Option<&MessageKeyEntry> {
        self.keys.iter().find(|k| k.rid == device_id)
    }

    pub fn is_key_transport(&self) -> bool {
        self.payload.is_none()
    }
}
