use crate::signal::chain_key::ChainKey;
use crate::signal::ecc::KeyPair;
use crate::signal::identity::IdentityKey;
use crate::signal::message_key::MessageKeys;
use crate::signal::root_key::RootKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Skipped message keys kept per receiving chain for out-of-order
/// delivery.
const MAX_MESSAGE_KEYS: usize = 2000;
/// Old receiving chains retained after DH steps.
const MAX_RECEIVER_CHAINS: usize = 5;

#[derive(Clone, Serialize, Deserialize)]
pub struct SenderChain {
    pub ratchet_key: KeyPair,
    pub chain_key: ChainKey,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ReceiverChain {
    pub ratchet_key: [u8; 32],
    pub chain_key: ChainKey,
    message_keys: VecDeque<MessageKeys>,
}

impl ReceiverChain {
    fn new(ratchet_key: [u8; 32], chain_key: ChainKey) -> Self {
        Self {
            ratchet_key,
            chain_key,
            message_keys: VecDeque::with_capacity(16),
        }
    }

    pub fn add_message_keys(&mut self, keys: MessageKeys) {
        if self.message_keys.len() >= MAX_MESSAGE_KEYS {
            self.message_keys.pop_front();
        }
        self.message_keys.push_back(keys);
    }

    pub fn take_message_keys(&mut self, counter: u32) -> Option<MessageKeys> {
        let pos = self
            .message_keys
            .iter()
            .position(|mk| mk.index() == counter)?;
        self.message_keys.remove(pos)
    }
}

/// Pending X3DH material carried until the peer acknowledges our first
/// message; every outbound message repeats it as a prekey message.
#[derive(Clone, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
}

/// The live Double-Ratchet state for one remote device.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    session_version: u32,
    local_identity: IdentityKey,
    remote_identity: IdentityKey,
    root_key: RootKey,
    previous_counter: u32,
    sender_chain: Option<SenderChain>,
    receiver_chains: Vec<ReceiverChain>,
    pending_pre_key: Option<PendingPreKey>,
    /// Base key of the handshake that created this state; lets replayed
    /// prekey messages fold into the existing session instead of
    /// resetting it.
    alice_base_key: Option<[u8; 32]>,
}

impl SessionState {
    pub fn new(
        local_identity: IdentityKey,
        remote_identity: IdentityKey,
        root_key: RootKey,
    ) -> Self {
        Self {
            session_version: crate::signal::protocol::CURRENT_VERSION as u32,
            local_identity,
            remote_identity,
            root_key,
            previous_counter: 0,
            sender_chain: None,
            receiver_chains: Vec::new(),
            pending_pre_key: None,
            alice_base_key: None,
        }
    }

    pub fn local_identity(&self) -> &IdentityKey {
        &self.local_identity
    }

    pub fn remote_identity(&self) -> &IdentityKey {
        &self.remote_identity
    }

    pub fn root_key(&self) -> &RootKey {
        &self.root_key
    }

    pub fn set_root_key(&mut self, root_key: RootKey) {
        self.root_key = root_key;
    }

    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub fn set_previous_counter(&mut self, counter: u32) {
        self.previous_counter = counter;
    }

    pub fn alice_base_key(&self) -> Option<[u8; 32]> {
        self.alice_base_key
    }

    pub fn set_alice_base_key(&mut self, base_key: [u8; 32]) {
        self.alice_base_key = Some(base_key);
    }

    pub fn sender_chain(&self) -> Option<&SenderChain> {
        self.sender_chain.as_ref()
    }

    pub fn set_sender_chain(&mut self, ratchet_key: KeyPair, chain_key: ChainKey) {
        self.sender_chain = Some(SenderChain {
            ratchet_key,
            chain_key,
        });
    }

    pub fn set_sender_chain_key(&mut self, chain_key: ChainKey) {
        if let Some(chain) = self.sender_chain.as_mut() {
            chain.chain_key = chain_key;
        }
    }

    pub fn find_receiver_chain_mut(&mut self, ratchet_key: &[u8; 32]) -> Option<&mut ReceiverChain> {
        self.receiver_chains
            .iter_mut()
            .find(|c| c.ratchet_key == *ratchet_key)
    }

    pub fn add_receiver_chain(&mut self, ratchet_key: [u8; 32], chain_key: ChainKey) {
        self.receiver_chains
            .push(ReceiverChain::new(ratchet_key, chain_key));
        if self.receiver_chains.len() > MAX_RECEIVER_CHAINS {
            self.receiver_chains.remove(0);
        }
    }

    pub fn set_receiver_chain_key(&mut self, ratchet_key: &[u8; 32], chain_key: ChainKey) {
        if let Some(chain) = self.find_receiver_chain_mut(ratchet_key) {
            chain.chain_key = chain_key;
        }
    }

    pub fn pending_pre_key(&self) -> Option<&PendingPreKey> {
        self.pending_pre_key.as_ref()
    }

    pub fn set_pending_pre_key(
        &mut self,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
        base_key: [u8; 32],
    ) {
        self.pending_pre_key = Some(PendingPreKey {
            pre_key_id,
            signed_pre_key_id,
            base_key,
        });
    }

    pub fn clear_pending_pre_key(&mut self) {
        self.pending_pre_key = None;
    }
}
