use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::crypto::cbc;
use crate::error::{SignalError, StoreError};
use crate::signal::address::SignalAddress;
use crate::signal::chain_key::ChainKey;
use crate::signal::ecc::{self, KeyPair};
use crate::signal::identity::IdentityKey;
use crate::signal::message_key::MessageKeys;
use crate::signal::protocol::{PreKeySignalMessage, SignalMessage};
use crate::signal::ratchet::{
    calculate_receiver_session, calculate_sender_session, ReceiverParameters, SenderParameters,
};
use crate::signal::state::{SessionRecord, SessionState};
use crate::signal::store::ProtocolStore;

/// How far ahead of the receiving chain a counter may run before we
/// refuse to derive skipped keys for it.
const MAX_FUTURE_MESSAGES: u32 = 2000;

/// The signal-layer view of a fetched device bundle, already decoded
/// down to raw key material.
pub struct PreKeyBundle {
    pub pre_key_id: Option<u32>,
    pub pre_key_public: Option<[u8; 32]>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub identity_key: IdentityKey,
}

/// Per-address guards serializing the load-modify-store window on a
/// session record. Every cipher touching the same store must share one
/// map, or two concurrent operations can consume the same chain index
/// and one write overwrites the other.
#[derive(Default)]
pub struct SessionLocks {
    inner: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn guard(&self, address: &SignalAddress) -> OwnedMutexGuard<()> {
        let lock = self.inner.entry(address.to_string()).or_default().clone();
        lock.lock_owned().await
    }
}

/// Establishes sessions, either actively from a bundle or passively
/// from an incoming prekey message. Callers serialize record access
/// through [`SessionLocks`].
pub struct SessionBuilder<S> {
    store: Arc<S>,
    address: SignalAddress,
}

impl<S: ProtocolStore> SessionBuilder<S> {
    pub fn new(store: Arc<S>, address: SignalAddress) -> Self {
        Self { store, address }
    }

    /// Runs the initiator side of X3DH against a fetched bundle and
    /// installs the resulting state as the record's current session.
    pub async fn process_bundle(
        &self,
        record: &mut SessionRecord,
        bundle: &PreKeyBundle,
    ) -> Result<(), SignalError> {
        if !self
            .store
            .is_trusted_identity(&self.address, &bundle.identity_key)
            .await?
        {
            return Err(SignalError::UntrustedIdentity {
                address: self.address.to_string(),
            });
        }

        let signed_point = ecc::serialize_point(&bundle.signed_pre_key_public);
        if !bundle
            .identity_key
            .verify_signature(&signed_point, &bundle.signed_pre_key_signature)
        {
            return Err(SignalError::InvalidBundle("bad signed prekey signature"));
        }
        if bundle.pre_key_id.is_some() != bundle.pre_key_public.is_some() {
            return Err(SignalError::InvalidBundle("inconsistent one-time prekey"));
        }

        let our_identity = self.store.identity_key_pair().await?;
        let base_key = KeyPair::generate();
        let session = calculate_sender_session(&SenderParameters {
            our_identity: &our_identity,
            our_base_key: &base_key,
            their_identity: &bundle.identity_key,
            their_signed_prekey: bundle.signed_pre_key_public,
            their_one_time_prekey: bundle.pre_key_public,
        })?;

        let mut state = SessionState::new(
            our_identity.public.clone(),
            bundle.identity_key.clone(),
            session.root_key,
        );
        state.set_sender_chain(session.ratchet_key, session.chain_key);
        state.set_pending_pre_key(
            bundle.pre_key_id,
            bundle.signed_pre_key_id,
            base_key.public_key,
        );
        state.set_alice_base_key(base_key.public_key);
        record.promote_fresh_state(state);

        self.store
            .save_identity(&self.address, &bundle.identity_key)
            .await?;
        Ok(())
    }

    /// Runs the responder side of X3DH for an incoming prekey message.
    /// Returns the consumed one-time prekey id, or `None` when the
    /// handshake was a replay and an existing state already covers it.
    pub async fn process_prekey_message(
        &self,
        record: &mut SessionRecord,
        message: &PreKeySignalMessage,
    ) -> Result<Option<u32>, SignalError> {
        if !self
            .store
            .is_trusted_identity(&self.address, &message.identity_key)
            .await?
        {
            return Err(SignalError::UntrustedIdentity {
                address: self.address.to_string(),
            });
        }

        if record.has_session_for_base_key(&message.base_key) {
            return Ok(None);
        }

        let our_identity = self.store.identity_key_pair().await?;
        let signed_prekey = self
            .store
            .load_signed_prekey(message.signed_pre_key_id)
            .await?;
        let one_time_prekey = match message.pre_key_id {
            Some(id) => Some(
                self.store
                    .load_prekey(id)
                    .await?
                    .ok_or(StoreError::NoSuchKey(id))?,
            ),
            None => None,
        };

        let session = calculate_receiver_session(&ReceiverParameters {
            our_identity: &our_identity,
            our_signed_prekey: &signed_prekey.key_pair,
            our_one_time_prekey: one_time_prekey.as_ref().map(|r| &r.key_pair),
            their_identity: &message.identity_key,
            their_base_key: message.base_key,
        })?;

        let mut state = SessionState::new(
            our_identity.public.clone(),
            message.identity_key.clone(),
            session.root_key,
        );
        // Our first DH step will happen lazily against the sender's
        // ratchet key; until then this chain is keyed to the signed
        // prekey the handshake targeted.
        state.set_sender_chain(signed_prekey.key_pair.clone(), session.chain_key);
        state.set_alice_base_key(message.base_key);
        record.promote_fresh_state(state);

        self.store
            .save_identity(&self.address, &message.identity_key)
            .await?;
        Ok(message.pre_key_id)
    }
}

/// Encrypts and decrypts on an established session, persisting the
/// ratchet state only after an operation succeeds.
pub struct SessionCipher<S> {
    store: Arc<S>,
    locks: Arc<SessionLocks>,
    address: SignalAddress,
    builder: SessionBuilder<S>,
}

impl<S: ProtocolStore> SessionCipher<S> {
    pub fn new(store: Arc<S>, locks: Arc<SessionLocks>, address: SignalAddress) -> Self {
        let builder = SessionBuilder::new(store.clone(), address.clone());
        Self {
            store,
            locks,
            address,
            builder,
        }
    }

    /// Encrypts one message on the current sending chain. The second
    /// element is `true` while the session is still un-acknowledged and
    /// the output is a prekey message.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, bool), SignalError> {
        let _guard = self.locks.guard(&self.address).await;
        let mut record = self.store.load_session(&self.address).await?;
        let state = record
            .current_mut()
            .ok_or_else(|| SignalError::NoSession {
                address: self.address.to_string(),
            })?;
        let chain = state
            .sender_chain()
            .ok_or(SignalError::UninitializedSession)?;
        let chain_key = chain.chain_key.clone();
        let ratchet_key = chain.ratchet_key.public_key;
        let keys = chain_key.message_keys();

        let ciphertext = cbc::encrypt(keys.cipher_key(), keys.iv(), plaintext)?;
        let local = state.local_identity().clone();
        let remote = state.remote_identity().clone();
        let message = SignalMessage::new(
            keys.mac_key(),
            ratchet_key,
            chain_key.index(),
            state.previous_counter(),
            ciphertext,
            &local,
            &remote,
        );

        let (serialized, is_prekey) = match state.pending_pre_key() {
            Some(pending) => {
                let registration_id = self.store.local_registration_id().await?;
                let prekey_message = PreKeySignalMessage::new(
                    registration_id,
                    pending.pre_key_id,
                    pending.signed_pre_key_id,
                    pending.base_key,
                    local,
                    message,
                );
                (prekey_message.serialize().to_vec(), true)
            }
            None => (message.serialize().to_vec(), false),
        };

        state.set_sender_chain_key(chain_key.next_key());
        self.store.store_session(&self.address, &record).await?;
        Ok((serialized, is_prekey))
    }

    /// Decrypts an incoming prekey message, building the session first
    /// when the embedded handshake is new. Returns the plaintext and
    /// the id of the one-time prekey the handshake consumed, if any.
    pub async fn decrypt_prekey(
        &self,
        message: &PreKeySignalMessage,
    ) -> Result<(Vec<u8>, Option<u32>), SignalError> {
        let _guard = self.locks.guard(&self.address).await;
        let mut record = self.store.load_session(&self.address).await?;
        let consumed = self
            .builder
            .process_prekey_message(&mut record, message)
            .await?;
        let plaintext = Self::decrypt_with_record(&mut record, &message.message)?;
        self.store.store_session(&self.address, &record).await?;
        Ok((plaintext, consumed))
    }

    /// Decrypts an ordinary ratchet message against the current state,
    /// falling back to archived states for late messages from before a
    /// session reset.
    pub async fn decrypt(&self, message: &SignalMessage) -> Result<Vec<u8>, SignalError> {
        let _guard = self.locks.guard(&self.address).await;
        let mut record = self.store.load_session(&self.address).await?;
        if record.is_fresh() {
            return Err(SignalError::NoSession {
                address: self.address.to_string(),
            });
        }
        if let Some(state) = record.current() {
            let remote = state.remote_identity().clone();
            if !self
                .store
                .is_trusted_identity(&self.address, &remote)
                .await?
            {
                return Err(SignalError::UntrustedIdentity {
                    address: self.address.to_string(),
                });
            }
        }

        let plaintext = Self::decrypt_with_record(&mut record, message)?;
        self.store.store_session(&self.address, &record).await?;
        Ok(plaintext)
    }

    fn decrypt_with_record(
        record: &mut SessionRecord,
        message: &SignalMessage,
    ) -> Result<Vec<u8>, SignalError> {
        if let Some(current) = record.current() {
            let mut candidate = current.clone();
            match Self::decrypt_with_state(&mut candidate, message) {
                Ok(plaintext) => {
                    if let Some(slot) = record.current_mut() {
                        *slot = candidate;
                    }
                    return Ok(plaintext);
                }
                // Replays and runaway counters are definitive for the
                // current state; archived states cannot rescue them.
                Err(e @ SignalError::DuplicateMessage { .. })
                | Err(e @ SignalError::TooFarInFuture(_)) => return Err(e),
                Err(_) => {}
            }
        }

        let previous_count = record.previous_states().len();
        for index in 0..previous_count {
            let mut candidate = match record.previous_states().get(index) {
                Some(state) => state.clone(),
                None => break,
            };
            if let Ok(plaintext) = Self::decrypt_with_state(&mut candidate, message) {
                if let Some(slot) = record.previous_states_mut().get_mut(index) {
                    *slot = candidate;
                }
                record.promote_state(index);
                return Ok(plaintext);
            }
        }

        Err(SignalError::InvalidMessage)
    }

    fn decrypt_with_state(
        state: &mut SessionState,
        message: &SignalMessage,
    ) -> Result<Vec<u8>, SignalError> {
        let their_ratchet = message.ratchet_key;
        Self::ensure_receiver_chain(state, their_ratchet)?;
        let keys = Self::take_message_keys(state, &their_ratchet, message.counter)?;

        let local = state.local_identity().clone();
        let remote = state.remote_identity().clone();
        message.verify_mac(keys.mac_key(), &remote, &local)?;

        let plaintext = cbc::decrypt(keys.cipher_key(), keys.iv(), &message.ciphertext)?;
        // First successful decrypt acknowledges the handshake.
        state.clear_pending_pre_key();
        Ok(plaintext)
    }

    /// Makes sure a receiving chain exists for the sender's current
    /// ratchet key, performing the DH step (and rotating our own
    /// sending chain) when the key is new.
    fn ensure_receiver_chain(
        state: &mut SessionState,
        their_ratchet: [u8; 32],
    ) -> Result<(), SignalError> {
        if state.find_receiver_chain_mut(&their_ratchet).is_some() {
            return Ok(());
        }

        let sender_chain = state
            .sender_chain()
            .ok_or(SignalError::UninitializedSession)?;
        let our_ratchet = sender_chain.ratchet_key.clone();
        let previous_index = sender_chain.chain_key.index();

        let receiver_step = state.root_key().create_chain(&their_ratchet, &our_ratchet)?;
        let new_ratchet = KeyPair::generate();
        let sender_step = receiver_step
            .root_key
            .create_chain(&their_ratchet, &new_ratchet)?;

        state.add_receiver_chain(their_ratchet, receiver_step.chain_key);
        state.set_previous_counter(previous_index.saturating_sub(1));
        state.set_root_key(sender_step.root_key);
        state.set_sender_chain(new_ratchet, sender_step.chain_key);
        Ok(())
    }

    /// Derives (or recovers) the message keys for a counter on an
    /// existing receiving chain, caching any skipped keys along the way.
    fn take_message_keys(
        state: &mut SessionState,
        their_ratchet: &[u8; 32],
        counter: u32,
    ) -> Result<MessageKeys, SignalError> {
        let chain = state
            .find_receiver_chain_mut(their_ratchet)
            .ok_or(SignalError::InvalidMessage)?;

        let current = chain.chain_key.index();
        if counter < current {
            return chain
                .take_message_keys(counter)
                .ok_or(SignalError::DuplicateMessage {
                    current,
                    received: counter,
                });
        }
        if counter - current >= MAX_FUTURE_MESSAGES {
            return Err(SignalError::TooFarInFuture(counter));
        }

        let mut chain_key: ChainKey = chain.chain_key.clone();
        while chain_key.index() < counter {
            chain.add_message_keys(chain_key.message_keys());
            chain_key = chain_key.next_key();
        }
        let keys = chain_key.message_keys();
        chain.chain_key = chain_key.next_key();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::state::{PreKeyRecord, SignedPreKeyRecord};
    use crate::signal::store::{
        IdentityStore, PreKeyStore, SessionStore, SignedPreKeyStore,
    };
    use crate::types::jid::Jid;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store, just enough surface for cipher tests.
    struct MemoryStore {
        identity: crate::signal::identity::IdentityKeyPair,
        prekeys: Mutex<HashMap<u32, PreKeyRecord>>,
        signed_prekeys: Mutex<HashMap<u32, SignedPreKeyRecord>>,
        sessions: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryStore {
        fn new() -> Self {
            Self {
                identity: crate::signal::identity::IdentityKeyPair::generate(),
                prekeys: Mutex::new(HashMap::new()),
                signed_prekeys: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl IdentityStore for MemoryStore {
        async fn identity_key_pair(
            &self,
        ) -> Result<crate::signal::identity::IdentityKeyPair, StoreError> {
            Ok(self.identity.clone())
        }

        async fn local_registration_id(&self) -> Result<u32, StoreError> {
            Ok(self.identity.registration_id())
        }

        async fn save_identity(
            &self,
            _address: &SignalAddress,
            _identity: &IdentityKey,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }

        async fn is_trusted_identity(
            &self,
            _address: &SignalAddress,
            _identity: &IdentityKey,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }
    }

    #[async_trait]
    impl PreKeyStore for MemoryStore {
        async fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
            Ok(self.prekeys.lock().unwrap().get(&id).cloned())
        }

        async fn store_prekey(&self, id: u32, record: PreKeyRecord) -> Result<(), StoreError> {
            self.prekeys.lock().unwrap().insert(id, record);
            Ok(())
        }

        async fn remove_prekey(&self, id: u32) -> Result<(), StoreError> {
            self.prekeys.lock().unwrap().remove(&id);
            Ok(())
        }

        async fn prekey_count(&self) -> Result<usize, StoreError> {
            Ok(self.prekeys.lock().unwrap().len())
        }
    }

    #[async_trait]
    impl SignedPreKeyStore for MemoryStore {
        async fn load_signed_prekey(&self, id: u32) -> Result<SignedPreKeyRecord, StoreError> {
            self.signed_prekeys
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or(StoreError::NoSuchKey(id))
        }

        async fn store_signed_prekey(
            &self,
            id: u32,
            record: SignedPreKeyRecord,
        ) -> Result<(), StoreError> {
            self.signed_prekeys.lock().unwrap().insert(id, record);
            Ok(())
        }

        async fn remove_old_signed_prekeys(
            &self,
            _older_than: chrono::DateTime<chrono::Utc>,
            _keep_id: u32,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[async_trait]
    impl SessionStore for MemoryStore {
        async fn load_session(&self, address: &SignalAddress) -> Result<SessionRecord, StoreError> {
            match self.sessions.lock().unwrap().get(&address.to_string()) {
                Some(bytes) => SessionRecord::deserialize(bytes).map_err(StoreError::Codec),
                None => Ok(SessionRecord::new()),
            }
        }

        async fn store_session(
            &self,
            address: &SignalAddress,
            record: &SessionRecord,
        ) -> Result<(), StoreError> {
            self.sessions
                .lock()
                .unwrap()
                .insert(address.to_string(), record.serialize());
            Ok(())
        }

        async fn contains_session(&self, address: &SignalAddress) -> Result<bool, StoreError> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .contains_key(&address.to_string()))
        }

        async fn delete_session(&self, address: &SignalAddress) -> Result<(), StoreError> {
            self.sessions.lock().unwrap().remove(&address.to_string());
            Ok(())
        }
    }

    fn cipher<S: ProtocolStore>(store: &Arc<S>, address: &SignalAddress) -> SessionCipher<S> {
        SessionCipher::new(store.clone(), Arc::new(SessionLocks::new()), address.clone())
    }

    struct Pair {
        alice: Arc<MemoryStore>,
        bob: Arc<MemoryStore>,
        alice_addr: SignalAddress,
        bob_addr: SignalAddress,
    }

    async fn established_pair() -> Pair {
        let alice = Arc::new(MemoryStore::new());
        let bob = Arc::new(MemoryStore::new());

        let prekey = PreKeyRecord::generate(31);
        let spk_pair = KeyPair::generate();
        let spk_signature = bob.identity.sign_prekey(&spk_pair.public_key);
        let spk = SignedPreKeyRecord::new(7, spk_pair, spk_signature, 1_700_000_000);
        bob.store_prekey(31, prekey.clone()).await.unwrap();
        bob.store_signed_prekey(7, spk.clone()).await.unwrap();

        let alice_jid: Jid = "alice@example.org".parse().unwrap();
        let bob_jid: Jid = "bob@example.org".parse().unwrap();
        let alice_addr = SignalAddress::new(&alice_jid, 1);
        let bob_addr = SignalAddress::new(&bob_jid, 1);

        let bundle = PreKeyBundle {
            pre_key_id: Some(31),
            pre_key_public: Some(prekey.key_pair.public_key),
            signed_pre_key_id: 7,
            signed_pre_key_public: spk.key_pair.public_key,
            signed_pre_key_signature: spk.signature,
            identity_key: bob.identity.public.clone(),
        };

        let builder = SessionBuilder::new(alice.clone(), bob_addr.clone());
        let mut record = alice.load_session(&bob_addr).await.unwrap();
        builder.process_bundle(&mut record, &bundle).await.unwrap();
        alice.store_session(&bob_addr, &record).await.unwrap();

        Pair {
            alice,
            bob,
            alice_addr,
            bob_addr,
        }
    }

    #[tokio::test]
    async fn full_handshake_and_round_trip() {
        let pair = established_pair().await;
        let alice_cipher = cipher(&pair.alice, &pair.bob_addr);
        let bob_cipher = cipher(&pair.bob, &pair.alice_addr);

        let (blob, is_prekey) = alice_cipher.encrypt(b"hello bob").await.unwrap();
        assert!(is_prekey);

        let message = PreKeySignalMessage::deserialize(&blob).unwrap();
        let (plaintext, consumed) = bob_cipher.decrypt_prekey(&message).await.unwrap();
        assert_eq!(plaintext, b"hello bob");
        assert_eq!(consumed, Some(31));

        // The reply runs on the ratchet proper, no prekey framing.
        let (reply, reply_is_prekey) = bob_cipher.encrypt(b"hi alice").await.unwrap();
        assert!(!reply_is_prekey);
        let reply_msg = SignalMessage::deserialize(&reply).unwrap();
        assert_eq!(alice_cipher.decrypt(&reply_msg).await.unwrap(), b"hi alice");

        // Alice's next message is no longer a prekey message either,
        // because the reply acknowledged the handshake.
        let (second, second_is_prekey) = alice_cipher.encrypt(b"again").await.unwrap();
        assert!(!second_is_prekey);
        let second_msg = SignalMessage::deserialize(&second).unwrap();
        assert_eq!(bob_cipher.decrypt(&second_msg).await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn out_of_order_delivery_uses_cached_keys() {
        let pair = established_pair().await;
        let alice_cipher = cipher(&pair.alice, &pair.bob_addr);
        let bob_cipher = cipher(&pair.bob, &pair.alice_addr);

        let (first, _) = alice_cipher.encrypt(b"one").await.unwrap();
        let (second, _) = alice_cipher.encrypt(b"two").await.unwrap();
        let (third, _) = alice_cipher.encrypt(b"three").await.unwrap();

        let first = PreKeySignalMessage::deserialize(&first).unwrap();
        let second = PreKeySignalMessage::deserialize(&second).unwrap();
        let third = PreKeySignalMessage::deserialize(&third).unwrap();

        let (p3, _) = bob_cipher.decrypt_prekey(&third).await.unwrap();
        assert_eq!(p3, b"three");
        let (p1, _) = bob_cipher.decrypt_prekey(&first).await.unwrap();
        assert_eq!(p1, b"one");
        let (p2, _) = bob_cipher.decrypt_prekey(&second).await.unwrap();
        assert_eq!(p2, b"two");
    }

    #[tokio::test]
    async fn replayed_message_is_rejected() {
        let pair = established_pair().await;
        let alice_cipher = cipher(&pair.alice, &pair.bob_addr);
        let bob_cipher = cipher(&pair.bob, &pair.alice_addr);

        let (blob, _) = alice_cipher.encrypt(b"only once").await.unwrap();
        let message = PreKeySignalMessage::deserialize(&blob).unwrap();
        bob_cipher.decrypt_prekey(&message).await.unwrap();

        let err = bob_cipher.decrypt_prekey(&message).await.unwrap_err();
        assert!(matches!(err, SignalError::DuplicateMessage { .. }));
    }

    #[tokio::test]
    async fn replayed_handshake_does_not_reset_the_session() {
        let pair = established_pair().await;
        let alice_cipher = cipher(&pair.alice, &pair.bob_addr);
        let bob_cipher = cipher(&pair.bob, &pair.alice_addr);

        let (first, _) = alice_cipher.encrypt(b"one").await.unwrap();
        let (second, _) = alice_cipher.encrypt(b"two").await.unwrap();

        let first = PreKeySignalMessage::deserialize(&first).unwrap();
        let second = PreKeySignalMessage::deserialize(&second).unwrap();

        bob_cipher.decrypt_prekey(&first).await.unwrap();
        // Same base key arrives again; process_prekey_message must fold
        // into the live session rather than re-running the handshake.
        let (p2, consumed) = bob_cipher.decrypt_prekey(&second).await.unwrap();
        assert_eq!(p2, b"two");
        assert_eq!(consumed, None);
    }

    #[tokio::test]
    async fn missing_signed_prekey_fails_decrypt() {
        let pair = established_pair().await;
        let alice_cipher = cipher(&pair.alice, &pair.bob_addr);
        let bob_cipher = cipher(&pair.bob, &pair.alice_addr);

        pair.bob
            .signed_prekeys
            .lock()
            .unwrap()
            .clear();

        let (blob, _) = alice_cipher.encrypt(b"late").await.unwrap();
        let message = PreKeySignalMessage::deserialize(&blob).unwrap();
        let err = bob_cipher.decrypt_prekey(&message).await.unwrap_err();
        assert!(matches!(
            err,
            SignalError::Store(StoreError::NoSuchKey(7))
        ));
    }

    #[tokio::test]
    async fn bad_bundle_signature_is_rejected() {
        let alice = Arc::new(MemoryStore::new());
        let bob = MemoryStore::new();
        let spk_pair = KeyPair::generate();
        let spk_signature = bob.identity.sign_prekey(&spk_pair.public_key);
        let spk = SignedPreKeyRecord::new(1, spk_pair, spk_signature, 1_700_000_000);
        let bob_jid: Jid = "bob@example.org".parse().unwrap();
        let bob_addr = SignalAddress::new(&bob_jid, 1);

        let mut bad_signature = spk.signature;
        bad_signature[3] ^= 0x01;
        let bundle = PreKeyBundle {
            pre_key_id: None,
            pre_key_public: None,
            signed_pre_key_id: 1,
            signed_pre_key_public: spk.key_pair.public_key,
            signed_pre_key_signature: bad_signature,
            identity_key: bob.identity.public.clone(),
        };

        let builder = SessionBuilder::new(alice, bob_addr);
        let mut record = SessionRecord::new();
        let err = builder
            .process_bundle(&mut record, &bundle)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::InvalidBundle(_)));
    }

    #[tokio::test]
    async fn encrypt_without_session_errors() {
        let store = Arc::new(MemoryStore::new());
        let jid: Jid = "nobody@example.org".parse().unwrap();
        let cipher = cipher(&store, &SignalAddress::new(&jid, 1));
        let err = cipher.encrypt(b"into the void").await.unwrap_err();
        assert!(matches!(err, SignalError::NoSession { .. }));
    }

    /// Store that parks between reading a session record and whatever
    /// the caller does next, giving an interleaved task room to run.
    struct YieldingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl IdentityStore for YieldingStore {
        async fn identity_key_pair(
            &self,
        ) -> Result<crate::signal::identity::IdentityKeyPair, StoreError> {
            self.inner.identity_key_pair().await
        }

        async fn local_registration_id(&self) -> Result<u32, StoreError> {
            self.inner.local_registration_id().await
        }

        async fn save_identity(
            &self,
            address: &SignalAddress,
            identity: &IdentityKey,
        ) -> Result<bool, StoreError> {
            self.inner.save_identity(address, identity).await
        }

        async fn is_trusted_identity(
            &self,
            address: &SignalAddress,
            identity: &IdentityKey,
        ) -> Result<bool, StoreError> {
            self.inner.is_trusted_identity(address, identity).await
        }
    }

    #[async_trait]
    impl PreKeyStore for YieldingStore {
        async fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
            self.inner.load_prekey(id).await
        }

        async fn store_prekey(&self, id: u32, record: PreKeyRecord) -> Result<(), StoreError> {
            self.inner.store_prekey(id, record).await
        }

        async fn remove_prekey(&self, id: u32) -> Result<(), StoreError> {
            self.inner.remove_prekey(id).await
        }

        async fn prekey_count(&self) -> Result<usize, StoreError> {
            self.inner.prekey_count().await
        }
    }

    #[async_trait]
    impl SignedPreKeyStore for YieldingStore {
        async fn load_signed_prekey(&self, id: u32) -> Result<SignedPreKeyRecord, StoreError> {
            self.inner.load_signed_prekey(id).await
        }

        async fn store_signed_prekey(
            &self,
            id: u32,
            record: SignedPreKeyRecord,
        ) -> Result<(), StoreError> {
            self.inner.store_signed_prekey(id, record).await
        }

        async fn remove_old_signed_prekeys(
            &self,
            older_than: chrono::DateTime<chrono::Utc>,
            keep_id: u32,
        ) -> Result<(), StoreError> {
            self.inner.remove_old_signed_prekeys(older_than, keep_id).await
        }
    }

    #[async_trait]
    impl SessionStore for YieldingStore {
        async fn load_session(&self, address: &SignalAddress) -> Result<SessionRecord, StoreError> {
            let record = self.inner.load_session(address).await?;
            tokio::task::yield_now().await;
            Ok(record)
        }

        async fn store_session(
            &self,
            address: &SignalAddress,
            record: &SessionRecord,
        ) -> Result<(), StoreError> {
            self.inner.store_session(address, record).await
        }

        async fn contains_session(&self, address: &SignalAddress) -> Result<bool, StoreError> {
            self.inner.contains_session(address).await
        }

        async fn delete_session(&self, address: &SignalAddress) -> Result<(), StoreError> {
            self.inner.delete_session(address).await
        }
    }

    #[tokio::test]
    async fn concurrent_encrypts_never_share_a_chain_index() {
        let alice = Arc::new(YieldingStore {
            inner: MemoryStore::new(),
        });
        let bob = Arc::new(MemoryStore::new());

        let prekey = PreKeyRecord::generate(31);
        let spk_pair = KeyPair::generate();
        let spk_signature = bob.identity.sign_prekey(&spk_pair.public_key);
        let spk = SignedPreKeyRecord::new(7, spk_pair, spk_signature, 1_700_000_000);
        bob.store_prekey(31, prekey.clone()).await.unwrap();
        bob.store_signed_prekey(7, spk.clone()).await.unwrap();

        let alice_jid: Jid = "alice@example.org".parse().unwrap();
        let bob_jid: Jid = "bob@example.org".parse().unwrap();
        let alice_addr = SignalAddress::new(&alice_jid, 1);
        let bob_addr = SignalAddress::new(&bob_jid, 1);

        let bundle = PreKeyBundle {
            pre_key_id: Some(31),
            pre_key_public: Some(prekey.key_pair.public_key),
            signed_pre_key_id: 7,
            signed_pre_key_public: spk.key_pair.public_key,
            signed_pre_key_signature: spk.signature,
            identity_key: bob.identity.public.clone(),
        };
        let builder = SessionBuilder::new(alice.clone(), bob_addr.clone());
        let mut record = alice.load_session(&bob_addr).await.unwrap();
        builder.process_bundle(&mut record, &bundle).await.unwrap();
        alice.store_session(&bob_addr, &record).await.unwrap();

        // Two ciphers racing on the same address, sharing one lock map
        // the way one engine's ciphers do. The yielding store would let
        // both read chain index 0 if the guard did not serialize them.
        let locks = Arc::new(SessionLocks::new());
        let c1 = SessionCipher::new(alice.clone(), locks.clone(), bob_addr.clone());
        let c2 = SessionCipher::new(alice.clone(), locks.clone(), bob_addr.clone());
        let (r1, r2) = tokio::join!(c1.encrypt(b"one"), c2.encrypt(b"two"));
        let first = PreKeySignalMessage::deserialize(&r1.unwrap().0).unwrap();
        let second = PreKeySignalMessage::deserialize(&r2.unwrap().0).unwrap();
        assert_ne!(first.message.counter, second.message.counter);

        let bob_cipher = cipher(&bob, &alice_addr);
        let (p1, _) = bob_cipher.decrypt_prekey(&first).await.unwrap();
        let (p2, _) = bob_cipher.decrypt_prekey(&second).await.unwrap();
        assert_eq!(p1, b"one");
        assert_eq!(p2, b"two");
    }
}
