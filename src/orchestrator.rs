//! Message-level encryption and decryption: fans the payload key out to
//! every trusted recipient device, and classifies everything that comes
//! back in.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bundle::BundleManager;
use crate::crypto::gcm::{self, SealedPayload};
use crate::devices::DeviceRegistry;
use crate::error::{OmemoError, SignalError, StoreError};
use crate::session_engine::SessionEngine;
use crate::signal::address::SignalAddress;
use crate::signal::store::SessionStore;
use crate::store::KeyStore;
use crate::transport::Transport;
use crate::types::jid::Jid;
use crate::wire::{MessageKeyEntry, OmemoCipher};

/// Reflected own group messages we still expect from the server, keyed
/// by payload ciphertext. Bounded; a reset just downgrades stale
/// reflections to drops.
const MAX_PENDING_ECHOES: usize = 256;

/// What to put on the wire for an outgoing message.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Encryption is off for this chat; send the body as-is.
    Plaintext(String),
    Encrypted(OmemoCipher),
}

/// Why an incoming envelope produced no plaintext. None of these are
/// errors; they are normal protocol outcomes the caller may surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// No wrapped key addressed our device id.
    NotForThisDevice,
    /// Replay of a message we already decrypted.
    Duplicate,
    /// The sender's identity key was explicitly rejected.
    UntrustedIdentity,
    /// The handshake referenced a signed prekey we already archived;
    /// the sender must rebuild from our current bundle.
    ArchivedSignedPreKey,
    /// A group message from a device no tracked member announces.
    UnknownGroupSender,
    /// The ciphertext failed to verify or decrypt.
    DecryptionFailed,
}

/// The classified result of handling one incoming envelope.
#[derive(Debug, Clone)]
pub enum Incoming {
    Message {
        plaintext: String,
        sender: Jid,
        sender_device: u32,
    },
    /// A keyless hello that only establishes or refreshes a session.
    KeyTransport { sender: Jid, sender_device: u32 },
    /// The server reflected one of our own group messages back.
    Echo { plaintext: String },
    Dropped(DropReason),
}

pub struct MessageOrchestrator<T: Transport> {
    store: Arc<KeyStore>,
    transport: Arc<T>,
    sessions: Arc<SessionEngine<T>>,
    registry: Arc<DeviceRegistry>,
    bundles: Arc<BundleManager<T>>,
    own_jid: Jid,
    own_device_id: u32,
    pending_echoes: Mutex<HashMap<Vec<u8>, String>>,
}

impl<T: Transport> MessageOrchestrator<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<KeyStore>,
        transport: Arc<T>,
        sessions: Arc<SessionEngine<T>>,
        registry: Arc<DeviceRegistry>,
        bundles: Arc<BundleManager<T>>,
        own_jid: Jid,
        own_device_id: u32,
    ) -> Self {
        Self {
            store,
            transport,
            sessions,
            registry,
            bundles,
            own_jid: own_jid.to_bare(),
            own_device_id,
            pending_echoes: Mutex::new(HashMap::new()),
        }
    }

    // ---- outgoing ----

    /// Encrypts a one-to-one message to every trusted device of the
    /// peer, plus our own other devices.
    pub async fn encrypt_message(&self, to: &Jid, body: &str) -> Result<OmemoCipher, OmemoError> {
        let peer = to.to_bare();
        let peer_devices = self.resolve_devices(&peer).await?;
        let peer_targets = self.sendable_targets(&peer, &peer_devices).await?;
        if peer_targets.is_empty() {
            return Err(OmemoError::NoValidSessions(peer));
        }

        let own_targets = self.own_device_targets().await?;
        let sealed = gcm::seal(body.as_bytes())?;
        let keys = self
            .wrap_key(&sealed, peer_targets.into_iter().chain(own_targets))
            .await;
        if keys.iter().all(|k| k.0.name() != peer.bare_string()) {
            return Err(OmemoError::NoValidSessions(peer));
        }

        Ok(self.assemble(sealed, keys, true))
    }

    /// Encrypts to every member of a tracked room. Any member with
    /// known devices but no trusted identity blocks the whole message.
    pub async fn encrypt_group_message(
        &self,
        room: &Jid,
        body: &str,
    ) -> Result<OmemoCipher, OmemoError> {
        let members = self
            .registry
            .room_members(room)
            .await
            .ok_or_else(|| OmemoError::RoomNotTracked(room.to_bare()))?;

        let mut targets = Vec::new();
        for member in &members {
            let devices = self.resolve_devices(member).await?;
            let sendable = self.sendable_targets(member, &devices).await?;
            if sendable.is_empty() && !devices.is_empty() {
                // Announced devices but no usable session for any of
                // them; the member would silently miss the message.
                log::warn!(
                    "no usable sessions for room member {}",
                    member.bare_string()
                );
            }
            targets.extend(sendable);
        }
        if targets.is_empty() {
            return Err(OmemoError::NoValidSessions(room.to_bare()));
        }
        targets.extend(self.own_device_targets().await?);

        let sealed = gcm::seal(body.as_bytes())?;
        let keys = self.wrap_key(&sealed, targets.into_iter()).await;
        let cipher = self.assemble(sealed, keys, true);

        // Remember the payload so the server's reflection of this
        // message classifies as our own echo.
        if let Some(payload) = &cipher.payload {
            let mut echoes = self.pending_echoes.lock().await;
            if echoes.len() >= MAX_PENDING_ECHOES {
                echoes.clear();
            }
            echoes.insert(payload.clone(), body.to_string());
        }
        Ok(cipher)
    }

    /// Builds a key-transport envelope: wrapped key material, no
    /// payload. Sent after session setup so the peer's devices can
    /// complete the handshake before the first real message.
    pub async fn key_transport(&self, to: &Jid) -> Result<OmemoCipher, OmemoError> {
        let peer = to.to_bare();
        let devices = self.resolve_devices(&peer).await?;
        let targets = self.sendable_targets(&peer, &devices).await?;
        if targets.is_empty() {
            return Err(OmemoError::NoValidSessions(peer));
        }
        let sealed = gcm::seal(&[])?;
        let keys = self.wrap_key(&sealed, targets.into_iter()).await;
        Ok(self.assemble(sealed, keys, false))
    }

    // ---- incoming ----

    /// Handles a one-to-one envelope from a known sender.
    pub async fn handle_message(
        &self,
        sender: &Jid,
        cipher: &OmemoCipher,
    ) -> Result<Incoming, OmemoError> {
        self.decrypt_for_self(&sender.to_bare(), cipher.sender_device_id, cipher)
            .await
    }

    /// Handles an envelope reflected through a tracked room; the real
    /// sender is resolved from the device id.
    pub async fn handle_group_message(
        &self,
        room: &Jid,
        cipher: &OmemoCipher,
    ) -> Result<Incoming, OmemoError> {
        if cipher.sender_device_id == self.own_device_id {
            let mut echoes = self.pending_echoes.lock().await;
            let hit = cipher
                .payload
                .as_ref()
                .and_then(|payload| echoes.remove(payload));
            return Ok(match hit {
                Some(plaintext) => Incoming::Echo { plaintext },
                // Our own reflection from before a restart; we cannot
                // decrypt messages we ourselves encrypted.
                None => Incoming::Dropped(DropReason::NotForThisDevice),
            });
        }

        let sender = match self
            .registry
            .find_room_device_owner(room, cipher.sender_device_id)
            .await?
        {
            Some(jid) => jid,
            None => {
                log::warn!(
                    "group message in {} from unknown device {}",
                    room.bare_string(),
                    cipher.sender_device_id
                );
                return Ok(Incoming::Dropped(DropReason::UnknownGroupSender));
            }
        };
        self.decrypt_for_self(&sender, cipher.sender_device_id, cipher)
            .await
    }

    async fn decrypt_for_self(
        &self,
        sender: &Jid,
        sender_device: u32,
        cipher: &OmemoCipher,
    ) -> Result<Incoming, OmemoError> {
        let entry = match cipher.key_for(self.own_device_id) {
            Some(entry) => entry,
            None => return Ok(Incoming::Dropped(DropReason::NotForThisDevice)),
        };

        let key = if entry.is_prekey {
            match self
                .sessions
                .decrypt_prekey_key(sender, sender_device, &entry.value)
                .await
            {
                Ok((key, consumed)) => {
                    if let Some(id) = consumed {
                        self.bundles.prekey_consumed(id).await?;
                    }
                    key
                }
                Err(e) => return self.classify_failure(sender, sender_device, e),
            }
        } else {
            match self
                .sessions
                .decrypt_key(sender, sender_device, &entry.value)
                .await
            {
                Ok(key) => key,
                Err(e) => return self.classify_failure(sender, sender_device, e),
            }
        };

        let payload = match &cipher.payload {
            Some(payload) => payload,
            None => {
                log::debug!("key transport from {sender}:{sender_device}");
                return Ok(Incoming::KeyTransport {
                    sender: sender.clone(),
                    sender_device,
                });
            }
        };

        let plaintext_bytes = match gcm::open(&key, &cipher.iv, payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("payload from {sender}:{sender_device} failed to open: {e}");
                return Ok(Incoming::Dropped(DropReason::DecryptionFailed));
            }
        };
        match String::from_utf8(plaintext_bytes) {
            Ok(plaintext) => Ok(Incoming::Message {
                plaintext,
                sender: sender.clone(),
                sender_device,
            }),
            Err(_) => Ok(Incoming::Dropped(DropReason::DecryptionFailed)),
        }
    }

    /// Sorts session-layer failures into drops the caller can surface
    /// versus real errors that must propagate.
    fn classify_failure(
        &self,
        sender: &Jid,
        sender_device: u32,
        error: SignalError,
    ) -> Result<Incoming, OmemoError> {
        let reason = match error {
            SignalError::DuplicateMessage { .. } => DropReason::Duplicate,
            SignalError::UntrustedIdentity { .. } => DropReason::UntrustedIdentity,
            SignalError::Store(StoreError::NoSuchKey(_)) => DropReason::ArchivedSignedPreKey,
            SignalError::Store(e) => return Err(OmemoError::Store(e)),
            other => {
                log::warn!("decrypt from {sender}:{sender_device} failed: {other}");
                DropReason::DecryptionFailed
            }
        };
        Ok(Incoming::Dropped(reason))
    }

    // ---- helpers ----

    /// Known devices for a peer, fetching the device list on demand the
    /// first time we need it.
    async fn resolve_devices(&self, peer: &Jid) -> Result<Vec<u32>, OmemoError> {
        let devices = self.registry.devices_for(peer).await?;
        if !devices.is_empty() {
            return Ok(devices);
        }
        match self.transport.fetch_device_list(peer).await {
            Ok(list) => {
                self.registry.update_device_list(peer, &list).await?;
                Ok(self.registry.devices_for(peer).await?)
            }
            Err(e) => {
                log::debug!("no device list for {}: {e}", peer.bare_string());
                Ok(Vec::new())
            }
        }
    }

    /// Builds sessions where missing, then keeps only devices whose
    /// identity the user (or blind trust) allows sending to.
    async fn sendable_targets(
        &self,
        peer: &Jid,
        devices: &[u32],
    ) -> Result<Vec<SignalAddress>, OmemoError> {
        let with_sessions = self.sessions.ensure_sessions(peer, devices).await?;
        if with_sessions.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for device_id in with_sessions {
            let address = SignalAddress::new(peer, device_id);
            if self.device_is_sendable(peer, &address).await? {
                out.push(address);
            } else {
                log::debug!("skipping {address}: identity not trusted for sending");
            }
        }
        if out.is_empty() {
            // Sessions exist but every identity is rejected or still
            // undecided; the user has to act before we may send.
            return Err(OmemoError::NoTrustedRecipients(peer.to_bare()));
        }
        Ok(out)
    }

    async fn device_is_sendable(
        &self,
        peer: &Jid,
        address: &SignalAddress,
    ) -> Result<bool, OmemoError> {
        let record = self.store.load_session(address).await?;
        let identity = match record.current() {
            Some(state) => state.remote_identity().public_key(),
            None => return Ok(false),
        };
        let trust = self.store.trust_level(&peer.to_bare(), &identity).await?;
        Ok(trust.map(|t| t.is_sendable()).unwrap_or(false))
    }

    async fn own_device_targets(&self) -> Result<Vec<SignalAddress>, OmemoError> {
        let devices = self.registry.devices_for(&self.own_jid).await?;
        match self.sendable_targets(&self.own_jid, &devices).await {
            Ok(targets) => Ok(targets),
            // Never let our own secondary devices block a message.
            Err(OmemoError::NoTrustedRecipients(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Wraps the payload key for each target; failures skip the device.
    async fn wrap_key(
        &self,
        sealed: &SealedPayload,
        targets: impl Iterator<Item = SignalAddress>,
    ) -> Vec<(SignalAddress, MessageKeyEntry)> {
        let mut out = Vec::new();
        for address in targets {
            let jid: Jid = match address.name().parse() {
                Ok(jid) => jid,
                Err(_) => continue,
            };
            match self
                .sessions
                .encrypt_key(&jid, address.device_id(), &sealed.key)
                .await
            {
                Ok((value, is_prekey)) => {
                    out.push((
                        address.clone(),
                        MessageKeyEntry {
                            rid: address.device_id(),
                            is_prekey,
                            value,
                        },
                    ));
                }
                Err(e) => {
                    log::warn!("wrapping key for {address} failed: {e}");
                }
            }
        }
        out
    }

    fn assemble(
        &self,
        sealed: SealedPayload,
        keys: Vec<(SignalAddress, MessageKeyEntry)>,
        with_payload: bool,
    ) -> OmemoCipher {
        OmemoCipher {
            sender_device_id: self.own_device_id,
            iv: sealed.iv,
            keys: keys.into_iter().map(|(_, entry)| entry).collect(),
            payload: with_payload.then_some(sealed.ciphertext),
        }
    }
}
