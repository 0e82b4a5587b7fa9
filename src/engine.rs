//! The public entry point. One [`OmemoEngine`] per logged-in account
//! wires the key store, device registry, bundle maintenance, session
//! engine, and message orchestrator together.

use std::path::Path;
use std::sync::Arc;

use crate::bundle::BundleManager;
use crate::config::EngineConfig;
use crate::devices::DeviceRegistry;
use crate::error::OmemoError;
use crate::orchestrator::{Incoming, MessageOrchestrator, Outgoing};
use crate::session_engine::SessionEngine;
use crate::store::KeyStore;
use crate::transport::{PubSubEvent, Roster, Transport};
use crate::types::events::{EventSink, OmemoEvent};
use crate::types::jid::Jid;
use crate::types::trust::{Fingerprint, TrustLevel};
use crate::wire::OmemoCipher;

pub struct OmemoEngine<T: Transport> {
    store: Arc<KeyStore>,
    transport: Arc<T>,
    roster: Arc<dyn Roster>,
    registry: Arc<DeviceRegistry>,
    bundles: Arc<BundleManager<T>>,
    sessions: Arc<SessionEngine<T>>,
    orchestrator: MessageOrchestrator<T>,
    sink: Arc<dyn EventSink>,
    own_jid: Jid,
    own_device_id: u32,
}

impl<T: Transport> OmemoEngine<T> {
    /// Opens the account's key store under `data_dir` and assembles the
    /// engine. Call [`start`](Self::start) once connected.
    pub async fn new(
        data_dir: &Path,
        own_jid: Jid,
        transport: Arc<T>,
        roster: Arc<dyn Roster>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Result<Self, OmemoError> {
        let store =
            KeyStore::open(data_dir, &own_jid, config.blind_trust_before_verification).await?;
        Self::with_store(store, own_jid, transport, roster, sink, config).await
    }

    /// Assembles the engine around an already opened store. Used by
    /// tests with an in-memory store.
    pub async fn with_store(
        store: KeyStore,
        own_jid: Jid,
        transport: Arc<T>,
        roster: Arc<dyn Roster>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Result<Self, OmemoError> {
        let store = Arc::new(store);
        let own_jid = own_jid.to_bare();
        let own_device_id = store.own_device_id().await?;

        let registry = Arc::new(DeviceRegistry::new(
            store.clone(),
            sink.clone(),
            own_jid.clone(),
            own_device_id,
        ));
        let bundles = Arc::new(BundleManager::new(
            store.clone(),
            transport.clone(),
            config.clone(),
            sink.clone(),
            own_device_id,
        ));
        let sessions = Arc::new(SessionEngine::new(
            store.clone(),
            transport.clone(),
            config.clone(),
            sink.clone(),
        ));
        let orchestrator = MessageOrchestrator::new(
            store.clone(),
            transport.clone(),
            sessions.clone(),
            registry.clone(),
            bundles.clone(),
            own_jid.clone(),
            own_device_id,
        );

        Ok(Self {
            store,
            transport,
            roster,
            registry,
            bundles,
            sessions,
            orchestrator,
            sink,
            own_jid,
            own_device_id,
        })
    }

    /// Announces this device: rotates and publishes key material as
    /// needed, then makes sure our device id is on the published list.
    pub async fn start(&self) -> Result<(), OmemoError> {
        self.bundles.ensure_published().await?;

        let announced = match self.transport.fetch_device_list(&self.own_jid).await {
            Ok(list) => {
                self.registry
                    .update_device_list(&self.own_jid, &list)
                    .await?;
                list.devices
            }
            Err(e) => {
                log::debug!("no published device list yet: {e}");
                Vec::new()
            }
        };
        if !announced.contains(&self.own_device_id) {
            self.bundles.publish_own_device_list(&announced).await?;
        }
        Ok(())
    }

    /// Feeds a server-side PubSub notification into the engine.
    pub async fn handle_pubsub_event(&self, event: PubSubEvent) -> Result<(), OmemoError> {
        match event {
            PubSubEvent::DeviceList { from, list } => {
                let from = from.to_bare();
                if from != self.own_jid && !self.roster.has_subscription(&from).await {
                    log::debug!("ignoring device list from unsubscribed {from}");
                    return Ok(());
                }
                let update = self.registry.update_device_list(&from, &list).await?;
                if from == self.own_jid {
                    if update.own_id_missing {
                        log::info!("own device id missing from published list, correcting");
                        self.bundles.publish_own_device_list(&list.devices).await?;
                    }
                } else {
                    self.fetch_missing_bundles(&from, &update.without_session)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Builds sessions for freshly announced devices right away, so the
    /// first message in either direction needs no bundle fetch. Each
    /// fetch gets one retry; a device still failing is parked in the
    /// bundle-missing set until the next list update or an explicit
    /// [`retry_missing_bundles`](Self::retry_missing_bundles).
    async fn fetch_missing_bundles(&self, jid: &Jid, devices: &[u32]) -> Result<(), OmemoError> {
        let mut built_any = false;
        for &device_id in devices {
            match self.sessions.build_session_with_retry(jid, device_id).await {
                Ok(()) => {
                    self.registry.clear_bundle_missing(jid, device_id).await;
                    built_any = true;
                }
                Err(OmemoError::Transport(e)) => {
                    log::warn!(
                        "bundle for {}:{device_id} unavailable: {e}",
                        jid.bare_string()
                    );
                    self.registry.mark_bundle_missing(jid, device_id).await;
                }
                Err(OmemoError::Store(e)) => return Err(OmemoError::Store(e)),
                Err(e) => {
                    log::warn!(
                        "session with {}:{device_id} not built: {e}",
                        jid.bare_string()
                    );
                }
            }
        }
        if built_any {
            self.sessions.announce_new_fingerprints(jid).await?;
            self.send_session_hello(jid).await;
        }
        Ok(())
    }

    /// Hands the host a payload-less envelope so the peer's devices can
    /// finish their side of the freshly built sessions.
    async fn send_session_hello(&self, jid: &Jid) {
        match self.orchestrator.key_transport(jid).await {
            Ok(cipher) => self.sink.on_event(OmemoEvent::KeyTransportReady {
                to: jid.clone(),
                cipher,
            }),
            Err(e) => log::debug!("key transport for {} not built: {e}", jid.bare_string()),
        }
    }

    /// Devices of this peer whose bundle could not be fetched so far.
    pub async fn missing_bundles(&self, jid: &Jid) -> Vec<u32> {
        self.registry.bundle_missing_devices(&jid.to_bare()).await
    }

    /// Retries bundle fetches that failed earlier, typically wired to
    /// an explicit refresh action in the UI.
    pub async fn retry_missing_bundles(&self, jid: &Jid) -> Result<(), OmemoError> {
        let peer = jid.to_bare();
        let devices = self.registry.bundle_missing_devices(&peer).await;
        if devices.is_empty() {
            return Ok(());
        }
        self.fetch_missing_bundles(&peer, &devices).await
    }

    // ---- outgoing ----

    /// Encrypts a one-to-one message, or passes the body through when
    /// the user has not enabled encryption for this chat.
    pub async fn encrypt_message(&self, to: &Jid, body: &str) -> Result<Outgoing, OmemoError> {
        if !self.encryption_enabled(to).await? {
            return Ok(Outgoing::Plaintext(body.to_string()));
        }
        let cipher = self.orchestrator.encrypt_message(to, body).await?;
        Ok(Outgoing::Encrypted(cipher))
    }

    /// Same for a tracked group chat.
    pub async fn encrypt_group_message(
        &self,
        room: &Jid,
        body: &str,
    ) -> Result<Outgoing, OmemoError> {
        if !self.encryption_enabled(room).await? {
            return Ok(Outgoing::Plaintext(body.to_string()));
        }
        let cipher = self.orchestrator.encrypt_group_message(room, body).await?;
        Ok(Outgoing::Encrypted(cipher))
    }

    /// Builds a payload-less hello that lets the peer's devices finish
    /// their side of freshly built sessions.
    pub async fn key_transport(&self, to: &Jid) -> Result<OmemoCipher, OmemoError> {
        self.orchestrator.key_transport(to).await
    }

    // ---- incoming ----

    pub async fn handle_message(
        &self,
        sender: &Jid,
        cipher: &OmemoCipher,
    ) -> Result<Incoming, OmemoError> {
        self.orchestrator.handle_message(sender, cipher).await
    }

    pub async fn handle_group_message(
        &self,
        room: &Jid,
        cipher: &OmemoCipher,
    ) -> Result<Incoming, OmemoError> {
        self.orchestrator.handle_group_message(room, cipher).await
    }

    // ---- trust and settings ----

    pub async fn fingerprints(&self, jid: &Jid) -> Result<Vec<Fingerprint>, OmemoError> {
        Ok(self.store.fingerprints(&jid.to_bare()).await?)
    }

    /// Our own identity fingerprint, for display next to the peers'.
    pub async fn own_fingerprint(&self) -> Result<Fingerprint, OmemoError> {
        use crate::signal::store::IdentityStore;
        let identity = self.store.identity_key_pair().await?;
        Ok(Fingerprint {
            public_key: identity.public.public_key(),
            trust: TrustLevel::Verified,
        })
    }

    pub async fn set_trust(
        &self,
        jid: &Jid,
        public_key: &[u8; 32],
        trust: TrustLevel,
    ) -> Result<(), OmemoError> {
        log::info!("trust for {} set to {trust}", jid.bare_string());
        Ok(self.store.set_trust(&jid.to_bare(), public_key, trust).await?)
    }

    /// Whether outgoing messages to this chat are encrypted. Off until
    /// the user switches it on; never auto-enabled.
    pub async fn encryption_enabled(&self, jid: &Jid) -> Result<bool, OmemoError> {
        Ok(self
            .store
            .encryption_enabled(&jid.to_bare())
            .await?
            .unwrap_or(false))
    }

    pub async fn set_encryption_enabled(
        &self,
        jid: &Jid,
        enabled: bool,
    ) -> Result<(), OmemoError> {
        Ok(self
            .store
            .set_encryption_enabled(&jid.to_bare(), enabled)
            .await?)
    }

    pub fn own_device_id(&self) -> u32 {
        self.own_device_id
    }

    pub fn own_jid(&self) -> &Jid {
        &self.own_jid
    }

    // ---- group chat membership ----

    /// Starts tracking a members-only, non-anonymous room for
    /// encryption. Other room types are never encrypted.
    pub async fn track_room(&self, room: &Jid) {
        self.registry.track_room(room).await;
    }

    pub async fn untrack_room(&self, room: &Jid) {
        self.registry.untrack_room(room).await;
    }

    pub async fn add_room_member(&self, room: &Jid, member: &Jid) {
        self.registry.add_room_member(room, member).await;
    }

    pub async fn remove_room_member(&self, room: &Jid, member: &Jid) {
        self.registry.remove_room_member(room, member).await;
    }
}
