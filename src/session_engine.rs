//! Session establishment and per-device key wrapping, one layer above
//! the raw Double Ratchet.

use std::sync::Arc;

use tokio::time::timeout;

use crate::config::EngineConfig;
use crate::error::{OmemoError, SignalError, TransportError};
use crate::signal::address::SignalAddress;
use crate::signal::protocol::{PreKeySignalMessage, SignalMessage};
use crate::signal::session::{SessionBuilder, SessionCipher, SessionLocks};
use crate::signal::store::SessionStore;
use crate::store::KeyStore;
use crate::transport::Transport;
use crate::types::events::{EventSink, OmemoEvent};
use crate::types::jid::Jid;

pub struct SessionEngine<T: Transport> {
    store: Arc<KeyStore>,
    locks: Arc<SessionLocks>,
    transport: Arc<T>,
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
}

impl<T: Transport> SessionEngine<T> {
    pub fn new(
        store: Arc<KeyStore>,
        transport: Arc<T>,
        config: EngineConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            locks: Arc::new(SessionLocks::new()),
            transport,
            config,
            sink,
        }
    }

    /// Makes sure a session exists for every listed device, fetching
    /// bundles for the missing ones. Devices whose bundle cannot be
    /// fetched or verified are skipped with a log line; the message
    /// still goes to everyone else.
    pub async fn ensure_sessions(
        &self,
        jid: &Jid,
        devices: &[u32],
    ) -> Result<Vec<u32>, OmemoError> {
        let mut usable = Vec::new();
        for &device_id in devices {
            let address = SignalAddress::new(jid, device_id);
            if self.store.contains_session(&address).await? {
                usable.push(device_id);
                continue;
            }
            match self.build_session_with_retry(jid, device_id).await {
                Ok(()) => usable.push(device_id),
                Err(e) => {
                    log::warn!("skipping device {address}: {e}");
                }
            }
        }
        self.announce_new_fingerprints(jid).await?;
        Ok(usable)
    }

    /// Fetches one device's bundle and runs X3DH against it.
    pub async fn build_session(&self, jid: &Jid, device_id: u32) -> Result<(), OmemoError> {
        let address = SignalAddress::new(jid, device_id);
        let bundle = timeout(
            self.config.bundle_fetch_timeout,
            self.transport.fetch_bundle(jid, device_id),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let signal_bundle = bundle.to_signal_bundle();
        let builder = SessionBuilder::new(self.store.clone(), address.clone());
        let _guard = self.locks.guard(&address).await;
        let mut record = self.store.load_session(&address).await?;
        builder.process_bundle(&mut record, &signal_bundle).await?;
        self.store.store_session(&address, &record).await?;

        log::info!("built session with {address}");
        self.sink.on_event(OmemoEvent::SessionBuilt {
            jid: jid.to_bare(),
            device_id,
        });
        Ok(())
    }

    /// [`build_session`](Self::build_session) with a single retry on a
    /// transport failure.
    pub async fn build_session_with_retry(
        &self,
        jid: &Jid,
        device_id: u32,
    ) -> Result<(), OmemoError> {
        match self.build_session(jid, device_id).await {
            Err(OmemoError::Transport(first)) => {
                log::debug!(
                    "bundle fetch for {}:{device_id} failed ({first}), retrying",
                    jid.bare_string()
                );
                self.build_session(jid, device_id).await
            }
            other => other,
        }
    }

    /// Wraps the payload key for one device. The flag says whether the
    /// output still carries the X3DH handshake.
    pub async fn encrypt_key(
        &self,
        jid: &Jid,
        device_id: u32,
        data: &[u8],
    ) -> Result<(Vec<u8>, bool), SignalError> {
        let cipher = SessionCipher::new(
            self.store.clone(),
            self.locks.clone(),
            SignalAddress::new(jid, device_id),
        );
        cipher.encrypt(data).await
    }

    /// Unwraps a key addressed to us from a handshake message. Returns
    /// the consumed one-time prekey id, if the handshake was new.
    pub async fn decrypt_prekey_key(
        &self,
        jid: &Jid,
        device_id: u32,
        blob: &[u8],
    ) -> Result<(Vec<u8>, Option<u32>), SignalError> {
        let message = PreKeySignalMessage::deserialize(blob)?;
        let cipher = SessionCipher::new(
            self.store.clone(),
            self.locks.clone(),
            SignalAddress::new(jid, device_id),
        );
        let result = cipher.decrypt_prekey(&message).await?;
        self.announce_new_fingerprints(jid).await?;
        Ok(result)
    }

    /// Unwraps a key addressed to us from an established session.
    pub async fn decrypt_key(
        &self,
        jid: &Jid,
        device_id: u32,
        blob: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        let message = SignalMessage::deserialize(blob)?;
        let cipher = SessionCipher::new(
            self.store.clone(),
            self.locks.clone(),
            SignalAddress::new(jid, device_id),
        );
        cipher.decrypt(&message).await
    }

    pub(crate) async fn announce_new_fingerprints(&self, jid: &Jid) -> Result<(), SignalError> {
        let fresh = self.store.take_unseen_fingerprints(&jid.to_bare()).await?;
        if !fresh.is_empty() {
            self.sink.on_event(OmemoEvent::NewFingerprints {
                jid: jid.to_bare(),
                fingerprints: fresh,
            });
        }
        Ok(())
    }
}
