//! Maintenance of our own published material: the signed prekey, the
//! one-time prekey pool, the bundle node, and the own device list.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::{EngineConfig, MAX_SIGNED_PREKEY_ID};
use crate::error::{OmemoError, StoreError};
use crate::signal::ecc::KeyPair;
use crate::signal::state::{PreKeyRecord, SignedPreKeyRecord};
use crate::signal::store::{IdentityStore, PreKeyStore, SignedPreKeyStore};
use crate::store::KeyStore;
use crate::transport::Transport;
use crate::types::events::{EventSink, OmemoEvent};
use crate::wire::{DeviceList, OmemoBundle, PreKeyEntry};

pub struct BundleManager<T: Transport> {
    store: Arc<KeyStore>,
    transport: Arc<T>,
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
    own_device_id: u32,
    /// Last own device list we pushed; suppresses no-op republishes
    /// when several updates race in.
    last_published_list: Mutex<Option<Vec<u32>>>,
}

impl<T: Transport> BundleManager<T> {
    pub fn new(
        store: Arc<KeyStore>,
        transport: Arc<T>,
        config: EngineConfig,
        sink: Arc<dyn EventSink>,
        own_device_id: u32,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            sink,
            own_device_id,
            last_published_list: Mutex::new(None),
        }
    }

    /// Startup and maintenance entry point: rotates the signed prekey
    /// when due, tops up the prekey pool, and republishes the bundle
    /// when anything moved (or it was never published).
    pub async fn ensure_published(&self) -> Result<(), OmemoError> {
        let rotated = self.rotate_signed_prekey_if_due().await?;
        let refilled = self.refill_prekeys_if_low().await?;
        if rotated || refilled {
            self.publish_bundle().await?;
        }
        Ok(())
    }

    /// Called after an incoming handshake consumed a one-time prekey.
    /// Always republishes so no later sender can pick the spent key.
    pub async fn prekey_consumed(&self, id: u32) -> Result<(), OmemoError> {
        self.store.remove_prekey(id).await?;
        log::debug!("one-time prekey {id} consumed");
        self.refill_prekeys_if_low().await?;
        self.publish_bundle().await
    }

    /// Assembles the bundle from stored material and pushes it to our
    /// bundle node.
    pub async fn publish_bundle(&self) -> Result<(), OmemoError> {
        let bundle = self.current_bundle().await?;
        self.transport
            .publish_bundle(self.own_device_id, &bundle)
            .await?;
        log::info!(
            "published bundle for device {} ({} prekeys)",
            self.own_device_id,
            bundle.pre_keys.len()
        );
        self.sink.on_event(OmemoEvent::BundlePublished {
            device_id: self.own_device_id,
        });
        Ok(())
    }

    pub async fn current_bundle(&self) -> Result<OmemoBundle, OmemoError> {
        let identity = self.store.identity_key_pair().await?;
        let signed_id = self
            .store
            .current_signed_prekey_id()
            .await?
            .ok_or_else(|| OmemoError::Store(StoreError::NoSuchKey(0)))?;
        let signed = self.store.load_signed_prekey(signed_id).await?;
        let pre_keys = self
            .store
            .all_prekeys()
            .await?
            .into_iter()
            .map(|record| PreKeyEntry {
                id: record.id,
                public_key: record.key_pair.public_key,
            })
            .collect();

        Ok(OmemoBundle {
            identity_key: identity.public.public_key(),
            signed_pre_key_id: signed.id,
            signed_pre_key_public: signed.key_pair.public_key,
            signed_pre_key_signature: signed.signature,
            pre_keys,
        })
    }

    /// Publishes our device list with our own id folded in. The list is
    /// the authoritative set from the server; we only ever add
    /// ourselves, never prune other devices.
    pub async fn publish_own_device_list(&self, announced: &[u32]) -> Result<(), OmemoError> {
        let mut devices = announced.to_vec();
        if !devices.contains(&self.own_device_id) {
            devices.push(self.own_device_id);
        }
        devices.sort_unstable();
        devices.dedup();

        let mut last = self.last_published_list.lock().await;
        if last.as_deref() == Some(devices.as_slice()) {
            return Ok(());
        }
        self.transport
            .publish_device_list(&DeviceList {
                devices: devices.clone(),
            })
            .await?;
        log::info!("published own device list: {:?}", devices);
        *last = Some(devices);
        Ok(())
    }

    /// Rotates when there is no current signed prekey, the record went
    /// missing, or it aged past the cycle. Old records stay loadable
    /// until the archive window passes.
    async fn rotate_signed_prekey_if_due(&self) -> Result<bool, OmemoError> {
        let now = Utc::now().timestamp();
        let cycle = self.config.signed_prekey_cycle.as_secs() as i64;

        let current_id = self.store.current_signed_prekey_id().await?;
        if let Some(id) = current_id {
            match self.store.load_signed_prekey(id).await {
                Ok(record) => {
                    if record.created_at + cycle > now {
                        return Ok(false);
                    }
                }
                // The pointed-to record was archived away; rotate.
                Err(StoreError::NoSuchKey(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let new_id = match current_id {
            Some(id) if id >= MAX_SIGNED_PREKEY_ID => 1,
            Some(id) => id + 1,
            None => 1,
        };
        let identity = self.store.identity_key_pair().await?;
        let key_pair = KeyPair::generate();
        let signature = identity.sign_prekey(&key_pair.public_key);
        let record = SignedPreKeyRecord::new(new_id, key_pair, signature, now);
        self.store.store_signed_prekey(new_id, record).await?;
        self.store.set_current_signed_prekey_id(new_id).await?;
        log::info!("rotated signed prekey to id {new_id}");

        let archive_secs = self.config.signed_prekey_archive.as_secs() as i64;
        let cutoff = chrono::DateTime::from_timestamp(now - archive_secs, 0)
            .unwrap_or_else(Utc::now);
        self.store
            .remove_old_signed_prekeys(cutoff, new_id)
            .await?;
        Ok(true)
    }

    async fn refill_prekeys_if_low(&self) -> Result<bool, OmemoError> {
        let count = self.store.prekey_count().await? as u32;
        if count >= self.config.min_prekey_count {
            return Ok(false);
        }
        let missing = self.config.default_prekey_count - count;
        let first_id = self.store.allocate_prekey_ids(missing).await?;
        for id in first_id..first_id + missing {
            self.store.store_prekey(id, PreKeyRecord::generate(id)).await?;
        }
        log::info!("generated {missing} one-time prekeys (pool was {count})");
        Ok(true)
    }
}
