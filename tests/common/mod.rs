//! Shared harness: an in-memory PubSub service and loopback transports
//! so several engines can talk to each other inside one test.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use omemo_core::{
    DeviceList, EngineConfig, EventSink, Jid, KeyStore, OmemoBundle, OmemoEngine, OmemoEvent,
    Roster, Transport, TransportError,
};

/// Stands in for the XMPP server's PubSub service. Shared by every
/// account in a test.
#[derive(Default)]
pub struct PubSubServer {
    device_lists: Mutex<HashMap<String, DeviceList>>,
    bundles: Mutex<HashMap<(String, u32), OmemoBundle>>,
}

impl PubSubServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drops a device's published bundle, as if the node was deleted.
    pub fn delete_bundle(&self, owner: &Jid, device_id: u32) {
        self.bundles
            .lock()
            .unwrap()
            .remove(&(owner.bare_string(), device_id));
    }

    pub fn published_device_list(&self, owner: &Jid) -> Option<DeviceList> {
        self.device_lists
            .lock()
            .unwrap()
            .get(&owner.bare_string())
            .cloned()
    }

    /// Publishes (or restores) a bundle on a device's behalf.
    pub fn publish_bundle_for(&self, owner: &Jid, device_id: u32, bundle: OmemoBundle) {
        self.bundles
            .lock()
            .unwrap()
            .insert((owner.bare_string(), device_id), bundle);
    }

    pub fn published_bundle(&self, owner: &Jid, device_id: u32) -> Option<OmemoBundle> {
        self.bundles
            .lock()
            .unwrap()
            .get(&(owner.bare_string(), device_id))
            .cloned()
    }
}

/// One account's view of the shared server.
pub struct LoopbackTransport {
    server: Arc<PubSubServer>,
    owner: Jid,
}

impl LoopbackTransport {
    pub fn new(server: Arc<PubSubServer>, owner: Jid) -> Self {
        Self {
            server,
            owner: owner.to_bare(),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn publish_device_list(&self, list: &DeviceList) -> Result<(), TransportError> {
        self.server
            .device_lists
            .lock()
            .unwrap()
            .insert(self.owner.bare_string(), list.clone());
        Ok(())
    }

    async fn fetch_device_list(&self, owner: &Jid) -> Result<DeviceList, TransportError> {
        self.server
            .device_lists
            .lock()
            .unwrap()
            .get(&owner.bare_string())
            .cloned()
            .ok_or(TransportError::ItemNotFound)
    }

    async fn publish_bundle(
        &self,
        device_id: u32,
        bundle: &OmemoBundle,
    ) -> Result<(), TransportError> {
        self.server
            .bundles
            .lock()
            .unwrap()
            .insert((self.owner.bare_string(), device_id), bundle.clone());
        Ok(())
    }

    async fn fetch_bundle(
        &self,
        owner: &Jid,
        device_id: u32,
    ) -> Result<OmemoBundle, TransportError> {
        self.server
            .bundles
            .lock()
            .unwrap()
            .get(&(owner.bare_string(), device_id))
            .cloned()
            .ok_or(TransportError::ItemNotFound)
    }
}

pub struct AllowAllRoster;

#[async_trait]
impl Roster for AllowAllRoster {
    async fn has_subscription(&self, _jid: &Jid) -> bool {
        true
    }
}

pub struct EmptyRoster;

#[async_trait]
impl Roster for EmptyRoster {
    async fn has_subscription(&self, _jid: &Jid) -> bool {
        false
    }
}

/// Records every event the engine emits.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<OmemoEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<OmemoEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: OmemoEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn jid(s: &str) -> Jid {
    s.parse().unwrap()
}

/// Small pool sizes keep the tests quick while still exercising the
/// refill path.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        default_prekey_count: 5,
        min_prekey_count: 3,
        ..EngineConfig::default()
    }
}

pub struct TestAccount {
    pub engine: OmemoEngine<LoopbackTransport>,
    pub sink: Arc<CollectingSink>,
    pub jid: Jid,
}

/// Builds and starts an engine for `address` against the shared server.
pub async fn account(server: &Arc<PubSubServer>, address: &str) -> TestAccount {
    account_with_config(server, address, test_config()).await
}

pub async fn account_with_config(
    server: &Arc<PubSubServer>,
    address: &str,
    config: EngineConfig,
) -> TestAccount {
    let _ = env_logger::builder().is_test(true).try_init();
    let jid = jid(address);
    let sink = CollectingSink::new();
    let store = KeyStore::open_in_memory(config.blind_trust_before_verification).unwrap();
    let transport = Arc::new(LoopbackTransport::new(server.clone(), jid.clone()));
    let engine = OmemoEngine::with_store(
        store,
        jid.clone(),
        transport,
        Arc::new(AllowAllRoster),
        sink.clone(),
        config,
    )
    .await
    .unwrap();
    engine.start().await.unwrap();
    TestAccount { engine, sink, jid }
}

/// Pushes each account's published device list to the other, the way a
/// server forwards PubSub notifications to subscribers.
pub async fn exchange_device_lists(server: &Arc<PubSubServer>, accounts: &[&TestAccount]) {
    for receiver in accounts {
        for sender in accounts {
            if sender.jid == receiver.jid {
                continue;
            }
            if let Some(list) = server.published_device_list(&sender.jid) {
                receiver
                    .engine
                    .handle_pubsub_event(omemo_core::PubSubEvent::DeviceList {
                        from: sender.jid.clone(),
                        list,
                    })
                    .await
                    .unwrap();
            }
        }
    }
}
