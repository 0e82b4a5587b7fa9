//! The engine's outward boundary. The host application supplies a
//! [`Transport`] for PubSub traffic and a [`Roster`] for subscription
//! checks; encrypted message stanzas themselves stay with the caller.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::jid::Jid;
use crate::wire::{DeviceList, OmemoBundle};

/// Server-pushed PubSub notifications the engine consumes.
#[derive(Debug, Clone)]
pub enum PubSubEvent {
    /// A contact (or our own account) published a new device list.
    DeviceList { from: Jid, list: DeviceList },
}

/// PubSub access for device lists and key bundles. Publishes always
/// target our own account; fetches name the owner.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish_device_list(&self, list: &DeviceList) -> Result<(), TransportError>;

    async fn fetch_device_list(&self, owner: &Jid) -> Result<DeviceList, TransportError>;

    async fn publish_bundle(
        &self,
        device_id: u32,
        bundle: &OmemoBundle,
    ) -> Result<(), TransportError>;

    async fn fetch_bundle(&self, owner: &Jid, device_id: u32)
        -> Result<OmemoBundle, TransportError>;
}

/// Presence subscription checks. Device lists only flow between
/// mutually subscribed contacts, so the engine will not build sessions
/// with anyone else.
#[async_trait]
pub trait Roster: Send + Sync {
    async fn has_subscription(&self, jid: &Jid) -> bool;
}
