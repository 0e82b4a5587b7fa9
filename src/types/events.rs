use crate::types::jid::Jid;
use crate::types::trust::Fingerprint;
use crate::wire::OmemoCipher;

/// Events the engine emits towards the embedding application. The UI
/// subscribes through an [`EventSink`] passed at construction; the core
/// never calls back into UI state directly.
#[derive(Debug, Clone)]
pub enum OmemoEvent {
    /// A peer's published device list changed.
    DeviceListChanged { jid: Jid, devices: Vec<u32> },
    /// Identity keys were observed for the first time. Emitted at most
    /// once per `(peer, key)` pair.
    NewFingerprints {
        jid: Jid,
        fingerprints: Vec<Fingerprint>,
    },
    /// A Double-Ratchet session with a remote device was established.
    SessionBuilt { jid: Jid, device_id: u32 },
    /// A payload-less envelope is ready for the host to send to `to`,
    /// letting the peer's devices finish freshly built sessions.
    KeyTransportReady { to: Jid, cipher: OmemoCipher },
    /// Our own bundle was (re-)published.
    BundlePublished { device_id: u32 },
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: OmemoEvent);
}

/// Sink that drops every event; useful for tests and headless use.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: OmemoEvent) {}
}
