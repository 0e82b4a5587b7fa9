//! OMEMO end-to-end encryption for XMPP-style messaging.
//!
//! The crate is transport-agnostic: the host application feeds PubSub
//! items and message envelopes in through [`OmemoEngine`] and ships the
//! returned entities out on its own connection. All key material lives
//! in a per-account SQLite store.

pub mod bundle;
pub mod config;
pub mod crypto;
pub mod devices;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod session_engine;
pub mod signal;
pub mod store;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::EngineConfig;
pub use engine::OmemoEngine;
pub use error::{OmemoError, SignalError, StoreError, TransportError};
pub use orchestrator::{DropReason, Incoming, Outgoing};
pub use store::KeyStore;
pub use transport::{PubSubEvent, Roster, Transport};
pub use types::events::{EventSink, NullSink, OmemoEvent};
pub use types::jid::Jid;
pub use types::trust::{Fingerprint, TrustLevel};
pub use wire::{DeviceList, MessageKeyEntry, OmemoBundle, OmemoCipher, PreKeyEntry};
