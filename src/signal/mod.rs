//! In-tree Signal protocol: X3DH session setup and the Double Ratchet,
//! plus the store traits the persistence layer implements.

pub mod address;
pub mod chain_key;
pub mod ecc;
pub mod identity;
pub mod message_key;
pub mod protocol;
pub mod ratchet;
pub mod root_key;
pub mod session;
pub mod state;
pub mod store;

pub use address::SignalAddress;
pub use identity::{IdentityKey, IdentityKeyPair};
pub use session::{PreKeyBundle, SessionBuilder, SessionCipher};
pub use store::ProtocolStore;
