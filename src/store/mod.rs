pub mod key_store;
pub mod migrations;

pub use key_store::KeyStore;
