pub mod cbc;
pub mod gcm;
pub mod hkdf;
pub mod xed25519;
