use async_trait::async_trait;

use crate::error::StoreError;
use crate::signal::address::SignalAddress;
use crate::signal::identity::{IdentityKey, IdentityKeyPair};
use crate::signal::state::{PreKeyRecord, SessionRecord, SignedPreKeyRecord};

/// Stores the local identity and the identities observed for peers.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn identity_key_pair(&self) -> Result<IdentityKeyPair, StoreError>;

    async fn local_registration_id(&self) -> Result<u32, StoreError>;

    /// Records an identity for an address. Returns `true` when the key
    /// was not known for this peer before.
    async fn save_identity(
        &self,
        address: &SignalAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError>;

    /// Whether sessions may be built and messages decrypted for this
    /// identity. Only an explicitly rejected key answers `false`;
    /// unknown keys are allowed through and recorded.
    async fn is_trusted_identity(
        &self,
        address: &SignalAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError>;

    async fn store_prekey(&self, id: u32, record: PreKeyRecord) -> Result<(), StoreError>;

    /// Deletes a one-time prekey after it was consumed by a handshake.
    async fn remove_prekey(&self, id: u32) -> Result<(), StoreError>;

    async fn prekey_count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait SignedPreKeyStore: Send + Sync {
    /// Errors with [`StoreError::NoSuchKey`] when the record was
    /// already archived away.
    async fn load_signed_prekey(&self, id: u32) -> Result<SignedPreKeyRecord, StoreError>;

    async fn store_signed_prekey(
        &self,
        id: u32,
        record: SignedPreKeyRecord,
    ) -> Result<(), StoreError>;

    /// Drops signed prekeys older than the archive window, keeping the
    /// one currently published.
    async fn remove_old_signed_prekeys(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
        keep_id: u32,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads the session record for an address, or a fresh empty record
    /// when none is stored yet.
    async fn load_session(&self, address: &SignalAddress) -> Result<SessionRecord, StoreError>;

    async fn store_session(
        &self,
        address: &SignalAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError>;

    async fn contains_session(&self, address: &SignalAddress) -> Result<bool, StoreError>;

    async fn delete_session(&self, address: &SignalAddress) -> Result<(), StoreError>;
}

/// The full store surface the session layer works against.
pub trait ProtocolStore:
    IdentityStore + PreKeyStore + SignedPreKeyStore + SessionStore
{
}

impl<T: IdentityStore + PreKeyStore + SignedPreKeyStore + SessionStore> ProtocolStore for T {}
