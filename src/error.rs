use crate::crypto::cbc::CbcError;
use crate::crypto::gcm::GcmError;
use crate::signal::ecc::CurveError;
use crate::signal::protocol::ProtocolError;
use crate::signal::root_key::RootKeyError;
use crate::types::jid::Jid;
use thiserror::Error;

/// Persistence-layer failures. Fatal for the current operation; always
/// propagated.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("record codec error: {0}")]
    Codec(String),
    /// A signed prekey referenced by an incoming handshake is no longer
    /// stored (archived). Non-fatal for anything but that message.
    #[error("no such signed prekey: {0}")]
    NoSuchKey(u32),
    #[error("identity not initialized")]
    IdentityMissing,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the Double-Ratchet session layer.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Curve(#[from] CurveError),
    #[error(transparent)]
    RootKey(#[from] RootKeyError),
    #[error("cipher error: {0}")]
    Cbc(#[from] CbcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Replay: the counter was already consumed and no skipped key is
    /// cached for it.
    #[error("duplicate message (chain index {current}, received {received})")]
    DuplicateMessage { current: u32, received: u32 },
    #[error("message counter too far in the future (received {0})")]
    TooFarInFuture(u32),
    /// The identity key diverged from the stored, explicitly rejected
    /// one. The stored session is never touched on this path.
    #[error("untrusted identity for {address}")]
    UntrustedIdentity { address: String },
    #[error("no session with {address}")]
    NoSession { address: String },
    #[error("session exists but has no sender chain")]
    UninitializedSession,
    /// Ciphertext did not verify against the current or any archived
    /// session state.
    #[error("no session state accepted the message")]
    InvalidMessage,
    #[error("invalid bundle: {0}")]
    InvalidBundle(&'static str),
}

/// Transport-boundary failures for pubsub publishes and fetches.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("pubsub item not found")]
    ItemNotFound,
    #[error("transport error: {0}")]
    Io(String),
}

/// Top-level engine errors surfaced to the caller.
#[derive(Debug, Error)]
pub enum OmemoError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("payload crypto error: {0}")]
    Payload(#[from] GcmError),
    /// No identity for the peer is Verified or Blind; the UI must
    /// surface the trust decision before we can send.
    #[error("no trusted recipient identities for {0}")]
    NoTrustedRecipients(Jid),
    /// Every candidate device was skipped or failed; nothing to send.
    #[error("no valid sessions for {0}")]
    NoValidSessions(Jid),
    /// Group encryption was requested for a room we do not track
    /// (not members-only and non-anonymous).
    #[error("room {0} is not tracked for encryption")]
    RoomNotTracked(Jid),
}
