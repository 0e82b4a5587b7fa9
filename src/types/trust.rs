use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-identity-key trust decision.
///
/// `Blind` is assigned automatically under blind-trust-before-verification;
/// `Verified` and `NotTrusted` are manual decisions. `Unknown` blocks
/// sending until the user decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    NotTrusted,
    Unknown,
    Blind,
    Verified,
}

impl TrustLevel {
    /// Whether a session with this identity may be used for outbound
    /// encryption.
    pub fn is_sendable(self) -> bool {
        matches!(self, TrustLevel::Blind | TrustLevel::Verified)
    }

    /// Integer codec for the SQLite `trust` column.
    pub fn to_db(self) -> i64 {
        match self {
            TrustLevel::NotTrusted => 0,
            TrustLevel::Unknown => 1,
            TrustLevel::Blind => 2,
            TrustLevel::Verified => 3,
        }
    }

    pub fn from_db(value: i64) -> TrustLevel {
        match value {
            0 => TrustLevel::NotTrusted,
            2 => TrustLevel::Blind,
            3 => TrustLevel::Verified,
            _ => TrustLevel::Unknown,
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustLevel::NotTrusted => "not-trusted",
            TrustLevel::Unknown => "unknown",
            TrustLevel::Blind => "blind",
            TrustLevel::Verified => "verified",
        };
        f.write_str(s)
    }
}

/// An observed remote identity key together with its trust decision,
/// as handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub public_key: [u8; 32],
    pub trust: TrustLevel,
}

impl Fingerprint {
    /// Human-readable rendering: lowercase hex in eight blocks of eight.
    pub fn render(&self) -> String {
        let hex = hex::encode(self.public_key);
        hex.as_bytes()
            .chunks(8)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
