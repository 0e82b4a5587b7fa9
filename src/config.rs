use std::time::Duration;

/// Target size of the one-time prekey pool.
pub const DEFAULT_PREKEY_COUNT: u32 = 100;
/// Refill threshold: when the pool drops below this, new prekeys are
/// generated and the bundle is republished.
pub const MIN_PREKEY_COUNT: u32 = 80;
/// Signed prekey ids wrap at this bound.
pub const MAX_SIGNED_PREKEY_ID: u32 = 0x7FFF_FFFF;

/// Per-account engine configuration. `Default` carries the protocol
/// constants; tests shrink the pool sizes and timers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_prekey_count: u32,
    pub min_prekey_count: u32,
    /// Age after which the current signed prekey is rotated.
    pub signed_prekey_cycle: Duration,
    /// Age after which non-current signed prekeys are deleted.
    pub signed_prekey_archive: Duration,
    /// Auto-trust first-seen identity keys until the user verifies or
    /// rejects one key for the peer.
    pub blind_trust_before_verification: bool,
    pub bundle_fetch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_prekey_count: DEFAULT_PREKEY_COUNT,
            min_prekey_count: MIN_PREKEY_COUNT,
            signed_prekey_cycle: Duration::from_secs(24 * 60 * 60),
            signed_prekey_archive: Duration::from_secs(15 * 24 * 60 * 60),
            blind_trust_before_verification: true,
            bundle_fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// A device id derived from the registration id, as published in device
/// lists. Always positive and below 2^31.
pub fn own_device_id(registration_id: u32) -> u32 {
    (registration_id % (MAX_SIGNED_PREKEY_ID - 1)) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.default_prekey_count, 100);
        assert_eq!(cfg.min_prekey_count, 80);
        assert_eq!(cfg.signed_prekey_cycle, Duration::from_secs(86_400));
        assert_eq!(cfg.signed_prekey_archive, Duration::from_secs(86_400 * 15));
        assert!(cfg.blind_trust_before_verification);
    }

    #[test]
    fn device_id_is_positive_and_bounded() {
        assert_eq!(own_device_id(0), 1);
        assert!(own_device_id(u32::MAX) <= MAX_SIGNED_PREKEY_ID);
        assert!(own_device_id(u32::MAX) >= 1);
    }
}
