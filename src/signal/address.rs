use crate::types::jid::Jid;
use std::fmt;

/// Addresses one remote device: the peer's bare JID plus the published
/// device id. Session records are keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalAddress {
    name: String,
    device_id: u32,
}

impl SignalAddress {
    pub fn new(jid: &Jid, device_id: u32) -> Self {
        Self {
            name: jid.bare_string(),
            device_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl fmt::Display for SignalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.device_id)
    }
}
