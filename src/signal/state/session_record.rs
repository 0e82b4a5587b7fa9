use crate::signal::state::session_state::SessionState;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const MAX_ARCHIVED_STATES: usize = 40;

/// A device's session history: the current ratchet state plus archived
/// ones kept so that messages sent before a re-handshake still decrypt.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fresh(&self) -> bool {
        self.current.is_none() && self.previous.is_empty()
    }

    pub fn current(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    /// Installs a new current state, archiving the old one.
    pub fn promote_fresh_state(&mut self, state: SessionState) {
        if let Some(old) = self.current.replace(state) {
            if self.previous.len() >= MAX_ARCHIVED_STATES {
                self.previous.pop_back();
            }
            self.previous.push_front(old);
        }
    }

    pub fn previous_states(&self) -> &VecDeque<SessionState> {
        &self.previous
    }

    pub fn previous_states_mut(&mut self) -> &mut VecDeque<SessionState> {
        &mut self.previous
    }

    /// Moves an archived state back to current after it successfully
    /// decrypted a message.
    pub fn promote_state(&mut self, index: usize) {
        if let Some(promoted) = self.previous.remove(index) {
            if let Some(old) = self.current.replace(promoted) {
                if self.previous.len() >= MAX_ARCHIVED_STATES {
                    self.previous.pop_back();
                }
                self.previous.push_front(old);
            }
        }
    }

    /// Whether any state (current or archived) was created by the
    /// handshake with this base key.
    pub fn has_session_for_base_key(&self, base_key: &[u8; 32]) -> bool {
        self.current
            .iter()
            .chain(self.previous.iter())
            .any(|s| s.alice_base_key() == Some(*base_key))
    }

    pub fn serialize(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("in-memory encoding cannot fail")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, String> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(record, _)| record)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::identity::IdentityKey;
    use crate::signal::root_key::RootKey;

    fn state(tag: u8) -> SessionState {
        let mut s = SessionState::new(
            IdentityKey::new([1u8; 32]),
            IdentityKey::new([2u8; 32]),
            RootKey::new([3u8; 32]),
        );
        s.set_alice_base_key([tag; 32]);
        s
    }

    #[test]
    fn promote_fresh_archives_previous_current() {
        let mut record = SessionRecord::new();
        assert!(record.is_fresh());
        record.promote_fresh_state(state(1));
        record.promote_fresh_state(state(2));
        assert_eq!(record.previous_states().len(), 1);
        assert_eq!(record.current().unwrap().alice_base_key(), Some([2u8; 32]));
    }

    #[test]
    fn base_key_lookup_covers_archived_states() {
        let mut record = SessionRecord::new();
        record.promote_fresh_state(state(1));
        record.promote_fresh_state(state(2));
        assert!(record.has_session_for_base_key(&[1u8; 32]));
        assert!(record.has_session_for_base_key(&[2u8; 32]));
        assert!(!record.has_session_for_base_key(&[3u8; 32]));
    }

    #[test]
    fn promote_state_swaps_with_current() {
        let mut record = SessionRecord::new();
        record.promote_fresh_state(state(1));
        record.promote_fresh_state(state(2));
        record.promote_state(0);
        assert_eq!(record.current().unwrap().alice_base_key(), Some([1u8; 32]));
        assert_eq!(
            record.previous_states()[0].alice_base_key(),
            Some([2u8; 32])
        );
    }

    #[test]
    fn serialization_round_trips() {
        let mut record = SessionRecord::new();
        record.promote_fresh_state(state(7));
        let bytes = record.serialize();
        let back = SessionRecord::deserialize(&bytes).unwrap();
        assert!(back.has_session_for_base_key(&[7u8; 32]));
    }
}
