//! Device bookkeeping: which devices each contact announces, and which
//! occupants belong to the encrypted group chats we track.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::signal::address::SignalAddress;
use crate::signal::store::SessionStore;
use crate::store::KeyStore;
use crate::types::events::{EventSink, OmemoEvent};
use crate::types::jid::Jid;
use crate::wire::DeviceList;

/// What applying a device list changed, for the caller to act on.
#[derive(Debug, Default)]
pub struct DeviceListUpdate {
    /// Our own list arrived without our device id; a corrective publish
    /// is needed.
    pub own_id_missing: bool,
    /// Announced devices we hold no session with yet, in need of an
    /// eager bundle fetch.
    pub without_session: Vec<u32>,
}

/// Tracks announced device lists and group membership. Device lists are
/// persisted through the [`KeyStore`]; room membership is runtime-only
/// and re-fed by the host application on join.
pub struct DeviceRegistry {
    store: Arc<KeyStore>,
    sink: Arc<dyn EventSink>,
    own_jid: Jid,
    own_device_id: u32,
    /// Tracked rooms (members-only, non-anonymous) to their occupants'
    /// real bare JIDs.
    rooms: RwLock<HashMap<String, HashSet<Jid>>>,
    /// Devices whose bundle fetch failed; retried on the next list
    /// notification or an explicit refresh.
    bundle_missing: RwLock<HashSet<(String, u32)>>,
}

impl DeviceRegistry {
    pub fn new(
        store: Arc<KeyStore>,
        sink: Arc<dyn EventSink>,
        own_jid: Jid,
        own_device_id: u32,
    ) -> Self {
        Self {
            store,
            sink,
            own_jid: own_jid.to_bare(),
            own_device_id,
            rooms: RwLock::new(HashMap::new()),
            bundle_missing: RwLock::new(HashSet::new()),
        }
    }

    /// Applies a device list update from PubSub. Sessions for devices
    /// that vanished are deactivated but their ratchet state is kept.
    pub async fn update_device_list(
        &self,
        from: &Jid,
        list: &DeviceList,
    ) -> Result<DeviceListUpdate, StoreError> {
        let owner = from.to_bare();
        let mut devices = list.devices.clone();
        devices.sort_unstable();
        devices.dedup();

        log::debug!("device list for {}: {:?}", owner, devices);
        self.store.set_device_list(&owner, &devices).await?;
        self.store.sync_session_activity(&owner, &devices).await?;
        self.sink.on_event(OmemoEvent::DeviceListChanged {
            jid: owner.clone(),
            devices: devices.clone(),
        });

        // Fetch failures for devices no longer announced are moot.
        let owner_key = owner.bare_string();
        self.bundle_missing
            .write()
            .await
            .retain(|(jid, device)| *jid != owner_key || devices.contains(device));

        let mut without_session = Vec::new();
        for &device_id in &devices {
            if owner == self.own_jid && device_id == self.own_device_id {
                continue;
            }
            let address = SignalAddress::new(&owner, device_id);
            if !self.store.contains_session(&address).await? {
                without_session.push(device_id);
            }
        }

        Ok(DeviceListUpdate {
            own_id_missing: owner == self.own_jid && !devices.contains(&self.own_device_id),
            without_session,
        })
    }

    pub async fn mark_bundle_missing(&self, jid: &Jid, device_id: u32) {
        self.bundle_missing
            .write()
            .await
            .insert((jid.bare_string(), device_id));
    }

    pub async fn clear_bundle_missing(&self, jid: &Jid, device_id: u32) {
        self.bundle_missing
            .write()
            .await
            .remove(&(jid.bare_string(), device_id));
    }

    /// Devices of this peer whose last bundle fetch failed.
    pub async fn bundle_missing_devices(&self, jid: &Jid) -> Vec<u32> {
        let missing = self.bundle_missing.read().await;
        let mut out: Vec<u32> = missing
            .iter()
            .filter(|(owner, _)| *owner == jid.bare_string())
            .map(|(_, device)| *device)
            .collect();
        out.sort_unstable();
        out
    }

    /// The devices to encrypt to for a peer. Our own device is never a
    /// recipient of its own wrapped key.
    pub async fn devices_for(&self, jid: &Jid) -> Result<Vec<u32>, StoreError> {
        let mut devices = self.store.device_list(&jid.to_bare()).await?;
        if jid.to_bare() == self.own_jid {
            devices.retain(|&d| d != self.own_device_id);
        }
        Ok(devices)
    }

    pub fn own_device_id(&self) -> u32 {
        self.own_device_id
    }

    pub fn own_jid(&self) -> &Jid {
        &self.own_jid
    }

    // ---- group chats ----

    /// Starts tracking a room. Only rooms that are members-only and
    /// non-anonymous are eligible for encryption; the host application
    /// enforces that before calling.
    pub async fn track_room(&self, room: &Jid) {
        self.rooms
            .write()
            .await
            .entry(room.bare_string())
            .or_default();
    }

    pub async fn untrack_room(&self, room: &Jid) {
        self.rooms.write().await.remove(&room.bare_string());
    }

    pub async fn is_tracked_room(&self, room: &Jid) -> bool {
        self.rooms.read().await.contains_key(&room.bare_string())
    }

    pub async fn add_room_member(&self, room: &Jid, member: &Jid) {
        if let Some(members) = self.rooms.write().await.get_mut(&room.bare_string()) {
            members.insert(member.to_bare());
        }
    }

    pub async fn remove_room_member(&self, room: &Jid, member: &Jid) {
        if let Some(members) = self.rooms.write().await.get_mut(&room.bare_string()) {
            members.remove(&member.to_bare());
        }
    }

    /// Current occupants, ourselves excluded.
    pub async fn room_members(&self, room: &Jid) -> Option<Vec<Jid>> {
        let rooms = self.rooms.read().await;
        let members = rooms.get(&room.bare_string())?;
        let mut out: Vec<Jid> = members
            .iter()
            .filter(|m| **m != self.own_jid)
            .cloned()
            .collect();
        out.sort();
        Some(out)
    }

    /// Maps a sender device id in a room back to the member announcing
    /// it. Needed because group messages only carry the device id.
    pub async fn find_room_device_owner(
        &self,
        room: &Jid,
        device_id: u32,
    ) -> Result<Option<Jid>, StoreError> {
        let members = match self.room_members(room).await {
            Some(m) => m,
            None => return Ok(None),
        };
        for member in members {
            if self.store.device_list(&member).await?.contains(&device_id) {
                return Ok(Some(member));
            }
        }
        if self
            .store
            .device_list(&self.own_jid)
            .await?
            .contains(&device_id)
        {
            return Ok(Some(self.own_jid.clone()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::events::NullSink;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn registry(own_device_id: u32) -> DeviceRegistry {
        let store = Arc::new(KeyStore::open_in_memory(true).unwrap());
        DeviceRegistry::new(
            store,
            Arc::new(NullSink),
            jid("me@example.org"),
            own_device_id,
        )
    }

    #[tokio::test]
    async fn contact_list_updates_are_persisted() {
        let registry = registry(7);
        let peer = jid("peer@example.org");
        let update = registry
            .update_device_list(&peer, &DeviceList {
                devices: vec![3, 1, 3, 2],
            })
            .await
            .unwrap();
        assert!(!update.own_id_missing);
        // No sessions yet, so every announced device wants a bundle.
        assert_eq!(update.without_session, vec![1, 2, 3]);
        assert_eq!(registry.devices_for(&peer).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn own_list_missing_our_device_asks_for_republish() {
        let registry = registry(7);
        let me = jid("me@example.org");

        let update = registry
            .update_device_list(&me, &DeviceList { devices: vec![9] })
            .await
            .unwrap();
        assert!(update.own_id_missing);

        let update = registry
            .update_device_list(&me, &DeviceList { devices: vec![7, 9] })
            .await
            .unwrap();
        assert!(!update.own_id_missing);
        // Our own device never fetches a bundle from itself.
        assert_eq!(update.without_session, vec![9]);
        // Only other own devices are encryption targets.
        assert_eq!(registry.devices_for(&me).await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn room_membership_and_owner_lookup() {
        let registry = registry(7);
        let room = jid("den@rooms.example.org");
        let alice = jid("alice@example.org");
        let bob = jid("bob@example.org");

        registry.track_room(&room).await;
        registry.add_room_member(&room, &alice).await;
        registry.add_room_member(&room, &bob).await;
        registry
            .update_device_list(&alice, &DeviceList { devices: vec![11] })
            .await
            .unwrap();
        registry
            .update_device_list(&bob, &DeviceList { devices: vec![22] })
            .await
            .unwrap();

        assert_eq!(
            registry.find_room_device_owner(&room, 22).await.unwrap(),
            Some(bob.clone())
        );
        assert_eq!(
            registry.find_room_device_owner(&room, 99).await.unwrap(),
            None
        );

        registry.remove_room_member(&room, &bob).await;
        assert_eq!(
            registry.find_room_device_owner(&room, 22).await.unwrap(),
            None
        );

        assert_eq!(registry.room_members(&room).await.unwrap(), vec![alice]);
    }

    #[tokio::test]
    async fn vanished_devices_leave_the_bundle_missing_set() {
        let registry = registry(7);
        let peer = jid("peer@example.org");
        registry
            .update_device_list(&peer, &DeviceList {
                devices: vec![1, 2],
            })
            .await
            .unwrap();
        registry.mark_bundle_missing(&peer, 1).await;
        registry.mark_bundle_missing(&peer, 2).await;
        assert_eq!(registry.bundle_missing_devices(&peer).await, vec![1, 2]);

        registry
            .update_device_list(&peer, &DeviceList { devices: vec![2] })
            .await
            .unwrap();
        assert_eq!(registry.bundle_missing_devices(&peer).await, vec![2]);

        registry.clear_bundle_missing(&peer, 2).await;
        assert!(registry.bundle_missing_devices(&peer).await.is_empty());
    }

    #[tokio::test]
    async fn untracked_room_has_no_members() {
        let registry = registry(7);
        let room = jid("den@rooms.example.org");
        assert!(!registry.is_tracked_room(&room).await);
        assert!(registry.room_members(&room).await.is_none());
    }
}
