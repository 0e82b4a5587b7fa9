use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config;
use crate::error::StoreError;
use crate::signal::address::SignalAddress;
use crate::signal::ecc::KeyPair;
use crate::signal::identity::{IdentityKey, IdentityKeyPair};
use crate::signal::state::{PreKeyRecord, SessionRecord, SignedPreKeyRecord};
use crate::signal::store::{IdentityStore, PreKeyStore, SessionStore, SignedPreKeyStore};
use crate::types::jid::Jid;
use crate::types::trust::{Fingerprint, TrustLevel};

/// Sentinel `peer_jid` for the row holding our own identity key pair
/// and registration id.
const OWN_ROW: &str = "__account__";

const NEXT_PREKEY_ID: &str = "next_prekey_id";
const SIGNED_PREKEY_ID: &str = "signed_prekey_id";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(value)
}

fn key32(blob: Vec<u8>) -> Result<[u8; 32], StoreError> {
    blob.try_into()
        .map_err(|_| StoreError::Codec("key blob is not 32 bytes".into()))
}

/// All durable OMEMO state for one account, in a single SQLite file.
/// One store per logged-in account; access is serialized through a
/// connection mutex.
pub struct KeyStore {
    conn: Mutex<Connection>,
    blind_trust: bool,
}

impl KeyStore {
    /// Opens (creating and migrating as needed) the store for an
    /// account, and makes sure the own identity exists.
    pub async fn open(
        data_dir: &Path,
        account: &Jid,
        blind_trust: bool,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("omemo_{}.db", account.bare_string()));
        let conn = Connection::open(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Self::setup(conn, blind_trust)
    }

    /// An in-memory store, used by tests.
    pub fn open_in_memory(blind_trust: bool) -> Result<Self, StoreError> {
        Self::setup(Connection::open_in_memory()?, blind_trust)
    }

    fn setup(conn: Connection, blind_trust: bool) -> Result<Self, StoreError> {
        conn.pragma_update(None, "secure_delete", "ON")?;
        super::migrations::run(&conn)?;
        ensure_own_identity(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            blind_trust,
        })
    }

    /// The device id we announce, derived from the registration id.
    pub async fn own_device_id(&self) -> Result<u32, StoreError> {
        Ok(config::own_device_id(self.local_registration_id().await?))
    }

    // ---- trust ----

    /// All identity keys ever seen for a peer, oldest first.
    pub async fn fingerprints(&self, jid: &Jid) -> Result<Vec<Fingerprint>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT public_key, trust FROM identities WHERE peer_jid = ?1 ORDER BY first_seen",
        )?;
        let rows = stmt.query_map(params![jid.bare_string()], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (blob, trust) = row?;
            out.push(Fingerprint {
                public_key: key32(blob)?,
                trust: TrustLevel::from_db(trust),
            });
        }
        Ok(out)
    }

    /// Fingerprints the UI has not yet announced for this peer. Marks
    /// them shown.
    pub async fn take_unseen_fingerprints(
        &self,
        jid: &Jid,
    ) -> Result<Vec<Fingerprint>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT public_key, trust FROM identities
             WHERE peer_jid = ?1 AND shown = 0 ORDER BY first_seen",
        )?;
        let rows = stmt.query_map(params![jid.bare_string()], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (blob, trust) = row?;
            out.push(Fingerprint {
                public_key: key32(blob)?,
                trust: TrustLevel::from_db(trust),
            });
        }
        drop(stmt);
        conn.execute(
            "UPDATE identities SET shown = 1 WHERE peer_jid = ?1",
            params![jid.bare_string()],
        )?;
        Ok(out)
    }

    pub async fn set_trust(
        &self,
        jid: &Jid,
        public_key: &[u8; 32],
        trust: TrustLevel,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE identities SET trust = ?3 WHERE peer_jid = ?1 AND public_key = ?2",
            params![jid.bare_string(), public_key.as_slice(), trust.to_db()],
        )?;
        Ok(())
    }

    pub async fn trust_level(
        &self,
        jid: &Jid,
        public_key: &[u8; 32],
    ) -> Result<Option<TrustLevel>, StoreError> {
        let conn = self.conn.lock().await;
        let trust: Option<i64> = conn
            .query_row(
                "SELECT trust FROM identities WHERE peer_jid = ?1 AND public_key = ?2",
                params![jid.bare_string(), public_key.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(trust.map(TrustLevel::from_db))
    }

    /// Whether at least one identity of this peer may be encrypted to.
    pub async fn has_sendable_identity(&self, jid: &Jid) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM identities WHERE peer_jid = ?1 AND trust IN (2, 3)",
            params![jid.bare_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ---- device lists ----

    pub async fn set_device_list(&self, owner: &Jid, devices: &[u32]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM device_lists WHERE owner_jid = ?1",
            params![owner.bare_string()],
        )?;
        for device in devices {
            tx.execute(
                "INSERT OR IGNORE INTO device_lists (owner_jid, device_id) VALUES (?1, ?2)",
                params![owner.bare_string(), device],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn device_list(&self, owner: &Jid) -> Result<Vec<u32>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT device_id FROM device_lists WHERE owner_jid = ?1 ORDER BY device_id",
        )?;
        let rows = stmt.query_map(params![owner.bare_string()], |row| row.get::<_, u32>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Reverse lookup: which known contact announces this device id.
    pub async fn find_device_owner(&self, device_id: u32) -> Result<Option<Jid>, StoreError> {
        let conn = self.conn.lock().await;
        let owner: Option<String> = conn
            .query_row(
                "SELECT owner_jid FROM device_lists WHERE device_id = ?1 LIMIT 1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        match owner {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| StoreError::Codec(format!("bad stored jid: {raw}"))),
            None => Ok(None),
        }
    }

    // ---- per-chat encryption toggle ----

    /// `None` when the user never toggled this chat.
    pub async fn encryption_enabled(&self, jid: &Jid) -> Result<Option<bool>, StoreError> {
        let conn = self.conn.lock().await;
        let enabled: Option<i64> = conn
            .query_row(
                "SELECT enabled FROM chat_state WHERE peer_jid = ?1",
                params![jid.bare_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(enabled.map(|v| v != 0))
    }

    pub async fn set_encryption_enabled(
        &self,
        jid: &Jid,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO chat_state (peer_jid, enabled) VALUES (?1, ?2)
             ON CONFLICT(peer_jid) DO UPDATE SET enabled = excluded.enabled",
            params![jid.bare_string(), enabled as i64],
        )?;
        Ok(())
    }

    // ---- prekey id allocation ----

    /// Reserves `count` consecutive one-time prekey ids and returns the
    /// first. Ids are never reused, even after the keys are consumed.
    pub async fn allocate_prekey_ids(&self, count: u32) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let first = get_config(&conn, NEXT_PREKEY_ID)?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);
        set_config(&conn, NEXT_PREKEY_ID, &(first + count).to_string())?;
        Ok(first)
    }

    /// The id of the currently published signed prekey, if any.
    pub async fn current_signed_prekey_id(&self) -> Result<Option<u32>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(get_config(&conn, SIGNED_PREKEY_ID)?.and_then(|v| v.parse::<u32>().ok()))
    }

    pub async fn set_current_signed_prekey_id(&self, id: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        set_config(&conn, SIGNED_PREKEY_ID, &id.to_string())
    }

    /// Every stored one-time prekey, in id order. Feeds the published
    /// bundle.
    pub async fn all_prekeys(&self) -> Result<Vec<PreKeyRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT record FROM prekeys ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode(&row?)?);
        }
        Ok(out)
    }

    // ---- session bookkeeping ----

    /// Device ids we hold an active session record for.
    pub async fn active_session_devices(&self, jid: &Jid) -> Result<Vec<u32>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT device_id FROM sessions WHERE peer_jid = ?1 AND active = 1 ORDER BY device_id",
        )?;
        let rows = stmt.query_map(params![jid.bare_string()], |row| row.get::<_, u32>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Marks sessions for devices no longer announced as inactive, and
    /// reactivates any that came back. The records themselves stay.
    pub async fn sync_session_activity(
        &self,
        jid: &Jid,
        announced: &[u32],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sessions SET active = 0 WHERE peer_jid = ?1",
            params![jid.bare_string()],
        )?;
        for device in announced {
            tx.execute(
                "UPDATE sessions SET active = 1 WHERE peer_jid = ?1 AND device_id = ?2",
                params![jid.bare_string(), device],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Generates and stores our identity on first open.
fn ensure_own_identity(conn: &Connection) -> Result<(), StoreError> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM identities WHERE peer_jid = ?1",
        params![OWN_ROW],
        |row| row.get(0),
    )?;
    if exists > 0 {
        return Ok(());
    }
    let identity = IdentityKeyPair::generate();
    let registration_id = identity.registration_id();
    log::info!(
        "generated new identity key (registration id {registration_id})"
    );
    conn.execute(
        "INSERT INTO identities
             (peer_jid, public_key, private_key, registration_id, trust, shown, first_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![
            OWN_ROW,
            identity.public.public_key().as_slice(),
            identity.key_pair.private_key.as_slice(),
            registration_id,
            TrustLevel::Verified.to_db(),
            Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl IdentityStore for KeyStore {
    async fn identity_key_pair(&self) -> Result<IdentityKeyPair, StoreError> {
        let conn = self.conn.lock().await;
        let private: Vec<u8> = conn
            .query_row(
                "SELECT private_key FROM identities WHERE peer_jid = ?1",
                params![OWN_ROW],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::IdentityMissing)?;
        let key_pair = KeyPair::from_private_key(key32(private)?);
        Ok(IdentityKeyPair {
            public: IdentityKey::new(key_pair.public_key),
            key_pair,
        })
    }

    async fn local_registration_id(&self) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let id: Option<u32> = conn
            .query_row(
                "SELECT registration_id FROM identities WHERE peer_jid = ?1",
                params![OWN_ROW],
                |row| row.get(0),
            )
            .optional()?;
        id.ok_or(StoreError::IdentityMissing)
    }

    async fn save_identity(
        &self,
        address: &SignalAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let key = identity.public_key();
        let known: i64 = conn.query_row(
            "SELECT COUNT(*) FROM identities WHERE peer_jid = ?1 AND public_key = ?2",
            params![address.name(), key.as_slice()],
            |row| row.get(0),
        )?;
        if known > 0 {
            return Ok(false);
        }

        // Blind trust applies until the user has made a manual decision
        // for this peer; after that, new keys wait as Unknown.
        let decided: i64 = conn.query_row(
            "SELECT COUNT(*) FROM identities WHERE peer_jid = ?1 AND trust IN (0, 3)",
            params![address.name()],
            |row| row.get(0),
        )?;
        let trust = if self.blind_trust && decided == 0 {
            TrustLevel::Blind
        } else {
            TrustLevel::Unknown
        };
        log::info!(
            "new identity key for {}: trust={}",
            address.name(),
            trust
        );
        conn.execute(
            "INSERT INTO identities
                 (peer_jid, public_key, trust, shown, first_seen)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                address.name(),
                key.as_slice(),
                trust.to_db(),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(true)
    }

    async fn is_trusted_identity(
        &self,
        address: &SignalAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let key = identity.public_key();
        let trust: Option<i64> = conn
            .query_row(
                "SELECT trust FROM identities WHERE peer_jid = ?1 AND public_key = ?2",
                params![address.name(), key.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        // Unknown keys pass; only an explicit rejection blocks.
        Ok(trust.map(TrustLevel::from_db) != Some(TrustLevel::NotTrusted))
    }
}

#[async_trait]
impl PreKeyStore for KeyStore {
    async fn load_prekey(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT record FROM prekeys WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| decode(&b)).transpose()
    }

    async fn store_prekey(&self, id: u32, record: PreKeyRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO prekeys (id, record) VALUES (?1, ?2)",
            params![id, encode(&record)?],
        )?;
        Ok(())
    }

    async fn remove_prekey(&self, id: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM prekeys WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn prekey_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM prekeys", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl SignedPreKeyStore for KeyStore {
    async fn load_signed_prekey(&self, id: u32) -> Result<SignedPreKeyRecord, StoreError> {
        let conn = self.conn.lock().await;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT record FROM signed_prekeys WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(b) => decode(&b),
            None => Err(StoreError::NoSuchKey(id)),
        }
    }

    async fn store_signed_prekey(
        &self,
        id: u32,
        record: SignedPreKeyRecord,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO signed_prekeys (id, record, created_at) VALUES (?1, ?2, ?3)",
            params![id, encode(&record)?, record.created_at],
        )?;
        Ok(())
    }

    async fn remove_old_signed_prekeys(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
        keep_id: u32,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM signed_prekeys WHERE created_at < ?1 AND id != ?2",
            params![older_than.timestamp(), keep_id],
        )?;
        if removed > 0 {
            log::info!("archived {removed} old signed prekey(s)");
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for KeyStore {
    async fn load_session(&self, address: &SignalAddress) -> Result<SessionRecord, StoreError> {
        let conn = self.conn.lock().await;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT record FROM sessions WHERE peer_jid = ?1 AND device_id = ?2",
                params![address.name(), address.device_id()],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(b) => SessionRecord::deserialize(&b).map_err(StoreError::Codec),
            None => Ok(SessionRecord::new()),
        }
    }

    async fn store_session(
        &self,
        address: &SignalAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (peer_jid, device_id, record, active) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(peer_jid, device_id) DO UPDATE SET record = excluded.record",
            params![address.name(), address.device_id(), record.serialize()],
        )?;
        Ok(())
    }

    async fn contains_session(&self, address: &SignalAddress) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE peer_jid = ?1 AND device_id = ?2",
            params![address.name(), address.device_id()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn delete_session(&self, address: &SignalAddress) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM sessions WHERE peer_jid = ?1 AND device_id = ?2",
            params![address.name(), address.device_id()],
        )?;
        Ok(())
    }
}
