use rusqlite::Connection;

use crate::error::StoreError;

/// Applied in order; `PRAGMA user_version` tracks how far a database
/// has come. Append-only.
const MIGRATIONS: &[&str] = &[SCHEMA_V1];

const SCHEMA_V1: &str = r#"
CREATE TABLE identities (
    peer_jid        TEXT    NOT NULL,
    public_key      BLOB    NOT NULL,
    private_key     BLOB,
    registration_id INTEGER,
    trust           INTEGER NOT NULL DEFAULT 1,
    shown           INTEGER NOT NULL DEFAULT 0,
    first_seen      INTEGER NOT NULL,
    PRIMARY KEY (peer_jid, public_key)
);

CREATE TABLE prekeys (
    id     INTEGER PRIMARY KEY,
    record BLOB NOT NULL
);

CREATE TABLE signed_prekeys (
    id         INTEGER PRIMARY KEY,
    record     BLOB    NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE sessions (
    peer_jid  TEXT    NOT NULL,
    device_id INTEGER NOT NULL,
    record    BLOB    NOT NULL,
    active    INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (peer_jid, device_id)
);

CREATE TABLE device_lists (
    owner_jid TEXT    NOT NULL,
    device_id INTEGER NOT NULL,
    PRIMARY KEY (owner_jid, device_id)
);

CREATE TABLE chat_state (
    peer_jid TEXT    PRIMARY KEY,
    enabled  INTEGER NOT NULL
);

CREATE TABLE config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        log::info!("applying key store migration {}", index + 1);
        conn.execute_batch(sql)?;
        conn.pragma_update(None, "user_version", (index + 1) as i64)?;
    }
    Ok(())
}
