//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `channels`, `members` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id             TEXT PRIMARY KEY NOT NULL,
    name           TEXT NOT NULL,
    description    TEXT NOT NULL DEFAULT '',
    password_hash  TEXT NOT NULL,              -- hex Argon2id hash
    salt           BLOB NOT NULL,
    encryption_key BLOB NOT NULL,              -- Argon2id(password, salt)
    key_version    INTEGER NOT NULL DEFAULT 1,
    max_members    INTEGER NOT NULL,
    transport_mode TEXT NOT NULL,              -- arp | mdns | https
    created_at     TEXT NOT NULL,              -- RFC-3339
    updated_at     TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Members
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS members (
    id             TEXT PRIMARY KEY NOT NULL,
    channel_id     TEXT NOT NULL,              -- FK -> channels(id)
    nickname       TEXT NOT NULL,
    public_key     BLOB,                       -- Ed25519, 32 bytes
    role           TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'offline',
    joined_at      TEXT NOT NULL,
    last_seen_at   TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,

    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_members_channel ON members(channel_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                 TEXT PRIMARY KEY NOT NULL,
    channel_id         TEXT NOT NULL,          -- main channel or a sub-channel
    sender_id          TEXT NOT NULL,
    sender_nickname    TEXT NOT NULL DEFAULT '',
    type               TEXT NOT NULL,
    content            TEXT NOT NULL,          -- JSON object
    reply_to_id        TEXT,
    timestamp          TEXT NOT NULL,
    original_sender_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_channel_ts
    ON messages(channel_id, timestamp ASC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
