//! v001 -- Initial schema creation.
//!
//! Creates the `voice_messages` ledger table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS voice_messages (
    id               TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    sender_id        TEXT NOT NULL,              -- UUID
    recipient_id     TEXT NOT NULL,              -- UUID
    file_path        TEXT NOT NULL,              -- object-store key
    file_size        INTEGER NOT NULL,
    duration_seconds INTEGER,
    audio_format     TEXT NOT NULL,
    total_chunks     INTEGER NOT NULL,
    chunks_received  INTEGER NOT NULL,
    status           TEXT NOT NULL,              -- pending/transmitted/delivered/listened/failed
    created_at       TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    transmitted_at   TEXT,
    delivered_at     TEXT,
    listened_at      TEXT
);

CREATE INDEX IF NOT EXISTS idx_voice_messages_recipient_created
    ON voice_messages(recipient_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
