//! v001 -- Initial schema creation.
//!
//! Creates the `users` and `inbox_items` tables. List-valued fields are JSON
//! arrays in TEXT columns.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id                     TEXT PRIMARY KEY NOT NULL,
    name                   TEXT NOT NULL,
    img                    TEXT NOT NULL,
    mates                  TEXT NOT NULL DEFAULT '[]',  -- [{_id, name, img}]
    mate_requests_sent     TEXT NOT NULL DEFAULT '[]',  -- [user id]
    mate_requests_received TEXT NOT NULL DEFAULT '[]',  -- [user id]
    subscriptions          TEXT NOT NULL DEFAULT '[]',  -- [NotificationSubscription]
    inbox                  TEXT NOT NULL DEFAULT '[]',  -- [inbox item id]
    created_at             TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Inbox items
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS inbox_items (
    id                 TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    sender             TEXT NOT NULL,
    drawing            TEXT NOT NULL,                   -- blob URL
    image              TEXT NOT NULL,                   -- blob URL
    thumbnail          TEXT NOT NULL,                   -- blob URL
    aspect_ratio       REAL NOT NULL,
    followers          TEXT NOT NULL DEFAULT '[]',
    original_followers TEXT NOT NULL DEFAULT '[]',
    seen_by            TEXT NOT NULL DEFAULT '[]',
    comments_seen_by   TEXT NOT NULL DEFAULT '[]',
    comments           TEXT NOT NULL DEFAULT '[]',      -- [{_id, sender, message, date}]
    date               TEXT NOT NULL                    -- RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_inbox_items_sender_date
    ON inbox_items(sender, date DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
