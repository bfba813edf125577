//! v001 -- Initial schema creation.
//!
//! Creates the six core tables: `profiles`, `conversations`,
//! `conversation_members`, `messages`, `message_reactions`, and
//! `message_seen`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Profiles
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS profiles (
    user_id      TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    username     TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    avatar_url   TEXT,
    last_active  TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    name       TEXT,                          -- group display name, nullable
    is_group   INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1
    created_at TEXT NOT NULL
);

-- Membership is fixed at creation; rows are only ever inserted alongside
-- their conversation.
CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id TEXT NOT NULL,            -- FK -> conversations(id)
    user_id         TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_members_user ON conversation_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,              -- FK -> conversations(id)
    sender          TEXT NOT NULL,              -- UUID v4
    seq             INTEGER NOT NULL,           -- strictly increasing per conversation
    payload         TEXT,                       -- JSON, NULL once deleted
    created_at      TEXT NOT NULL,              -- ISO-8601
    edited_at       TEXT,
    deleted         INTEGER NOT NULL DEFAULT 0, -- boolean 0/1

    UNIQUE (conversation_id, seq),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq ASC);

-- ----------------------------------------------------------------
-- Reactions (one row per user/emoji pair, toggled on and off)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_reactions (
    message_id TEXT NOT NULL,                 -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    emoji      TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id, emoji),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Seen-state (monotonic: rows are inserted, never deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_seen (
    message_id TEXT NOT NULL,                 -- FK -> messages(id)
    user_id    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
