use rusqlite::Connection;
use tracing::info;

use crate::StoreResult;

pub fn run(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            kind            TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
            name            TEXT,
            created_by      TEXT NOT NULL,
            last_message_id TEXT,
            last_activity   TEXT NOT NULL,
            is_active       INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_activity
            ON conversations(last_activity DESC);

        CREATE TABLE IF NOT EXISTS participants (
            conversation_id      TEXT NOT NULL REFERENCES conversations(id),
            identity             TEXT NOT NULL,
            display_name         TEXT NOT NULL,
            role                 TEXT NOT NULL CHECK (role IN ('member', 'admin')),
            joined_at            TEXT NOT NULL,
            last_read_message_id TEXT,
            UNIQUE(conversation_id, identity)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_identity
            ON participants(identity);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            seq             INTEGER NOT NULL,
            sender          TEXT NOT NULL,
            sender_name     TEXT NOT NULL,
            body            TEXT NOT NULL,
            kind            TEXT NOT NULL CHECK (kind IN ('text', 'image', 'file', 'system')),
            created_at      TEXT NOT NULL,
            is_edited       INTEGER NOT NULL DEFAULT 0,
            edited_at       TEXT,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            deleted_at      TEXT,
            reply_to        TEXT,
            UNIQUE(conversation_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);
        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender);

        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id TEXT NOT NULL REFERENCES messages(id),
            identity   TEXT NOT NULL,
            read_at    TEXT NOT NULL,
            UNIQUE(message_id, identity)
        );

        CREATE INDEX IF NOT EXISTS idx_receipts_message
            ON read_receipts(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
