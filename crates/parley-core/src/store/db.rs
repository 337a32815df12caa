use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::ChatError;

/// On-device persistent store, SQLite behind a connection mutex.
///
/// Every local mutation in the system goes through this single connection,
/// which is what confines store writes to one logical owner: the send path,
/// the sync path and read-marks serialize here rather than through any
/// distributed locking.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the store under `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, ChatError> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)
            .map_err(|e| ChatError::store(format!("create data dir: {e}")))?;
        let conn = Connection::open(data_dir.join("parley.db"))?;
        Self::with_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, ChatError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ChatError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id                  TEXT PRIMARY KEY,
                participant_ids     TEXT NOT NULL,
                is_group            INTEGER NOT NULL DEFAULT 0,
                group_name          TEXT,
                last_message        TEXT,
                last_message_at     INTEGER,
                last_sender_id      TEXT,
                unread_count        TEXT NOT NULL DEFAULT '{}',
                last_interaction_at TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS messages (
                id             TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id      TEXT NOT NULL,
                text           TEXT NOT NULL,
                created_at     INTEGER NOT NULL,
                delivery_state TEXT NOT NULL,
                read_receipts  TEXT NOT NULL DEFAULT '{}',
                updated_at     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_delivery_state
                ON messages (delivery_state);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let conn = db.conn().lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        drop(Database::open(dir.path()).unwrap());
        Database::open(dir.path()).unwrap();
    }
}
