use std::path::Path;

use revi::error::{AgentError, AgentResult};
use rusqlite::{params, Connection, OptionalExtension};

use super::{StoreBackend, StoredItem, DB_FILE_NAME};

/// Embedded sqlite backend for the offline queue.
///
/// One database file under the configured directory; a `queue` table keyed
/// by item id plus a `meta` table for the device id and last-sync marker.
#[derive(Debug)]
pub(crate) struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub(crate) fn open(directory: &Path) -> AgentResult<Self> {
        std::fs::create_dir_all(directory)
            .map_err(|err| AgentError::StorageDegraded(err.to_string()))?;
        let conn = Connection::open(directory.join(DB_FILE_NAME)).map_err(storage_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS queue (
                 id           TEXT PRIMARY KEY,
                 kind         TEXT NOT NULL,
                 priority     TEXT NOT NULL,
                 created_at   INTEGER NOT NULL,
                 retry_count  INTEGER NOT NULL DEFAULT 0,
                 size_bytes   INTEGER NOT NULL,
                 payload_blob BLOB NOT NULL
             );
             CREATE INDEX IF NOT EXISTS queue_kind ON queue (kind);
             CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )
        .map_err(storage_err)?;
        Ok(SqliteBackend { conn })
    }
}

fn storage_err(err: rusqlite::Error) -> AgentError {
    AgentError::StorageDegraded(err.to_string())
}

impl StoreBackend for SqliteBackend {
    fn insert(&mut self, item: &StoredItem) -> AgentResult<()> {
        let payload =
            serde_json::to_vec(&item.payload).map_err(|err| AgentError::Internal(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO queue
                 (id, kind, priority, created_at, retry_count, size_bytes, payload_blob)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.id,
                    item.kind.as_str(),
                    item.priority.as_str(),
                    item.created_at,
                    item.retry_count,
                    item.size_bytes,
                    payload,
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn remove(&mut self, id: &str) -> AgentResult<()> {
        self.conn
            .execute("DELETE FROM queue WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(())
    }

    fn update_retry(&mut self, id: &str, retry_count: u32) -> AgentResult<()> {
        self.conn
            .execute(
                "UPDATE queue SET retry_count = ?2 WHERE id = ?1",
                params![id, retry_count],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn load_all(&mut self) -> AgentResult<Vec<StoredItem>> {
        let mut statement = self
            .conn
            .prepare(
                "SELECT id, kind, priority, created_at, retry_count, size_bytes, payload_blob
                 FROM queue",
            )
            .map_err(storage_err)?;
        let rows = statement
            .query_map([], |row| {
                let kind: String = row.get(1)?;
                let priority: String = row.get(2)?;
                let payload: Vec<u8> = row.get(6)?;
                Ok((
                    StoredItem {
                        id: row.get(0)?,
                        kind: revi::event::EventKind::parse(&kind)
                            .unwrap_or(revi::event::EventKind::Session),
                        priority: revi::event::Priority::parse(&priority)
                            .unwrap_or(revi::event::Priority::Low),
                        created_at: row.get(3)?,
                        retry_count: row.get(4)?,
                        size_bytes: row.get(5)?,
                        payload: serde_json::Value::Null,
                    },
                    payload,
                ))
            })
            .map_err(storage_err)?;

        let mut items = Vec::new();
        for row in rows {
            let (mut item, payload) = row.map_err(storage_err)?;
            // Rows whose payload no longer parses are dropped at load time.
            match serde_json::from_slice(&payload) {
                Ok(value) => {
                    item.payload = value;
                    items.push(item);
                }
                Err(err) => {
                    tracing::debug!(id = %item.id, error = %err, "dropping unreadable queue row");
                    let _ = self
                        .conn
                        .execute("DELETE FROM queue WHERE id = ?1", params![item.id]);
                }
            }
        }
        Ok(items)
    }

    fn get_meta(&mut self, key: &str) -> AgentResult<Option<String>> {
        self.conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(storage_err)
    }

    fn set_meta(&mut self, key: &str, value: &str) -> AgentResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(storage_err)?;
        Ok(())
    }
}
