//! Durable retry-queue journal.
//!
//! The retry queue lives in memory; when a journal is configured it mirrors
//! every enqueue, attempt and removal here so a restart can pick up where the
//! last process left off. Payloads are opaque JSON text to this layer.

use std::path::Path;

use rusqlite::{Connection, Result as SqliteResult, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from journal persistence.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("journal payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One queued operation as persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub aggregate_id: String,
    /// Enqueue sequence; restores per-aggregate FIFO order.
    pub seq: i64,
    /// Serialized snapshot.
    pub payload: String,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Unix millis before which the operation must not run.
    pub next_eligible_ms: u64,
    pub description: String,
}

/// Storage for queued operations.
pub trait QueueJournal: Send {
    fn put(&self, entry: &JournalEntry) -> Result<(), JournalError>;

    fn update_attempts(
        &self,
        id: &str,
        attempts_made: u32,
        next_eligible_ms: u64,
    ) -> Result<(), JournalError>;

    fn remove(&self, id: &str) -> Result<(), JournalError>;

    /// Every entry, ordered by `seq`.
    fn load_all(&self) -> Result<Vec<JournalEntry>, JournalError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queued_operations (
    id TEXT PRIMARY KEY,
    aggregate_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    payload TEXT NOT NULL,
    attempts_made INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    next_eligible_ms INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    created_at INTEGER DEFAULT (unixepoch())
);
CREATE INDEX IF NOT EXISTS idx_queued_aggregate ON queued_operations(aggregate_id, seq);
"#;

/// SQLite-backed [`QueueJournal`].
pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    /// Open or create a journal at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Create an in-memory journal (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn len(&self) -> SqliteResult<usize> {
        self.conn
            .query_row("SELECT COUNT(*) FROM queued_operations", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
    }

    pub fn is_empty(&self) -> SqliteResult<bool> {
        self.len().map(|n| n == 0)
    }
}

impl QueueJournal for SqliteJournal {
    fn put(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        self.conn.execute(
            "INSERT INTO queued_operations
                 (id, aggregate_id, seq, payload, attempts_made, max_attempts,
                  next_eligible_ms, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 payload = excluded.payload,
                 attempts_made = excluded.attempts_made,
                 max_attempts = excluded.max_attempts,
                 next_eligible_ms = excluded.next_eligible_ms,
                 description = excluded.description",
            params![
                entry.id,
                entry.aggregate_id,
                entry.seq,
                entry.payload,
                entry.attempts_made,
                entry.max_attempts,
                entry.next_eligible_ms as i64,
                entry.description,
            ],
        )?;
        Ok(())
    }

    fn update_attempts(
        &self,
        id: &str,
        attempts_made: u32,
        next_eligible_ms: u64,
    ) -> Result<(), JournalError> {
        self.conn.execute(
            "UPDATE queued_operations SET attempts_made = ?1, next_eligible_ms = ?2 WHERE id = ?3",
            params![attempts_made, next_eligible_ms as i64, id],
        )?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), JournalError> {
        self.conn
            .execute("DELETE FROM queued_operations WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, aggregate_id, seq, payload, attempts_made, max_attempts,
                    next_eligible_ms, description
             FROM queued_operations ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(JournalEntry {
                id: row.get(0)?,
                aggregate_id: row.get(1)?,
                seq: row.get(2)?,
                payload: row.get(3)?,
                attempts_made: row.get(4)?,
                max_attempts: row.get(5)?,
                next_eligible_ms: row.get::<_, i64>(6)?.max(0) as u64,
                description: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<SqliteResult<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, aggregate: &str, seq: i64) -> JournalEntry {
        JournalEntry {
            id: id.to_string(),
            aggregate_id: aggregate.to_string(),
            seq,
            payload: r#"{"revision":1}"#.to_string(),
            attempts_made: 0,
            max_attempts: 3,
            next_eligible_ms: 0,
            description: "save funnel".to_string(),
        }
    }

    #[test]
    fn test_put_load_ordered_by_seq() {
        let journal = SqliteJournal::in_memory().unwrap();
        journal.put(&entry("op-2", "f1", 2)).unwrap();
        journal.put(&entry("op-1", "f1", 1)).unwrap();
        journal.put(&entry("op-3", "f2", 3)).unwrap();

        let all = journal.load_all().unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["op-1", "op-2", "op-3"]);
        assert_eq!(all[0], entry("op-1", "f1", 1));
    }

    #[test]
    fn test_update_attempts_and_remove() {
        let journal = SqliteJournal::in_memory().unwrap();
        journal.put(&entry("op-1", "f1", 1)).unwrap();
        journal.update_attempts("op-1", 2, 1_700_000_000_000).unwrap();

        let loaded = journal.load_all().unwrap();
        assert_eq!(loaded[0].attempts_made, 2);
        assert_eq!(loaded[0].next_eligible_ms, 1_700_000_000_000);

        journal.remove("op-1").unwrap();
        assert!(journal.is_empty().unwrap());
    }

    #[test]
    fn test_put_is_idempotent_per_id() {
        let journal = SqliteJournal::in_memory().unwrap();
        journal.put(&entry("op-1", "f1", 1)).unwrap();
        let mut newer = entry("op-1", "f1", 1);
        newer.payload = r#"{"revision":2}"#.to_string();
        journal.put(&newer).unwrap();

        assert_eq!(journal.len().unwrap(), 1);
        assert_eq!(journal.load_all().unwrap()[0].payload, r#"{"revision":2}"#);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        SqliteJournal::open(&path).unwrap().put(&entry("op-1", "f1", 7)).unwrap();

        let reopened = SqliteJournal::open(&path).unwrap();
        let all = reopened.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].seq, 7);
    }
}
