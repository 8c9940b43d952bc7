//! Persistent metadata store.
//!
//! One SQLite database holds the backup record log, the file index, the
//! content-hash index, operation history and run statistics. A single
//! connection sits behind a mutex so every mutation is serialized; each
//! logical change is one transaction committed with `synchronous = FULL`
//! before the producing call returns.

pub mod file_index;
pub mod operations;
pub mod records;
pub mod state;

use crate::utils::errors::Result;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub use file_index::{ContentHashEntry, FileIndexEntry};
pub use records::{BackupKind, BackupRecord, RecordStatus};

const METADATA_DB: &str = "metadata.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK(kind IN ('full_database','wal_increment','file_backup','file_reference')),
  created_at TEXT NOT NULL,
  path TEXT NOT NULL,
  source_path TEXT,
  reference_target TEXT,
  original_size INTEGER NOT NULL DEFAULT 0,
  stored_size INTEGER NOT NULL DEFAULT 0,
  checksum TEXT NOT NULL,
  content_hash TEXT,
  compression TEXT NOT NULL DEFAULT 'none',
  expires_at TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','corrupt')),
  metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_backup_records_kind_created ON backup_records(kind, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_backup_records_expires ON backup_records(expires_at);
CREATE INDEX IF NOT EXISTS idx_backup_records_content_hash ON backup_records(content_hash);

CREATE TABLE IF NOT EXISTS file_index (
  path TEXT PRIMARY KEY,
  content_hash TEXT NOT NULL,
  size INTEGER NOT NULL DEFAULT 0,
  modified_at TEXT NOT NULL,
  permissions INTEGER,
  record_id TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_index_record ON file_index(record_id);

CREATE TABLE IF NOT EXISTS content_hashes (
  content_hash TEXT PRIMARY KEY,
  record_id TEXT NOT NULL,
  artifact_path TEXT NOT NULL,
  checksum TEXT NOT NULL,
  compression TEXT NOT NULL DEFAULT 'none',
  size INTEGER NOT NULL DEFAULT 0,
  ref_count INTEGER NOT NULL DEFAULT 0 CHECK(ref_count >= 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operations (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  status TEXT NOT NULL,
  started_at TEXT NOT NULL,
  finished_at TEXT,
  record TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_operations_started ON operations(started_at DESC);

CREATE TABLE IF NOT EXISTS engine_state (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#;

pub struct MetadataStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl MetadataStore {
    /// Open (creating if needed) the store inside `dir` and apply the schema.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(METADATA_DB);

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA synchronous = FULL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "Metadata store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read (or single-statement write) against the store.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction. Nothing is written unless `f` succeeds.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction rolls back on drop, so the connection stays usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Current time at the precision timestamps are persisted with, so a record
/// read back compares equal to the one written.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lexically sortable UTC timestamp used for every TEXT time column.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timestamp_column(row: &Row, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(name)?;
    parse_timestamp_column(row, name, &raw)
}

pub(crate) fn optional_timestamp_column(
    row: &Row,
    name: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|raw| parse_timestamp_column(row, name, &raw))
        .transpose()
}

fn parse_timestamp_column(row: &Row, name: &str, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            let idx = row.as_ref().column_index(name).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        {
            let store = MetadataStore::open(temp_dir.path())?;
            store.with_conn(|conn| state::set(conn, "k", "v"))?;
        }
        let store = MetadataStore::open(temp_dir.path())?;
        let value = store.with_conn(|conn| state::get(conn, "k"))?;
        assert_eq!(value.as_deref(), Some("v"));
        Ok(())
    }

    #[test]
    fn test_failed_transaction_writes_nothing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;

        let result: Result<()> = store.transaction(|tx| {
            state::set(tx, "half", "written")?;
            Err(crate::EngineError::Integrity("abort".into()))
        });
        assert!(result.is_err());

        let value = store.with_conn(|conn| state::get(conn, "half"))?;
        assert!(value.is_none());
        Ok(())
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.000001Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = earlier + chrono::Duration::milliseconds(5);
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
    }
}
