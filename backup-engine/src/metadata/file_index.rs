//! File index (keyed by watched path) and content-hash index (keyed by digest).

use super::{format_timestamp, timestamp_column};
use crate::codec::Algorithm;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── FileIndexEntry ──

/// Last known state of one watched file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileIndexEntry {
    pub path: PathBuf,
    pub content_hash: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// Unix mode bits, re-applied on restore
    pub permissions: Option<u32>,
    /// Record that backs this path (a `file_backup` or `file_reference`)
    pub record_id: String,
    pub updated_at: DateTime<Utc>,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<FileIndexEntry> {
    let path: String = row.get("path")?;
    let size: i64 = row.get("size")?;
    let permissions: Option<i64> = row.get("permissions")?;
    Ok(FileIndexEntry {
        path: PathBuf::from(path),
        content_hash: row.get("content_hash")?,
        size: size.max(0) as u64,
        modified_at: timestamp_column(row, "modified_at")?,
        permissions: permissions.map(|p| p as u32),
        record_id: row.get("record_id")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

pub fn load_entries(conn: &Connection) -> Result<Vec<FileIndexEntry>> {
    let mut stmt = conn.prepare("SELECT * FROM file_index ORDER BY path")?;
    let rows = stmt.query_map([], |row| row_to_entry(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn upsert_entry(conn: &Connection, entry: &FileIndexEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO file_index (path, content_hash, size, modified_at, permissions, record_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(path) DO UPDATE SET
           content_hash = excluded.content_hash,
           size = excluded.size,
           modified_at = excluded.modified_at,
           permissions = excluded.permissions,
           record_id = excluded.record_id,
           updated_at = excluded.updated_at",
        params![
            entry.path.to_string_lossy(),
            entry.content_hash,
            entry.size as i64,
            format_timestamp(&entry.modified_at),
            entry.permissions.map(|p| p as i64),
            entry.record_id,
            format_timestamp(&entry.updated_at),
        ],
    )?;
    Ok(())
}

pub fn delete_entry(conn: &Connection, path: &Path) -> Result<bool> {
    let changes = conn.execute(
        "DELETE FROM file_index WHERE path = ?",
        params![path.to_string_lossy()],
    )?;
    Ok(changes > 0)
}

/// Drop every index entry that points at `record_id`; returns the paths removed.
pub fn delete_entries_for_record(conn: &Connection, record_id: &str) -> Result<Vec<PathBuf>> {
    let mut stmt = conn.prepare("SELECT path FROM file_index WHERE record_id = ?")?;
    let paths: Vec<PathBuf> = stmt
        .query_map(params![record_id], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .map(PathBuf::from)
        .collect();
    conn.execute("DELETE FROM file_index WHERE record_id = ?", params![record_id])?;
    Ok(paths)
}

// ── ContentHashEntry ──

/// One stored copy of a distinct content, shared by every record that
/// resolves to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentHashEntry {
    pub content_hash: String,
    /// Record that produced the artifact
    pub record_id: String,
    pub artifact_path: PathBuf,
    /// SHA-256 of the artifact bytes
    pub checksum: String,
    pub compression: Algorithm,
    pub size: u64,
    pub ref_count: u64,
    pub created_at: DateTime<Utc>,
}

fn row_to_content(row: &Row) -> rusqlite::Result<ContentHashEntry> {
    let artifact_path: String = row.get("artifact_path")?;
    let compression: String = row.get("compression")?;
    let size: i64 = row.get("size")?;
    let ref_count: i64 = row.get("ref_count")?;
    Ok(ContentHashEntry {
        content_hash: row.get("content_hash")?,
        record_id: row.get("record_id")?,
        artifact_path: PathBuf::from(artifact_path),
        checksum: row.get("checksum")?,
        compression: Algorithm::parse(&compression).unwrap_or(Algorithm::None),
        size: size.max(0) as u64,
        ref_count: ref_count.max(0) as u64,
        created_at: timestamp_column(row, "created_at")?,
    })
}

pub fn load_contents(conn: &Connection) -> Result<Vec<ContentHashEntry>> {
    let mut stmt = conn.prepare("SELECT * FROM content_hashes")?;
    let rows = stmt.query_map([], |row| row_to_content(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn upsert_content(conn: &Connection, entry: &ContentHashEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO content_hashes (content_hash, record_id, artifact_path, checksum, compression, size, ref_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(content_hash) DO UPDATE SET
           record_id = excluded.record_id,
           artifact_path = excluded.artifact_path,
           checksum = excluded.checksum,
           compression = excluded.compression,
           size = excluded.size,
           ref_count = excluded.ref_count",
        params![
            entry.content_hash,
            entry.record_id,
            entry.artifact_path.to_string_lossy(),
            entry.checksum,
            entry.compression.as_str(),
            entry.size as i64,
            entry.ref_count as i64,
            format_timestamp(&entry.created_at),
        ],
    )?;
    Ok(())
}

pub fn delete_content(conn: &Connection, content_hash: &str) -> Result<bool> {
    let changes = conn.execute(
        "DELETE FROM content_hashes WHERE content_hash = ?",
        params![content_hash],
    )?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{now, MetadataStore};
    use tempfile::TempDir;

    fn entry(path: &str, record_id: &str) -> FileIndexEntry {
        FileIndexEntry {
            path: PathBuf::from(path),
            content_hash: "h1".into(),
            size: 10,
            modified_at: now(),
            permissions: Some(0o644),
            record_id: record_id.into(),
            updated_at: now(),
        }
    }

    #[test]
    fn test_upsert_replaces_entry() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;
        let mut e = entry("/data/a.txt", "r1");
        store.with_conn(|conn| upsert_entry(conn, &e))?;
        e.record_id = "r2".into();
        e.content_hash = "h2".into();
        store.with_conn(|conn| upsert_entry(conn, &e))?;

        let entries = store.with_conn(load_entries)?;
        assert_eq!(entries, vec![e]);
        Ok(())
    }

    #[test]
    fn test_delete_entries_for_record() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;
        store.transaction(|tx| {
            upsert_entry(tx, &entry("/data/a.txt", "r1"))?;
            upsert_entry(tx, &entry("/data/b.txt", "r1"))?;
            upsert_entry(tx, &entry("/data/c.txt", "r2"))
        })?;

        let removed = store.with_conn(|conn| delete_entries_for_record(conn, "r1"))?;
        assert_eq!(removed.len(), 2);
        assert_eq!(store.with_conn(load_entries)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_content_ref_count_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;
        let mut content = ContentHashEntry {
            content_hash: "h1".into(),
            record_id: "r1".into(),
            artifact_path: PathBuf::from("/backups/files/data/a.txt.zst"),
            checksum: "c1".into(),
            compression: Algorithm::Zstd,
            size: 10,
            ref_count: 1,
            created_at: now(),
        };
        store.with_conn(|conn| upsert_content(conn, &content))?;
        content.ref_count = 2;
        store.with_conn(|conn| upsert_content(conn, &content))?;

        let loaded = store.with_conn(load_contents)?;
        assert_eq!(loaded, vec![content]);

        assert!(store.with_conn(|conn| delete_content(conn, "h1"))?);
        assert!(store.with_conn(load_contents)?.is_empty());
        Ok(())
    }
}
