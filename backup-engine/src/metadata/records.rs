use super::{format_timestamp, timestamp_column};
use crate::codec::{checksum, Algorithm};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── BackupKind ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    FullDatabase,
    WalIncrement,
    FileBackup,
    FileReference,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::FullDatabase => "full_database",
            BackupKind::WalIncrement => "wal_increment",
            BackupKind::FileBackup => "file_backup",
            BackupKind::FileReference => "file_reference",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "full_database" => Some(BackupKind::FullDatabase),
            "wal_increment" => Some(BackupKind::WalIncrement),
            "file_backup" => Some(BackupKind::FileBackup),
            "file_reference" => Some(BackupKind::FileReference),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, BackupKind::FileBackup | BackupKind::FileReference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    /// Failed validation; never selected for restore again
    Corrupt,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Corrupt => "corrupt",
        }
    }
}

// ── BackupRecord ──

/// Immutable description of one artifact produced by a backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    /// Artifact path; for references, the canonical artifact they resolve to
    pub path: PathBuf,
    /// File the artifact was taken from
    pub source_path: Option<PathBuf>,
    /// Canonical record id for `file_reference` records
    pub reference_target: Option<String>,
    pub original_size: u64,
    pub stored_size: u64,
    /// SHA-256 of the stored bytes
    pub checksum: String,
    /// SHA-256 of the original, uncompressed bytes
    pub content_hash: Option<String>,
    pub compression: Algorithm,
    pub expires_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl BackupRecord {
    pub fn compressed(&self) -> bool {
        self.compression != Algorithm::None
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Files that make up the artifact. Multi-file artifacts (WAL increments)
    /// list their members under `metadata.files`, relative to `path`.
    pub fn artifact_files(&self) -> Vec<PathBuf> {
        match self.metadata.get("files").and_then(|f| f.as_array()) {
            Some(files) => files
                .iter()
                .filter_map(|f| f.as_str())
                .map(|name| self.path.join(name))
                .collect(),
            None => vec![self.path.clone()],
        }
    }

    /// Recompute the stored-bytes checksum and compare.
    pub fn verify_checksum(&self) -> Result<bool> {
        let actual = checksum::hash_files(&self.artifact_files())?;
        Ok(actual == self.checksum)
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    let kind: String = row.get("kind")?;
    let compression: String = row.get("compression")?;
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;
    let path: String = row.get("path")?;
    let source_path: Option<String> = row.get("source_path")?;
    let original_size: i64 = row.get("original_size")?;
    let stored_size: i64 = row.get("stored_size")?;

    Ok(BackupRecord {
        id: row.get("id")?,
        kind: BackupKind::parse(&kind).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, kind.clone(), rusqlite::types::Type::Text)
        })?,
        created_at: timestamp_column(row, "created_at")?,
        path: PathBuf::from(path),
        source_path: source_path.map(PathBuf::from),
        reference_target: row.get("reference_target")?,
        original_size: original_size.max(0) as u64,
        stored_size: stored_size.max(0) as u64,
        checksum: row.get("checksum")?,
        content_hash: row.get("content_hash")?,
        compression: Algorithm::parse(&compression).unwrap_or(Algorithm::None),
        expires_at: timestamp_column(row, "expires_at")?,
        status: if status == "corrupt" {
            RecordStatus::Corrupt
        } else {
            RecordStatus::Active
        },
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

pub fn insert(conn: &Connection, record: &BackupRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO backup_records (id, kind, created_at, path, source_path, reference_target,
            original_size, stored_size, checksum, content_hash, compression, expires_at, status, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            record.id,
            record.kind.as_str(),
            format_timestamp(&record.created_at),
            record.path.to_string_lossy(),
            record.source_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            record.reference_target,
            record.original_size as i64,
            record.stored_size as i64,
            record.checksum,
            record.content_hash,
            record.compression.as_str(),
            format_timestamp(&record.expires_at),
            record.status.as_str(),
            serde_json::to_string(&record.metadata)?,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_records WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_record(row))?;
    Ok(rows.next().transpose()?)
}

/// Newest first
pub fn find_by_kind(conn: &Connection, kind: BackupKind) -> Result<Vec<BackupRecord>> {
    let mut stmt =
        conn.prepare("SELECT * FROM backup_records WHERE kind = ? ORDER BY created_at DESC")?;
    let rows = stmt.query_map(params![kind.as_str()], |row| row_to_record(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn latest_active(conn: &Connection, kind: BackupKind) -> Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_records WHERE kind = ? AND status = 'active'
         ORDER BY created_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![kind.as_str()], |row| row_to_record(row))?;
    Ok(rows.next().transpose()?)
}

/// Records of `kind` created in `(after, until]`, oldest first.
pub fn find_created_between(
    conn: &Connection,
    kind: BackupKind,
    after: &DateTime<Utc>,
    until: &DateTime<Utc>,
) -> Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_records
         WHERE kind = ?1 AND created_at > ?2 AND created_at <= ?3
         ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(
        params![kind.as_str(), format_timestamp(after), format_timestamp(until)],
        |row| row_to_record(row),
    )?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Records of `kind` whose retention expiry is at or before `now`, oldest first.
pub fn find_expired(
    conn: &Connection,
    kind: BackupKind,
    now: &DateTime<Utc>,
) -> Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_records WHERE kind = ?1 AND expires_at <= ?2
         ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![kind.as_str(), format_timestamp(now)], |row| {
        row_to_record(row)
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn count_by_kind(conn: &Connection, kind: BackupKind) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM backup_records WHERE kind = ?",
        params![kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Live records resolving to `content_hash`, oldest first
pub fn find_by_content_hash(conn: &Connection, content_hash: &str) -> Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_records WHERE content_hash = ? ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![content_hash], |row| row_to_record(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn sum_original_size(conn: &Connection, kind: BackupKind) -> Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(original_size), 0) FROM backup_records WHERE kind = ?",
        params![kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

pub fn sum_stored_size(conn: &Connection, kind: BackupKind) -> Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(stored_size), 0) FROM backup_records WHERE kind = ?",
        params![kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

pub fn update_status(conn: &Connection, id: &str, status: RecordStatus) -> Result<()> {
    conn.execute(
        "UPDATE backup_records SET status = ? WHERE id = ?",
        params![status.as_str(), id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let changes = conn.execute("DELETE FROM backup_records WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(kind: BackupKind, created_at: DateTime<Utc>) -> BackupRecord {
        BackupRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            created_at,
            path: PathBuf::from("/backups/database/full/db.zst"),
            source_path: Some(PathBuf::from("/srv/app.db")),
            reference_target: None,
            original_size: 4096,
            stored_size: 1024,
            checksum: "abc".into(),
            content_hash: Some("def".into()),
            compression: Algorithm::Zstd,
            expires_at: created_at + Duration::days(30),
            status: RecordStatus::Active,
            metadata: serde_json::json!({ "database": { "table_count": 2 } }),
        }
    }

    #[test]
    fn test_insert_and_find() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;
        let rec = record(BackupKind::FullDatabase, crate::metadata::now());

        store.with_conn(|conn| insert(conn, &rec))?;
        let found = store.with_conn(|conn| find_by_id(conn, &rec.id))?.unwrap();

        assert_eq!(found.kind, BackupKind::FullDatabase);
        assert_eq!(found.compression, Algorithm::Zstd);
        assert_eq!(found.stored_size, 1024);
        assert_eq!(found.metadata["database"]["table_count"], 2);
        assert_eq!(found.created_at, rec.created_at);
        Ok(())
    }

    #[test]
    fn test_latest_active_skips_corrupt() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;
        let now = Utc::now();
        let older = record(BackupKind::FullDatabase, now - Duration::hours(2));
        let newer = record(BackupKind::FullDatabase, now);

        store.transaction(|tx| {
            insert(tx, &older)?;
            insert(tx, &newer)?;
            update_status(tx, &newer.id, RecordStatus::Corrupt)
        })?;

        let latest = store
            .with_conn(|conn| latest_active(conn, BackupKind::FullDatabase))?
            .unwrap();
        assert_eq!(latest.id, older.id);
        Ok(())
    }

    #[test]
    fn test_find_created_between_is_ascending_and_bounded() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;
        let t0 = Utc::now() - Duration::hours(3);
        let wal1 = record(BackupKind::WalIncrement, t0 + Duration::hours(1));
        let wal2 = record(BackupKind::WalIncrement, t0 + Duration::hours(2));
        let wal3 = record(BackupKind::WalIncrement, t0 + Duration::hours(3));
        store.transaction(|tx| {
            insert(tx, &wal3)?;
            insert(tx, &wal1)?;
            insert(tx, &wal2)
        })?;

        let found = store.with_conn(|conn| {
            find_created_between(conn, BackupKind::WalIncrement, &t0, &wal2.created_at)
        })?;
        let ids: Vec<_> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![wal1.id.as_str(), wal2.id.as_str()]);
        Ok(())
    }

    #[test]
    fn test_find_expired() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = MetadataStore::open(temp_dir.path())?;
        let mut stale = record(BackupKind::FileBackup, Utc::now() - Duration::days(40));
        stale.expires_at = Utc::now() - Duration::days(10);
        let fresh = record(BackupKind::FileBackup, Utc::now());
        store.transaction(|tx| {
            insert(tx, &stale)?;
            insert(tx, &fresh)
        })?;

        let expired =
            store.with_conn(|conn| find_expired(conn, BackupKind::FileBackup, &Utc::now()))?;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
        Ok(())
    }
}
