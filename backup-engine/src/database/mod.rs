//! Database backup engine: online snapshots and WAL increments of the primary
//! SQLite database.

pub mod stats;
pub mod wal;

use crate::codec::{checksum, compression, Compressor};
use crate::config::{EngineConfig, RetentionConfig};
use crate::metadata::{records, now, BackupKind, BackupRecord, MetadataStore, RecordStatus};
use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::{commit_dir, commit_file, copy_synced, partial_path, remove_path, StagedPaths};
use chrono::{DateTime, Duration, Utc};
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use stats::DatabaseStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEngineStatus {
    pub database_path: PathBuf,
    pub database_exists: bool,
    pub consistent_mode: bool,
    pub full_backups: u64,
    pub wal_increments: u64,
    pub latest_full_backup: Option<DateTime<Utc>>,
}

pub struct DatabaseBackupEngine {
    database_path: PathBuf,
    backup_root: PathBuf,
    retention: RetentionConfig,
    key_tables: Vec<String>,
    store: Arc<MetadataStore>,
    consistent_mode: AtomicBool,
}

/// `20260114T093000.123456Z`, sortable and filesystem safe
pub(crate) fn artifact_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

/// Online copy of `src` into a new file at `dst` through the SQLite backup API.
/// The copy is left in rollback-journal mode and passes an integrity check.
pub(crate) fn snapshot_to(src: &Path, dst: &Path) -> Result<()> {
    let src_conn = Connection::open_with_flags(
        src,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    src_conn.busy_timeout(std::time::Duration::from_secs(30))?;

    let mut dst_conn = Connection::open(dst)?;
    {
        let backup = Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(25), None)?;
    }
    let _mode: String = dst_conn.query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))?;
    stats::integrity_check(&dst_conn)?;
    Ok(())
}

impl DatabaseBackupEngine {
    pub fn new(config: &EngineConfig, store: Arc<MetadataStore>) -> Self {
        Self {
            database_path: config.database_path.clone(),
            backup_root: config.backup_root.clone(),
            retention: config.retention.clone(),
            key_tables: config.database.key_tables.clone(),
            store,
            consistent_mode: AtomicBool::new(false),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn key_tables(&self) -> &[String] {
        &self.key_tables
    }

    pub fn full_dir(&self) -> PathBuf {
        self.backup_root.join("database").join("full")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.backup_root.join("database").join("wal")
    }

    pub fn is_consistent_mode(&self) -> bool {
        self.consistent_mode.load(Ordering::Relaxed)
    }

    /// Put the primary database into WAL mode so readers continue during a
    /// snapshot. Failure is logged and reported as `false`.
    pub fn enable_consistent_mode(&self) -> bool {
        let enabled = Connection::open_with_flags(
            &self.database_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(EngineError::from)
        .and_then(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            wal::enable_wal(&conn)
        });

        let ok = match enabled {
            Ok(true) => true,
            Ok(false) => {
                warn!(path = %self.database_path.display(), "Database refused WAL mode");
                false
            }
            Err(e) => {
                warn!(path = %self.database_path.display(), "Failed to enable WAL mode: {}", e);
                false
            }
        };
        self.consistent_mode.store(ok, Ordering::Relaxed);
        ok
    }

    fn db_file_name(&self) -> String {
        self.database_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "database.db".to_string())
    }

    pub fn create_full_backup(&self, compressor: Option<&Compressor>) -> Result<BackupRecord> {
        if !self.database_path.is_file() {
            return Err(EngineError::NotFound(format!(
                "database {}",
                self.database_path.display()
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now();
        let dir = self.full_dir();
        std::fs::create_dir_all(&dir)?;
        let base = format!(
            "{}_{}_{}",
            artifact_timestamp(&created_at),
            &id[..8],
            self.db_file_name()
        );

        let mut staged = StagedPaths::new();
        let snapshot = staged.track(partial_path(&dir.join(&base)));
        snapshot_to(&self.database_path, &snapshot)?;

        let db_stats = stats::inspect(&snapshot, &self.key_tables)?;
        let original_size = std::fs::metadata(&snapshot)?.len();
        let content_hash = checksum::hash_file(&snapshot)?;

        let (artifact, algorithm) = match compressor {
            Some(compressor) => {
                let packed = staged.track(partial_path(&dir.join(format!("{}.packing", base))));
                let outcome = compressor.compress_file(&snapshot, &packed)?;
                let target = dir.join(format!("{}{}", base, outcome.algorithm.extension()));
                commit_file(&packed, &target)?;
                remove_path(&snapshot)?;
                (staged.track(target), outcome.algorithm)
            }
            None => {
                let target = dir.join(&base);
                commit_file(&snapshot, &target)?;
                (staged.track(target), compression::Algorithm::None)
            }
        };

        let stored_size = std::fs::metadata(&artifact)?.len();
        let stored_checksum = checksum::hash_file(&artifact)?;
        let record = BackupRecord {
            id,
            kind: BackupKind::FullDatabase,
            created_at,
            path: artifact,
            source_path: Some(self.database_path.clone()),
            reference_target: None,
            original_size,
            stored_size,
            checksum: stored_checksum,
            content_hash: Some(content_hash),
            compression: algorithm,
            expires_at: created_at + Duration::days(self.retention.full_backup_days),
            status: RecordStatus::Active,
            metadata: serde_json::json!({ "database": db_stats }),
        };

        self.store.with_conn(|conn| records::insert(conn, &record))?;
        staged.commit();

        info!(
            record_id = %record.id,
            path = %record.path.display(),
            original_size,
            stored_size,
            compression = record.compression.as_str(),
            "Full database backup created"
        );
        Ok(record)
    }

    /// Capture the current `-wal` / `-shm` pair. `None` when there is no WAL,
    /// it is empty, or it is identical to the latest increment.
    pub fn backup_increment_files(&self) -> Result<Option<BackupRecord>> {
        let wal_file = wal::wal_path(&self.database_path);
        let wal_len = match std::fs::metadata(&wal_file) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if wal_len == 0 {
            debug!("WAL is empty, no increment to capture");
            return Ok(None);
        }

        let sources: Vec<PathBuf> = [wal_file, wal::shm_path(&self.database_path)]
            .into_iter()
            .filter(|p| p.is_file())
            .collect();

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now();
        let target_dir = self
            .wal_dir()
            .join(format!("{}_{}", artifact_timestamp(&created_at), &id[..8]));
        let mut staged = StagedPaths::new();
        let staging_dir = staged.track(partial_path(&target_dir));
        std::fs::create_dir_all(&staging_dir)?;

        let mut names = Vec::new();
        let mut copied = Vec::new();
        let mut total = 0u64;
        for source in &sources {
            let Some(name) = source.file_name() else { continue };
            let dst = staging_dir.join(name);
            total += copy_synced(source, &dst)?;
            names.push(name.to_string_lossy().into_owned());
            copied.push(dst);
        }
        let digest = checksum::hash_files(&copied)?;
        // `-shm` is rebuilt by every reader, so only the log identifies an increment.
        let wal_hash = checksum::hash_file(&copied[0])?;

        let latest = self
            .store
            .with_conn(|conn| records::latest_active(conn, BackupKind::WalIncrement))?;
        if latest
            .as_ref()
            .is_some_and(|r| r.content_hash.as_deref() == Some(wal_hash.as_str()))
        {
            debug!("WAL unchanged since the latest increment");
            return Ok(None);
        }

        commit_dir(&staging_dir, &target_dir)?;
        staged.track(&target_dir);

        let record = BackupRecord {
            id,
            kind: BackupKind::WalIncrement,
            created_at,
            path: target_dir,
            source_path: Some(self.database_path.clone()),
            reference_target: None,
            original_size: total,
            stored_size: total,
            checksum: digest,
            content_hash: Some(wal_hash),
            compression: compression::Algorithm::None,
            expires_at: created_at + Duration::hours(self.retention.wal_increment_hours),
            status: RecordStatus::Active,
            metadata: serde_json::json!({ "files": names }),
        };
        self.store.with_conn(|conn| records::insert(conn, &record))?;
        staged.commit();

        info!(record_id = %record.id, size = total, "WAL increment captured");
        Ok(Some(record))
    }

    /// Recompute the artifact checksum; full backups must also open as a
    /// valid database. A failing record is marked corrupt.
    pub fn validate_record(&self, record: &BackupRecord) -> bool {
        match self.check_record(record) {
            Ok(()) => true,
            Err(e) => {
                warn!(record_id = %record.id, "Backup validation failed: {}", e);
                if let Err(e) = self.store.with_conn(|conn| {
                    records::update_status(conn, &record.id, RecordStatus::Corrupt)
                }) {
                    warn!(record_id = %record.id, "Failed to mark record corrupt: {}", e);
                }
                false
            }
        }
    }

    fn check_record(&self, record: &BackupRecord) -> Result<()> {
        if !record.verify_checksum()? {
            return Err(EngineError::Integrity(format!(
                "checksum mismatch for {}",
                record.path.display()
            )));
        }
        if record.kind != BackupKind::FullDatabase {
            return Ok(());
        }

        let scratch = tempfile::Builder::new()
            .prefix(".validate")
            .tempdir_in(record.path.parent().unwrap_or(&self.backup_root))?;
        let db = scratch.path().join(self.db_file_name());
        compression::decompress_file(&record.path, &db)?;
        stats::inspect(&db, &[]).map(|_| ())
    }

    /// Delete expired full backups and increments. Returns the removed records.
    pub fn cleanup_expired(&self) -> Result<Vec<BackupRecord>> {
        let now = now();
        let mut removed = Vec::new();
        for kind in [BackupKind::FullDatabase, BackupKind::WalIncrement] {
            let expired = self
                .store
                .with_conn(|conn| records::find_expired(conn, kind, &now))?;
            for record in expired {
                if let Err(e) = remove_path(&record.path) {
                    warn!(record_id = %record.id, "Failed to remove expired artifact: {}", e);
                    continue;
                }
                self.store.with_conn(|conn| records::delete(conn, &record.id))?;
                debug!(record_id = %record.id, kind = kind.as_str(), "Expired backup removed");
                removed.push(record);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Expired database backups removed");
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<DatabaseEngineStatus> {
        self.store.with_conn(|conn| {
            Ok(DatabaseEngineStatus {
                database_path: self.database_path.clone(),
                database_exists: self.database_path.is_file(),
                consistent_mode: self.is_consistent_mode(),
                full_backups: records::count_by_kind(conn, BackupKind::FullDatabase)?,
                wal_increments: records::count_by_kind(conn, BackupKind::WalIncrement)?,
                latest_full_backup: records::latest_active(conn, BackupKind::FullDatabase)?
                    .map(|r| r.created_at),
            })
        })
    }
}
