//! Backup orchestrator: composes the database and file engines into full and
//! incremental operations and replicates their artifacts to the storage backends.

pub mod operation;
pub mod tracker;
pub mod upload;

use crate::codec::Compressor;
use crate::config::{EngineConfig, UploadConfig};
use crate::database::{DatabaseBackupEngine, DatabaseEngineStatus};
use crate::files::{BatchOutcome, FileBackupEngine, FileCleanup, FileEngineStatus};
use crate::metadata::BackupRecord;
use crate::storage::{BackendStatus, SharedBackend};
use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::remote_key;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use operation::{
    upload_status, BackendUploadResult, OperationKind, OperationRecord, OperationStatus,
    StepRecord, StepStatus,
};
pub use tracker::{OperationTracker, RunStatistics};
pub use upload::{RemoteDeletion, UploadItem};

const RECENT_OPERATIONS: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupResult {
    pub database_removed: Vec<BackupRecord>,
    pub files: FileCleanup,
    pub remote: Vec<RemoteDeletion>,
    pub history_pruned: usize,
    pub errors: Vec<String>,
}

impl CleanupResult {
    pub fn removed_count(&self) -> usize {
        self.database_removed.len() + self.files.removed_records.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub database: Option<DatabaseEngineStatus>,
    pub files: Option<FileEngineStatus>,
    pub backends: Vec<BackendStatus>,
    pub active_operations: Vec<OperationRecord>,
    pub statistics: RunStatistics,
    pub recent_operations: Vec<OperationRecord>,
    pub errors: Vec<String>,
}

pub struct BackupOrchestrator {
    database: Arc<DatabaseBackupEngine>,
    files: Arc<FileBackupEngine>,
    backends: Vec<SharedBackend>,
    compressor: Option<Compressor>,
    tracker: Arc<OperationTracker>,
    backup_root: PathBuf,
    upload: UploadConfig,
    max_history: usize,
}

impl BackupOrchestrator {
    pub fn new(
        config: &EngineConfig,
        database: Arc<DatabaseBackupEngine>,
        files: Arc<FileBackupEngine>,
        backends: Vec<SharedBackend>,
        tracker: Arc<OperationTracker>,
    ) -> Self {
        Self {
            database,
            files,
            backends,
            compressor: Compressor::from_config(&config.compression),
            tracker,
            backup_root: config.backup_root.clone(),
            upload: config.upload.clone(),
            max_history: config.history.max_operations,
        }
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    pub fn backends(&self) -> &[SharedBackend] {
        &self.backends
    }

    pub fn cancel(&self, operation_id: &str) -> bool {
        self.tracker.cancel(operation_id)
    }

    /// Full database snapshot plus a walk of every watched directory. A failed
    /// snapshot aborts the whole operation.
    pub async fn create_full_backup(&self, upload_to_storage: bool) -> OperationRecord {
        let (mut op, cancel) = self.tracker.begin(OperationKind::FullBackup);
        let mut status = OperationStatus::Succeeded;

        let step = op.begin_step("database_backup");
        let database = self.database.clone();
        let compressor = self.compressor;
        let snapshot = tokio::task::spawn_blocking(move || database.create_full_backup(compressor.as_ref()))
            .await
            .map_err(EngineError::from)
            .and_then(|r| r);
        match snapshot {
            Ok(record) => {
                op.finish_step(step, StepStatus::Succeeded, Some(format!("backup {}", record.id)));
                op.total_size += record.stored_size;
                op.records.push(record);
            }
            Err(e) => {
                error!(operation_id = %op.id, "Full database backup failed: {}", e);
                op.finish_step(step, StepStatus::Failed, Some(e.to_string()));
                op.fail(format!("database backup failed: {}", e));
                self.tracker.complete(&op);
                return op;
            }
        }
        self.progress(&mut op, 40);

        if cancel.is_cancelled() {
            return self.cancelled(op);
        }

        let step = op.begin_step("file_backup");
        let files = self.files.clone();
        let token = cancel.clone();
        let batch = tokio::task::spawn_blocking(move || {
            let mut outcome = files.process_queue_until(compressor.as_ref(), &token);
            if !outcome.cancelled {
                outcome.merge(files.backup_watched(compressor.as_ref(), &token));
            }
            outcome
        })
        .await;
        status = status.worst(self.record_batch(&mut op, step, batch));
        if cancel.is_cancelled() {
            return self.cancelled(op);
        }
        self.progress(&mut op, 70);

        self.finish_backup(op, status, upload_to_storage, cancel).await
    }

    /// WAL increment plus whatever the watcher queued. No directory walk.
    pub async fn create_incremental_backup(&self, upload_to_storage: bool) -> OperationRecord {
        let (mut op, cancel) = self.tracker.begin(OperationKind::IncrementalBackup);
        let mut status = OperationStatus::Succeeded;

        let step = op.begin_step("database_increment");
        let database = self.database.clone();
        let increment = tokio::task::spawn_blocking(move || database.backup_increment_files())
            .await
            .map_err(EngineError::from)
            .and_then(|r| r);
        match increment {
            Ok(Some(record)) => {
                op.finish_step(step, StepStatus::Succeeded, Some(format!("increment {}", record.id)));
                op.total_size += record.stored_size;
                op.records.push(record);
            }
            Ok(None) => {
                op.finish_step(step, StepStatus::Skipped, Some("no new WAL data".into()));
            }
            Err(e) => {
                warn!(operation_id = %op.id, "WAL increment failed: {}", e);
                op.finish_step(step, StepStatus::Failed, Some(e.to_string()));
                status = OperationStatus::Partial;
            }
        }
        self.progress(&mut op, 30);

        if cancel.is_cancelled() {
            return self.cancelled(op);
        }

        let step = op.begin_step("file_backup");
        let files = self.files.clone();
        let compressor = self.compressor;
        let token = cancel.clone();
        let batch = tokio::task::spawn_blocking(move || {
            files.process_queue_until(compressor.as_ref(), &token)
        })
        .await;
        status = status.worst(self.record_batch(&mut op, step, batch));
        if cancel.is_cancelled() {
            return self.cancelled(op);
        }
        self.progress(&mut op, 60);

        self.finish_backup(op, status, upload_to_storage, cancel).await
    }

    /// Fold a file batch into the operation. Per-file failures do not stop the
    /// batch but leave the operation partial.
    fn record_batch(
        &self,
        op: &mut OperationRecord,
        step: usize,
        batch: std::result::Result<BatchOutcome, tokio::task::JoinError>,
    ) -> OperationStatus {
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                op.finish_step(step, StepStatus::Failed, Some(e.to_string()));
                return OperationStatus::Partial;
            }
        };

        op.total_size += batch.records.iter().map(|r| r.stored_size).sum::<u64>();
        let backed_up = batch.records.len();
        op.records.extend(batch.records);

        if batch.cancelled {
            // Left running; the caller cancels the whole operation.
            return OperationStatus::Failed;
        }

        if !batch.failed.is_empty() {
            op.set_detail(
                "failed_files",
                serde_json::to_value(&batch.failed).unwrap_or_default(),
            );
        }
        if !batch.walk_errors.is_empty() {
            op.set_detail("walk_errors", serde_json::json!(batch.walk_errors));
        }

        if batch.failed.is_empty() && batch.walk_errors.is_empty() {
            op.finish_step(step, StepStatus::Succeeded, Some(format!("{} files backed up", backed_up)));
            OperationStatus::Succeeded
        } else {
            op.finish_step(
                step,
                StepStatus::Failed,
                Some(format!(
                    "{} files backed up, {} failed, {} walk errors",
                    backed_up,
                    batch.failed.len(),
                    batch.walk_errors.len()
                )),
            );
            OperationStatus::Partial
        }
    }

    async fn finish_backup(
        &self,
        mut op: OperationRecord,
        mut status: OperationStatus,
        upload_to_storage: bool,
        cancel: CancellationToken,
    ) -> OperationRecord {
        if !upload_to_storage {
            op.skip_step("upload", "upload not requested");
        } else if self.backends.is_empty() {
            op.skip_step("upload", "no storage backends configured");
        } else {
            let step = op.begin_step("upload");
            let items = Arc::new(upload::upload_items(&op.records, &self.backup_root));
            op.uploads = upload::upload_to_backends(
                &self.backends,
                items,
                self.upload.max_workers,
                Duration::from_secs(self.upload.timeout_secs),
                &cancel,
            )
            .await;

            if cancel.is_cancelled() {
                return self.cancelled(op);
            }

            let upload_outcome = upload_status(&op.uploads);
            let ok = op.uploads.iter().filter(|u| u.succeeded()).count();
            let message = format!("{}/{} backends succeeded", ok, op.uploads.len());
            let step_status = if upload_outcome == OperationStatus::Succeeded {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            };
            op.finish_step(step, step_status, Some(message));
            status = status.worst(upload_outcome);
        }

        let error = match status {
            OperationStatus::Succeeded => None,
            _ => Some(self.failure_summary(&op)),
        };
        op.finish(status, error);
        info!(
            operation_id = %op.id,
            kind = op.kind.as_str(),
            status = op.status.as_str(),
            records = op.records.len(),
            total_size = op.total_size,
            "Backup operation finished"
        );
        self.tracker.complete(&op);
        op
    }

    fn failure_summary(&self, op: &OperationRecord) -> String {
        let mut parts: Vec<String> = op
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| match &s.message {
                Some(msg) => format!("{}: {}", s.name, msg),
                None => s.name.clone(),
            })
            .collect();
        parts.extend(
            op.uploads
                .iter()
                .filter_map(|u| u.error.as_ref().map(|e| format!("{}: {}", u.backend, e))),
        );
        parts.join("; ")
    }

    fn progress(&self, op: &mut OperationRecord, progress: u8) {
        op.set_progress(progress);
        self.tracker.update(op);
    }

    fn cancelled(&self, mut op: OperationRecord) -> OperationRecord {
        warn!(operation_id = %op.id, "Operation cancelled");
        op.cancel();
        self.tracker.complete(&op);
        op
    }

    /// Expire local artifacts, then delete their remote copies and prune
    /// the operation history. Every part is best-effort.
    pub async fn cleanup_expired(&self) -> CleanupResult {
        let mut result = CleanupResult::default();

        let database = self.database.clone();
        match tokio::task::spawn_blocking(move || database.cleanup_expired())
            .await
            .map_err(EngineError::from)
            .and_then(|r| r)
        {
            Ok(removed) => result.database_removed = removed,
            Err(e) => {
                warn!("Database cleanup failed: {}", e);
                result.errors.push(format!("database: {}", e));
            }
        }

        let files = self.files.clone();
        match tokio::task::spawn_blocking(move || files.cleanup_expired())
            .await
            .map_err(EngineError::from)
            .and_then(|r| r)
        {
            Ok(cleanup) => result.files = cleanup,
            Err(e) => {
                warn!("File cleanup failed: {}", e);
                result.errors.push(format!("files: {}", e));
            }
        }

        let mut keys: Vec<String> = result
            .database_removed
            .iter()
            .flat_map(|r| r.artifact_files())
            .chain(result.files.released_artifacts.iter().cloned())
            .map(|path| remote_key(&self.backup_root, &path))
            .collect();
        keys.sort();
        keys.dedup();

        if !keys.is_empty() && !self.backends.is_empty() {
            result.remote = upload::delete_from_backends(
                &self.backends,
                Arc::new(keys),
                Duration::from_secs(self.upload.timeout_secs),
            )
            .await;
            for deletion in &result.remote {
                result
                    .errors
                    .extend(deletion.errors.iter().map(|e| format!("{}: {}", deletion.backend, e)));
            }
        }

        match self.tracker.prune_history(self.max_history) {
            Ok(pruned) => result.history_pruned = pruned,
            Err(e) => result.errors.push(format!("history: {}", e)),
        }

        info!(
            removed = result.removed_count(),
            bytes_freed = result.files.bytes_freed,
            errors = result.errors.len(),
            "Cleanup finished"
        );
        result
    }

    pub async fn get_status(&self) -> OrchestratorStatus {
        let mut errors = Vec::new();

        let database = match self.database.status() {
            Ok(status) => Some(status),
            Err(e) => {
                errors.push(format!("database: {}", e));
                None
            }
        };
        let files = match self.files.status() {
            Ok(status) => Some(status),
            Err(e) => {
                errors.push(format!("files: {}", e));
                None
            }
        };

        let backends = upload::backend_statuses(
            &self.backends,
            Duration::from_secs(self.upload.timeout_secs),
        )
        .await;

        let recent_operations = match self.tracker.history(RECENT_OPERATIONS) {
            Ok(ops) => ops,
            Err(e) => {
                errors.push(format!("history: {}", e));
                Vec::new()
            }
        };

        OrchestratorStatus {
            database,
            files,
            backends,
            active_operations: self.tracker.active(),
            statistics: self.tracker.statistics(),
            recent_operations,
            errors,
        }
    }

    /// Operation by id, in flight or from history
    pub fn operation(&self, operation_id: &str) -> Result<Option<OperationRecord>> {
        self.tracker.find(operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BackupKind, MetadataStore};
    use crate::storage::LocalBackend;
    use rusqlite::Connection;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        config: EngineConfig,
        orchestrator: BackupOrchestrator,
    }

    fn fixture(backends: Vec<SharedBackend>) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("app.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);
             INSERT INTO notes (body) VALUES ('one'), ('two');",
        )
        .unwrap();
        drop(conn);

        let data = temp_dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("readme.txt"), b"hello").unwrap();

        let mut config = EngineConfig::new(&db_path, temp_dir.path().join("backups"));
        config.watched_directories = vec![data];

        let store = Arc::new(MetadataStore::open(&config.metadata_dir()).unwrap());
        let database = Arc::new(DatabaseBackupEngine::new(&config, store.clone()));
        let files = Arc::new(FileBackupEngine::new(&config, store.clone()).unwrap());
        let tracker = Arc::new(OperationTracker::new(store).unwrap());
        let orchestrator = BackupOrchestrator::new(&config, database, files, backends, tracker);
        Fixture {
            temp_dir,
            config,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_full_backup_without_upload() {
        let fx = fixture(Vec::new());
        let op = fx.orchestrator.create_full_backup(false).await;

        assert!(op.success, "{:?}", op.error);
        assert_eq!(op.status, OperationStatus::Succeeded);
        let db_record = op
            .records
            .iter()
            .find(|r| r.kind == BackupKind::FullDatabase)
            .unwrap();
        assert_eq!(db_record.metadata["database"]["row_counts"]["notes"], 2);
        assert!(op.records.iter().any(|r| r.kind == BackupKind::FileBackup));
        assert_eq!(op.step("upload").unwrap().status, StepStatus::Skipped);

        let stats = fx.orchestrator.tracker().statistics();
        assert_eq!(stats.succeeded, 1);
        assert!(stats.last_full_backup.is_some());
    }

    #[tokio::test]
    async fn test_one_unreachable_backend_gives_partial() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"file").unwrap();
        let first: SharedBackend = Arc::new(LocalBackend::new("first", temp_dir.path().join("first")));
        let second: SharedBackend = Arc::new(LocalBackend::new("second", temp_dir.path().join("second")));
        let broken: SharedBackend = Arc::new(LocalBackend::new("broken", blocker.join("remote")));

        let fx = fixture(vec![first.clone(), broken, second.clone()]);
        let op = fx.orchestrator.create_full_backup(true).await;

        assert_eq!(op.status, OperationStatus::Partial);
        assert!(!op.success);
        assert_eq!(op.uploads.len(), 3);
        assert!(op.uploads[0].succeeded());
        assert!(!op.uploads[1].succeeded());
        assert!(op.uploads[2].succeeded());

        let db_record = op
            .records
            .iter()
            .find(|r| r.kind == BackupKind::FullDatabase)
            .unwrap();
        let key = remote_key(&fx.config.backup_root, &db_record.path);
        assert!(first.exists(&key).await.unwrap());
        assert!(second.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_snapshot_aborts() {
        let fx = fixture(Vec::new());
        fs::remove_file(&fx.config.database_path).unwrap();

        let op = fx.orchestrator.create_full_backup(false).await;
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("database backup failed")));
        assert!(op.step("file_backup").is_none());
        assert!(op.records.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_skips_missing_wal() {
        let fx = fixture(Vec::new());
        fx.orchestrator.files.enqueue(fx.temp_dir.path().join("data/readme.txt"));

        let op = fx.orchestrator.create_incremental_backup(false).await;
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(op.step("database_increment").unwrap().status, StepStatus::Skipped);
        assert_eq!(op.records.len(), 1);
        assert_eq!(op.records[0].kind, BackupKind::FileBackup);
    }

    #[tokio::test]
    async fn test_failed_increment_capture_keeps_file_backups() {
        let fx = fixture(Vec::new());
        assert!(fx.orchestrator.database.enable_consistent_mode());
        let writer = Connection::open(&fx.config.database_path).unwrap();
        writer.execute_batch("PRAGMA wal_autocheckpoint = 0;").unwrap();
        writer.execute("INSERT INTO notes (body) VALUES ('three')", []).unwrap();

        // A plain file where the increment directory should be.
        let database_dir = fx.config.backup_root.join("database");
        fs::create_dir_all(&database_dir).unwrap();
        fs::write(database_dir.join("wal"), b"not a directory").unwrap();
        fx.orchestrator.files.enqueue(fx.temp_dir.path().join("data/readme.txt"));

        let op = fx.orchestrator.create_incremental_backup(false).await;
        assert_eq!(op.status, OperationStatus::Partial);
        assert_eq!(op.step("database_increment").unwrap().status, StepStatus::Failed);
        assert_eq!(op.records.len(), 1);
        assert_eq!(op.records[0].kind, BackupKind::FileBackup);
        drop(writer);
    }

    #[tokio::test]
    async fn test_status_and_cleanup() {
        let fx = fixture(Vec::new());
        fx.orchestrator.create_full_backup(false).await;

        let status = fx.orchestrator.get_status().await;
        assert!(status.errors.is_empty());
        assert_eq!(status.database.unwrap().full_backups, 1);
        assert_eq!(status.recent_operations.len(), 1);
        assert!(status.active_operations.is_empty());

        let cleanup = fx.orchestrator.cleanup_expired().await;
        assert_eq!(cleanup.removed_count(), 0);
        assert!(cleanup.errors.is_empty());
    }
}
