//! Recovery manager: inventories backups and restores the database (optionally
//! to a point in time) and backed-up files.

pub mod patterns;
pub mod validation;

use crate::codec::{checksum, compression};
use crate::config::EngineConfig;
use crate::database::{self, stats, wal, DatabaseBackupEngine, DatabaseStats};
use crate::files::metadata::apply_to_path;
use crate::files::{FailedFile, FileBackupEngine};
use crate::metadata::{records, BackupKind, BackupRecord, FileIndexEntry, MetadataStore, RecordStatus};
use crate::orchestrator::{OperationKind, OperationRecord, OperationStatus, OperationTracker, StepStatus};
use crate::storage::SharedBackend;
use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::{
    commit_file, copy_synced, partial_path, relative_components, remote_key, remove_path,
    with_suffix, StagedPaths,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use validation::{TestCheck, TestResult, ValidationResult};

use self::patterns::PathPattern;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupInventory {
    pub database: Vec<BackupRecord>,
    pub increments: Vec<BackupRecord>,
    pub files: Vec<BackupRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseRestoreOptions {
    /// Full backup to start from (default: newest usable)
    #[serde(default)]
    pub backup_id: Option<String>,
    /// Replay WAL increments up to and including this instant
    #[serde(default)]
    pub point_in_time: Option<DateTime<Utc>>,
    /// Restore destination (default: the primary database path)
    #[serde(default)]
    pub target_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRestoreOptions {
    /// Glob patterns over original paths (empty = everything)
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub restore_to_original: bool,
    /// Relocation root when not restoring to original locations
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
}

impl Default for FileRestoreOptions {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            restore_to_original: true,
            target_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemRecoveryOptions {
    #[serde(default)]
    pub point_in_time: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoredFile {
    pub source: PathBuf,
    pub restored_to: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRestoreReport {
    pub restored: Vec<RestoredFile>,
    pub failed: Vec<FailedFile>,
    pub cancelled: bool,
}

impl FileRestoreReport {
    fn status(&self) -> OperationStatus {
        match (self.restored.len(), self.failed.len()) {
            (_, 0) if !self.cancelled => OperationStatus::Succeeded,
            (0, _) => OperationStatus::Failed,
            _ => OperationStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseRestoreSummary {
    backup_id: String,
    target: PathBuf,
    increments_applied: usize,
    safety_copy: Option<PathBuf>,
    stats: DatabaseStats,
}

enum Destination {
    Original,
    Under(PathBuf),
}

impl Destination {
    fn resolve(&self, source: &Path) -> PathBuf {
        match self {
            Destination::Original => source.to_path_buf(),
            Destination::Under(root) => root.join(relative_components(source)),
        }
    }
}

/// Run blocking engine work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn ensure_running(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

fn close_step<T>(op: &mut OperationRecord, step: usize, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => op.finish_step(step, StepStatus::Succeeded, None),
        Err(e) => op.finish_step(step, StepStatus::Failed, Some(e.to_string())),
    }
    result
}

pub struct RecoveryManager {
    database: Arc<DatabaseBackupEngine>,
    files: Arc<FileBackupEngine>,
    backends: Vec<SharedBackend>,
    store: Arc<MetadataStore>,
    tracker: Arc<OperationTracker>,
    backup_root: PathBuf,
    expected_directories: Vec<PathBuf>,
    sample_size: usize,
}

impl RecoveryManager {
    pub fn new(
        config: &EngineConfig,
        database: Arc<DatabaseBackupEngine>,
        files: Arc<FileBackupEngine>,
        backends: Vec<SharedBackend>,
        store: Arc<MetadataStore>,
        tracker: Arc<OperationTracker>,
    ) -> Self {
        Self {
            database,
            files,
            backends,
            store,
            tracker,
            backup_root: config.backup_root.clone(),
            expected_directories: config.expected_directories(),
            sample_size: config.recovery.validation_sample_size,
        }
    }

    /// Every record still in the metadata store, newest first.
    pub fn list_available_backups(&self) -> Result<BackupInventory> {
        self.store.with_conn(|conn| {
            let mut files = records::find_by_kind(conn, BackupKind::FileBackup)?;
            files.extend(records::find_by_kind(conn, BackupKind::FileReference)?);
            files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(BackupInventory {
                database: records::find_by_kind(conn, BackupKind::FullDatabase)?,
                increments: records::find_by_kind(conn, BackupKind::WalIncrement)?,
                files,
            })
        })
    }

    pub async fn restore_database(&self, opts: DatabaseRestoreOptions) -> OperationRecord {
        let (op, cancel) = self.tracker.begin(OperationKind::DatabaseRestore);
        self.run_database_restore(op, opts, &cancel).await
    }

    async fn run_database_restore(
        &self,
        mut op: OperationRecord,
        opts: DatabaseRestoreOptions,
        cancel: &CancellationToken,
    ) -> OperationRecord {
        let target = opts
            .target_path
            .clone()
            .unwrap_or_else(|| self.database.database_path().to_path_buf());

        match self.restore_database_into(&mut op, &opts, &target, cancel).await {
            Ok(summary) => {
                op.total_size = summary.stats.size_bytes;
                op.set_detail("database", serde_json::to_value(&summary).unwrap_or_default());
                op.finish(OperationStatus::Succeeded, None);
            }
            Err(EngineError::Cancelled) => {
                info!(operation_id = %op.id, "Database restore cancelled");
                op.cancel();
            }
            Err(e) => {
                error!(operation_id = %op.id, "Database restore failed: {}", e);
                op.fail(format!("database restore failed: {}", e));
            }
        }
        self.tracker.complete(&op);
        op
    }

    pub async fn restore_files(&self, opts: FileRestoreOptions) -> OperationRecord {
        let (mut op, cancel) = self.tracker.begin(OperationKind::FileRestore);

        let selected = self.select_files(&opts.patterns).and_then(|entries| {
            let destination = self.destination(&opts)?;
            Ok((entries, destination))
        });
        let (entries, destination) = match selected {
            Ok(selection) => selection,
            Err(e) => {
                op.fail(format!("file restore failed: {}", e));
                self.tracker.complete(&op);
                return op;
            }
        };

        let report = self
            .restore_files_into(&mut op, entries, &destination, &cancel)
            .await;
        self.finish_file_restore(&mut op, &report);
        self.tracker.complete(&op);
        op
    }

    fn finish_file_restore(&self, op: &mut OperationRecord, report: &FileRestoreReport) {
        op.total_size = report.restored.iter().map(|f| f.size).sum();
        op.set_detail("files", serde_json::to_value(report).unwrap_or_default());
        if report.cancelled {
            op.cancel();
            return;
        }
        let status = report.status();
        let error = (status != OperationStatus::Succeeded)
            .then(|| format!("{} of {} files failed to restore", report.failed.len(), report.failed.len() + report.restored.len()));
        op.finish(status, error);
    }

    /// Database restore, then every file to its original location, then
    /// validation. A failing step stops the ones after it.
    pub async fn perform_full_system_recovery(&self, point_in_time: Option<DateTime<Utc>>) -> OperationRecord {
        let (mut op, cancel) = self.tracker.begin(OperationKind::SystemRecovery);
        let target = self.database.database_path().to_path_buf();
        let opts = DatabaseRestoreOptions {
            point_in_time,
            ..Default::default()
        };

        match self.restore_database_into(&mut op, &opts, &target, &cancel).await {
            Ok(summary) => {
                op.set_detail("database", serde_json::to_value(&summary).unwrap_or_default());
            }
            Err(EngineError::Cancelled) => {
                op.cancel();
                self.tracker.complete(&op);
                return op;
            }
            Err(e) => {
                error!(operation_id = %op.id, "System recovery aborted at database restore: {}", e);
                op.fail(format!("database restore failed: {}", e));
                self.tracker.complete(&op);
                return op;
            }
        }
        op.set_progress(40);
        self.tracker.update(&op);

        if cancel.is_cancelled() {
            op.cancel();
            self.tracker.complete(&op);
            return op;
        }

        let entries = self.files.index_entries();
        let report = self
            .restore_files_into(&mut op, entries, &Destination::Original, &cancel)
            .await;
        op.total_size = report.restored.iter().map(|f| f.size).sum();
        op.set_detail("files", serde_json::to_value(&report).unwrap_or_default());
        if report.cancelled {
            op.cancel();
            self.tracker.complete(&op);
            return op;
        }
        if !report.failed.is_empty() {
            warn!(operation_id = %op.id, failed = report.failed.len(), "System recovery stopped after file restore");
            op.finish(
                OperationStatus::Partial,
                Some(format!(
                    "file restore: {} files failed; database restored, validation not run",
                    report.failed.len()
                )),
            );
            self.tracker.complete(&op);
            return op;
        }
        op.set_progress(80);
        self.tracker.update(&op);

        let step = op.begin_step("validate_system");
        let validation = self.validate_system_recovery().await;
        op.set_detail("validation", serde_json::to_value(&validation).unwrap_or_default());
        if validation.valid {
            op.finish_step(step, StepStatus::Succeeded, None);
            op.finish(OperationStatus::Succeeded, None);
        } else {
            let message = validation.errors.join("; ");
            op.finish_step(step, StepStatus::Failed, Some(message.clone()));
            op.finish(OperationStatus::Partial, Some(format!("validation failed: {}", message)));
        }
        info!(operation_id = %op.id, status = op.status.as_str(), "System recovery finished");
        self.tracker.complete(&op);
        op
    }

    pub async fn restore_full_system(&self, opts: SystemRecoveryOptions) -> OperationRecord {
        self.perform_full_system_recovery(opts.point_in_time).await
    }

    /// Database structure, a sample of indexed files and the expected
    /// directories of the live system.
    pub async fn validate_system_recovery(&self) -> ValidationResult {
        let database_path = self.database.database_path().to_path_buf();
        let key_tables = self.database.key_tables().to_vec();
        let entries = self.files.index_entries();
        let expected = self.expected_directories.clone();
        let sample_size = self.sample_size;

        let checked = blocking(move || {
            let mut result = ValidationResult::new();
            validation::check_database(&database_path, &key_tables, &mut result);
            validation::check_files(&validation::sample(&entries, sample_size), &mut result);
            validation::check_directories(&expected, &mut result);
            Ok(result.conclude())
        })
        .await;

        match checked {
            Ok(result) => result,
            Err(e) => {
                let mut result = ValidationResult::new();
                result.errors.push(e.to_string());
                result.conclude()
            }
        }
    }

    /// Rehearse the restore paths inside a throwaway directory.
    pub async fn test_recovery_procedures(&self) -> TestResult {
        let (mut op, cancel) = self.tracker.begin(OperationKind::RecoveryTest);
        let mut result = TestResult::new();

        let sandbox = match tempfile::Builder::new().prefix("recovery-test").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                result.record("sandbox", result.started_at, Err(e.to_string()));
                let result = result.conclude();
                op.fail("could not create sandbox");
                self.tracker.complete(&op);
                return result;
            }
        };
        debug!(sandbox = %sandbox.path().display(), "Recovery self-test started");

        let inventory = self.list_available_backups().unwrap_or_default();
        let latest = inventory
            .database
            .iter()
            .find(|r| r.status == RecordStatus::Active)
            .cloned();

        let started = crate::metadata::now();
        let check = match &latest {
            Some(full) => {
                let target = sandbox.path().join("database").join("restored.db");
                let opts = DatabaseRestoreOptions {
                    backup_id: Some(full.id.clone()),
                    ..Default::default()
                };
                self.restore_database_into(&mut op, &opts, &target, &cancel)
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|summary| compare_with_backup(full, &summary.stats))
            }
            None => Err("no usable full database backup".to_string()),
        };
        result.record("database_restore", started, check);

        if let Some(full) = &latest {
            let last_increment = inventory
                .increments
                .iter()
                .filter(|r| r.status == RecordStatus::Active && r.created_at > full.created_at)
                .map(|r| r.created_at)
                .max();
            if let Some(point_in_time) = last_increment {
                let started = crate::metadata::now();
                let target = sandbox.path().join("database").join("point-in-time.db");
                let opts = DatabaseRestoreOptions {
                    backup_id: Some(full.id.clone()),
                    point_in_time: Some(point_in_time),
                    target_path: None,
                };
                let check = self
                    .restore_database_into(&mut op, &opts, &target, &cancel)
                    .await
                    .map(|s| format!("{} increments applied", s.increments_applied))
                    .map_err(|e| e.to_string());
                result.record("point_in_time_restore", started, check);
            }
        }

        let entries = self.files.index_entries();
        if !entries.is_empty() {
            let started = crate::metadata::now();
            let sampled: Vec<FileIndexEntry> = validation::sample(&entries, self.sample_size)
                .into_iter()
                .cloned()
                .collect();
            let destination = Destination::Under(sandbox.path().join("files"));
            let report = self
                .restore_files_into(&mut op, sampled, &destination, &cancel)
                .await;
            let check = if report.failed.is_empty() && !report.cancelled {
                Ok(format!("{} files restored", report.restored.len()))
            } else {
                Err(report
                    .failed
                    .iter()
                    .map(|f| format!("{}: {}", f.path.display(), f.error))
                    .collect::<Vec<_>>()
                    .join("; "))
            };
            result.record("file_restore", started, check);
        }

        let result = result.conclude();
        op.set_detail("test", serde_json::to_value(&result).unwrap_or_default());
        if result.passed {
            op.finish(OperationStatus::Succeeded, None);
        } else {
            op.finish(OperationStatus::Failed, Some("recovery self-test failed".into()));
        }
        self.tracker.complete(&op);
        info!(passed = result.passed, checks = result.checks.len(), "Recovery self-test finished");
        result
    }

    // ── database restore steps ──

    async fn restore_database_into(
        &self,
        op: &mut OperationRecord,
        opts: &DatabaseRestoreOptions,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<DatabaseRestoreSummary> {
        let step = op.begin_step("select_backup");
        let selected = self.select_backups(opts);
        let (full, increments) = close_step(op, step, selected)?;
        debug!(backup_id = %full.id, increments = increments.len(), "Restore plan selected");
        ensure_running(cancel)?;

        let step = op.begin_step("fetch_artifacts");
        let mut fetched = Ok(0);
        for record in std::iter::once(&full).chain(increments.iter()) {
            match self.ensure_local(record).await {
                Ok(n) => fetched = fetched.map(|total| total + n),
                Err(e) => {
                    fetched = Err(e);
                    break;
                }
            }
        }
        close_step(op, step, fetched)?;
        ensure_running(cancel)?;

        let step = op.begin_step("verify_checksum");
        let mut verified = Ok(());
        for record in std::iter::once(&full).chain(increments.iter()) {
            if let Err(e) = self.verify_artifact(record).await {
                if let EngineError::Integrity(message) = &e {
                    warn!(backup_id = %record.id, "{}", message);
                }
                verified = Err(e);
                break;
            }
        }
        close_step(op, step, verified)?;
        ensure_running(cancel)?;

        let step = op.begin_step("restore");
        let staging = partial_path(&with_suffix(target, ".restore"));
        let key_tables = self.database.key_tables().to_vec();
        let (full_for_stage, staging_path) = (full.clone(), staging.clone());
        let staged = blocking(move || stage_database(&full_for_stage, &increments, &staging_path)).await;
        let applied = match close_step(op, step, staged).and_then(|applied| {
            ensure_running(cancel)?;
            Ok(applied)
        }) {
            Ok(applied) => applied,
            Err(e) => {
                let _ = remove_path(&staging);
                return Err(e);
            }
        };

        let step = op.begin_step("install");
        let safety_dir = self
            .backup_root
            .join("recovery")
            .join("safety")
            .join(&op.id);
        let (target_path, staging_path) = (target.to_path_buf(), staging.clone());
        let installed = blocking(move || install(&staging_path, &target_path, &safety_dir)).await;
        let safety_copy = close_step(op, step, installed)?;

        let step = op.begin_step("validate");
        let (target_path, safety) = (target.to_path_buf(), safety_copy.clone());
        let validated =
            blocking(move || validate_installed(&target_path, &key_tables, safety.as_deref())).await;
        let stats = close_step(op, step, validated)?;

        info!(
            backup_id = %full.id,
            target = %target.display(),
            increments_applied = applied,
            "Database restored"
        );
        Ok(DatabaseRestoreSummary {
            backup_id: full.id,
            target: target.to_path_buf(),
            increments_applied: applied,
            safety_copy,
            stats,
        })
    }

    /// Full backup to start from plus the increments to replay, oldest first.
    fn select_backups(&self, opts: &DatabaseRestoreOptions) -> Result<(BackupRecord, Vec<BackupRecord>)> {
        self.store.with_conn(|conn| {
            let full = match &opts.backup_id {
                Some(id) => {
                    let record = records::find_by_id(conn, id)?
                        .filter(|r| r.kind == BackupKind::FullDatabase)
                        .ok_or_else(|| EngineError::NotFound(format!("full database backup {}", id)))?;
                    if record.status == RecordStatus::Corrupt {
                        return Err(EngineError::Integrity(format!("backup {} is marked corrupt", id)));
                    }
                    if let Some(pit) = &opts.point_in_time {
                        if record.created_at > *pit {
                            return Err(EngineError::NotFound(format!(
                                "backup {} was taken after the requested point in time",
                                id
                            )));
                        }
                    }
                    record
                }
                None => records::find_by_kind(conn, BackupKind::FullDatabase)?
                    .into_iter()
                    .filter(|r| r.status == RecordStatus::Active)
                    .find(|r| opts.point_in_time.map_or(true, |pit| r.created_at <= pit))
                    .ok_or_else(|| EngineError::NotFound("no usable full database backup".into()))?,
            };

            let increments = match &opts.point_in_time {
                Some(pit) => records::find_created_between(conn, BackupKind::WalIncrement, &full.created_at, pit)?
                    .into_iter()
                    .filter(|r| r.status == RecordStatus::Active)
                    .collect(),
                None => Vec::new(),
            };
            Ok((full, increments))
        })
    }

    /// Download any artifact file of `record` missing on local disk from the
    /// first backend holding it. Returns the number fetched.
    async fn ensure_local(&self, record: &BackupRecord) -> Result<usize> {
        self.fetch_artifacts(record, false).await
    }

    /// Checksum of the local artifact. A local copy that fails is replaced
    /// once from storage before the record is marked corrupt.
    async fn verify_artifact(&self, record: &BackupRecord) -> Result<()> {
        let local = record.clone();
        if blocking(move || local.verify_checksum()).await? {
            return Ok(());
        }
        warn!(backup_id = %record.id, "Local artifact failed its checksum, fetching it again");
        match self.fetch_artifacts(record, true).await {
            Ok(0) => {}
            Ok(_) => {
                let local = record.clone();
                if blocking(move || local.verify_checksum()).await? {
                    info!(backup_id = %record.id, "Artifact replaced from storage");
                    return Ok(());
                }
            }
            Err(e) => warn!(backup_id = %record.id, "Re-fetch failed: {}", e),
        }
        self.store
            .with_conn(|conn| records::update_status(conn, &record.id, RecordStatus::Corrupt))?;
        Err(EngineError::Integrity(format!(
            "checksum mismatch for backup {}",
            record.id
        )))
    }

    /// With `replace`, every artifact file is downloaded again and files no
    /// backend holds are left as they are.
    async fn fetch_artifacts(&self, record: &BackupRecord, replace: bool) -> Result<usize> {
        let mut fetched = 0;
        for file in record.artifact_files() {
            if !replace && tokio::fs::try_exists(&file).await.unwrap_or(false) {
                continue;
            }
            let key = remote_key(&self.backup_root, &file);
            let mut found = false;
            for backend in &self.backends {
                match backend.exists(&key).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(backend = %backend.name(), key = %key, "Existence check failed: {}", e);
                        continue;
                    }
                }
                match backend.download(&key, &file).await {
                    Ok(()) => {
                        info!(backend = %backend.name(), key = %key, "Fetched artifact from storage");
                        found = true;
                        break;
                    }
                    Err(e) => warn!(backend = %backend.name(), key = %key, "Download failed: {}", e),
                }
            }
            if !found && replace {
                continue;
            }
            if !found {
                return Err(EngineError::NotFound(format!(
                    "artifact {} is neither local nor on any storage backend",
                    file.display()
                )));
            }
            fetched += 1;
        }
        Ok(fetched)
    }

    // ── file restore ──

    fn select_files(&self, raw_patterns: &[String]) -> Result<Vec<FileIndexEntry>> {
        let patterns: Vec<PathPattern> = patterns::compile(raw_patterns);
        let entries: Vec<FileIndexEntry> = self
            .files
            .index_entries()
            .into_iter()
            .filter(|e| patterns::matches_any(&patterns, &e.path))
            .collect();
        if entries.is_empty() && !patterns.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no backed-up files match {}",
                raw_patterns.join(", ")
            )));
        }
        Ok(entries)
    }

    fn destination(&self, opts: &FileRestoreOptions) -> Result<Destination> {
        if opts.restore_to_original {
            return Ok(Destination::Original);
        }
        opts.target_dir
            .clone()
            .map(Destination::Under)
            .ok_or_else(|| {
                EngineError::Configuration(
                    "target_dir is required when not restoring to original locations".into(),
                )
            })
    }

    async fn restore_files_into(
        &self,
        op: &mut OperationRecord,
        entries: Vec<FileIndexEntry>,
        destination: &Destination,
        cancel: &CancellationToken,
    ) -> FileRestoreReport {
        let step = op.begin_step("restore_files");
        let mut report = FileRestoreReport::default();

        for entry in entries {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let target = destination.resolve(&entry.path);
            match self.restore_one(&entry, &target).await {
                Ok(size) => report.restored.push(RestoredFile {
                    source: entry.path,
                    restored_to: target,
                    size,
                }),
                Err(e) => {
                    warn!(path = %entry.path.display(), "File restore failed: {}", e);
                    report.failed.push(FailedFile {
                        path: entry.path,
                        error: e.to_string(),
                    });
                }
            }
        }

        let message = format!("{} restored, {} failed", report.restored.len(), report.failed.len());
        let status = if report.failed.is_empty() && !report.cancelled {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        op.finish_step(step, status, Some(message));
        report
    }

    async fn restore_one(&self, entry: &FileIndexEntry, target: &Path) -> Result<u64> {
        let record = self
            .store
            .with_conn(|conn| records::find_by_id(conn, &entry.record_id))?
            .ok_or_else(|| EngineError::NotFound(format!("backup record {}", entry.record_id)))?;
        self.ensure_local(&record).await?;

        let entry = entry.clone();
        let target = target.to_path_buf();
        blocking(move || restore_file(&record, &entry, &target)).await
    }
}

/// Decompress the full backup into `staging` and replay `increments` on it.
fn stage_database(full: &BackupRecord, increments: &[BackupRecord], staging: &Path) -> Result<usize> {
    remove_path(staging)?;
    wal::remove_companions(staging)?;
    if let Some(parent) = staging.parent() {
        std::fs::create_dir_all(parent)?;
    }
    compression::decompress_file(&full.path, staging)?;
    let applied = wal::replay_increments(staging, increments)?;
    stats::integrity_check(&stats::open_read_only(staging)?)?;
    Ok(applied)
}

/// Move `staging` over `target`, keeping a safety copy of an existing target.
fn install(staging: &Path, target: &Path, safety_dir: &Path) -> Result<Option<PathBuf>> {
    let safety = if target.exists() {
        std::fs::create_dir_all(safety_dir)?;
        let name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "database.db".into());
        let copy = safety_dir.join(name);
        if let Err(e) = database::snapshot_to(target, &copy) {
            // Not a readable database; keep its raw bytes instead.
            debug!(target = %target.display(), "Snapshot of current database failed, copying: {}", e);
            remove_path(&copy)?;
            copy_synced(target, &copy)?;
            for suffix in ["-wal", "-shm"] {
                let companion = with_suffix(target, suffix);
                if companion.exists() {
                    copy_synced(&companion, &with_suffix(&copy, suffix))?;
                }
            }
        }
        info!(safety_copy = %copy.display(), "Safety copy of current database taken");
        Some(copy)
    } else {
        None
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    wal::remove_companions(target)?;
    commit_file(staging, target)?;
    Ok(safety)
}

/// Inspect the installed database; on failure the safety copy goes back.
fn validate_installed(target: &Path, key_tables: &[String], safety: Option<&Path>) -> Result<DatabaseStats> {
    match stats::inspect(target, key_tables) {
        Ok(stats) => Ok(stats),
        Err(e) => {
            error!(target = %target.display(), "Restored database failed validation: {}", e);
            reinstate(safety, target)?;
            Err(e)
        }
    }
}

/// Put the safety copy back after a failed restore, or remove the restored
/// file when there was nothing to protect.
fn reinstate(safety: Option<&Path>, target: &Path) -> Result<()> {
    wal::remove_companions(target)?;
    let Some(safety) = safety else {
        remove_path(target)?;
        return Ok(());
    };
    let staged = partial_path(target);
    copy_synced(safety, &staged)?;
    commit_file(&staged, target)?;
    for suffix in ["-wal", "-shm"] {
        let companion = with_suffix(safety, suffix);
        if companion.exists() {
            copy_synced(&companion, &with_suffix(target, suffix))?;
        }
    }
    warn!(target = %target.display(), "Previous database reinstated from safety copy");
    Ok(())
}

/// Decompress one file artifact to `target`, check its content hash and
/// re-apply the recorded permissions and modification time.
fn restore_file(record: &BackupRecord, entry: &FileIndexEntry, target: &Path) -> Result<u64> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut staged = StagedPaths::new();
    let staging = staged.track(partial_path(target));
    let size = compression::decompress_file(&record.path, &staging)?;

    let restored_hash = checksum::hash_file(&staging)?;
    if restored_hash != entry.content_hash {
        return Err(EngineError::Integrity(format!(
            "restored content of {} does not match its backup",
            entry.path.display()
        )));
    }
    apply_to_path(&staging, entry.permissions, Some(entry.modified_at))?;
    commit_file(&staging, target)?;
    staged.commit();
    Ok(size)
}

/// Restored table set and row counts must equal those recorded at backup time.
fn compare_with_backup(full: &BackupRecord, restored: &DatabaseStats) -> std::result::Result<String, String> {
    let recorded: Option<DatabaseStats> = full
        .metadata
        .get("database")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    match recorded {
        Some(recorded) if recorded.table_count != restored.table_count => Err(format!(
            "table count {} differs from backup ({})",
            restored.table_count, recorded.table_count
        )),
        Some(recorded) if recorded.row_counts != restored.row_counts => {
            Err("row counts differ from backup".to_string())
        }
        Some(_) => Ok(format!("{} tables verified", restored.table_count)),
        None => Ok("restored database passed integrity check".to_string()),
    }
}
