//! The engine facade: the only entry point a host service needs.

use crate::config::EngineConfig;
use crate::database::DatabaseBackupEngine;
use crate::files::FileBackupEngine;
use crate::metadata::{records, BackupKind, MetadataStore};
use crate::orchestrator::{BackupOrchestrator, CleanupResult, OperationRecord, OperationTracker, OrchestratorStatus};
use crate::recovery::{
    BackupInventory, DatabaseRestoreOptions, FileRestoreOptions, RecoveryManager,
    SystemRecoveryOptions, TestResult, ValidationResult,
};
use crate::storage;
use crate::utils::errors::{EngineError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct BackupEngine {
    config: EngineConfig,
    store: Arc<MetadataStore>,
    database: Arc<DatabaseBackupEngine>,
    files: Arc<FileBackupEngine>,
    orchestrator: BackupOrchestrator,
    recovery: RecoveryManager,
}

impl BackupEngine {
    /// Validate `config`, open the metadata store and build every component.
    /// Only misconfiguration fails here.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.backup_root).map_err(|e| {
            EngineError::Configuration(format!(
                "backup_root {} is not usable: {}",
                config.backup_root.display(),
                e
            ))
        })?;

        let store = Arc::new(MetadataStore::open(&config.metadata_dir())?);
        let database = Arc::new(DatabaseBackupEngine::new(&config, store.clone()));
        let files = Arc::new(FileBackupEngine::new(&config, store.clone())?);
        let tracker = Arc::new(OperationTracker::new(store.clone())?);

        let backends = storage::create_backends(&config.storage)
            .await
            .map_err(|e| match e {
                EngineError::Configuration(_) => e,
                other => EngineError::Configuration(format!("storage backend: {}", other)),
            })?;

        let orchestrator = BackupOrchestrator::new(
            &config,
            database.clone(),
            files.clone(),
            backends.clone(),
            tracker.clone(),
        );
        let recovery = RecoveryManager::new(
            &config,
            database.clone(),
            files.clone(),
            backends,
            store.clone(),
            tracker,
        );

        let consistent = database.enable_consistent_mode();
        info!(
            database = %config.database_path.display(),
            backup_root = %config.backup_root.display(),
            backends = config.storage.len(),
            watched = config.watched_directories.len(),
            consistent_mode = consistent,
            "Backup engine ready"
        );

        Ok(Self {
            config,
            store,
            database,
            files,
            orchestrator,
            recovery,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &BackupOrchestrator {
        &self.orchestrator
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn files(&self) -> &Arc<FileBackupEngine> {
        &self.files
    }

    pub fn database(&self) -> &Arc<DatabaseBackupEngine> {
        &self.database
    }

    /// Start real-time monitoring of the configured directories. Explicit
    /// backups keep working when this fails.
    pub fn start_watching(&self) -> Result<()> {
        let directories: Vec<PathBuf> = self.config.watched_directories.clone();
        self.files.watch(&directories)
    }

    pub fn stop_watching(&self) {
        self.files.stop_watching();
    }

    pub async fn create_full_backup(&self, upload_to_storage: bool) -> OperationRecord {
        self.orchestrator.create_full_backup(upload_to_storage).await
    }

    pub async fn create_incremental_backup(&self, upload_to_storage: bool) -> OperationRecord {
        self.orchestrator.create_incremental_backup(upload_to_storage).await
    }

    pub async fn restore_database(&self, opts: DatabaseRestoreOptions) -> OperationRecord {
        self.recovery.restore_database(opts).await
    }

    pub async fn restore_files(&self, opts: FileRestoreOptions) -> OperationRecord {
        self.recovery.restore_files(opts).await
    }

    pub async fn restore_full_system(&self, opts: SystemRecoveryOptions) -> OperationRecord {
        self.recovery.restore_full_system(opts).await
    }

    pub fn list_available_backups(&self) -> Result<BackupInventory> {
        self.recovery.list_available_backups()
    }

    pub async fn cleanup_expired(&self) -> CleanupResult {
        self.orchestrator.cleanup_expired().await
    }

    pub async fn get_status(&self) -> OrchestratorStatus {
        self.orchestrator.get_status().await
    }

    pub async fn validate_system_recovery(&self) -> ValidationResult {
        self.recovery.validate_system_recovery().await
    }

    pub async fn test_recovery_procedures(&self) -> TestResult {
        self.recovery.test_recovery_procedures().await
    }

    /// Request cooperative cancellation of a running operation
    pub fn cancel(&self, operation_id: &str) -> bool {
        self.orchestrator.cancel(operation_id)
    }

    pub fn operation(&self, operation_id: &str) -> Result<Option<OperationRecord>> {
        self.orchestrator.operation(operation_id)
    }

    /// Re-verify one backup record. Database records also get a structural
    /// check; a failing record is marked corrupt.
    pub async fn validate_backup(&self, record_id: &str) -> Result<bool> {
        let record = self
            .store
            .with_conn(|conn| records::find_by_id(conn, record_id))?
            .ok_or_else(|| EngineError::NotFound(format!("backup record {}", record_id)))?;

        let database = self.database.clone();
        tokio::task::spawn_blocking(move || match record.kind {
            BackupKind::FullDatabase | BackupKind::WalIncrement => Ok(database.validate_record(&record)),
            BackupKind::FileBackup | BackupKind::FileReference => record.verify_checksum(),
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackendConfig;
    use crate::orchestrator::OperationStatus;
    use rusqlite::Connection;
    use tempfile::TempDir;

    fn seeded_config(temp_dir: &TempDir) -> EngineConfig {
        let db_path = temp_dir.path().join("app.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
             INSERT INTO t (v) VALUES ('a'), ('b');",
        )
        .unwrap();
        EngineConfig::new(db_path, temp_dir.path().join("backups"))
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = seeded_config(&temp_dir);
        config.storage.push(StorageBackendConfig::Local {
            name: None,
            root: PathBuf::new(),
        });
        let err = BackupEngine::new(config).await.err().unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_backup_then_validate_through_facade() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = seeded_config(&temp_dir);
        config.storage.push(StorageBackendConfig::Local {
            name: Some("mirror".into()),
            root: temp_dir.path().join("mirror"),
        });
        let engine = BackupEngine::new(config).await.unwrap();
        assert!(engine.database().is_consistent_mode());

        let op = engine.create_full_backup(true).await;
        assert_eq!(op.status, OperationStatus::Succeeded, "{:?}", op.error);
        assert_eq!(op.uploads.len(), 1);

        let record_id = op.records[0].id.clone();
        assert!(engine.validate_backup(&record_id).await.unwrap());
        assert!(engine.validate_backup("missing").await.unwrap_err().is_not_found());

        let inventory = engine.list_available_backups().unwrap();
        assert_eq!(inventory.database.len(), 1);

        let status = engine.get_status().await;
        assert_eq!(status.backends.len(), 1);
        assert!(status.backends[0].reachable);
        assert_eq!(status.statistics.total_operations, 1);
    }
}
