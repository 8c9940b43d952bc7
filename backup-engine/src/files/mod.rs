//! File backup engine: content-addressed per-file backups of watched trees.

pub mod filter;
pub mod index;
pub mod metadata;
pub mod queue;
pub mod walker;
pub mod watcher;

use crate::codec::{checksum, Algorithm, Compressor, HashingReader};
use crate::config::EngineConfig;
use crate::database::artifact_timestamp;
use crate::metadata::{
    now, records, BackupKind, BackupRecord, ContentHashEntry, FileIndexEntry, MetadataStore,
    RecordStatus,
};
use crate::utils::errors::Result;
use crate::utils::fs::{commit_file, partial_path, relative_components, remove_path, StagedPaths};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::filter::IgnoreFilter;
use self::index::{FileIndexState, IndexUpdate};
use self::metadata::FileMetadata;
use self::queue::PendingQueue;
use self::walker::WalkOptions;
use self::watcher::FileWatcher;

const EXTERNAL_DIR: &str = "_external";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of backing up a batch of files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub records: Vec<BackupRecord>,
    pub failed: Vec<FailedFile>,
    /// Entries the directory walk could not read
    pub walk_errors: Vec<String>,
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.records.extend(other.records);
        self.failed.extend(other.failed);
        self.walk_errors.extend(other.walk_errors);
        self.cancelled |= other.cancelled;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileCleanup {
    pub removed_records: Vec<BackupRecord>,
    /// Artifacts deleted because their last reference expired
    pub released_artifacts: Vec<PathBuf>,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEngineStatus {
    pub watched_directories: Vec<PathBuf>,
    pub watching: bool,
    pub pending: usize,
    pub indexed_files: usize,
    pub unique_contents: usize,
    pub deduplicated_bytes: u64,
}

pub struct FileBackupEngine {
    watched: Vec<PathBuf>,
    backup_root: PathBuf,
    retention_days: i64,
    filter: Arc<IgnoreFilter>,
    queue: Arc<PendingQueue>,
    index: Mutex<FileIndexState>,
    store: Arc<MetadataStore>,
    watcher: Mutex<Option<FileWatcher>>,
}

impl FileBackupEngine {
    pub fn new(config: &EngineConfig, store: Arc<MetadataStore>) -> Result<Self> {
        let index = FileIndexState::load(&store)?;
        debug!(
            files = index.len(),
            contents = index.content_count(),
            "File index loaded"
        );
        Ok(Self {
            watched: config.watched_directories.clone(),
            backup_root: config.backup_root.clone(),
            retention_days: config.retention.file_backup_days,
            filter: Arc::new(
                IgnoreFilter::new(&config.ignore)
                    .excluding(&config.backup_root)
                    .excluding(&config.metadata_dir()),
            ),
            queue: Arc::new(PendingQueue::new()),
            index: Mutex::new(index),
            store,
            watcher: Mutex::new(None),
        })
    }

    pub fn watched_directories(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn files_root(&self) -> PathBuf {
        self.backup_root.join("files")
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn enqueue(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.filter.is_ignored(&path) {
            return false;
        }
        self.queue.push(path)
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.watcher).is_some()
    }

    /// Begin monitoring `directories`. On failure real-time mode stays off;
    /// explicit backups keep working.
    pub fn watch(&self, directories: &[PathBuf]) -> Result<()> {
        match watcher::start(directories, self.filter.clone(), self.queue.clone()) {
            Ok(w) => {
                *lock(&self.watcher) = Some(w);
                Ok(())
            }
            Err(e) => {
                warn!("File watcher failed to start, real-time mode disabled: {}", e);
                Err(e)
            }
        }
    }

    pub fn stop_watching(&self) {
        if lock(&self.watcher).take().is_some() {
            info!("File watcher stopped");
        }
    }

    /// Snapshot of every index entry, sorted by path
    pub fn index_entries(&self) -> Vec<FileIndexEntry> {
        let index = lock(&self.index);
        let mut entries: Vec<_> = index.entries().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    pub fn content_entry(&self, content_hash: &str) -> Option<ContentHashEntry> {
        lock(&self.index).content(content_hash).cloned()
    }

    /// Where the artifact for `source` lives, mirrored from its
    /// watched-directory-relative path.
    fn artifact_path(&self, source: &Path, created_at: &DateTime<Utc>, algorithm: Algorithm) -> PathBuf {
        let owner = self
            .watched
            .iter()
            .filter(|dir| source.starts_with(dir))
            .max_by_key(|dir| dir.components().count());

        let mirrored = match owner {
            Some(dir) => {
                let name = dir
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| "root".into());
                let relative = source.strip_prefix(dir).unwrap_or(source);
                self.files_root().join(name).join(relative)
            }
            None => self
                .files_root()
                .join(EXTERNAL_DIR)
                .join(relative_components(source)),
        };

        let file_name = mirrored
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        mirrored.with_file_name(format!(
            "{}.{}{}",
            file_name,
            artifact_timestamp(created_at),
            algorithm.extension()
        ))
    }

    /// Back up one file, deduplicating by content. `None` when the path is
    /// ignored, gone, or unchanged since its last backup.
    pub fn backup_file(
        &self,
        path: &Path,
        compressor: Option<&Compressor>,
    ) -> Result<Option<BackupRecord>> {
        if self.filter.is_ignored(path) {
            return Ok(None);
        }
        let meta = match FileMetadata::from_path(path) {
            Ok(meta) if meta.is_file => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content_hash = checksum::hash_file(path)?;

        let mut index = lock(&self.index);
        if let Some(entry) = index.entry(path) {
            if entry.content_hash == content_hash && entry.modified_at >= meta.modified {
                debug!(path = %path.display(), "Unchanged, skipped");
                return Ok(None);
            }
        }

        let created_at = now();
        let expires_at = created_at + Duration::days(self.retention_days);

        if let Some(existing) = index.content(&content_hash).cloned() {
            return self
                .create_reference(&mut index, path, &meta, existing, created_at, expires_at)
                .map(Some);
        }

        // New content: copy (and compress) while hashing the bytes actually read.
        let algorithm = compressor
            .map(|c| c.effective_algorithm())
            .unwrap_or(Algorithm::None);
        let target = self.artifact_path(path, &created_at, algorithm);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut staged = StagedPaths::new();
        let staging = staged.track(partial_path(&target));
        let mut reader = HashingReader::new(BufReader::new(File::open(path)?));
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            match compressor {
                Some(c) => {
                    c.compress_stream(&mut reader, &mut writer)?;
                }
                None => {
                    io::copy(&mut reader, &mut writer)?;
                }
            }
            writer.flush()?;
        }
        let (copied_hash, copied_size) = reader.finalize();

        if copied_hash != content_hash {
            debug!(path = %path.display(), "File changed while copying, using copied bytes");
            if let Some(existing) = index.content(&copied_hash).cloned() {
                drop(staged);
                let meta = FileMetadata {
                    size: copied_size,
                    ..meta
                };
                return self
                    .create_reference(&mut index, path, &meta, existing, created_at, expires_at)
                    .map(Some);
            }
        }

        commit_file(&staging, &target)?;
        staged.track(&target);
        let stored_size = std::fs::metadata(&target)?.len();
        let artifact_checksum = checksum::hash_file(&target)?;

        let record = BackupRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind: BackupKind::FileBackup,
            created_at,
            path: target.clone(),
            source_path: Some(path.to_path_buf()),
            reference_target: None,
            original_size: copied_size,
            stored_size,
            checksum: artifact_checksum.clone(),
            content_hash: Some(copied_hash.clone()),
            compression: algorithm,
            expires_at,
            status: RecordStatus::Active,
            metadata: serde_json::json!({
                "permissions": meta.permissions,
                "modified_at": meta.modified,
            }),
        };
        let content = ContentHashEntry {
            content_hash: copied_hash.clone(),
            record_id: record.id.clone(),
            artifact_path: target,
            checksum: artifact_checksum,
            compression: algorithm,
            size: copied_size,
            ref_count: 1,
            created_at,
        };
        let entry = FileIndexEntry {
            path: path.to_path_buf(),
            content_hash: copied_hash,
            size: copied_size,
            modified_at: meta.modified,
            permissions: meta.permissions,
            record_id: record.id.clone(),
            updated_at: created_at,
        };

        index.commit(
            &self.store,
            IndexUpdate {
                insert_records: vec![record.clone()],
                upsert_entries: vec![entry],
                upsert_contents: vec![content],
                ..Default::default()
            },
        )?;
        staged.commit();

        debug!(
            record_id = %record.id,
            path = %path.display(),
            size = copied_size,
            "File backed up"
        );
        Ok(Some(record))
    }

    fn create_reference(
        &self,
        index: &mut MutexGuard<'_, FileIndexState>,
        path: &Path,
        meta: &FileMetadata,
        mut content: ContentHashEntry,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<BackupRecord> {
        let record = BackupRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind: BackupKind::FileReference,
            created_at,
            path: content.artifact_path.clone(),
            source_path: Some(path.to_path_buf()),
            reference_target: Some(content.record_id.clone()),
            original_size: meta.size,
            stored_size: 0,
            checksum: content.checksum.clone(),
            content_hash: Some(content.content_hash.clone()),
            compression: content.compression,
            expires_at,
            status: RecordStatus::Active,
            metadata: serde_json::json!({
                "permissions": meta.permissions,
                "modified_at": meta.modified,
                "dedup_saved": meta.size,
            }),
        };
        content.ref_count += 1;
        let entry = FileIndexEntry {
            path: path.to_path_buf(),
            content_hash: content.content_hash.clone(),
            size: meta.size,
            modified_at: meta.modified,
            permissions: meta.permissions,
            record_id: record.id.clone(),
            updated_at: created_at,
        };

        index.commit(
            &self.store,
            IndexUpdate {
                insert_records: vec![record.clone()],
                upsert_entries: vec![entry],
                upsert_contents: vec![content],
                ..Default::default()
            },
        )?;
        debug!(
            record_id = %record.id,
            path = %path.display(),
            saved = meta.size,
            "Deduplicated against existing content"
        );
        Ok(record)
    }

    /// Drain the pending queue. Individual failures are logged, not returned.
    pub fn process_queue(&self, compressor: Option<&Compressor>) -> Vec<BackupRecord> {
        self.process_queue_until(compressor, &CancellationToken::new())
            .records
    }

    /// Drain the pending queue, stopping between files once `cancel` fires.
    /// Unprocessed paths go back on the queue.
    pub fn process_queue_until(
        &self,
        compressor: Option<&Compressor>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let pending = self.queue.drain();
        let mut outcome = BatchOutcome::default();
        let mut rest = pending.into_iter();
        for path in rest.by_ref() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                self.queue.push(path);
                break;
            }
            self.backup_one(&path, compressor, &mut outcome);
        }
        for path in rest {
            self.queue.push(path);
        }
        outcome
    }

    fn backup_one(&self, path: &Path, compressor: Option<&Compressor>, outcome: &mut BatchOutcome) {
        match self.backup_file(path, compressor) {
            Ok(Some(record)) => outcome.records.push(record),
            Ok(None) => {}
            Err(e) => {
                warn!(path = %path.display(), "File backup failed: {}", e);
                outcome.failed.push(FailedFile {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Back up every eligible file under `dir`.
    pub fn backup_directory(
        &self,
        dir: &Path,
        compressor: Option<&Compressor>,
    ) -> Result<Vec<BackupRecord>> {
        Ok(self
            .backup_directory_until(dir, compressor, &CancellationToken::new())?
            .records)
    }

    /// Like [`Self::backup_directory`], honouring `cancel` between files.
    pub fn backup_directory_until(
        &self,
        dir: &Path,
        compressor: Option<&Compressor>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let summary = walker::walk_directory_with_callback(
            dir,
            &WalkOptions::default(),
            &self.filter,
            |file| {
                if cancel.is_cancelled() {
                    return ControlFlow::Break(());
                }
                self.backup_one(&file.path, compressor, &mut outcome);
                ControlFlow::Continue(())
            },
        )?;
        outcome.walk_errors = summary.errors;
        outcome.cancelled = summary.stopped;
        info!(
            dir = %dir.display(),
            walked = summary.files,
            backed_up = outcome.records.len(),
            failed = outcome.failed.len(),
            "Directory backup finished"
        );
        Ok(outcome)
    }

    /// Walk every watched directory. A directory that cannot be walked is
    /// reported in `walk_errors` and the rest continue.
    pub fn backup_watched(&self, compressor: Option<&Compressor>, cancel: &CancellationToken) -> BatchOutcome {
        let mut total = BatchOutcome::default();
        for dir in &self.watched {
            if cancel.is_cancelled() {
                total.cancelled = true;
                break;
            }
            match self.backup_directory_until(dir, compressor, cancel) {
                Ok(outcome) => total.merge(outcome),
                Err(e) => {
                    warn!(dir = %dir.display(), "Directory walk failed: {}", e);
                    total.walk_errors.push(format!("{}: {}", dir.display(), e));
                }
            }
        }
        total
    }

    /// Expire file records. Each expiry releases one reference; an artifact is
    /// deleted only when its last reference goes.
    pub fn cleanup_expired(&self) -> Result<FileCleanup> {
        let now = now();
        let mut expired = Vec::new();
        for kind in [BackupKind::FileReference, BackupKind::FileBackup] {
            expired.extend(
                self.store
                    .with_conn(|conn| records::find_expired(conn, kind, &now))?,
            );
        }

        let mut cleanup = FileCleanup::default();
        let mut index = lock(&self.index);
        for record in expired {
            let mut update = IndexUpdate {
                delete_records: vec![record.id.clone()],
                release_entries_of: vec![record.id.clone()],
                ..Default::default()
            };
            let mut release: Option<PathBuf> = None;

            let content = record
                .content_hash
                .as_deref()
                .and_then(|hash| index.content(hash).cloned());
            match content {
                Some(mut content) if content.ref_count > 1 => {
                    content.ref_count -= 1;
                    if content.record_id == record.id {
                        // Re-point at a surviving record.
                        let survivors = self.store.with_conn(|conn| {
                            records::find_by_content_hash(conn, &content.content_hash)
                        })?;
                        if let Some(next) = survivors
                            .iter()
                            .find(|r| r.id != record.id && r.kind != BackupKind::WalIncrement)
                        {
                            content.record_id = next.id.clone();
                        }
                    }
                    update.upsert_contents.push(content);
                }
                Some(content) => {
                    update.delete_contents.push(content.content_hash.clone());
                    release = Some(content.artifact_path);
                }
                None if record.kind == BackupKind::FileBackup => {
                    release = Some(record.path.clone());
                }
                None => {}
            }

            let freed = release
                .as_ref()
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .unwrap_or(0);
            if let Some(path) = &release {
                if let Err(e) = remove_path(path) {
                    warn!(record_id = %record.id, "Failed to remove artifact: {}", e);
                    continue;
                }
            }

            index.commit(&self.store, update)?;
            if let Some(path) = release {
                cleanup.bytes_freed += freed;
                cleanup.released_artifacts.push(path);
            }
            cleanup.removed_records.push(record);
        }

        if !cleanup.removed_records.is_empty() {
            info!(
                records = cleanup.removed_records.len(),
                artifacts = cleanup.released_artifacts.len(),
                bytes = cleanup.bytes_freed,
                "Expired file backups removed"
            );
        }
        Ok(cleanup)
    }

    pub fn status(&self) -> Result<FileEngineStatus> {
        let deduplicated_bytes = self
            .store
            .with_conn(|conn| records::sum_original_size(conn, BackupKind::FileReference))?;
        let index = lock(&self.index);
        Ok(FileEngineStatus {
            watched_directories: self.watched.clone(),
            watching: self.is_watching(),
            pending: self.queue.len(),
            indexed_files: index.len(),
            unique_contents: index.content_count(),
            deduplicated_bytes,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
