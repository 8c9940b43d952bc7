//! Concurrent fan-out of artifacts and status queries to every configured
//! storage backend.

use super::operation::BackendUploadResult;
use crate::metadata::{BackupKind, BackupRecord};
use crate::storage::{BackendStatus, SharedBackend};
use crate::utils::fs::remote_key;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub local_path: PathBuf,
    pub key: String,
    pub size: u64,
}

/// Every file that has to reach the backends for `records`. References
/// share their canonical artifact and contribute nothing.
pub fn upload_items(records: &[BackupRecord], backup_root: &Path) -> Vec<UploadItem> {
    records
        .iter()
        .filter(|r| r.kind != BackupKind::FileReference)
        .flat_map(|r| r.artifact_files())
        .map(|path| UploadItem {
            key: remote_key(backup_root, &path),
            size: std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
            local_path: path,
        })
        .collect()
}

/// Progress shared with a backend task so a timeout still reports what landed.
#[derive(Default)]
struct Progress {
    uploaded: AtomicUsize,
    bytes: AtomicU64,
}

/// Uploads `items` to each backend. Backends run concurrently, at most
/// `max_workers` at a time, each bounded by `timeout`. One backend's failure
/// never affects another. Results come back in backend order.
pub async fn upload_to_backends(
    backends: &[SharedBackend],
    items: Arc<Vec<UploadItem>>,
    max_workers: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<BackendUploadResult> {
    if backends.is_empty() {
        return Vec::new();
    }

    let workers = backends.len().min(max_workers.max(1));
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    info!(
        backends = backends.len(),
        items = items.len(),
        workers,
        "Uploading artifacts"
    );

    for (idx, backend) in backends.iter().enumerate() {
        let backend = backend.clone();
        let items = items.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let name = backend.name().to_string();
            let progress = Arc::new(Progress::default());

            let error = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let run = upload_all(backend, items.clone(), progress.clone(), cancel);
                    match tokio::time::timeout(timeout, run).await {
                        Ok(result) => result.err(),
                        Err(_) => Some(format!("upload timed out after {}s", timeout.as_secs())),
                    }
                }
                Err(e) => Some(e.to_string()),
            };

            let uploaded = progress.uploaded.load(Ordering::Relaxed);
            let result = BackendUploadResult {
                backend: name,
                uploaded,
                failed: items.len().saturating_sub(uploaded),
                bytes: progress.bytes.load(Ordering::Relaxed),
                error,
            };
            (idx, result)
        });
    }

    let mut results: Vec<Option<BackendUploadResult>> = vec![None; backends.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, result)) => {
                if let Some(err) = &result.error {
                    warn!(backend = %result.backend, uploaded = result.uploaded, "Upload failed: {}", err);
                } else {
                    debug!(backend = %result.backend, uploaded = result.uploaded, "Upload finished");
                }
                results[idx] = Some(result);
            }
            Err(e) => warn!("Upload task aborted: {}", e),
        }
    }

    results
        .into_iter()
        .enumerate()
        .map(|(idx, result)| {
            result.unwrap_or_else(|| BackendUploadResult {
                backend: backends[idx].name().to_string(),
                uploaded: 0,
                failed: items.len(),
                bytes: 0,
                error: Some("upload task aborted".into()),
            })
        })
        .collect()
}

/// Sequential uploads to one backend; stops at the first error.
async fn upload_all(
    backend: SharedBackend,
    items: Arc<Vec<UploadItem>>,
    progress: Arc<Progress>,
    cancel: CancellationToken,
) -> std::result::Result<(), String> {
    for item in items.iter() {
        if cancel.is_cancelled() {
            return Err("cancelled".into());
        }
        backend
            .upload(&item.local_path, &item.key)
            .await
            .map_err(|e| format!("{}: {}", item.key, e))?;
        progress.uploaded.fetch_add(1, Ordering::Relaxed);
        progress.bytes.fetch_add(item.size, Ordering::Relaxed);
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteDeletion {
    pub backend: String,
    pub deleted: usize,
    pub errors: Vec<String>,
}

/// Best-effort deletion of `keys` on every backend, each bounded by `timeout`.
pub async fn delete_from_backends(
    backends: &[SharedBackend],
    keys: Arc<Vec<String>>,
    timeout: Duration,
) -> Vec<RemoteDeletion> {
    let mut tasks = JoinSet::new();
    for (idx, backend) in backends.iter().enumerate() {
        let backend = backend.clone();
        let keys = keys.clone();
        tasks.spawn(async move {
            let mut outcome = RemoteDeletion {
                backend: backend.name().to_string(),
                ..Default::default()
            };
            let run = async {
                for key in keys.iter() {
                    match backend.delete(key).await {
                        Ok(true) => outcome.deleted += 1,
                        Ok(false) => {}
                        Err(e) => outcome.errors.push(format!("{}: {}", key, e)),
                    }
                }
            };
            if tokio::time::timeout(timeout, run).await.is_err() {
                outcome
                    .errors
                    .push(format!("deletion timed out after {}s", timeout.as_secs()));
            }
            (idx, outcome)
        });
    }

    let mut results: Vec<(usize, RemoteDeletion)> = Vec::with_capacity(backends.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => {
                for err in &entry.1.errors {
                    warn!(backend = %entry.1.backend, "Remote cleanup failed: {}", err);
                }
                results.push(entry);
            }
            Err(e) => warn!("Remote cleanup task aborted: {}", e),
        }
    }
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, r)| r).collect()
}

/// Health of every backend, queried concurrently and returned in backend
/// order. A backend that does not answer within `timeout` is unreachable.
pub async fn backend_statuses(backends: &[SharedBackend], timeout: Duration) -> Vec<BackendStatus> {
    let mut tasks = JoinSet::new();
    for (idx, backend) in backends.iter().enumerate() {
        let backend = backend.clone();
        tasks.spawn(async move {
            let status = match tokio::time::timeout(timeout, backend.info()).await {
                Ok(status) => status,
                Err(_) => BackendStatus::unreachable(
                    backend.name(),
                    backend.kind(),
                    format!("status timed out after {}s", timeout.as_secs_f64()),
                ),
            };
            (idx, status)
        });
    }

    let mut results: Vec<(usize, BackendStatus)> = Vec::with_capacity(backends.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => results.push(entry),
            Err(e) => warn!("Backend status task aborted: {}", e),
        }
    }
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackendKind, LocalBackend, RemoteFileInfo, StorageBackend};
    use crate::utils::errors::Result;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    /// Never answers a status query in time.
    struct Stalled;

    #[async_trait]
    impl StorageBackend for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Sftp
        }

        async fn upload(&self, _local_path: &Path, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn download(&self, key: &str, _local_path: &Path) -> Result<()> {
            Err(crate::utils::errors::EngineError::NotFound(key.to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn exists(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn stat(&self, _key: &str) -> Result<Option<RemoteFileInfo>> {
            Ok(None)
        }

        async fn info(&self) -> BackendStatus {
            tokio::time::sleep(Duration::from_secs(60)).await;
            BackendStatus::unreachable("stalled", BackendKind::Sftp, "unreachable")
        }
    }

    fn items(dir: &Path, count: usize) -> Vec<UploadItem> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("artifact-{}.bin", i));
                fs::write(&path, vec![i as u8; 64]).unwrap();
                UploadItem {
                    key: format!("database/full/artifact-{}.bin", i),
                    size: 64,
                    local_path: path,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let good: SharedBackend = Arc::new(LocalBackend::new("good", temp_dir.path().join("good")));
        let bad: SharedBackend = Arc::new(LocalBackend::new("bad", blocker.join("remote")));
        let items = Arc::new(items(temp_dir.path(), 2));

        let results = upload_to_backends(
            &[good.clone(), bad],
            items,
            4,
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].succeeded());
        assert_eq!(results[0].uploaded, 2);
        assert_eq!(results[0].bytes, 128);
        assert!(!results[1].succeeded());
        assert_eq!(results[1].failed, 2);
        assert!(good.exists("database/full/artifact-1.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_upload_reports_failure() {
        let temp_dir = TempDir::new().unwrap();
        let backend: SharedBackend = Arc::new(LocalBackend::new("local", temp_dir.path().join("remote")));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = upload_to_backends(
            &[backend],
            Arc::new(items(temp_dir.path(), 1)),
            1,
            Duration::from_secs(30),
            &cancel,
        )
        .await;
        assert_eq!(results[0].uploaded, 0);
        assert_eq!(results[0].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_delete_from_backends() {
        let temp_dir = TempDir::new().unwrap();
        let backend: SharedBackend = Arc::new(LocalBackend::new("local", temp_dir.path().join("remote")));
        let items = items(temp_dir.path(), 1);
        backend.upload(&items[0].local_path, &items[0].key).await.unwrap();

        let keys = Arc::new(vec![items[0].key.clone(), "missing/key".to_string()]);
        let outcome = delete_from_backends(&[backend.clone()], keys, Duration::from_secs(30)).await;
        assert_eq!(outcome[0].deleted, 1);
        assert!(outcome[0].errors.is_empty());
        assert!(!backend.exists(&items[0].key).await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_backend_does_not_hold_up_status() {
        let temp_dir = TempDir::new().unwrap();
        let stalled: SharedBackend = Arc::new(Stalled);
        let local: SharedBackend = Arc::new(LocalBackend::new("local", temp_dir.path().join("remote")));

        let started = std::time::Instant::now();
        let statuses = backend_statuses(&[stalled, local], Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(10));

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].name, "stalled");
        assert!(!statuses[0].reachable);
        assert!(statuses[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(statuses[1].name, "local");
        assert!(statuses[1].reachable, "{:?}", statuses[1].error);
    }
}
