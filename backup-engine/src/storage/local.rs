//! Filesystem-backed storage: a directory tree rooted at `root`.

use super::{check_key, BackendKind, BackendStatus, RemoteFileInfo, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::{partial_path, remote_key};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct LocalBackend {
    name: String,
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, root: PathBuf) -> Self {
        Self {
            name: name.into(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        check_key(&self.name, key)?;
        Ok(self.root.join(key.trim_start_matches('/')))
    }

    fn err(&self, action: &str, key: &str, e: io::Error) -> EngineError {
        EngineError::storage(&self.name, format!("{} '{}': {}", action, key, e))
    }
}

fn walk_files(root: &Path) -> Vec<(String, u64)> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.file_name().to_string_lossy().ends_with(".partial"))
        .map(|e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            (remote_key(root, e.path()), size)
        })
        .collect()
}

#[cfg(unix)]
fn free_space(root: &Path) -> Option<u64> {
    nix::sys::statvfs::statvfs(root)
        .ok()
        .map(|st| st.blocks_available() as u64 * st.fragment_size() as u64)
}

#[cfg(not(unix))]
fn free_space(_root: &Path) -> Option<u64> {
    None
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.err("create directory for", key, e))?;
        }
        let staged = partial_path(&target);
        tokio::fs::copy(local_path, &staged)
            .await
            .map_err(|e| self.err("upload", key, e))?;
        if let Err(e) = tokio::fs::rename(&staged, &target).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(self.err("upload", key, e));
        }
        tracing::debug!(backend = %self.name, key, "Uploaded");
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<()> {
        let source = self.resolve(key)?;
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(EngineError::NotFound(format!("{}: {}", self.name, key)));
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged = partial_path(local_path);
        if let Err(e) = tokio::fs::copy(&source, &staged).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(self.err("download", key, e));
        }
        if let Err(e) = tokio::fs::rename(&staged, local_path).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(self.err("download", key, e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let target = self.resolve(key)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.err("delete", key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();
        let mut keys: Vec<String> = tokio::task::spawn_blocking(move || walk_files(&root))
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let target = self.resolve(key)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.err("stat", key, e)),
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<RemoteFileInfo>> {
        let target = self.resolve(key)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => Ok(Some(RemoteFileInfo {
                key: key.to_string(),
                size: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.err("stat", key, e)),
        }
    }

    async fn info(&self) -> BackendStatus {
        if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
            return BackendStatus::unreachable(&self.name, self.kind(), e);
        }
        let root = self.root.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            let files = walk_files(&root);
            (files, free_space(&root))
        })
        .await;
        match scanned {
            Ok((files, free)) => BackendStatus {
                name: self.name.clone(),
                kind: self.kind(),
                reachable: true,
                object_count: Some(files.len() as u64),
                total_size: Some(files.iter().map(|(_, size)| size).sum()),
                free_space: free,
                error: None,
            },
            Err(e) => BackendStatus::unreachable(&self.name, self.kind(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_download_list() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = LocalBackend::new("local", temp_dir.path().join("remote"));
        let src = temp_dir.path().join("artifact.bin");
        std::fs::write(&src, b"payload")?;

        backend.upload(&src, "database/full/a.db").await?;
        backend.upload(&src, "files/docs/b.txt").await?;

        assert!(backend.exists("database/full/a.db").await?);
        assert_eq!(backend.list("database/").await?, vec!["database/full/a.db"]);
        assert_eq!(backend.list("").await?.len(), 2);

        let dst = temp_dir.path().join("restored/a.db");
        backend.download("database/full/a.db", &dst).await?;
        assert_eq!(std::fs::read(&dst)?, b"payload");

        let info = backend.stat("files/docs/b.txt").await?.unwrap();
        assert_eq!(info.size, 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_keys_are_not_errors() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = LocalBackend::new("local", temp_dir.path().to_path_buf());

        assert!(!backend.exists("nope").await?);
        assert!(backend.stat("nope").await?.is_none());
        assert!(!backend.delete("nope").await?);

        let err = backend
            .download("nope", &temp_dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_download_leaves_destination_untouched() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = LocalBackend::new("local", temp_dir.path().join("remote"));
        // A directory under the key makes the copy fail after the existence check.
        std::fs::create_dir_all(temp_dir.path().join("remote/database/full/a.db"))?;
        let dst = temp_dir.path().join("a.db");
        std::fs::write(&dst, b"previous")?;

        assert!(backend.download("database/full/a.db", &dst).await.is_err());
        assert_eq!(std::fs::read(&dst)?, b"previous");
        assert!(!partial_path(&dst).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_info_reports_unreachable_root() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, b"x")?;
        let backend = LocalBackend::new("broken", blocker.join("root"));

        let status = backend.info().await;
        assert!(!status.reachable);
        assert!(status.error.is_some());

        let src = temp_dir.path().join("a");
        std::fs::write(&src, b"a")?;
        assert!(backend.upload(&src, "a").await.is_err());
        Ok(())
    }
}
