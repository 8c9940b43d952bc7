//! Storage backends: a fixed capability set over a local or remote namespace.
//!
//! Keys are `/`-separated and relative to the backend root. "Not found" is a
//! normal result (`Ok(false)` / `Ok(None)`) for `exists`, `stat` and `delete`;
//! `download` of a missing key is `Err(EngineError::NotFound)`.

pub mod local;
pub mod s3;
pub mod sftp;

use crate::config::StorageBackendConfig;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use local::LocalBackend;
pub use s3::S3Backend;
pub use sftp::SftpBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    Sftp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileInfo {
    pub key: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Point-in-time health of one backend. Produced even when unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub kind: BackendKind,
    pub reachable: bool,
    pub object_count: Option<u64>,
    pub total_size: Option<u64>,
    pub free_space: Option<u64>,
    pub error: Option<String>,
}

impl BackendStatus {
    pub fn unreachable(name: &str, kind: BackendKind, error: impl ToString) -> Self {
        BackendStatus {
            name: name.to_string(),
            kind,
            reachable: false,
            object_count: None,
            total_size: None,
            free_space: None,
            error: Some(error.to_string()),
        }
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()>;

    async fn download(&self, key: &str, local_path: &Path) -> Result<()>;

    /// `Ok(false)` when there was nothing to delete
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Every key under `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn stat(&self, key: &str) -> Result<Option<RemoteFileInfo>>;

    async fn info(&self) -> BackendStatus;
}

pub type SharedBackend = Arc<dyn StorageBackend>;

/// Build a backend handle from its configuration. No network traffic happens
/// here except what the S3 SDK needs to resolve its own configuration.
pub async fn create_backend(config: &StorageBackendConfig) -> Result<SharedBackend> {
    let name = config.name();
    let backend: SharedBackend = match config {
        StorageBackendConfig::Local { root, .. } => Arc::new(LocalBackend::new(name, root.clone())),
        StorageBackendConfig::S3 { .. } => Arc::new(S3Backend::from_config(name, config).await?),
        StorageBackendConfig::Sftp { .. } => Arc::new(SftpBackend::from_config(name, config)?),
    };
    tracing::debug!(backend = %backend.name(), kind = ?backend.kind(), "Storage backend created");
    Ok(backend)
}

pub async fn create_backends(configs: &[StorageBackendConfig]) -> Result<Vec<SharedBackend>> {
    let mut backends = Vec::with_capacity(configs.len());
    for config in configs {
        backends.push(create_backend(config).await?);
    }
    Ok(backends)
}

/// `prefix/key` with redundant slashes removed.
pub(crate) fn join_key(prefix: Option<&str>, key: &str) -> String {
    let key = key.trim_start_matches('/');
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, key),
        None => key.to_string(),
    }
}

/// Rejects keys that would escape the backend root.
pub(crate) fn check_key(backend: &str, key: &str) -> Result<()> {
    if key.split('/').any(|part| part == "..") {
        return Err(crate::EngineError::storage(
            backend,
            format!("Invalid key '{}'", key),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(None, "a/b"), "a/b");
        assert_eq!(join_key(Some("backups/"), "/a/b"), "backups/a/b");
        assert_eq!(join_key(Some(""), "a"), "a");
    }

    #[test]
    fn test_check_key_rejects_parent_dirs() {
        assert!(check_key("t", "database/full/x.db").is_ok());
        assert!(check_key("t", "../etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_factory_builds_local() -> Result<()> {
        let backend = create_backend(&StorageBackendConfig::Local {
            name: Some("replica".into()),
            root: "/tmp/does-not-matter".into(),
        })
        .await?;
        assert_eq!(backend.name(), "replica");
        assert_eq!(backend.kind(), BackendKind::Local);
        Ok(())
    }
}
