//! Engine configuration.
//!
//! The engine receives an [`EngineConfig`] once at construction and never reads
//! the environment itself. [`EngineConfig::from_file`] exists for the host binary.

use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::paths_overlap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Primary SQLite database file
    pub database_path: PathBuf,

    /// Root directory for every artifact the engine produces
    pub backup_root: PathBuf,

    /// Metadata directory (default: `<backup_root>/metadata`)
    #[serde(default)]
    pub metadata_dir: Option<PathBuf>,

    /// Directory trees monitored for file backups
    #[serde(default)]
    pub watched_directories: Vec<PathBuf>,

    #[serde(default)]
    pub ignore: IgnoreConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    /// Remote/local targets artifacts are replicated to
    #[serde(default)]
    pub storage: Vec<StorageBackendConfig>,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoreConfig {
    /// File name suffixes that are never backed up
    #[serde(default = "default_ignored_extensions")]
    pub extensions: Vec<String>,

    /// Path substrings that are never backed up
    #[serde(default = "default_ignored_substrings")]
    pub substrings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_full_backup_days")]
    pub full_backup_days: i64,

    #[serde(default = "default_wal_increment_hours")]
    pub wal_increment_hours: i64,

    #[serde(default = "default_file_backup_days")]
    pub file_backup_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_compression_enabled")]
    pub enabled: bool,

    /// Preferred algorithm (zstd, gzip, none)
    #[serde(default = "default_compression")]
    pub algorithm: String,

    /// Compression level (1-22 for zstd, 0-9 for gzip)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageBackendConfig {
    Local {
        #[serde(default)]
        name: Option<String>,
        root: PathBuf,
    },
    S3 {
        #[serde(default)]
        name: Option<String>,
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        /// Custom endpoint for non-AWS providers (MinIO, Wasabi, R2, ...)
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        #[serde(default)]
        session_token: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        force_path_style: bool,
    },
    Sftp {
        #[serde(default)]
        name: Option<String>,
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        private_key: Option<PathBuf>,
        #[serde(default)]
        passphrase: Option<String>,
        root: String,
        #[serde(default = "default_ssh_timeout_secs")]
        timeout_secs: u64,
    },
}

impl StorageBackendConfig {
    /// Display name used in logs and operation results
    pub fn name(&self) -> String {
        match self {
            StorageBackendConfig::Local { name, root } => name
                .clone()
                .unwrap_or_else(|| format!("local:{}", root.display())),
            StorageBackendConfig::S3 { name, bucket, .. } => {
                name.clone().unwrap_or_else(|| format!("s3:{}", bucket))
            }
            StorageBackendConfig::Sftp { name, host, .. } => {
                name.clone().unwrap_or_else(|| format!("sftp:{}", host))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Upper bound on concurrently uploading backends
    #[serde(default = "default_upload_workers")]
    pub max_workers: usize,

    /// Per-backend timeout for one operation's uploads
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Tables whose row counts are recorded with each full backup (empty = all)
    #[serde(default)]
    pub key_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Directories that must exist after a system recovery (empty = watched directories)
    #[serde(default)]
    pub expected_directories: Vec<PathBuf>,

    /// Number of restored files whose checksums are re-verified
    #[serde(default = "default_validation_sample_size")]
    pub validation_sample_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Operation history entries kept after cleanup
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_ignored_extensions() -> Vec<String> {
    [
        ".tmp", ".temp", ".swp", ".lock", ".part", ".partial", "~", "-journal", "-wal", "-shm",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ignored_substrings() -> Vec<String> {
    [
        "/.git/",
        "/.svn/",
        "/.hg/",
        "/__pycache__/",
        "/node_modules/",
        ".DS_Store",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_full_backup_days() -> i64 {
    30
}

fn default_wal_increment_hours() -> i64 {
    24
}

fn default_file_backup_days() -> i64 {
    30
}

fn default_compression_enabled() -> bool {
    true
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_timeout_secs() -> u64 {
    30
}

fn default_upload_workers() -> usize {
    4
}

fn default_upload_timeout_secs() -> u64 {
    600
}

fn default_validation_sample_size() -> usize {
    10
}

fn default_max_operations() -> usize {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            extensions: default_ignored_extensions(),
            substrings: default_ignored_substrings(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            full_backup_days: default_full_backup_days(),
            wal_increment_hours: default_wal_increment_hours(),
            file_backup_days: default_file_backup_days(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: default_compression_enabled(),
            algorithm: default_compression(),
            level: default_compression_level(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_workers: default_upload_workers(),
            timeout_secs: default_upload_timeout_secs(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            expected_directories: Vec::new(),
            validation_sample_size: default_validation_sample_size(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Minimal configuration with every optional section at its default
    pub fn new(database_path: impl Into<PathBuf>, backup_root: impl Into<PathBuf>) -> Self {
        EngineConfig {
            database_path: database_path.into(),
            backup_root: backup_root.into(),
            metadata_dir: None,
            watched_directories: Vec::new(),
            ignore: IgnoreConfig::default(),
            retention: RetentionConfig::default(),
            compression: CompressionConfig::default(),
            storage: Vec::new(),
            upload: UploadConfig::default(),
            database: DatabaseConfig::default(),
            recovery: RecoveryConfig::default(),
            history: HistoryConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.metadata_dir
            .clone()
            .unwrap_or_else(|| self.backup_root.join("metadata"))
    }

    /// Directories a recovered system must contain
    pub fn expected_directories(&self) -> Vec<PathBuf> {
        if self.recovery.expected_directories.is_empty() {
            self.watched_directories.clone()
        } else {
            self.recovery.expected_directories.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(EngineError::Configuration("database_path is required".into()));
        }
        if self.backup_root.as_os_str().is_empty() {
            return Err(EngineError::Configuration("backup_root is required".into()));
        }
        if self.upload.max_workers == 0 {
            return Err(EngineError::Configuration(
                "upload.max_workers must be at least 1".into(),
            ));
        }
        if !matches!(self.compression.algorithm.as_str(), "zstd" | "gzip" | "none") {
            return Err(EngineError::Configuration(format!(
                "Unknown compression algorithm '{}'",
                self.compression.algorithm
            )));
        }
        let metadata_dir = self.metadata_dir();
        for dir in &self.watched_directories {
            if dir.as_os_str().is_empty() {
                return Err(EngineError::Configuration(
                    "watched_directories contains an empty path".into(),
                ));
            }
            for (label, owned) in [("backup_root", &self.backup_root), ("metadata_dir", &metadata_dir)] {
                if paths_overlap(dir, owned) {
                    return Err(EngineError::Configuration(format!(
                        "{} {} overlaps watched directory {}",
                        label,
                        owned.display(),
                        dir.display()
                    )));
                }
            }
        }
        for backend in &self.storage {
            validate_backend(backend)?;
        }
        Ok(())
    }
}

fn validate_backend(backend: &StorageBackendConfig) -> Result<()> {
    let name = backend.name();
    match backend {
        StorageBackendConfig::Local { root, .. } => {
            if root.as_os_str().is_empty() {
                return Err(EngineError::Configuration(format!("{}: root is required", name)));
            }
        }
        StorageBackendConfig::S3 {
            bucket,
            access_key_id,
            secret_access_key,
            ..
        } => {
            if bucket.is_empty() {
                return Err(EngineError::Configuration(format!("{}: bucket is required", name)));
            }
            if access_key_id.is_some() != secret_access_key.is_some() {
                return Err(EngineError::Configuration(format!(
                    "{}: access_key_id and secret_access_key must be set together",
                    name
                )));
            }
        }
        StorageBackendConfig::Sftp {
            host,
            username,
            password,
            private_key,
            root,
            ..
        } => {
            if host.is_empty() || username.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "{}: host and username are required",
                    name
                )));
            }
            if root.is_empty() {
                return Err(EngineError::Configuration(format!("{}: root is required", name)));
            }
            if password.is_none() && private_key.is_none() {
                return Err(EngineError::Configuration(format!(
                    "{}: either password or private_key is required",
                    name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_with_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            database_path = "/srv/app/app.db"
            backup_root = "/srv/backups"
            watched_directories = ["/srv/app/uploads"]

            [[storage]]
            kind = "local"
            root = "/mnt/replica"

            [[storage]]
            kind = "s3"
            bucket = "app-backups"
            endpoint = "http://minio:9000"
            force_path_style = true

            [[storage]]
            kind = "sftp"
            host = "backup.example.org"
            username = "backup"
            private_key = "/etc/backup/id_ed25519"
            root = "/data/app"
            "#,
        )
        .unwrap();

        assert_eq!(config.retention.full_backup_days, 30);
        assert_eq!(config.retention.wal_increment_hours, 24);
        assert_eq!(config.compression.algorithm, "zstd");
        assert_eq!(config.storage.len(), 3);
        assert_eq!(config.storage[1].name(), "s3:app-backups");
        assert_eq!(config.metadata_dir(), PathBuf::from("/srv/backups/metadata"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_sftp_without_credentials() {
        let mut config = EngineConfig::new("/srv/app.db", "/srv/backups");
        config.storage.push(StorageBackendConfig::Sftp {
            name: None,
            host: "host".into(),
            port: 22,
            username: "user".into(),
            password: None,
            private_key: None,
            passphrase: None,
            root: "/backups".into(),
            timeout_secs: 30,
        });

        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_algorithm() {
        let mut config = EngineConfig::new("/srv/app.db", "/srv/backups");
        config.compression.algorithm = "brotli".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_backup_root_inside_watched_directory() {
        let mut config = EngineConfig::new("/srv/app.db", "/srv/data/backups");
        config.watched_directories = vec![PathBuf::from("/srv/data")];
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));

        let mut config = EngineConfig::new("/srv/app.db", "/srv/backups");
        config.metadata_dir = Some(PathBuf::from("/srv/uploads/.meta"));
        config.watched_directories = vec![PathBuf::from("/srv/uploads")];
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));

        config.metadata_dir = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expected_directories_default_to_watched() {
        let mut config = EngineConfig::new("/srv/app.db", "/srv/backups");
        config.watched_directories = vec![PathBuf::from("/srv/uploads")];
        assert_eq!(config.expected_directories(), vec![PathBuf::from("/srv/uploads")]);
    }
}
