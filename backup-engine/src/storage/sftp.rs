//! SFTP storage over an `ssh2` session.
//!
//! libssh2 is blocking, so every call runs on the blocking pool. One session is
//! cached and reused; it is dropped after any transport-level error and
//! re-established on the next call.

use super::{check_key, BackendKind, BackendStatus, RemoteFileInfo, StorageBackend};
use crate::config::StorageBackendConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::partial_path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ssh2::{ErrorCode, FileStat, RenameFlags, Session, Sftp};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// `LIBSSH2_FX_NO_SUCH_FILE`
const FX_NO_SUCH_FILE: i32 = 2;

#[derive(Debug, Clone)]
enum SftpAuth {
    Password(String),
    Key {
        private_key: PathBuf,
        passphrase: Option<String>,
    },
}

#[derive(Debug)]
struct Settings {
    name: String,
    host: String,
    port: u16,
    username: String,
    auth: SftpAuth,
    root: String,
    timeout: Duration,
}

pub struct SftpBackend {
    settings: Arc<Settings>,
    session: Arc<Mutex<Option<Session>>>,
}

impl SftpBackend {
    pub fn from_config(name: String, config: &StorageBackendConfig) -> Result<Self> {
        let StorageBackendConfig::Sftp {
            host,
            port,
            username,
            password,
            private_key,
            passphrase,
            root,
            timeout_secs,
            ..
        } = config
        else {
            return Err(EngineError::Configuration(
                "Expected SFTP backend configuration".into(),
            ));
        };

        let auth = match (private_key, password) {
            (Some(private_key), _) => SftpAuth::Key {
                private_key: private_key.clone(),
                passphrase: passphrase.clone(),
            },
            (None, Some(password)) => SftpAuth::Password(password.clone()),
            (None, None) => {
                return Err(EngineError::Configuration(format!(
                    "{}: either password or private_key is required",
                    name
                )))
            }
        };

        Ok(Self {
            settings: Arc::new(Settings {
                name,
                host: host.clone(),
                port: *port,
                username: username.clone(),
                auth,
                root: root.trim_end_matches('/').to_string(),
                timeout: Duration::from_secs((*timeout_secs).max(1)),
            }),
            session: Arc::new(Mutex::new(None)),
        })
    }

    fn remote_path(&self, key: &str) -> Result<PathBuf> {
        check_key(&self.settings.name, key)?;
        Ok(self.settings.remote_path(key))
    }

    /// Run `f` against an SFTP channel on the blocking pool.
    async fn with_sftp<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> std::result::Result<T, CallError> + Send + 'static,
    {
        let settings = self.settings.clone();
        let cache = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = cache.lock().unwrap_or_else(|p| p.into_inner());
            if guard.is_none() {
                *guard = Some(settings.connect()?);
            }
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::storage(&settings.name, "no session"));
            };

            let outcome = session
                .sftp()
                .map_err(CallError::from)
                .and_then(|sftp| f(&sftp));
            match outcome {
                Ok(value) => Ok(value),
                Err(e) => {
                    if !e.is_not_found() {
                        *guard = None;
                    }
                    Err(settings.err(e))
                }
            }
        })
        .await?
    }
}

impl Settings {
    fn remote_path(&self, key: &str) -> PathBuf {
        PathBuf::from(format!("{}/{}", self.root, key.trim_start_matches('/')))
    }

    fn err(&self, e: impl std::fmt::Display) -> EngineError {
        EngineError::storage(&self.name, e)
    }

    fn connect(&self) -> Result<Session> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| self.err(format!("resolve {}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| self.err(format!("no address for {}", self.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| self.err(format!("connect {}: {}", addr, e)))?;
        tcp.set_read_timeout(Some(self.timeout))?;
        tcp.set_write_timeout(Some(self.timeout))?;

        let mut sess = Session::new().map_err(|e| self.err(e))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(self.timeout.as_millis() as u32);
        sess.handshake().map_err(|e| self.err(e))?;

        match &self.auth {
            SftpAuth::Password(password) => sess
                .userauth_password(&self.username, password)
                .map_err(|e| self.err(format!("SSH authentication failed: {}", e)))?,
            SftpAuth::Key {
                private_key,
                passphrase,
            } => sess
                .userauth_pubkey_file(&self.username, None, private_key, passphrase.as_deref())
                .map_err(|e| self.err(format!("SSH key authentication failed: {}", e)))?,
        }
        if !sess.authenticated() {
            return Err(self.err("SSH authentication failed"));
        }

        tracing::debug!(backend = %self.name, host = %self.host, "SFTP session established");
        Ok(sess)
    }
}

fn is_not_found(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE))
}

/// `mkdir -p` on the remote side.
fn mkdir_all(sftp: &Sftp, dir: &Path) -> std::result::Result<(), ssh2::Error> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        match sftp.stat(&current) {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => continue,
            Err(e) if is_not_found(&e) => sftp.mkdir(&current, 0o755)?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn list_recursive(
    sftp: &Sftp,
    dir: &Path,
    out: &mut Vec<(PathBuf, FileStat)>,
) -> std::result::Result<(), CallError> {
    let entries = match sftp.readdir(dir) {
        Ok(entries) => entries,
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for (path, stat) in entries {
        if stat.is_dir() {
            list_recursive(sftp, &path, out)?;
        } else if stat.is_file() {
            out.push((path, stat));
        }
    }
    Ok(())
}

/// Failure inside a blocking SFTP closure
#[derive(Debug)]
enum CallError {
    Ssh(ssh2::Error),
    Io(io::Error),
}

impl CallError {
    fn is_not_found(&self) -> bool {
        matches!(self, CallError::Ssh(e) if is_not_found(e))
    }
}

impl From<ssh2::Error> for CallError {
    fn from(e: ssh2::Error) -> Self {
        CallError::Ssh(e)
    }
}

impl From<io::Error> for CallError {
    fn from(e: io::Error) -> Self {
        CallError::Io(e)
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Ssh(e) => write!(f, "{}", e),
            CallError::Io(e) => write!(f, "{}", e),
        }
    }
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sftp
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let target = self.remote_path(key)?;
        let local_path = local_path.to_path_buf();
        self.with_sftp(move |sftp| {
            if let Some(parent) = target.parent() {
                mkdir_all(sftp, parent)?;
            }
            let staged = PathBuf::from(format!("{}.partial", target.display()));
            let mut input = std::fs::File::open(&local_path)?;
            let mut remote = sftp.create(&staged)?;
            io::copy(&mut input, &mut remote)?;
            drop(remote);

            let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
            if sftp.rename(&staged, &target, Some(flags)).is_err() {
                // SFTPv3 servers refuse to overwrite on rename.
                let _ = sftp.unlink(&target);
                sftp.rename(&staged, &target, None)?;
            }
            Ok(())
        })
        .await?;
        tracing::debug!(backend = %self.settings.name, key, "Uploaded");
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<()> {
        let source = self.remote_path(key)?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let local = local_path.to_path_buf();
        let staged = partial_path(local_path);
        let partial = staged.clone();
        let result = self
            .with_sftp(move |sftp| {
                let mut remote = sftp.open(&source)?;
                let mut output = std::fs::File::create(&partial)?;
                io::copy(&mut remote, &mut output)?;
                output.sync_all()?;
                drop(output);
                std::fs::rename(&partial, &local)?;
                Ok(())
            })
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&staged).await;
        }
        match result {
            Err(e) if !self.exists(key).await.unwrap_or(true) => {
                tracing::debug!(backend = %self.settings.name, key, "Download failed: {}", e);
                Err(EngineError::NotFound(format!("{}: {}", self.settings.name, key)))
            }
            other => other,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let target = self.remote_path(key)?;
        self.with_sftp(move |sftp| match sftp.unlink(&target) {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/').to_string();
        let root = self.settings.root.clone();
        // Walk from the deepest directory the prefix names.
        let start = match prefix.rfind('/') {
            Some(idx) => self.settings.remote_path(&prefix[..idx]),
            None => PathBuf::from(&root),
        };
        let files = self
            .with_sftp(move |sftp| {
                let mut out = Vec::new();
                list_recursive(sftp, &start, &mut out)?;
                Ok(out)
            })
            .await?;

        let root_path = PathBuf::from(&self.settings.root);
        let mut keys: Vec<String> = files
            .into_iter()
            .map(|(path, _)| crate::utils::fs::remote_key(&root_path, &path))
            .filter(|key| key.starts_with(&prefix) && !key.ends_with(".partial"))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.stat(key).await?.is_some())
    }

    async fn stat(&self, key: &str) -> Result<Option<RemoteFileInfo>> {
        let target = self.remote_path(key)?;
        let key_owned = key.to_string();
        self.with_sftp(move |sftp| match sftp.stat(&target) {
            Ok(stat) if stat.is_file() => Ok(Some(RemoteFileInfo {
                key: key_owned,
                size: stat.size.unwrap_or(0),
                modified_at: stat
                    .mtime
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0)),
            })),
            Ok(_) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn info(&self) -> BackendStatus {
        let start = PathBuf::from(&self.settings.root);
        let scanned = self
            .with_sftp(move |sftp| {
                let mut out = Vec::new();
                list_recursive(sftp, &start, &mut out)?;
                Ok(out)
            })
            .await;
        match scanned {
            Ok(files) => BackendStatus {
                name: self.settings.name.clone(),
                kind: self.kind(),
                reachable: true,
                object_count: Some(files.len() as u64),
                total_size: Some(files.iter().map(|(_, stat)| stat.size.unwrap_or(0)).sum()),
                free_space: None,
                error: None,
            },
            Err(e) => BackendStatus::unreachable(&self.settings.name, self.kind(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(password: Option<&str>, key: Option<&str>) -> StorageBackendConfig {
        StorageBackendConfig::Sftp {
            name: None,
            host: "127.0.0.1".into(),
            port: 1,
            username: "backup".into(),
            password: password.map(String::from),
            private_key: key.map(PathBuf::from),
            passphrase: None,
            root: "/data/backups/".into(),
            timeout_secs: 1,
        }
    }

    #[test]
    fn test_requires_credentials() {
        let cfg = config(None, None);
        assert!(SftpBackend::from_config(cfg.name(), &cfg).is_err());
    }

    #[test]
    fn test_remote_path_under_root() -> Result<()> {
        let cfg = config(Some("secret"), None);
        let backend = SftpBackend::from_config(cfg.name(), &cfg)?;
        assert_eq!(
            backend.remote_path("database/full/a.db")?,
            PathBuf::from("/data/backups/database/full/a.db")
        );
        assert!(backend.remote_path("../../etc").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_status() -> Result<()> {
        let cfg = config(Some("secret"), None);
        let backend = SftpBackend::from_config(cfg.name(), &cfg)?;
        let status = backend.info().await;
        assert!(!status.reachable);
        assert_eq!(status.kind, BackendKind::Sftp);
        Ok(())
    }
}
