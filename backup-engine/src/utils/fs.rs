//! Small filesystem helpers shared by the engines: staged writes, durable
//! renames and remote key derivation.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Paths written during an in-progress operation. Everything tracked is
/// removed on drop unless [`StagedPaths::commit`] was called.
#[derive(Debug, Default)]
pub struct StagedPaths {
    paths: Vec<PathBuf>,
    committed: bool,
}

impl StagedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        self.paths.push(path.clone());
        path
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for StagedPaths {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in self.paths.iter().rev() {
            if let Err(e) = remove_path(path) {
                tracing::warn!(path = %path.display(), "Failed to remove staged path: {}", e);
            }
        }
    }
}

/// `<path>.partial`
pub fn partial_path(path: &Path) -> PathBuf {
    with_suffix(path, ".partial")
}

/// Appends `suffix` to the final component, e.g. `db.sqlite` + `-wal`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Flush a staged file to disk and atomically move it into place.
pub fn commit_file(staged: &Path, target: &Path) -> io::Result<()> {
    fs::File::open(staged)?.sync_all()?;
    fs::rename(staged, target)?;
    sync_parent(target);
    Ok(())
}

/// Move a staged directory into place after flushing every file in it.
pub fn commit_dir(staged: &Path, target: &Path) -> io::Result<()> {
    for entry in fs::read_dir(staged)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::File::open(entry.path())?.sync_all()?;
        }
    }
    fs::rename(staged, target)?;
    sync_parent(target);
    Ok(())
}

fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Remove a file or directory tree. A missing path is `Ok(false)`.
pub fn remove_path(path: &Path) -> io::Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

/// Copy a file and flush the destination before returning.
pub fn copy_synced(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = fs::copy(src, dst)?;
    fs::File::open(dst)?.sync_all()?;
    Ok(bytes)
}

/// Remote object key for a local artifact: relative to `root`, `/`-separated.
pub fn remote_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Drops root and prefix components so an absolute path can be re-rooted.
pub fn relative_components(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Canonical form of `path`. The longest existing prefix is resolved and the
/// missing remainder appended, so paths that do not exist yet still compare
/// against real ones.
pub fn resolve_path(path: &Path) -> PathBuf {
    let mut missing: Vec<OsString> = Vec::new();
    let mut current = path;
    loop {
        let lookup = if current.as_os_str().is_empty() {
            Path::new(".")
        } else {
            current
        };
        if let Ok(real) = fs::canonicalize(lookup) {
            return missing.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (current.file_name(), current.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// True when one of the two paths contains the other.
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    let (a, b) = (resolve_path(a), resolve_path(b));
    a.starts_with(&b) || b.starts_with(&a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staged_paths_removed_unless_committed() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let dropped = temp_dir.path().join("dropped.partial");
        let kept = temp_dir.path().join("kept.partial");
        fs::write(&dropped, b"x")?;
        fs::write(&kept, b"y")?;

        {
            let mut staged = StagedPaths::new();
            staged.track(&dropped);
        }
        {
            let mut staged = StagedPaths::new();
            staged.track(&kept);
            staged.commit();
        }

        assert!(!dropped.exists());
        assert!(kept.exists());
        Ok(())
    }

    #[test]
    fn test_remote_key_is_relative_and_slash_separated() {
        let root = Path::new("/var/backups");
        let key = remote_key(root, Path::new("/var/backups/database/full/db.zst"));
        assert_eq!(key, "database/full/db.zst");
        assert_eq!(remote_key(root, Path::new("/elsewhere/x.txt")), "elsewhere/x.txt");
    }

    #[test]
    fn test_remove_missing_path_is_false() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(!remove_path(&temp_dir.path().join("nope"))?);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_overlap_sees_through_symlinks_and_missing_dirs() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let data = temp_dir.path().join("data");
        fs::create_dir_all(&data)?;
        let alias = temp_dir.path().join("alias");
        std::os::unix::fs::symlink(&data, &alias)?;

        assert!(paths_overlap(&alias.join("backups/not-yet"), &data));
        assert!(paths_overlap(&data, &data.join("nested")));
        assert!(!paths_overlap(&temp_dir.path().join("backups"), &data));
        Ok(())
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(with_suffix(Path::new("/data/app.db"), "-wal"), PathBuf::from("/data/app.db-wal"));
    }
}
