//! Denylist filter for watched paths.

use crate::config::IgnoreConfig;
use crate::utils::fs::resolve_path;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    extensions: Vec<String>,
    substrings: Vec<String>,
    /// Trees the engine writes into; never backed up
    excluded_roots: Vec<PathBuf>,
}

impl IgnoreFilter {
    pub fn new(config: &IgnoreConfig) -> Self {
        Self {
            extensions: config.extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            substrings: config.substrings.clone(),
            excluded_roots: Vec::new(),
        }
    }

    /// Also ignore everything under `root`, as written and as resolved.
    pub fn excluding(mut self, root: &Path) -> Self {
        let resolved = resolve_path(root);
        if resolved != root {
            self.excluded_roots.push(resolved);
        }
        self.excluded_roots.push(root.to_path_buf());
        self
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if self.excluded_roots.is_empty() {
            return false;
        }
        if self.excluded_roots.iter().any(|root| path.starts_with(root)) {
            return true;
        }
        // A symlinked layout can reach an excluded tree under another name.
        match std::fs::canonicalize(path) {
            Ok(real) => self.excluded_roots.iter().any(|root| real.starts_with(root)),
            Err(_) => false,
        }
    }

    /// True when the file name ends with a denied suffix, the path contains a
    /// denied substring, or the path lies in an excluded root.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if self.extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            return true;
        }

        let full = path.to_string_lossy().replace('\\', "/");
        if self.substrings.iter().any(|s| full.contains(s.as_str())) {
            return true;
        }
        self.is_excluded(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_denylist() {
        let filter = IgnoreFilter::new(&IgnoreConfig::default());

        assert!(filter.is_ignored(Path::new("/srv/data/report.tmp")));
        assert!(filter.is_ignored(Path::new("/srv/data/notes.txt~")));
        assert!(filter.is_ignored(Path::new("/srv/data/app.db-wal")));
        assert!(filter.is_ignored(Path::new("/srv/data/.git/config")));
        assert!(filter.is_ignored(Path::new("/srv/data/web/node_modules/x/index.js")));
        assert!(filter.is_ignored(Path::new("/srv/data/.DS_Store")));
        assert!(filter.is_ignored(Path::new("/srv/data/archive.LOCK")));

        assert!(!filter.is_ignored(Path::new("/srv/data/report.pdf")));
        assert!(!filter.is_ignored(Path::new("/srv/data/my-wallpaper.png")));
        assert!(!filter.is_ignored(Path::new("/srv/data/.gitignore")));
    }

    #[cfg(unix)]
    #[test]
    fn test_excluded_root_also_hidden_behind_symlink() -> std::io::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let data = temp_dir.path().join("data");
        let backups = temp_dir.path().join("backups");
        std::fs::create_dir_all(&data)?;
        std::fs::create_dir_all(backups.join("files"))?;
        std::fs::write(backups.join("files/artifact.zst"), b"x")?;
        std::os::unix::fs::symlink(&backups, data.join("mirror"))?;
        std::fs::write(data.join("keep.txt"), b"y")?;

        let filter = IgnoreFilter::new(&IgnoreConfig::default()).excluding(&backups);

        assert!(filter.is_ignored(&backups.join("files/artifact.zst")));
        assert!(filter.is_ignored(&data.join("mirror")));
        assert!(filter.is_ignored(&data.join("mirror/files/artifact.zst")));
        assert!(!filter.is_ignored(&data.join("keep.txt")));
        Ok(())
    }
}
