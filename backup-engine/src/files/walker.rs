//! Directory traversal for file backups.

use super::filter::IgnoreFilter;
use crate::utils::errors::Result;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct WalkedFile {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (of the target, for symlinks)
    pub size: u64,

    pub is_symlink: bool,
}

/// Entries the walk could not read
#[derive(Debug, Clone, Default)]
pub struct WalkSummary {
    pub files: usize,
    pub errors: Vec<String>,
    /// The callback asked to stop early
    pub stopped: bool,
}

impl WalkedFile {
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None for directories, symlinks to directories and broken links.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = raw_metadata.is_symlink();

        let size = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                // Directory target or broken link
                _ => return Ok(None),
            }
        } else if raw_metadata.is_file() {
            raw_metadata.len()
        } else {
            return Ok(None);
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
            is_symlink,
        }))
    }
}

/// Walk `root`, calling `callback` for every eligible file. Unreadable entries
/// below the root are collected in the summary; an unreadable root is an error.
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    filter: &IgnoreFilter,
    mut callback: F,
) -> Result<WalkSummary>
where
    F: FnMut(&WalkedFile) -> ControlFlow<()>,
{
    let mut walker = WalkDir::new(root).follow_links(options.follow_links);
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut summary = WalkSummary::default();
    let mut iter = walker.into_iter();
    while let Some(entry) = iter.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                summary.errors.push(e.to_string());
                continue;
            }
        };

        if filter.is_ignored(entry.path()) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }
        if entry.file_type().is_dir() {
            continue;
        }

        match WalkedFile::from_entry(&entry, root) {
            Ok(Some(file)) => {
                summary.files += 1;
                if callback(&file).is_break() {
                    summary.stopped = true;
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), "Failed to read metadata: {}", e);
                summary.errors.push(format!("{}: {}", entry.path().display(), e));
            }
        }
    }

    Ok(summary)
}

/// Walk a directory tree and collect all eligible files
pub fn walk_directory(
    root: &Path,
    options: &WalkOptions,
    filter: &IgnoreFilter,
) -> Result<Vec<WalkedFile>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, filter, |file| {
        files.push(file.clone());
        ControlFlow::Continue(())
    })?;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IgnoreConfig;
    use std::fs;
    use tempfile::TempDir;

    fn filter() -> IgnoreFilter {
        IgnoreFilter::new(&IgnoreConfig::default())
    }

    #[test]
    fn test_walk_with_subdirectories() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default(), &filter())?;
        assert_eq!(files.len(), 2);
        assert_eq!(files.iter().map(|f| f.size).sum::<u64>(), 16);
        Ok(())
    }

    #[test]
    fn test_ignored_entries_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join(".git/objects"))?;
        fs::write(temp_dir.path().join(".git/objects/abc"), b"x")?;
        fs::write(temp_dir.path().join("keep.txt"), b"keep")?;
        fs::write(temp_dir.path().join("scratch.tmp"), b"drop")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default(), &filter())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("keep.txt"));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_broken_symlink_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("target.txt"), b"12345")?;
        std::os::unix::fs::symlink(temp_dir.path().join("target.txt"), temp_dir.path().join("link.txt"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("missing"), temp_dir.path().join("dangling"))?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default(), &filter())?;
        assert_eq!(files.len(), 2);
        let link = files.iter().find(|f| f.is_symlink).unwrap();
        assert_eq!(link.size, 5);
        Ok(())
    }

    #[test]
    fn test_missing_root_is_error() {
        let result = walk_directory(Path::new("/definitely/not/here"), &WalkOptions::default(), &filter());
        assert!(result.is_err());
    }

    #[test]
    fn test_callback_can_stop() -> Result<()> {
        let temp_dir = TempDir::new()?;
        for i in 0..5 {
            fs::write(temp_dir.path().join(format!("f{}.txt", i)), b"x")?;
        }
        let summary = walk_directory_with_callback(
            temp_dir.path(),
            &WalkOptions::default(),
            &filter(),
            |_| ControlFlow::Break(()),
        )?;
        assert!(summary.stopped);
        assert_eq!(summary.files, 1);
        Ok(())
    }
}
