//! File metadata preserved across backup and restore.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,

    /// Last modified time, at the precision the index stores
    pub modified: DateTime<Utc>,

    /// File permissions (Unix mode bits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,

    pub is_file: bool,
}

impl FileMetadata {
    /// Extract metadata from a file path (following symlinks)
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let modified = DateTime::<Utc>::from(metadata.modified()?).trunc_subsecs(6);

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified,
            permissions,
            is_file: metadata.is_file(),
        })
    }
}

/// Re-apply permissions (Unix) and modification time to a restored file.
pub fn apply_to_path(
    path: &Path,
    permissions: Option<u32>,
    modified: Option<DateTime<Utc>>,
) -> std::io::Result<()> {
    #[cfg(unix)]
    if let Some(mode) = permissions {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = permissions;

    if let Some(modified) = modified {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_modified(modified.into())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_extract_metadata() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_path(temp_file.path())?;
        assert_eq!(metadata.size, 12);
        assert!(metadata.is_file);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_apply_restores_mode_and_mtime() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let when = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.250000Z")
            .unwrap()
            .with_timezone(&Utc);

        apply_to_path(temp_file.path(), Some(0o100640), Some(when))?;

        let metadata = FileMetadata::from_path(temp_file.path())?;
        assert_eq!(metadata.permissions.unwrap() & 0o777, 0o640);
        assert_eq!(metadata.modified, when);
        Ok(())
    }
}
