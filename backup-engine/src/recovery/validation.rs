//! Post-recovery checks and self-test reporting.

use crate::codec::checksum;
use crate::database::{stats, DatabaseStats};
use crate::metadata::{now, FileIndexEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub checked_at: DateTime<Utc>,
    pub database_valid: bool,
    pub database_stats: Option<DatabaseStats>,
    pub files_checked: usize,
    pub files_valid: usize,
    pub missing_directories: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Structural check of the database at `path`.
pub fn check_database(path: &Path, key_tables: &[String], result: &mut ValidationResult) {
    match stats::inspect(path, key_tables) {
        Ok(stats) => {
            result.database_valid = true;
            result.database_stats = Some(stats);
        }
        Err(e) => {
            result.database_valid = false;
            result.errors.push(format!("database {}: {}", path.display(), e));
        }
    }
}

/// Evenly spaced sample of at most `size` entries, stable across runs.
pub fn sample(entries: &[FileIndexEntry], size: usize) -> Vec<&FileIndexEntry> {
    if size == 0 || entries.is_empty() {
        return Vec::new();
    }
    if entries.len() <= size {
        return entries.iter().collect();
    }
    let step = entries.len() as f64 / size as f64;
    (0..size)
        .map(|i| &entries[((i as f64) * step) as usize])
        .collect()
}

/// Re-hash each sampled file and compare with its indexed content hash.
pub fn check_files(entries: &[&FileIndexEntry], result: &mut ValidationResult) {
    for entry in entries {
        result.files_checked += 1;
        match checksum::hash_file(&entry.path) {
            Ok(hash) if hash == entry.content_hash => result.files_valid += 1,
            Ok(_) => result
                .errors
                .push(format!("{}: content hash mismatch", entry.path.display())),
            Err(e) => result.errors.push(format!("{}: {}", entry.path.display(), e)),
        }
    }
}

pub fn check_directories(expected: &[PathBuf], result: &mut ValidationResult) {
    for dir in expected {
        if !dir.is_dir() {
            result.errors.push(format!("missing directory {}", dir.display()));
            result.missing_directories.push(dir.clone());
        }
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: false,
            checked_at: now(),
            database_valid: false,
            database_stats: None,
            files_checked: 0,
            files_valid: 0,
            missing_directories: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Settle `valid` once every check has run
    pub fn conclude(mut self) -> Self {
        self.valid = self.database_valid
            && self.files_valid == self.files_checked
            && self.missing_directories.is_empty();
        self
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCheck {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
    pub duration_ms: i64,
}

/// Outcome of a sandboxed recovery rehearsal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub checks: Vec<TestCheck>,
}

impl TestResult {
    pub fn new() -> Self {
        Self {
            passed: false,
            started_at: now(),
            finished_at: None,
            checks: Vec::new(),
        }
    }

    pub fn record(&mut self, name: &str, started: DateTime<Utc>, outcome: Result<String, String>) {
        let duration_ms = (now() - started).num_milliseconds();
        let (passed, message) = match outcome {
            Ok(msg) => (true, Some(msg)),
            Err(msg) => (false, Some(msg)),
        };
        if !passed {
            tracing::warn!(check = name, "Recovery self-test check failed: {:?}", message);
        }
        self.checks.push(TestCheck {
            name: name.to_string(),
            passed,
            message,
            duration_ms,
        });
    }

    pub fn conclude(mut self) -> Self {
        self.passed = !self.checks.is_empty() && self.checks.iter().all(|c| c.passed);
        self.finished_at = Some(now());
        self
    }
}

impl Default for TestResult {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn entry(path: PathBuf, content_hash: String) -> FileIndexEntry {
        FileIndexEntry {
            path,
            content_hash,
            size: 0,
            modified_at: now(),
            permissions: None,
            record_id: "r".into(),
            updated_at: now(),
        }
    }

    #[test]
    fn test_sample_is_bounded_and_spread() {
        let entries: Vec<_> = (0..10)
            .map(|i| entry(PathBuf::from(format!("/f{}", i)), String::new()))
            .collect();
        let picked = sample(&entries, 3);
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0].path, PathBuf::from("/f0"));
        assert_eq!(sample(&entries, 20).len(), 10);
        assert!(sample(&entries, 0).is_empty());
    }

    #[test]
    fn test_file_and_directory_checks() {
        let temp_dir = TempDir::new().unwrap();
        let good = temp_dir.path().join("good.txt");
        let bad = temp_dir.path().join("bad.txt");
        fs::write(&good, b"same").unwrap();
        fs::write(&bad, b"changed").unwrap();

        let entries = vec![
            entry(good, checksum::hash_bytes(b"same")),
            entry(bad, checksum::hash_bytes(b"original")),
        ];
        let mut result = ValidationResult::new();
        result.database_valid = true;
        check_files(&sample(&entries, 10), &mut result);
        check_directories(&[temp_dir.path().to_path_buf(), temp_dir.path().join("gone")], &mut result);
        let result = result.conclude();

        assert_eq!(result.files_checked, 2);
        assert_eq!(result.files_valid, 1);
        assert_eq!(result.missing_directories.len(), 1);
        assert!(!result.valid);
    }
}
