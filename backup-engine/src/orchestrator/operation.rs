//! Operation records: one per backup or recovery run.

use crate::metadata::{now, BackupRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FullBackup,
    IncrementalBackup,
    DatabaseRestore,
    FileRestore,
    SystemRecovery,
    RecoveryTest,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::FullBackup => "full_backup",
            OperationKind::IncrementalBackup => "incremental_backup",
            OperationKind::DatabaseRestore => "database_restore",
            OperationKind::FileRestore => "file_restore",
            OperationKind::SystemRecovery => "system_recovery",
            OperationKind::RecoveryTest => "recovery_test",
        }
    }

    pub fn is_backup(&self) -> bool {
        matches!(self, OperationKind::FullBackup | OperationKind::IncrementalBackup)
    }
}

/// `pending → running → {succeeded, partial, failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Partial => "partial",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Partial | OperationStatus::Failed
        )
    }

    /// The worse of two outcomes
    pub fn worst(self, other: OperationStatus) -> OperationStatus {
        fn rank(s: OperationStatus) -> u8 {
            match s {
                OperationStatus::Failed => 3,
                OperationStatus::Partial => 2,
                _ => 1,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Per-backend upload outcome for one operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendUploadResult {
    pub backend: String,
    pub uploaded: usize,
    pub failed: usize,
    pub bytes: u64,
    pub error: Option<String>,
}

impl BackendUploadResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.failed == 0
    }
}

/// Status implied by a set of upload results; no uploads is success.
pub fn upload_status(results: &[BackendUploadResult]) -> OperationStatus {
    let ok = results.iter().filter(|r| r.succeeded()).count();
    if ok == results.len() {
        OperationStatus::Succeeded
    } else if ok == 0 {
        OperationStatus::Failed
    } else {
        OperationStatus::Partial
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 0-100
    pub progress: u8,
    pub steps: Vec<StepRecord>,
    /// Stored bytes produced (backups) or restored (recoveries)
    pub total_size: u64,
    pub success: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub records: Vec<BackupRecord>,
    #[serde(default)]
    pub uploads: Vec<BackendUploadResult>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl OperationRecord {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: OperationStatus::Pending,
            started_at: now(),
            finished_at: None,
            progress: 0,
            steps: Vec::new(),
            total_size: 0,
            success: false,
            error: None,
            records: Vec::new(),
            uploads: Vec::new(),
            details: serde_json::json!({}),
        }
    }

    pub fn start(&mut self) {
        self.status = OperationStatus::Running;
        self.started_at = now();
    }

    /// Open a running step; returns its index for [`Self::finish_step`].
    pub fn begin_step(&mut self, name: &str) -> usize {
        self.steps.push(StepRecord {
            name: name.to_string(),
            status: StepStatus::Running,
            started_at: Some(now()),
            finished_at: None,
            message: None,
        });
        self.steps.len() - 1
    }

    pub fn finish_step(&mut self, idx: usize, status: StepStatus, message: Option<String>) {
        if let Some(step) = self.steps.get_mut(idx) {
            step.status = status;
            step.finished_at = Some(now());
            step.message = message;
        }
    }

    pub fn skip_step(&mut self, name: &str, reason: &str) {
        self.steps.push(StepRecord {
            name: name.to_string(),
            status: StepStatus::Skipped,
            started_at: None,
            finished_at: None,
            message: Some(reason.to_string()),
        });
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    pub fn set_detail(&mut self, key: &str, value: serde_json::Value) {
        if !self.details.is_object() {
            self.details = serde_json::json!({});
        }
        if let Some(map) = self.details.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn finish(&mut self, status: OperationStatus, error: Option<String>) {
        self.status = status;
        self.success = status == OperationStatus::Succeeded;
        self.error = error;
        self.finished_at = Some(now());
        self.progress = 100;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(OperationStatus::Failed, Some(error.into()));
    }

    pub fn cancel(&mut self) {
        for step in &mut self.steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Failed;
                step.finished_at = Some(now());
                step.message = Some("cancelled".into());
            }
        }
        self.fail("operation cancelled");
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(backend: &str, error: Option<&str>) -> BackendUploadResult {
        BackendUploadResult {
            backend: backend.into(),
            uploaded: if error.is_none() { 1 } else { 0 },
            failed: if error.is_none() { 0 } else { 1 },
            bytes: 0,
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_upload_status_policy() {
        assert_eq!(upload_status(&[]), OperationStatus::Succeeded);
        assert_eq!(
            upload_status(&[result("a", None), result("b", None)]),
            OperationStatus::Succeeded
        );
        assert_eq!(
            upload_status(&[result("a", None), result("b", Some("down"))]),
            OperationStatus::Partial
        );
        assert_eq!(
            upload_status(&[result("a", Some("down")), result("b", Some("down"))]),
            OperationStatus::Failed
        );
    }

    #[test]
    fn test_success_tracks_status() {
        let mut op = OperationRecord::new(OperationKind::FullBackup);
        op.start();
        let idx = op.begin_step("database_full_backup");
        op.finish_step(idx, StepStatus::Succeeded, None);
        op.finish(OperationStatus::Partial, Some("1 backend failed".into()));
        assert!(!op.success);

        let mut op = OperationRecord::new(OperationKind::FullBackup);
        op.begin_step("file_backup");
        op.cancel();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.as_deref(), Some("operation cancelled"));
        assert_eq!(op.failed_steps(), vec!["file_backup"]);
    }

    #[test]
    fn test_worst_status() {
        use OperationStatus::*;
        assert_eq!(Succeeded.worst(Partial), Partial);
        assert_eq!(Failed.worst(Partial), Failed);
        assert_eq!(Succeeded.worst(Succeeded), Succeeded);
    }
}
