//! Tracks in-flight operations, provides cooperative cancellation and folds
//! finished runs into history and run statistics.

use super::operation::{OperationKind, OperationRecord, OperationStatus};
use crate::metadata::operations::{self, HistoryKey};
use crate::metadata::{state, MetadataStore};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const STATS_KEY: &str = "run_statistics";

/// Cumulative counters across every finished operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_operations: u64,
    pub succeeded: u64,
    pub partial: u64,
    pub failed: u64,
    pub bytes_backed_up: u64,
    pub last_full_backup: Option<DateTime<Utc>>,
    pub last_incremental_backup: Option<DateTime<Utc>>,
    pub last_recovery: Option<DateTime<Utc>>,
}

impl RunStatistics {
    fn record(&mut self, op: &OperationRecord) {
        self.total_operations += 1;
        match op.status {
            OperationStatus::Succeeded => self.succeeded += 1,
            OperationStatus::Partial => self.partial += 1,
            _ => self.failed += 1,
        }
        // A failed run produced nothing usable.
        if op.status == OperationStatus::Failed {
            return;
        }
        let finished = op.finished_at.unwrap_or(op.started_at);
        match op.kind {
            OperationKind::FullBackup => {
                self.bytes_backed_up += op.total_size;
                self.last_full_backup = Some(finished);
            }
            OperationKind::IncrementalBackup => {
                self.bytes_backed_up += op.total_size;
                self.last_incremental_backup = Some(finished);
            }
            OperationKind::DatabaseRestore
            | OperationKind::FileRestore
            | OperationKind::SystemRecovery => self.last_recovery = Some(finished),
            OperationKind::RecoveryTest => {}
        }
    }
}

struct ActiveOperation {
    record: OperationRecord,
    cancel: CancellationToken,
}

pub struct OperationTracker {
    active: DashMap<String, ActiveOperation>,
    stats: Mutex<RunStatistics>,
    store: Arc<MetadataStore>,
}

impl OperationTracker {
    pub fn new(store: Arc<MetadataStore>) -> Result<Self> {
        let stats = store
            .with_conn(|conn| state::get_json::<RunStatistics>(conn, STATS_KEY))?
            .unwrap_or_default();
        Ok(Self {
            active: DashMap::new(),
            stats: Mutex::new(stats),
            store,
        })
    }

    /// Register a new running operation
    pub fn begin(&self, kind: OperationKind) -> (OperationRecord, CancellationToken) {
        let mut record = OperationRecord::new(kind);
        record.start();
        let cancel = CancellationToken::new();
        self.active.insert(
            record.id.clone(),
            ActiveOperation {
                record: record.clone(),
                cancel: cancel.clone(),
            },
        );
        tracing::info!(operation_id = %record.id, kind = kind.as_str(), "Operation started");
        (record, cancel)
    }

    /// Refresh the in-flight snapshot reported by status queries
    pub fn update(&self, record: &OperationRecord) {
        if let Some(mut active) = self.active.get_mut(&record.id) {
            active.record = record.clone();
        }
    }

    /// Request cooperative cancellation of a running operation
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.active.get(operation_id) {
            Some(active) => {
                active.cancel.cancel();
                tracing::info!(operation_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Remove from tracking, append to history and update statistics.
    /// Persistence failures are logged; the operation result stands.
    pub fn complete(&self, record: &OperationRecord) {
        self.active.remove(&record.id);

        let snapshot = {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.record(record);
            stats.clone()
        };

        let persisted = self.store.transaction(|tx| {
            operations::save(
                tx,
                &HistoryKey {
                    id: &record.id,
                    kind: record.kind.as_str(),
                    status: record.status.as_str(),
                    started_at: &record.started_at,
                    finished_at: record.finished_at.as_ref(),
                },
                record,
            )?;
            state::set_json(tx, STATS_KEY, &snapshot)
        });
        if let Err(e) = persisted {
            warn!(operation_id = %record.id, "Failed to persist operation history: {}", e);
        }

        tracing::info!(
            operation_id = %record.id,
            kind = record.kind.as_str(),
            status = record.status.as_str(),
            duration_ms = record.duration_ms().unwrap_or(0),
            "Operation finished"
        );
    }

    pub fn running_count(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> Vec<OperationRecord> {
        let mut ops: Vec<_> = self.active.iter().map(|a| a.record.clone()).collect();
        ops.sort_by_key(|op| op.started_at);
        ops
    }

    pub fn statistics(&self) -> RunStatistics {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn history(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        self.store.with_conn(|conn| operations::find_recent(conn, limit))
    }

    pub fn find(&self, operation_id: &str) -> Result<Option<OperationRecord>> {
        if let Some(active) = self.active.get(operation_id) {
            return Ok(Some(active.record.clone()));
        }
        self.store.with_conn(|conn| operations::find_by_id(conn, operation_id))
    }

    /// Keep the newest `keep` history entries
    pub fn prune_history(&self, keep: usize) -> Result<usize> {
        self.store.with_conn(|conn| operations::prune(conn, keep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lifecycle_and_statistics() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(MetadataStore::open(temp_dir.path())?);
        let tracker = OperationTracker::new(store.clone())?;

        let (mut op, cancel) = tracker.begin(OperationKind::FullBackup);
        assert_eq!(tracker.running_count(), 1);
        assert!(tracker.cancel(&op.id));
        assert!(cancel.is_cancelled());

        op.total_size = 1024;
        op.finish(OperationStatus::Succeeded, None);
        tracker.complete(&op);
        assert_eq!(tracker.running_count(), 0);
        assert!(!tracker.cancel(&op.id));

        let stats = tracker.statistics();
        assert_eq!(stats.total_operations, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.bytes_backed_up, 1024);
        assert!(stats.last_full_backup.is_some());

        // Statistics and history survive a restart.
        let reopened = OperationTracker::new(store)?;
        assert_eq!(reopened.statistics(), stats);
        let found = reopened.find(&op.id)?.unwrap();
        assert_eq!(found.status, OperationStatus::Succeeded);
        Ok(())
    }

    #[test]
    fn test_failed_run_counts_no_bytes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let tracker = OperationTracker::new(Arc::new(MetadataStore::open(temp_dir.path())?))?;
        let (mut op, _) = tracker.begin(OperationKind::IncrementalBackup);
        op.total_size = 99;
        op.fail("database unavailable");
        tracker.complete(&op);

        let stats = tracker.statistics();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.bytes_backed_up, 0);
        assert!(stats.last_incremental_backup.is_none());
        Ok(())
    }
}
