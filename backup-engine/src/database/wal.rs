//! Write-ahead-log companions and point-in-time replay.
//!
//! Replay is checkpoint-and-discard: each captured `-wal` is placed next to
//! the restored database, checkpointed into it, and removed before the next
//! one is applied. A WAL image holds full page copies, so applying captures
//! in ascending order reproduces the state at the last applied capture. Frames
//! that were checkpointed and reset in the live database between two captures
//! are not recoverable; precision is bounded by the capture interval.

use crate::metadata::BackupRecord;
use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::{copy_synced, remove_path, with_suffix};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

pub fn wal_path(db: &Path) -> PathBuf {
    with_suffix(db, "-wal")
}

pub fn shm_path(db: &Path) -> PathBuf {
    with_suffix(db, "-shm")
}

/// Switch `db` to WAL journaling. Returns whether the mode took effect.
pub fn enable_wal(conn: &Connection) -> Result<bool> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    Ok(mode.eq_ignore_ascii_case("wal"))
}

/// Remove `-wal` / `-shm` companions left next to `db`.
pub fn remove_companions(db: &Path) -> Result<()> {
    remove_path(&wal_path(db))?;
    remove_path(&shm_path(db))?;
    Ok(())
}

fn captured_wal(record: &BackupRecord) -> Option<PathBuf> {
    record
        .artifact_files()
        .into_iter()
        .find(|f| f.to_string_lossy().ends_with("-wal"))
}

/// Apply `increments` (oldest first) on top of the database at `target`.
/// Returns the number applied.
pub fn replay_increments(target: &Path, increments: &[BackupRecord]) -> Result<usize> {
    if increments.is_empty() {
        return Ok(0);
    }
    {
        let conn = Connection::open(target)?;
        if !enable_wal(&conn)? {
            return Err(EngineError::Integrity(format!(
                "{} cannot be switched to WAL mode",
                target.display()
            )));
        }
    }
    remove_companions(target)?;

    let mut applied = 0;
    for increment in increments {
        let Some(wal) = captured_wal(increment) else {
            tracing::warn!(record_id = %increment.id, "Increment has no WAL file, skipped");
            continue;
        };
        copy_synced(&wal, &wal_path(target))?;
        remove_path(&shm_path(target))?;

        let conn = Connection::open(target)?;
        let (busy, _log, _checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        drop(conn);
        if busy != 0 {
            return Err(EngineError::Integrity(format!(
                "checkpoint of increment {} did not complete",
                increment.id
            )));
        }
        remove_companions(target)?;

        tracing::debug!(record_id = %increment.id, "Applied WAL increment");
        applied += 1;
    }

    // Leave the restored file self-contained.
    let conn = Connection::open(target)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))?;
    drop(conn);
    remove_companions(target)?;
    Ok(applied)
}
