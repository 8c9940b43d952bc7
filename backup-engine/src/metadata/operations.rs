//! Operation history: one JSON document per finished (or in-flight) run.

use super::format_timestamp;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Indexed columns stored next to the serialized document
pub struct HistoryKey<'a> {
    pub id: &'a str,
    pub kind: &'a str,
    pub status: &'a str,
    pub started_at: &'a DateTime<Utc>,
    pub finished_at: Option<&'a DateTime<Utc>>,
}

pub fn save<T: Serialize>(conn: &Connection, key: &HistoryKey<'_>, record: &T) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO operations (id, kind, status, started_at, finished_at, record)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            key.id,
            key.kind,
            key.status,
            format_timestamp(key.started_at),
            key.finished_at.map(format_timestamp),
            serde_json::to_string(record)?,
        ],
    )?;
    Ok(())
}

/// Newest first. Documents that no longer deserialize are skipped.
pub fn find_recent<T: DeserializeOwned>(conn: &Connection, limit: usize) -> Result<Vec<T>> {
    let mut stmt =
        conn.prepare("SELECT record FROM operations ORDER BY started_at DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
    Ok(rows
        .filter_map(|r| r.ok())
        .filter_map(|raw| serde_json::from_str(&raw).ok())
        .collect())
}

pub fn find_by_id<T: DeserializeOwned>(conn: &Connection, id: &str) -> Result<Option<T>> {
    let mut stmt = conn.prepare("SELECT record FROM operations WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    match rows.next().transpose()? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn count(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))?;
    Ok(n as u64)
}

/// Keep the `keep` most recent entries; returns how many were removed.
pub fn prune(conn: &Connection, keep: usize) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM operations WHERE id NOT IN (
           SELECT id FROM operations ORDER BY started_at DESC LIMIT ?
         )",
        params![keep as i64],
    )?;
    Ok(removed)
}
