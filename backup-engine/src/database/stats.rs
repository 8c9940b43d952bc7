//! Structural checks and statistics for SQLite database files.

use crate::utils::errors::{EngineError, Result};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub table_count: u64,
    /// page_size × page_count
    pub size_bytes: u64,
    pub row_counts: BTreeMap<String, u64>,
}

pub fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// User tables, sorted by name
pub fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn row_count(conn: &Connection, table: &str) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\""));
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Runs `PRAGMA integrity_check`; any answer other than `ok` is an integrity error.
pub fn integrity_check(conn: &Connection) -> Result<()> {
    let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if result != "ok" {
        return Err(EngineError::Integrity(format!(
            "integrity_check failed: {}",
            result
        )));
    }
    Ok(())
}

/// Table count, size and row counts of `key_tables` (every table when empty).
pub fn collect(conn: &Connection, key_tables: &[String]) -> Result<DatabaseStats> {
    let tables = table_names(conn)?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;

    let selected: Vec<&String> = if key_tables.is_empty() {
        tables.iter().collect()
    } else {
        key_tables
            .iter()
            .filter(|t| {
                let present = tables.contains(t);
                if !present {
                    tracing::warn!(table = %t, "Key table not present in database");
                }
                present
            })
            .collect()
    };

    let mut row_counts = BTreeMap::new();
    for table in selected {
        row_counts.insert(table.clone(), row_count(conn, table)?);
    }

    Ok(DatabaseStats {
        table_count: tables.len() as u64,
        size_bytes: (page_size.max(0) * page_count.max(0)) as u64,
        row_counts,
    })
}

/// Open `path`, check its structure and collect statistics.
pub fn inspect(path: &Path, key_tables: &[String]) -> Result<DatabaseStats> {
    let conn = open_read_only(path)?;
    integrity_check(&conn)?;
    collect(&conn, key_tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_counts_rows() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("app.db");
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE notes (id INTEGER PRIMARY KEY);
             INSERT INTO users (name) VALUES ('a'), ('b');",
        )?;
        drop(conn);

        let stats = inspect(&path, &[])?;
        assert_eq!(stats.table_count, 2);
        assert_eq!(stats.row_counts["users"], 2);
        assert_eq!(stats.row_counts["notes"], 0);
        assert!(stats.size_bytes > 0);

        let only_users = inspect(&path, &["users".to_string(), "missing".to_string()])?;
        assert_eq!(only_users.row_counts.len(), 1);
        Ok(())
    }

    #[test]
    fn test_garbage_file_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("garbage.db");
        std::fs::write(&path, vec![0xAB; 8192])?;
        assert!(inspect(&path, &[]).is_err());
        Ok(())
    }
}
