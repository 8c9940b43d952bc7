//! Backup Engine Library
//!
//! Consistent snapshots of a SQLite database and content-deduplicated backups
//! of watched directory trees, replicated to local, S3 and SFTP storage, with
//! point-in-time recovery.

pub mod codec;
pub mod config;
pub mod daemon;
pub mod database;
pub mod engine;
pub mod files;
pub mod metadata;
pub mod orchestrator;
pub mod recovery;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::BackupEngine;
pub use orchestrator::{OperationRecord, OperationStatus};
pub use utils::errors::{EngineError, Result};
