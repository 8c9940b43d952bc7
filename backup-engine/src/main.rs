//! Backup Engine - host embedding
//!
//! Loads a TOML configuration, runs one engine operation and prints its
//! structured result as JSON.

use anyhow::{Context, Result};
use backup_engine::daemon::shutdown::ShutdownCoordinator;
use backup_engine::recovery::{DatabaseRestoreOptions, FileRestoreOptions, SystemRecoveryOptions};
use backup_engine::{utils, BackupEngine, EngineConfig, OperationRecord};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Full database snapshot and walk of every watched directory
    Full {
        #[arg(long)]
        upload: bool,
    },
    /// WAL increment and queued file changes
    Incremental {
        #[arg(long)]
        upload: bool,
    },
    /// Restore the database, optionally to a point in time
    RestoreDb {
        #[arg(long)]
        backup_id: Option<String>,
        /// RFC 3339 timestamp
        #[arg(long)]
        point_in_time: Option<DateTime<Utc>>,
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Restore backed-up files matching the given patterns
    RestoreFiles {
        #[arg(long = "pattern")]
        patterns: Vec<String>,
        /// Relocation root; files go back to their original paths when omitted
        #[arg(long)]
        target_dir: Option<PathBuf>,
    },
    /// Database restore, file restore and validation
    Recover {
        #[arg(long)]
        point_in_time: Option<DateTime<Utc>>,
    },
    /// List every backup still on record
    List,
    /// Remove expired backups locally and remotely
    Cleanup,
    /// Component status and run statistics
    Status,
    /// Validate the live system against the backup index
    Validate,
    /// Rehearse recovery in a temporary sandbox
    SelfTest,
    /// Watch directories and run incremental backups on an interval
    Watch {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
        #[arg(long)]
        upload: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print an operation and turn a non-successful status into a failing exit.
fn report(op: &OperationRecord) -> Result<()> {
    print_json(op)?;
    if op.success {
        Ok(())
    } else {
        anyhow::bail!(
            "operation {} finished {}: {}",
            op.id,
            op.status.as_str(),
            op.error.as_deref().unwrap_or("no details")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting backup-engine v{}", env!("CARGO_PKG_VERSION"));

    let engine = BackupEngine::new(config).await?;

    match args.command {
        Command::Full { upload } => report(&engine.create_full_backup(upload).await)?,
        Command::Incremental { upload } => report(&engine.create_incremental_backup(upload).await)?,
        Command::RestoreDb {
            backup_id,
            point_in_time,
            target,
        } => {
            let op = engine
                .restore_database(DatabaseRestoreOptions {
                    backup_id,
                    point_in_time,
                    target_path: target,
                })
                .await;
            report(&op)?
        }
        Command::RestoreFiles { patterns, target_dir } => {
            let op = engine
                .restore_files(FileRestoreOptions {
                    patterns,
                    restore_to_original: target_dir.is_none(),
                    target_dir,
                })
                .await;
            report(&op)?
        }
        Command::Recover { point_in_time } => {
            report(&engine.restore_full_system(SystemRecoveryOptions { point_in_time }).await)?
        }
        Command::List => print_json(&engine.list_available_backups()?)?,
        Command::Cleanup => print_json(&engine.cleanup_expired().await)?,
        Command::Status => print_json(&engine.get_status().await)?,
        Command::Validate => {
            let result = engine.validate_system_recovery().await;
            print_json(&result)?;
            if !result.valid {
                anyhow::bail!("system validation failed");
            }
        }
        Command::SelfTest => {
            let result = engine.test_recovery_procedures().await;
            print_json(&result)?;
            if !result.passed {
                anyhow::bail!("recovery self-test failed");
            }
        }
        Command::Watch { interval_secs, upload } => watch(&engine, interval_secs, upload).await?,
    }

    Ok(())
}

/// Run incremental backups until SIGINT/SIGTERM. A signal during a run is
/// honoured once that run has finished.
async fn watch(engine: &BackupEngine, interval_secs: u64, upload: bool) -> Result<()> {
    if let Err(e) = engine.start_watching() {
        tracing::warn!("Real-time watching unavailable, relying on interval backups: {}", e);
    }

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.wait_for_signal();
    tokio::pin!(signals);
    let mut stopping = false;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    while !stopping {
        tokio::select! {
            _ = &mut signals => {
                stopping = true;
                continue;
            }
            _ = interval.tick() => {}
        }

        let run = engine.create_incremental_backup(upload);
        tokio::pin!(run);
        let op = loop {
            tokio::select! {
                op = &mut run => break op,
                _ = &mut signals, if !stopping => {
                    tracing::info!("Shutdown requested, waiting for the running backup");
                    stopping = true;
                }
            }
        };
        tracing::info!(
            operation_id = %op.id,
            status = op.status.as_str(),
            records = op.records.len(),
            "Scheduled incremental backup finished"
        );
    }

    engine.stop_watching();
    tracing::info!("Graceful shutdown complete");
    Ok(())
}
