//! Real-time change detection. The notify callback only enqueues paths.

use super::filter::IgnoreFilter;
use super::queue::PendingQueue;
use crate::utils::errors::{EngineError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keeps the OS watch alive; dropping it stops monitoring.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    directories: Vec<PathBuf>,
}

impl FileWatcher {
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }
}

fn handle_event(event: Event, filter: &IgnoreFilter, queue: &PendingQueue) {
    // Create, Modify (content, metadata, rename-to) all carry the new path.
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in event.paths {
        if !path.is_file() || filter.is_ignored(&path) {
            continue;
        }
        if queue.push(path.clone()) {
            debug!(path = %path.display(), "Change queued");
        }
    }
}

/// Start recursive monitoring of every existing directory in `directories`.
/// Fails only when nothing could be watched.
pub fn start(
    directories: &[PathBuf],
    filter: Arc<IgnoreFilter>,
    queue: Arc<PendingQueue>,
) -> Result<FileWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => handle_event(event, &filter, &queue),
        Err(e) => warn!("Watch error: {}", e),
    })?;

    let mut watching = Vec::new();
    for dir in directories {
        match watcher.watch(dir, RecursiveMode::Recursive) {
            Ok(()) => watching.push(dir.clone()),
            Err(e) => warn!(dir = %dir.display(), "Cannot watch directory: {}", e),
        }
    }
    if watching.is_empty() {
        return Err(EngineError::Configuration(
            "none of the watched directories could be monitored".into(),
        ));
    }

    info!(count = watching.len(), "File watcher started");
    Ok(FileWatcher {
        _watcher: watcher,
        directories: watching,
    })
}
