//! Pending-change queue shared by the watcher and the backup worker.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct PendingQueue {
    paths: Mutex<BTreeSet<PathBuf>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the path was already pending.
    pub fn push(&self, path: impl Into<PathBuf>) -> bool {
        self.lock().insert(path.into())
    }

    /// Take every pending path, leaving the queue empty.
    pub fn drain(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.lock()).into_iter().collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_dedups_and_drain_clears() {
        let queue = PendingQueue::new();
        assert!(queue.push("/a"));
        assert!(!queue.push("/a"));
        assert!(queue.push("/b"));

        assert_eq!(queue.drain(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(PendingQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        queue.push(format!("/t{}/f{}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.drain().len(), 200);
    }
}
