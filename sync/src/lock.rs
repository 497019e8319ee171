//! Per-file serialization locks.
//!
//! Every read-modify-write of a state file holds that file's lock for the
//! whole cycle, backup included. The manager is injected into stores rather
//! than kept global, so tests can run isolated instances side by side.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-path fair mutexes.
///
/// Thread-safe and can be shared across stores via `Arc`.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Create a new lock manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Wait for exclusive access to `path`.
    ///
    /// Waiters are served in FIFO order. The lock is released when the guard
    /// is dropped.
    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(path.to_path_buf()).or_default().clone();
        let guard = lock.lock_owned().await;
        tracing::trace!(path = %path.display(), "State lock acquired");
        guard
    }

    /// Number of paths that have been locked at least once.
    pub fn tracked_paths(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_path_is_exclusive() {
        let manager = LockManager::new_shared();
        let path = PathBuf::from("/tmp/state.json");

        let guard = manager.acquire(&path).await;
        let contender = {
            let manager = manager.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let _guard = manager.acquire(&path).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_paths_do_not_block() {
        let manager = LockManager::new();
        let _a = manager.acquire(Path::new("/tmp/a.json")).await;
        let _b = manager.acquire(Path::new("/tmp/b.json")).await;
        assert_eq!(manager.tracked_paths(), 2);
    }
}
