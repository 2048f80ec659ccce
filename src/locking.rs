//! In-memory path locks serializing conflicting filesystem mutations.
//!
//! The device filesystem is one shared resource; every mutating handler
//! takes the lock for its target path before touching storage and holds it
//! for the duration of the mutation. Reads stay lock-free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for a device path, waiting at most `timeout`.
    pub async fn lock_path(
        &self,
        device_path: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let key = normalize_key(device_path);
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key).or_default().clone()
        };

        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// Drops lock entries nobody is waiting on.
    pub async fn prune(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[derive(Debug)]
pub struct LockTimeout;

fn normalize_key(device_path: &str) -> String {
    let trimmed = device_path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_path_is_exclusive() {
        let manager = LockManager::new();
        let guard = manager
            .lock_path("/config.json", Duration::from_secs(1))
            .await
            .expect("first lock");

        let second = manager
            .lock_path("/config.json/", Duration::from_millis(50))
            .await;
        assert!(second.is_err());

        drop(guard);
        manager
            .lock_path("/config.json", Duration::from_secs(1))
            .await
            .expect("relock after release");
    }

    #[tokio::test]
    async fn different_paths_do_not_block() {
        let manager = LockManager::new();
        let _a = manager
            .lock_path("/a.txt", Duration::from_secs(1))
            .await
            .expect("lock a");
        let _b = manager
            .lock_path("/b.txt", Duration::from_millis(50))
            .await
            .expect("lock b");
    }
}
