//! Per-resource serialization.
//!
//! Each logical resource (claim, or (node, handle) pair) gets its own
//! async lock so that no two phases ever run for the same resource at
//! the same time, while unrelated resources proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, creating it on first use. The guard
    /// is owned, so it can be held across await points for the whole
    /// phase.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key.to_owned()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("claim-a").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.lock("claim-a").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("lock should be released")
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("claim-a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock("claim-b"))
            .await
            .expect("unrelated key must not block");
    }
}
