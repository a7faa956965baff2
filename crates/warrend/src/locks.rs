//! Per-connection-name critical sections.
//!
//! Handlers read a persisted connection record, await the store, and
//! write the mutated record back. Two tasks doing that concurrently on
//! the same name would last-writer-win on `save_connection`, so every
//! such read-modify-write runs under the name's lock. The registry
//! actor needs none of this; its mutations are synchronous.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per fully-qualified connection name.
#[derive(Default)]
pub struct NameLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `name`, creating it on first use. The guard
    /// must be held across the whole read-modify-write of the record.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            Arc::clone(map.entry(name.to_string()).or_default())
        };
        slot.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_name_is_exclusive() {
        let locks = Arc::new(NameLocks::new());
        let guard = locks.lock("alice@example.com/db").await;

        let contender = Arc::clone(&locks);
        let waiting = tokio::spawn(async move {
            let _g = contender.lock("alice@example.com/db").await;
        });

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(guard);
        waiting.await.expect("contender completes");
    }

    #[tokio::test]
    async fn test_different_names_are_independent() {
        let locks = NameLocks::new();
        let _db = locks.lock("alice@example.com/db").await;
        // Completes immediately; a shared lock would deadlock here.
        let _web = locks.lock("alice@example.com/web").await;
    }
}
