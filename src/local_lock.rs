//! In-process lock registry keyed by service account.
//!
//! Serializes reconcilers in one process so that concurrent callers for the
//! same service account don't all queue up on the cluster lease. The lease is
//! what provides exclusion across processes; this only saves redundant work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::EnsureError;

/// Held while a caller owns the key. Dropping it unlocks.
pub type LocalLockGuard = OwnedMutexGuard<()>;

/// Per-key async mutexes, created on first use and never removed.
///
/// Owned by the caller and shared through an `Arc`, so separate instances
/// don't interfere with each other.
#[derive(Debug, Default)]
pub struct LocalLockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LocalLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Wait until `key` is free and take it.
    ///
    /// Returns `EnsureError::Cancelled` if `cancel` fires first.
    pub async fn acquire(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<LocalLockGuard, EnsureError> {
        let lock = self.lock_for(key);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EnsureError::Cancelled),
            guard = lock.lock_owned() => Ok(guard),
        }
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive_and_other_keys_are_not() {
        let registry = Arc::new(LocalLockRegistry::new());
        let cancel = CancellationToken::new();

        let held = registry.acquire("ns/a", &cancel).await.unwrap();
        let other = registry.acquire("ns/b", &cancel).await.unwrap();

        let r = registry.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { r.acquire("ns/a", &c).await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second caller must wait for the key");

        drop(held);
        waiter.await.unwrap().unwrap();
        drop(other);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn waiting_observes_cancellation() {
        let registry = LocalLockRegistry::new();
        let cancel = CancellationToken::new();
        let _held = registry.acquire("ns/a", &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let err = registry.acquire("ns/a", &waiter_cancel).await.unwrap_err();
        assert!(matches!(err, EnsureError::Cancelled));
    }
}
