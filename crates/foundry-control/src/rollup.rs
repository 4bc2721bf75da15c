//! Per-resource mutual exclusion for readiness rollups.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::ResourceId;

/// One async mutex per aggregate resource.
///
/// A rollup evaluates under the guard for its resource, so two events for
/// the same parent never evaluate concurrently while different parents
/// proceed independently.
#[derive(Debug, Clone, Default)]
pub struct RollupLocks {
    locks: Arc<DashMap<ResourceId, Arc<Mutex<()>>>>,
}

impl RollupLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive rollup access to `id`.
    pub async fn acquire(&self, id: &ResourceId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(id.clone()).or_default().value());
        lock.lock_owned().await
    }

    /// Drop the lock entry of a resource that no longer exists.
    pub fn forget(&self, id: &ResourceId) {
        self.locks.remove(id);
    }

    /// Number of tracked resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no resource is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_resource_is_serialised() {
        let locks = RollupLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let id = ResourceId::new("component-1");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                let id = id.clone();
                tokio::spawn(async move {
                    let _guard = locks.acquire(&id).await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.ok();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_resources_do_not_block() {
        let locks = RollupLocks::new();
        let _a = locks.acquire(&ResourceId::new("a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire(&ResourceId::new("b")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);

        locks.forget(&ResourceId::new("b"));
        assert_eq!(locks.len(), 1);
    }
}
