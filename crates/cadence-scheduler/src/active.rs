//! Run ids currently executing in this process.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Live-run registry shared by the poll loop, chain tasks and crash recovery.
///
/// A claim holds the write guard from before its `STARTED` row is inserted
/// until the id is registered; recovery holds the read guard for its whole
/// pass. Recovery therefore never sees a committed `STARTED` row whose run is
/// live but not yet registered.
#[derive(Debug, Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<RwLock<HashSet<i64>>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access for claiming a run.
    pub async fn claim(&self) -> RwLockWriteGuard<'_, HashSet<i64>> {
        self.inner.write().await
    }

    /// Shared access for a recovery pass.
    pub async fn read(&self) -> RwLockReadGuard<'_, HashSet<i64>> {
        self.inner.read().await
    }

    /// Forget a run once it has been finalized or abandoned.
    pub async fn finish(&self, run_id: i64) {
        self.inner.write().await.remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claimed_runs_are_visible_until_finished() {
        let runs = ActiveRuns::new();
        runs.claim().await.insert(7);
        assert!(runs.read().await.contains(&7));
        assert_eq!(runs.read().await.len(), 1);

        runs.finish(7).await;
        assert!(runs.read().await.is_empty());
    }

    #[tokio::test]
    async fn clones_share_one_registry() {
        let runs = ActiveRuns::new();
        let other = runs.clone();
        other.claim().await.insert(1);
        assert!(runs.read().await.contains(&1));
    }

    #[tokio::test]
    async fn a_pending_claim_blocks_readers() {
        let runs = ActiveRuns::new();
        let guard = runs.claim().await;
        let reader = runs.clone();
        let read = tokio::spawn(async move { reader.read().await.len() });

        tokio::task::yield_now().await;
        assert!(!read.is_finished());
        drop(guard);
        assert_eq!(read.await.unwrap(), 0);
    }
}
