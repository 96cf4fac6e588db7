use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

mod memory;

pub use memory::*;

pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Key prefixes used by the two primitives
pub const SCHEDULER_LOCK_PREFIX: &str = "schedulerLock:";
pub const CREATION_GUARD_PREFIX: &str = "roomCreationProgressList:";

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The store could not be reached, callers must fail closed on this
    #[error("Coordination store is unreachable: {0}")]
    Unreachable(String),
}

/// Represents the low-latency key-value store used for ephemeral locks,
/// guards, and the durable webhook registration hash.
///
/// Only atomic single-key operations are assumed available, so invariants
/// spanning multiple keys are enforced by re-reading at the dependent write.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Sets a key that expires after the given ttl
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> CoordinationResult<()>;

    /// Sets a key only if it does not already exist, returning whether it was set
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> CoordinationResult<bool>;

    async fn get(&self, key: &str) -> CoordinationResult<Option<String>>;
    async fn exists(&self, key: &str) -> CoordinationResult<bool>;
    async fn delete(&self, key: &str) -> CoordinationResult<()>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> CoordinationResult<()>;
    async fn hash_get(&self, key: &str, field: &str) -> CoordinationResult<Option<String>>;
    async fn hash_delete(&self, key: &str, field: &str) -> CoordinationResult<()>;
    async fn hash_fields(&self, key: &str) -> CoordinationResult<Vec<String>>;
}

/// A ttl'd marker preventing readers from observing a room mid-creation.
///
/// If a node crashes between [CreationGuard::begin] and [CreationGuard::end],
/// the marker self-expires, bounding worst-case staleness to one ttl period.
#[derive(Clone)]
pub struct CreationGuard {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
    poll_interval: Duration,
}

impl CreationGuard {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration, poll_interval: Duration) -> Self {
        Self {
            store,
            ttl,
            poll_interval,
        }
    }

    fn key(room_id: &str) -> String {
        format!("{CREATION_GUARD_PREFIX}{room_id}")
    }

    pub async fn begin(&self, room_id: &str) -> CoordinationResult<()> {
        self.store.set_ttl(&Self::key(room_id), "1", self.ttl).await
    }

    pub async fn is_in_progress(&self, room_id: &str) -> CoordinationResult<bool> {
        self.store.exists(&Self::key(room_id)).await
    }

    pub async fn end(&self, room_id: &str) -> CoordinationResult<()> {
        self.store.delete(&Self::key(room_id)).await
    }

    /// Polls until the guard clears, bounded by the guard's own ttl
    pub async fn wait_until_settled(&self, room_id: &str) -> CoordinationResult<()> {
        let attempts = (self.ttl.as_millis() / self.poll_interval.as_millis().max(1)).max(1);

        for _ in 0..attempts {
            if !self.is_in_progress(room_id).await? {
                return Ok(());
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        Ok(())
    }
}

/// A ttl'd marker ensuring only one cluster node executes a named periodic job.
///
/// There is no fencing token, so every guarded job must stay idempotent per
/// unit of work. A partitioned holder's lock simply expires at ttl.
#[derive(Clone)]
pub struct SchedulerLock {
    store: Arc<dyn CoordinationStore>,
}

impl SchedulerLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    fn key(work: &str) -> String {
        format!("{SCHEDULER_LOCK_PREFIX}{work}")
    }

    /// Attempts to take the lock, returning false if another node holds it
    pub async fn acquire(&self, work: &str, ttl: Duration) -> CoordinationResult<bool> {
        self.store.set_if_absent(&Self::key(work), "1", ttl).await
    }

    pub async fn exists(&self, work: &str) -> CoordinationResult<bool> {
        self.store.exists(&Self::key(work)).await
    }

    pub async fn release(&self, work: &str) -> CoordinationResult<()> {
        self.store.delete(&Self::key(work)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_lock_race_has_one_winner() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordination::new());

        // Two nodes sharing the same store
        let first = SchedulerLock::new(store.clone());
        let second = SchedulerLock::new(store.clone());

        let ttl = Duration::from_secs(10);
        let won_first = first.acquire("roomDurationChecker", ttl).await.unwrap();
        let won_second = second.acquire("roomDurationChecker", ttl).await.unwrap();

        assert!(won_first, "first acquisition should succeed");
        assert!(!won_second, "second acquisition should be refused");
        assert!(
            second.exists("roomDurationChecker").await.unwrap(),
            "loser should observe the lock and skip its tick"
        );

        first.release("roomDurationChecker").await.unwrap();
        assert!(second.acquire("roomDurationChecker", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expires_at_ttl() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordination::new());
        let lock = SchedulerLock::new(store);

        assert!(lock
            .acquire("activeRoomChecker", Duration::from_millis(20))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(
            !lock.exists("activeRoomChecker").await.unwrap(),
            "lock should self-expire"
        );
        assert!(lock
            .acquire("activeRoomChecker", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_guard_wait_until_settled() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordination::new());
        let guard = CreationGuard::new(
            store,
            Duration::from_millis(100),
            Duration::from_millis(10),
        );

        guard.begin("room-1").await.unwrap();
        assert!(guard.is_in_progress("room-1").await.unwrap());

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.wait_until_settled("room-1").await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        guard.end("room-1").await.unwrap();

        waiter.await.unwrap().unwrap();
        assert!(!guard.is_in_progress("room-1").await.unwrap());
    }
}
