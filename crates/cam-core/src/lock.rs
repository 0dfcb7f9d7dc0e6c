//! Cluster-wide migration lock
//!
//! A single named lock with a time-to-live. Holders must refresh before the
//! TTL lapses; a refresh after expiry or takeover reports [`LockError::Lost`].
//! Release is best-effort.

use crate::error::LockError;
use crate::types::LockHandle;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Distributed lock service
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Try to take `resource` for `ttl`; `None` when someone else holds it
    async fn acquire(&self, resource: &str, ttl: Duration)
        -> Result<Option<LockHandle>, LockError>;

    /// Extend the lock; fails with [`LockError::Lost`] if expired or stolen
    async fn refresh(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError>;

    /// Give the lock up
    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
}

#[derive(Debug, Clone)]
struct Holder {
    token: String,
    expires_at: Instant,
}

/// In-process lock coordinator
///
/// Shared between simulated cluster nodes via `Arc`. Expiry uses the tokio
/// clock, so paused-time tests can advance past a TTL.
#[derive(Debug, Default)]
pub struct InMemoryLockCoordinator {
    holders: DashMap<String, Holder>,
}

impl InMemoryLockCoordinator {
    /// Create an empty coordinator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the live holder of `resource`, if any
    #[must_use]
    pub fn holder(&self, resource: &str) -> Option<String> {
        self.holders
            .get(resource)
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| h.token.clone())
    }
}

#[async_trait]
impl LockCoordinator for InMemoryLockCoordinator {
    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let now = Instant::now();
        let token = uuid::Uuid::new_v4().to_string();
        let holder = Holder {
            token: token.clone(),
            expires_at: now + ttl,
        };

        match self.holders.entry(resource.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Ok(None);
                }
                tracing::debug!(resource, "taking over expired lock");
                entry.insert(holder);
            }
            Entry::Vacant(entry) => {
                entry.insert(holder);
            }
        }

        Ok(Some(LockHandle {
            token,
            resource: resource.to_string(),
            acquired_at: chrono::Utc::now(),
        }))
    }

    async fn refresh(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let lost = || LockError::Lost {
            resource: handle.resource.clone(),
        };

        let mut holder = self.holders.get_mut(&handle.resource).ok_or_else(lost)?;
        if holder.token != handle.token || holder.expires_at <= now {
            return Err(lost());
        }
        holder.expires_at = now + ttl;
        Ok(())
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        self.holders
            .remove_if(&handle.resource, |_, h| h.token == handle.token);
        Ok(())
    }
}

/// A held lock together with the coordinator and TTL used to keep it
///
/// Progress mutations and range work take `&LockSession` as proof that the
/// caller holds the lock.
pub struct LockSession {
    coordinator: Arc<dyn LockCoordinator>,
    handle: LockHandle,
    ttl: Duration,
}

impl std::fmt::Debug for LockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSession")
            .field("handle", &self.handle)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LockSession {
    /// Acquire `resource`; `Ok(None)` when another node holds it
    pub async fn acquire(
        coordinator: Arc<dyn LockCoordinator>,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, LockError> {
        let handle = coordinator.acquire(resource, ttl).await?;
        Ok(handle.map(|handle| {
            tracing::info!(resource, token = %handle.token, ttl_ms = ttl.as_millis() as u64, "acquired migration lock");
            Self {
                coordinator,
                handle,
                ttl,
            }
        }))
    }

    /// Lock handle
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// TTL applied on every refresh
    #[inline]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Heartbeat
    pub async fn refresh(&self) -> Result<(), LockError> {
        self.coordinator.refresh(&self.handle, self.ttl).await.map_err(|e| {
            tracing::error!(resource = %self.handle.resource, error = %e, "lock refresh failed");
            e
        })
    }

    /// Release the lock, logging rather than returning failures
    pub async fn release(self) {
        match self.coordinator.release(&self.handle).await {
            Ok(()) => tracing::info!(resource = %self.handle.resource, "released migration lock"),
            Err(e) => tracing::warn!(
                resource = %self.handle.resource,
                error = %e,
                "failed to release migration lock; it will expire"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn second_acquire_is_refused() {
        let locks = InMemoryLockCoordinator::new();

        let first = locks.acquire("migration", TTL).await.unwrap();
        assert!(first.is_some());

        let second = locks.acquire("migration", TTL).await.unwrap();
        assert!(second.is_none());

        // Different resource is independent
        assert!(locks.acquire("other", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_frees_resource() {
        let locks = InMemoryLockCoordinator::new();
        let handle = locks.acquire("migration", TTL).await.unwrap().unwrap();

        locks.release(&handle).await.unwrap();
        assert!(locks.holder("migration").is_none());
        assert!(locks.acquire("migration", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_release_does_not_free_new_holder() {
        let locks = InMemoryLockCoordinator::new();
        let old = locks.acquire("migration", TTL).await.unwrap().unwrap();
        locks.release(&old).await.unwrap();

        let new = locks.acquire("migration", TTL).await.unwrap().unwrap();
        locks.release(&old).await.unwrap();
        assert_eq!(locks.holder("migration"), Some(new.token));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_after_expiry_is_lost() {
        let locks = InMemoryLockCoordinator::new();
        let handle = locks.acquire("migration", TTL).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        locks.refresh(&handle, TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let err = locks.refresh(&handle, TTL).await.unwrap_err();
        assert!(err.is_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_over() {
        let locks = InMemoryLockCoordinator::new();
        let old = locks.acquire("migration", TTL).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let new = locks.acquire("migration", TTL).await.unwrap().unwrap();
        assert_ne!(old.token, new.token);

        // Old holder cannot resurrect its lease
        assert!(locks.refresh(&old, TTL).await.unwrap_err().is_lost());
        assert!(locks.refresh(&new, TTL).await.is_ok());
    }

    #[tokio::test]
    async fn session_release_is_best_effort() {
        let locks: Arc<dyn LockCoordinator> = Arc::new(InMemoryLockCoordinator::new());
        let session = LockSession::acquire(locks.clone(), "migration", TTL)
            .await
            .unwrap()
            .unwrap();
        session.refresh().await.unwrap();
        session.release().await;

        assert!(locks.acquire("migration", TTL).await.unwrap().is_some());
    }
}
