//! Lease-based lock provider for a single process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use streamshift::errors::{LockError, LockResult};
use streamshift::lock::{DistributedLock, LockInfo, LockProvider, ReleaseOutcome};
use streamshift::types::{LockId, LockKey, Timestamp};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct Lease {
    lock_id: LockId,
    expires_at: Instant,
}

type LeaseTable = Arc<Mutex<HashMap<LockKey, Lease>>>;

/// Lock provider with real lease semantics, shared by clones.
///
/// Grants expire after `lease_duration` unless renewed; a holder whose lease
/// expired or was taken over is fenced off by its `lock_id` and sees its
/// renewals refused.
#[derive(Debug, Clone)]
pub struct InMemoryLockProvider {
    leases: LeaseTable,
    lease_duration: Duration,
    poll_interval: Duration,
}

impl InMemoryLockProvider {
    /// Creates a provider granting leases of `lease_duration`.
    pub fn new(lease_duration: Duration) -> LockResult<Self> {
        if lease_duration.is_zero() {
            return Err(LockError::InvalidConfiguration(
                "lease duration must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            lease_duration,
            poll_interval: Duration::from_millis(50),
        })
    }

    /// Sets how often a blocked acquisition retries.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Drops whatever lease holds `key`, as if it had expired.
    ///
    /// The former holder's renewals fail from then on.
    pub fn revoke(&self, key: &LockKey) -> bool {
        let revoked = self.leases.lock().remove(key).is_some();
        if revoked {
            info!(lock_key = %key, "[memory.lock] lease revoked");
        }
        revoked
    }

    fn try_grant(&self, key: &LockKey) -> Option<InMemoryLock> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|lease| lease.expires_at > now) {
            return None;
        }
        let lock_id = LockId::new();
        let _ = leases.insert(
            key.clone(),
            Lease {
                lock_id,
                expires_at: now + self.lease_duration,
            },
        );
        drop(leases);

        let acquired_at = Timestamp::now();
        Some(InMemoryLock {
            lock_id,
            lock_key: key.clone(),
            leases: Arc::clone(&self.leases),
            lease_duration: self.lease_duration,
            info: Mutex::new(LockInfo {
                lock_id,
                lock_key: key.clone(),
                acquired_at,
                expires_at: Some(wall_clock_after(acquired_at, self.lease_duration)),
            }),
            expires_at: Mutex::new(now + self.lease_duration),
            released: AtomicBool::new(false),
        })
    }
}

fn wall_clock_after(from: Timestamp, duration: Duration) -> Timestamp {
    let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
    Timestamp::new(from.into_datetime() + delta)
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire_lock(
        &self,
        key: &LockKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> LockResult<Option<Box<dyn DistributedLock>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = self.try_grant(key) {
                debug!(lock_key = %key, lock_id = %lock.info().lock_id, "[memory.lock] granted");
                return Ok(Some(Box::new(lock)));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(lock_key = %key, "[memory.lock] timed out waiting for lease");
                return Ok(None);
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn is_locked(&self, key: &LockKey) -> LockResult<bool> {
        let now = Instant::now();
        Ok(self
            .leases
            .lock()
            .get(key)
            .is_some_and(|lease| lease.expires_at > now))
    }

    fn lease_duration(&self) -> Option<Duration> {
        Some(self.lease_duration)
    }
}

/// A grant from [`InMemoryLockProvider`].
#[derive(Debug)]
pub struct InMemoryLock {
    lock_id: LockId,
    lock_key: LockKey,
    leases: LeaseTable,
    lease_duration: Duration,
    info: Mutex<LockInfo>,
    expires_at: Mutex<Instant>,
    released: AtomicBool,
}

impl InMemoryLock {
    fn holds(&self, lease: Option<&Lease>, now: Instant) -> bool {
        lease.is_some_and(|lease| lease.lock_id == self.lock_id && lease.expires_at > now)
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    fn info(&self) -> LockInfo {
        self.info.lock().clone()
    }

    async fn renew(&self) -> LockResult<bool> {
        if self.released.load(Ordering::Acquire) {
            return Ok(false);
        }
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if !self.holds(leases.get(&self.lock_key), now) {
            return Ok(false);
        }
        let expires_at = now + self.lease_duration;
        if let Some(lease) = leases.get_mut(&self.lock_key) {
            lease.expires_at = expires_at;
        }
        drop(leases);

        *self.expires_at.lock() = expires_at;
        let mut info = self.info.lock();
        info.expires_at = Some(wall_clock_after(Timestamp::now(), self.lease_duration));
        Ok(true)
    }

    fn is_valid(&self) -> bool {
        !self.released.load(Ordering::Acquire) && *self.expires_at.lock() > Instant::now()
    }

    async fn release(&self) -> LockResult<ReleaseOutcome> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(ReleaseOutcome::AlreadyReleased);
        }
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if self.holds(leases.get(&self.lock_key), now) {
            let _ = leases.remove(&self.lock_key);
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::AlreadyReleased)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LockKey {
        LockKey::try_new("migration:order-1").unwrap()
    }

    fn provider(lease_ms: u64) -> InMemoryLockProvider {
        InMemoryLockProvider::new(Duration::from_millis(lease_ms))
            .unwrap()
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn zero_lease_is_rejected() {
        assert!(InMemoryLockProvider::new(Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn second_acquirer_times_out_while_lease_is_held() {
        let provider = provider(1_000);
        let cancel = CancellationToken::new();
        let held = provider
            .acquire_lock(&key(), Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();

        let second = provider
            .acquire_lock(&key(), Duration::from_millis(30), &cancel)
            .await
            .unwrap();

        assert!(second.is_none());
        assert!(provider.is_locked(&key()).await.unwrap());
        assert_eq!(held.release().await.unwrap(), ReleaseOutcome::Released);
        assert!(!provider.is_locked(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn waiter_gets_the_lock_after_release() {
        let provider = provider(1_000);
        let cancel = CancellationToken::new();
        let held = provider
            .acquire_lock(&key(), Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let provider = provider.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                provider
                    .acquire_lock(&key(), Duration::from_secs(2), &cancel)
                    .await
                    .unwrap()
                    .is_some()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = held.release().await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn expired_holder_is_fenced_off() {
        let provider = provider(20);
        let cancel = CancellationToken::new();
        let first = provider
            .acquire_lock(&key(), Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!first.is_valid());

        let second = provider
            .acquire_lock(&key(), Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();

        assert_ne!(first.info().lock_id, second.info().lock_id);
        assert!(!first.renew().await.unwrap());
        assert_eq!(first.release().await.unwrap(), ReleaseOutcome::AlreadyReleased);
        assert!(second.renew().await.unwrap());
        assert!(provider.is_locked(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn renewal_extends_the_lease() {
        let provider = provider(60);
        let cancel = CancellationToken::new();
        let lock = provider
            .acquire_lock(&key(), Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            assert!(lock.renew().await.unwrap());
        }

        assert!(lock.is_valid());
        assert!(lock.info().expires_at.is_some());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let provider = provider(1_000);
        let lock = provider
            .acquire_lock(&key(), Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(lock.release().await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(lock.release().await.unwrap(), ReleaseOutcome::AlreadyReleased);
        assert!(!lock.renew().await.unwrap());
    }

    #[tokio::test]
    async fn revoked_lease_refuses_renewal() {
        let provider = provider(1_000);
        let lock = provider
            .acquire_lock(&key(), Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert!(provider.revoke(&key()));

        assert!(!lock.renew().await.unwrap());
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let provider = provider(1_000);
        let cancel = CancellationToken::new();
        let _held = provider
            .acquire_lock(&key(), Duration::from_millis(10), &cancel)
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();

        let started = Instant::now();
        let waited = provider
            .acquire_lock(&key(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        assert!(waited.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
