//! Leased, renewable mutual exclusion scoped to a lock key.
//!
//! A [`LockProvider`] hands out [`DistributedLock`] grants. A grant stays valid
//! until it expires, is released, or fails renewal; a holder whose renewal
//! fails must stop every write made under that key. [`LockHeartbeat`] renews a
//! grant in the background and signals loss.
//!
//! Contention is not an error: `acquire_lock` returns `None` when the lock
//! could not be obtained within the timeout.

mod heartbeat;
mod noop;

pub use heartbeat::{HeartbeatConfig, LockHeartbeat};
pub use noop::{NoOpLock, NoOpLockProvider};

use crate::errors::LockResult;
use crate::types::{LockId, LockKey, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Snapshot of a lock grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Identifies this grant; a re-acquired lock gets a new id
    pub lock_id: LockId,
    /// The key the grant covers
    pub lock_key: LockKey,
    /// When the grant was obtained
    pub acquired_at: Timestamp,
    /// When the lease runs out unless renewed, `None` if it never expires
    pub expires_at: Option<Timestamp>,
}

impl LockInfo {
    /// Whether the lease is still running at `now`.
    pub fn is_unexpired_at(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Result of releasing a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The grant was held and is now released.
    Released,
    /// The grant had already been released or had expired.
    AlreadyReleased,
}

/// A held lock grant.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Current snapshot of the grant.
    fn info(&self) -> LockInfo;

    /// Extends the lease.
    ///
    /// `Ok(false)` means the backend no longer recognizes this holder: the
    /// lock is lost. `Err` means the backend could not be asked.
    async fn renew(&self) -> LockResult<bool>;

    /// Local check that the grant is neither released nor past its expiry.
    fn is_valid(&self) -> bool;

    /// Releases the grant. Idempotent: a second call reports `AlreadyReleased`.
    async fn release(&self) -> LockResult<ReleaseOutcome>;
}

/// Source of distributed locks.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Acquires `key`, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or cancellation; the caller decides whether
    /// that is fatal.
    async fn acquire_lock(
        &self,
        key: &LockKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> LockResult<Option<Box<dyn DistributedLock>>>;

    /// Best-effort check whether someone holds `key`.
    ///
    /// The answer may be stale by the time it is returned. Use it for status
    /// displays only, never to decide whether to write.
    async fn is_locked(&self, key: &LockKey) -> LockResult<bool>;

    /// Lease length of granted locks, `None` when grants never expire.
    fn lease_duration(&self) -> Option<Duration>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn lock_info_without_expiry_is_always_unexpired() {
        let info = LockInfo {
            lock_id: LockId::new(),
            lock_key: LockKey::try_new("migration:a").unwrap(),
            acquired_at: Timestamp::now(),
            expires_at: None,
        };
        let far_future = Timestamp::new(chrono::Utc::now() + ChronoDuration::days(3650));
        assert!(info.is_unexpired_at(far_future));
    }

    #[test]
    fn lock_info_expires_at_deadline() {
        let now = chrono::Utc::now();
        let info = LockInfo {
            lock_id: LockId::new(),
            lock_key: LockKey::try_new("migration:a").unwrap(),
            acquired_at: Timestamp::new(now),
            expires_at: Some(Timestamp::new(now + ChronoDuration::seconds(30))),
        };
        assert!(info.is_unexpired_at(Timestamp::new(now + ChronoDuration::seconds(29))));
        assert!(!info.is_unexpired_at(Timestamp::new(now + ChronoDuration::seconds(30))));
    }
}
