//! Lock provider for single-instance deployments.

use super::{DistributedLock, LockInfo, LockProvider, ReleaseOutcome};
use crate::errors::LockResult;
use crate::types::{LockId, LockKey, Timestamp};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Lock provider that grants every request instantly with a lock that never expires.
///
/// **Unsafe for multi-instance deployments.** It performs no coordination at
/// all: two processes, or two tasks in one process, both "hold" the same key
/// at once. Use it only when exactly one application instance can ever run a
/// migration.
#[derive(Debug)]
pub struct NoOpLockProvider {
    _private: (),
}

impl NoOpLockProvider {
    /// Creates the provider.
    pub fn new() -> Self {
        warn!("[lock.noop] using NoOpLockProvider: migrations are NOT coordinated across instances");
        Self { _private: () }
    }
}

impl Default for NoOpLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockProvider for NoOpLockProvider {
    async fn acquire_lock(
        &self,
        key: &LockKey,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> LockResult<Option<Box<dyn DistributedLock>>> {
        Ok(Some(Box::new(NoOpLock::new(key.clone()))))
    }

    async fn is_locked(&self, _key: &LockKey) -> LockResult<bool> {
        Ok(false)
    }

    fn lease_duration(&self) -> Option<Duration> {
        None
    }
}

/// Unexpiring lock handed out by [`NoOpLockProvider`].
#[derive(Debug)]
pub struct NoOpLock {
    info: LockInfo,
    released: AtomicBool,
}

impl NoOpLock {
    /// Creates a held lock for `key`.
    pub fn new(lock_key: LockKey) -> Self {
        Self {
            info: LockInfo {
                lock_id: LockId::new(),
                lock_key,
                acquired_at: Timestamp::now(),
                expires_at: None,
            },
            released: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DistributedLock for NoOpLock {
    fn info(&self) -> LockInfo {
        self.info.clone()
    }

    async fn renew(&self) -> LockResult<bool> {
        Ok(!self.released.load(Ordering::Acquire))
    }

    fn is_valid(&self) -> bool {
        !self.released.load(Ordering::Acquire)
    }

    async fn release(&self) -> LockResult<ReleaseOutcome> {
        if self.released.swap(true, Ordering::AcqRel) {
            Ok(ReleaseOutcome::AlreadyReleased)
        } else {
            Ok(ReleaseOutcome::Released)
        }
    }
}
