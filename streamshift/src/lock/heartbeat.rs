//! Background lease renewal.

use super::DistributedLock;
use crate::errors::{LockError, ValidationError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How often and how forgivingly a lock is renewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Time between renewals; must be strictly shorter than the lease.
    #[serde(with = "crate::config::duration_ms")]
    pub interval: Duration,
    /// Consecutive renewal errors after which the lock is treated as lost.
    pub max_consecutive_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_consecutive_failures: 2,
        }
    }
}

impl HeartbeatConfig {
    /// Checks the configuration against the provider's lease length.
    pub fn validate(&self, lease: Option<Duration>) -> Result<(), ValidationError> {
        if self.interval.is_zero() {
            return Err(ValidationError::InvalidConfiguration(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ValidationError::InvalidConfiguration(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if let Some(lease) = lease {
            if self.interval >= lease {
                return Err(ValidationError::InvalidConfiguration(format!(
                    "heartbeat interval {:?} must be shorter than the lock lease {:?}",
                    self.interval, lease
                )));
            }
        }
        Ok(())
    }
}

/// Renews a lock on its own task and reports when the lock is lost.
///
/// Loss is signalled through an atomic flag and the [`scope`](Self::scope)
/// token. A renewal that does not answer within one interval counts as a
/// failed renewal. Once lost, the heartbeat stops renewing; it never tries to
/// win the lock back.
pub struct LockHeartbeat {
    lock: Arc<dyn DistributedLock>,
    lost: Arc<AtomicBool>,
    scope: CancellationToken,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl LockHeartbeat {
    /// Starts renewing `lock` every `config.interval`.
    ///
    /// The heartbeat's scope is a child of `cancel`.
    pub fn spawn(
        lock: Arc<dyn DistributedLock>,
        config: HeartbeatConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let scope = cancel.child_token();
        let stop = CancellationToken::new();

        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&lock),
            config,
            Arc::clone(&lost),
            scope.clone(),
            stop.clone(),
        ));

        Self {
            lock,
            lost,
            scope,
            stop,
            handle,
        }
    }

    /// Whether the lock has been lost or its lease has run out.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire) || !self.lock.is_valid()
    }

    /// Token cancelled when the caller cancels or the lock is lost.
    ///
    /// Long-running work done under the lock should watch this token.
    pub fn scope(&self) -> CancellationToken {
        self.scope.clone()
    }

    /// Stops renewing and waits for the task to finish.
    ///
    /// Returns whether the lock had been lost.
    pub async fn stop(self) -> bool {
        self.stop.cancel();
        if let Err(join_error) = self.handle.await {
            error!(error = %join_error, "[lock.heartbeat] heartbeat task ended abnormally");
        }
        self.lost.load(Ordering::Acquire)
    }
}

async fn run_heartbeat(
    lock: Arc<dyn DistributedLock>,
    config: HeartbeatConfig,
    lost: Arc<AtomicBool>,
    scope: CancellationToken,
    stop: CancellationToken,
) {
    let lock_key = lock.info().lock_key;
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease is fresh at spawn time.
    let _ = ticker.tick().await;

    let mut consecutive_failures = 0_u32;
    loop {
        tokio::select! {
            () = stop.cancelled() => {
                debug!(lock_key = %lock_key, "[lock.heartbeat] stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let renewal = timeout(config.interval, lock.renew())
            .await
            .unwrap_or_else(|_| Err(LockError::Timeout(config.interval)));
        match renewal {
            Ok(true) => {
                consecutive_failures = 0;
                debug!(lock_key = %lock_key, "[lock.heartbeat] lease renewed");
            }
            Ok(false) => {
                error!(lock_key = %lock_key, "[lock.heartbeat] lease no longer held by this instance");
                break;
            }
            Err(renew_error) => {
                consecutive_failures += 1;
                warn!(
                    lock_key = %lock_key,
                    attempt = consecutive_failures,
                    error = %renew_error,
                    "[lock.heartbeat] lease renewal failed"
                );
                if consecutive_failures >= config.max_consecutive_failures {
                    error!(
                        lock_key = %lock_key,
                        failures = consecutive_failures,
                        "[lock.heartbeat] giving up on lease after consecutive renewal failures"
                    );
                    break;
                }
            }
        }
    }

    lost.store(true, Ordering::Release);
    scope.cancel();
}
