//! Out-of-band retry of failed mirror writes.
//!
//! During `DualWrite` and `DualRead` a write succeeds once the primary stream
//! accepted it. If the mirror write to the secondary stream fails, the
//! failure is recorded here instead of failing the caller, and retried later.
//! Anything never reconciled shows up as a count or checksum mismatch when
//! the migration is verified.

use crate::config::RetryConfig;
use crate::errors::EventStoreError;
use crate::event_store::{EventStore, EventToWrite, ExpectedVersion};
use crate::types::{EventVersion, StreamId, Timestamp};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest period between passes of [`ReconciliationQueue::spawn_retry_loop`].
pub const MIN_RETRY_LOOP_PERIOD: Duration = Duration::from_millis(10);

/// A mirror write waiting to be retried.
#[derive(Debug, Clone)]
pub struct PendingSecondaryWrite {
    /// Secondary stream the events belong to
    pub stream_id: StreamId,
    /// Version the secondary stream must be at for the events to fit
    pub expected: ExpectedVersion,
    /// The events to mirror
    pub events: Vec<EventToWrite>,
    /// Attempts made so far, including the original write
    pub attempts: u32,
    /// Most recent failure
    pub last_error: String,
    /// When the original write failed
    pub first_failed_at: Timestamp,
    next_attempt_at: Instant,
}

impl PendingSecondaryWrite {
    /// Records a first failed attempt.
    pub fn new(
        stream_id: StreamId,
        expected: ExpectedVersion,
        events: Vec<EventToWrite>,
        error: &EventStoreError,
    ) -> Self {
        Self {
            stream_id,
            expected,
            events,
            attempts: 1,
            last_error: error.to_string(),
            first_failed_at: Timestamp::now(),
            next_attempt_at: Instant::now(),
        }
    }

    /// Version the secondary stream reaches once these events are written.
    fn target_version(&self) -> Option<EventVersion> {
        match self.expected {
            ExpectedVersion::Exact(version) => Some(version.advance_by(self.events.len() as u64)),
            ExpectedVersion::NoStream => {
                Some(EventVersion::initial().advance_by(self.events.len() as u64))
            }
            ExpectedVersion::Any => None,
        }
    }
}

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Writes that succeeded on retry
    pub succeeded: usize,
    /// Writes dropped because the secondary already holds those positions
    pub superseded: usize,
    /// Writes kept for a later pass
    pub still_pending: usize,
    /// Writes given up on
    pub abandoned: usize,
}

/// Queue of failed mirror writes.
#[derive(Debug)]
pub struct ReconciliationQueue {
    pending: Mutex<VecDeque<PendingSecondaryWrite>>,
    abandoned: Mutex<Vec<PendingSecondaryWrite>>,
    retry: RetryConfig,
}

impl ReconciliationQueue {
    /// Creates an empty queue.
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            abandoned: Mutex::new(Vec::new()),
            retry,
        }
    }

    /// Records a failed mirror write.
    pub fn record(&self, write: PendingSecondaryWrite) {
        warn!(
            stream = %write.stream_id,
            expected = %write.expected,
            events = write.events.len(),
            error = %write.last_error,
            "[reconciliation.record] mirror write deferred"
        );
        self.pending.lock().push_back(write);
    }

    /// Number of writes waiting for a retry.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no writes are waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Pending writes for one secondary stream.
    pub fn pending_for(&self, stream_id: &StreamId) -> Vec<PendingSecondaryWrite> {
        self.pending
            .lock()
            .iter()
            .filter(|write| &write.stream_id == stream_id)
            .cloned()
            .collect()
    }

    /// Writes that exhausted their retries.
    pub fn abandoned(&self) -> Vec<PendingSecondaryWrite> {
        self.abandoned.lock().clone()
    }

    /// Retries every pending write whose backoff has elapsed.
    pub async fn retry_pending<S>(&self, store: &S) -> ReconciliationReport
    where
        S: EventStore + ?Sized,
    {
        let now = Instant::now();
        let due: Vec<PendingSecondaryWrite> = {
            let mut pending = self.pending.lock();
            let (due, waiting): (VecDeque<_>, VecDeque<_>) =
                pending.drain(..).partition(|write| write.next_attempt_at <= now);
            *pending = waiting;
            due.into_iter().collect()
        };

        let mut report = ReconciliationReport::default();
        let mut keep = Vec::new();

        for mut write in due {
            match store
                .append(&write.stream_id, write.expected, write.events.clone())
                .await
            {
                Ok(version) => {
                    debug!(stream = %write.stream_id, version = %version, "[reconciliation.retry] mirror write applied");
                    report.succeeded += 1;
                }
                Err(EventStoreError::VersionConflict { current, .. })
                    if write.target_version().is_some_and(|target| current >= target) =>
                {
                    debug!(
                        stream = %write.stream_id,
                        current = %current,
                        "[reconciliation.retry] secondary already caught up, dropping deferred write"
                    );
                    report.superseded += 1;
                }
                Err(EventStoreError::StreamClosed { .. }) => {
                    error!(stream = %write.stream_id, "[reconciliation.retry] secondary stream closed, abandoning deferred write");
                    report.abandoned += 1;
                    self.abandoned.lock().push(write);
                }
                Err(retry_error) => {
                    write.attempts += 1;
                    write.last_error = retry_error.to_string();
                    if write.attempts >= self.retry.max_attempts {
                        error!(
                            stream = %write.stream_id,
                            attempts = write.attempts,
                            error = %retry_error,
                            "[reconciliation.retry] giving up on deferred write"
                        );
                        report.abandoned += 1;
                        self.abandoned.lock().push(write);
                    } else {
                        write.next_attempt_at =
                            Instant::now() + self.retry.delay_for_attempt(write.attempts);
                        keep.push(write);
                    }
                }
            }
        }

        report.still_pending = keep.len();
        if !keep.is_empty() {
            let mut pending = self.pending.lock();
            for write in keep.into_iter().rev() {
                pending.push_front(write);
            }
            report.still_pending = pending.len();
        }

        if report != ReconciliationReport::default() {
            info!(
                succeeded = report.succeeded,
                superseded = report.superseded,
                still_pending = report.still_pending,
                abandoned = report.abandoned,
                "[reconciliation.retry] pass complete"
            );
        }
        report
    }

    /// Retries pending writes every `base_delay` until `cancel` fires.
    ///
    /// Passes are at least [`MIN_RETRY_LOOP_PERIOD`] apart; a zero
    /// `base_delay` only makes individual retries immediate.
    pub fn spawn_retry_loop<S>(
        self: Arc<Self>,
        store: Arc<S>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        S: EventStore + ?Sized + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.retry.base_delay.max(MIN_RETRY_LOOP_PERIOD));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let report = self.retry_pending(store.as_ref()).await;
                        if report.abandoned > 0 {
                            warn!(
                                abandoned = report.abandoned,
                                still_pending = report.still_pending,
                                "[reconciliation.loop] mirror writes abandoned"
                            );
                        } else if report.succeeded + report.superseded > 0 {
                            debug!(
                                succeeded = report.succeeded,
                                superseded = report.superseded,
                                still_pending = report.still_pending,
                                "[reconciliation.loop] pass finished"
                            );
                        }
                    }
                }
            }
        })
    }
}

impl Default for ReconciliationQueue {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
