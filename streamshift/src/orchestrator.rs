//! The cutover state machine.
//!
//! [`CutoverOrchestrator`] moves one object's stream through
//! `Normal -> DualWrite -> DualRead -> Cutover -> BookClosed`. Every phase
//! change is made while holding the object's migration lock, is persisted to
//! the routing table with a compare-and-set on the previous phase, and is
//! preceded by a check of the lock heartbeat and the caller's cancellation
//! token. A lost lock or a cancellation stops the run with routing left at
//! the last persisted phase; running the migration again resumes from there.
//!
//! Exit criteria per phase:
//!
//! - `Normal`: none
//! - `DualWrite`: the new stream's version equals the old stream's version
//!   after a catch-up pass (lag 0), within `max_catch_up_passes`
//! - `DualRead`: a final drain pass, then verification passes
//! - `Cutover`: book closing ran (skipped entirely when not configured)

use crate::book_closing::{
    BookCloser, BookClosingConfig, BookClosingReport, BookClosingRequest, ObjectHistory,
    SnapshotWriter, StreamArchiver,
};
use crate::config::MigrationConfig;
use crate::errors::{EventStoreError, MigrationError, MigrationResult, ValidationError};
use crate::event_store::{EventStore, ExpectedVersion, ReadOptions};
use crate::lock::{DistributedLock, LockHeartbeat, LockProvider};
use crate::planner::{MigrationPlan, MigrationPlanner, PlanRequest, Prerequisite};
use crate::reconciliation::ReconciliationQueue;
use crate::routing::MigrationPhase;
use crate::routing_table::{MigrationRoutingEntry, RoutingTable};
use crate::stream_closed::StreamLocation;
use crate::transformer::EventTransformer;
use crate::types::{EventVersion, LockKey, MigrationId, ObjectId, StreamId};
use crate::verification::{VerificationResult, Verifier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Which object to migrate, and where to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    /// Object whose stream moves
    pub object_id: ObjectId,
    /// Stream the object currently lives in
    pub old_stream: StreamId,
    /// Full coordinates of the destination; written into the closing sentinel
    pub new_location: StreamLocation,
    /// Extra prerequisites for planning
    pub prerequisites: Vec<Prerequisite>,
}

impl MigrationRequest {
    /// Request moving `old_stream` to `new_stream`.
    pub fn new(object_id: ObjectId, old_stream: StreamId, new_stream: StreamId) -> Self {
        Self {
            object_id,
            old_stream,
            new_location: StreamLocation::stream(new_stream),
            prerequisites: Vec::new(),
        }
    }

    /// Sets the destination's store coordinates.
    #[must_use]
    pub fn with_new_location(mut self, new_location: StreamLocation) -> Self {
        self.new_location = new_location;
        self
    }

    /// Adds a planning prerequisite.
    #[must_use]
    pub fn with_prerequisite(mut self, prerequisite: Prerequisite) -> Self {
        self.prerequisites.push(prerequisite);
        self
    }

    /// Destination stream id.
    pub const fn new_stream(&self) -> &StreamId {
        &self.new_location.stream_id
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The heartbeat lost the migration lock.
    LockLost,
    /// The caller cancelled.
    Cancelled,
}

/// How a migration run ended. Only failures of the machinery are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Another instance holds the migration lock.
    LockUnavailable,
    /// Catch-up did not reach lag 0 within the allowed passes.
    Stalled {
        /// Phase routing was left at
        phase: MigrationPhase,
        /// Old stream version at the last check
        old_version: EventVersion,
        /// New stream version at the last check
        new_version: EventVersion,
    },
    /// Verification failed; cutover was not allowed.
    VerificationFailed {
        /// Phase routing was left at
        phase: MigrationPhase,
        /// Every check's outcome
        result: VerificationResult,
    },
    /// The run stopped before finishing.
    Aborted {
        /// Phase routing was left at
        phase: MigrationPhase,
        /// Why it stopped
        reason: AbortReason,
    },
    /// The run finished.
    Completed {
        /// Final phase
        phase: MigrationPhase,
        /// Migration attempt id
        migration_id: Option<MigrationId>,
        /// Book closing report, when book closing ran in this call
        book_closing: Option<BookClosingReport>,
    },
}

impl MigrationOutcome {
    /// Whether the run finished.
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

struct HeldLock {
    key: LockKey,
    lock: Arc<dyn DistributedLock>,
    heartbeat: LockHeartbeat,
}

impl HeldLock {
    async fn release(self) {
        let lost = self.heartbeat.stop().await;
        match self.lock.release().await {
            Ok(outcome) => {
                debug!(lock_key = %self.key, outcome = ?outcome, lost, "[migration.lock] released");
            }
            Err(release_error) => warn!(
                lock_key = %self.key,
                error = %release_error,
                "[migration.lock] release failed, lease will expire"
            ),
        }
    }
}

enum CatchUp {
    Level,
    Stalled {
        old_version: EventVersion,
        new_version: EventVersion,
    },
    Interrupted(AbortReason),
}

/// Drives migrations for any number of objects.
pub struct CutoverOrchestrator<S: ?Sized> {
    store: Arc<S>,
    locks: Arc<dyn LockProvider>,
    table: Arc<dyn RoutingTable>,
    transformer: Arc<dyn EventTransformer>,
    config: MigrationConfig,
    planner: MigrationPlanner,
    verifier: Verifier,
    reconciliation: Option<Arc<ReconciliationQueue>>,
    snapshots: Option<Arc<dyn SnapshotWriter>>,
    archiver: Option<Arc<dyn StreamArchiver>>,
    history: Option<Arc<dyn ObjectHistory>>,
}

impl<S> CutoverOrchestrator<S>
where
    S: EventStore + ?Sized,
{
    /// Creates an orchestrator.
    pub fn new(
        store: Arc<S>,
        locks: Arc<dyn LockProvider>,
        table: Arc<dyn RoutingTable>,
        transformer: Arc<dyn EventTransformer>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            planner: MigrationPlanner::new(config.planner.clone()),
            verifier: Verifier::new(config.verification.clone()),
            store,
            locks,
            table,
            transformer,
            config,
            reconciliation: None,
            snapshots: None,
            archiver: None,
            history: None,
        }
    }

    /// Replaces the verifier, e.g. to add custom validators.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Drains this queue before verifying.
    #[must_use]
    pub fn with_reconciliation(mut self, queue: Arc<ReconciliationQueue>) -> Self {
        self.reconciliation = Some(queue);
        self
    }

    /// Sets the snapshot writer used by book closing.
    #[must_use]
    pub fn with_snapshot_writer(mut self, writer: Arc<dyn SnapshotWriter>) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Sets the archiver used by book closing.
    #[must_use]
    pub fn with_archiver(mut self, archiver: Arc<dyn StreamArchiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Sets the object history used by book closing.
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn ObjectHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// The configuration in use.
    pub const fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Dry-runs a migration. Read-only.
    pub async fn plan(
        &self,
        request: &MigrationRequest,
        cancel: &CancellationToken,
    ) -> MigrationResult<MigrationPlan> {
        let mut plan_request = PlanRequest::new(
            request.object_id.clone(),
            request.old_stream.clone(),
            request.new_stream().clone(),
        )
        .with_lock_timing(self.locks.lease_duration(), self.config.heartbeat.interval)
        .with_book_closing(self.config.book_closing.clone());
        for prerequisite in &request.prerequisites {
            plan_request = plan_request.with_prerequisite(prerequisite.clone());
        }
        self.planner
            .plan(self.store.as_ref(), &plan_request, self.transformer.as_ref(), cancel)
            .await
    }

    /// Runs verification of the new stream against the old. Read-only.
    pub async fn verify(
        &self,
        request: &MigrationRequest,
        cancel: &CancellationToken,
    ) -> MigrationResult<VerificationResult> {
        self.verifier
            .run(
                self.store.as_ref(),
                &request.old_stream,
                request.new_stream(),
                Some(self.transformer.as_ref()),
                cancel,
            )
            .await
    }

    /// Current routing entry of an object.
    pub async fn status(&self, object_id: &ObjectId) -> MigrationResult<Option<MigrationRoutingEntry>> {
        Ok(self.table.get(object_id).await?)
    }

    /// Removes the routing entry of a finished migration.
    ///
    /// Afterwards the closed old stream's sentinel is what redirects readers
    /// and writers, so an entry whose old stream was deleted is kept.
    /// Returns `false` when there was no entry.
    pub async fn retire(&self, object_id: &ObjectId) -> MigrationResult<bool> {
        let Some(entry) = self.table.get(object_id).await? else {
            return Ok(false);
        };
        if entry.phase != MigrationPhase::BookClosed {
            return Err(MigrationError::InvalidPhase {
                object_id: object_id.clone(),
                required: MigrationPhase::BookClosed,
                actual: entry.phase,
            });
        }
        if self.store.stream_version(&entry.old_stream).await? == EventVersion::initial() {
            warn!(
                object_id = %object_id,
                old_stream = %entry.old_stream,
                "[migration.retire] old stream was deleted, keeping routing entry"
            );
            return Err(MigrationError::RedirectStillNeeded {
                object_id: object_id.clone(),
                old_stream: entry.old_stream,
            });
        }
        self.table.remove(object_id).await?;
        info!(object_id = %object_id, migration_id = %entry.migration_id, "[migration.retire] routing entry removed");
        Ok(true)
    }

    /// Runs, or resumes, a migration as far as it can go.
    #[instrument(skip(self, cancel), fields(object_id = %request.object_id))]
    pub async fn start_migration(
        &self,
        request: &MigrationRequest,
        cancel: &CancellationToken,
    ) -> MigrationResult<MigrationOutcome> {
        self.config.validate(self.locks.lease_duration())?;
        if &request.old_stream == request.new_stream() {
            return Err(ValidationError::InvalidConfiguration(format!(
                "old and new stream are both '{}'",
                request.old_stream
            ))
            .into());
        }

        let held = match self.acquire(&request.object_id, cancel).await? {
            Ok(held) => held,
            Err(outcome) => return Ok(outcome),
        };
        let result = self.run_phases(request, &held.heartbeat, cancel).await;
        held.release().await;
        result
    }

    /// Closes the old stream of an object.
    ///
    /// Requires the object to be at least in `Cutover` unless `force` is set.
    /// An object in `Cutover` moves to `BookClosed` afterwards. Book closing
    /// uses the configured settings, or the defaults when none are configured.
    #[instrument(skip(self, cancel), fields(object_id = %request.object_id))]
    pub async fn close_book(
        &self,
        request: &MigrationRequest,
        force: bool,
        cancel: &CancellationToken,
    ) -> MigrationResult<MigrationOutcome> {
        let entry = self.table.get(&request.object_id).await?;
        let phase = entry.as_ref().map_or(MigrationPhase::Normal, |entry| entry.phase);
        if phase < MigrationPhase::Cutover && !force {
            return Err(MigrationError::InvalidPhase {
                object_id: request.object_id.clone(),
                required: MigrationPhase::Cutover,
                actual: phase,
            });
        }
        let config = self.config.book_closing.clone().unwrap_or_default();
        config.validate()?;

        let held = match self.acquire(&request.object_id, cancel).await? {
            Ok(held) => held,
            Err(outcome) => return Ok(outcome),
        };
        let result = self
            .close_book_locked(request, phase, config, &held.heartbeat, cancel)
            .await;
        held.release().await;
        result
    }

    async fn close_book_locked(
        &self,
        request: &MigrationRequest,
        phase: MigrationPhase,
        config: BookClosingConfig,
        heartbeat: &LockHeartbeat,
        cancel: &CancellationToken,
    ) -> MigrationResult<MigrationOutcome> {
        // Re-read under the lock; the earlier read only gated the request.
        let entry = self.table.get(&request.object_id).await?;
        if let Some(reason) = interrupted(heartbeat, cancel) {
            return Ok(MigrationOutcome::Aborted {
                phase: entry.as_ref().map_or(MigrationPhase::Normal, |entry| entry.phase),
                reason,
            });
        }
        let migration_id = entry.as_ref().map(|entry| entry.migration_id);
        let report = self
            .book_closer(config)
            .close(&closing_request(request, migration_id))
            .await?;

        let Some(entry) = entry.filter(|entry| entry.phase == MigrationPhase::Cutover) else {
            return Ok(MigrationOutcome::Completed {
                phase,
                migration_id,
                book_closing: Some(report),
            });
        };
        if let Some(reason) = interrupted(heartbeat, cancel) {
            return Ok(MigrationOutcome::Aborted {
                phase: entry.phase,
                reason,
            });
        }
        let entry = self.transition(&entry, MigrationPhase::BookClosed).await?;
        Ok(MigrationOutcome::Completed {
            phase: entry.phase,
            migration_id,
            book_closing: Some(report),
        })
    }

    /// Takes the object's migration lock and starts its heartbeat.
    ///
    /// `Err` carries the outcome to report when the lock was not obtained.
    async fn acquire(
        &self,
        object_id: &ObjectId,
        cancel: &CancellationToken,
    ) -> MigrationResult<Result<HeldLock, MigrationOutcome>> {
        let key = LockKey::for_migration(object_id);
        let Some(lock) = self
            .locks
            .acquire_lock(&key, self.config.lock_timeout, cancel)
            .await?
        else {
            if cancel.is_cancelled() {
                return Ok(Err(MigrationOutcome::Aborted {
                    phase: self.current_phase(object_id).await?,
                    reason: AbortReason::Cancelled,
                }));
            }
            info!(lock_key = %key, "[migration.lock] lock held elsewhere");
            return Ok(Err(MigrationOutcome::LockUnavailable));
        };
        let lock: Arc<dyn DistributedLock> = Arc::from(lock);
        debug!(lock_key = %key, lock_id = %lock.info().lock_id, "[migration.lock] acquired");

        let heartbeat = LockHeartbeat::spawn(Arc::clone(&lock), self.config.heartbeat.clone(), cancel);
        Ok(Ok(HeldLock {
            key,
            lock,
            heartbeat,
        }))
    }

    async fn current_phase(&self, object_id: &ObjectId) -> MigrationResult<MigrationPhase> {
        Ok(self
            .table
            .get(object_id)
            .await?
            .map_or(MigrationPhase::Normal, |entry| entry.phase))
    }

    async fn run_phases(
        &self,
        request: &MigrationRequest,
        heartbeat: &LockHeartbeat,
        cancel: &CancellationToken,
    ) -> MigrationResult<MigrationOutcome> {
        let mut entry = self.load_or_create_entry(request).await?;
        let mut book_closing = None;

        loop {
            match entry.phase {
                MigrationPhase::Normal => {}
                MigrationPhase::DualWrite => {
                    match self.catch_up(&entry, heartbeat, cancel).await? {
                        CatchUp::Level => {}
                        CatchUp::Stalled {
                            old_version,
                            new_version,
                        } => {
                            warn!(
                                object_id = %entry.object_id,
                                old_version = %old_version,
                                new_version = %new_version,
                                "[migration.catch_up] new stream did not catch up"
                            );
                            return Ok(MigrationOutcome::Stalled {
                                phase: entry.phase,
                                old_version,
                                new_version,
                            });
                        }
                        CatchUp::Interrupted(reason) => {
                            return Ok(aborted(&entry, reason));
                        }
                    }
                }
                MigrationPhase::DualRead => {
                    self.reconcile(&entry).await;
                    if let Some(reason) = self.drain(&entry, heartbeat, cancel).await? {
                        return Ok(aborted(&entry, reason));
                    }
                    let result = match self
                        .verifier
                        .run(
                            self.store.as_ref(),
                            &entry.old_stream,
                            &entry.new_stream,
                            Some(self.transformer.as_ref()),
                            &heartbeat.scope(),
                        )
                        .await
                    {
                        Ok(result) => result,
                        Err(MigrationError::Cancelled) => {
                            let reason = interrupted(heartbeat, cancel).unwrap_or(AbortReason::Cancelled);
                            return Ok(aborted(&entry, reason));
                        }
                        Err(verification_error) => return Err(verification_error),
                    };
                    if !result.passed() {
                        warn!(
                            object_id = %entry.object_id,
                            errors = ?result.errors,
                            "[migration.verify] verification failed, cutover blocked"
                        );
                        return Ok(MigrationOutcome::VerificationFailed {
                            phase: entry.phase,
                            result,
                        });
                    }
                }
                MigrationPhase::Cutover => {
                    let Some(config) = self.config.book_closing.clone() else {
                        return Ok(completed(&entry, book_closing));
                    };
                    if let Some(reason) = interrupted(heartbeat, cancel) {
                        return Ok(aborted(&entry, reason));
                    }
                    let report = self
                        .book_closer(config)
                        .close(&closing_request(request, Some(entry.migration_id)))
                        .await?;
                    book_closing = Some(report);
                }
                MigrationPhase::BookClosed => return Ok(completed(&entry, book_closing)),
            }

            let Some(next) = entry.phase.next() else {
                return Ok(completed(&entry, book_closing));
            };
            if let Some(reason) = interrupted(heartbeat, cancel) {
                return Ok(aborted(&entry, reason));
            }
            entry = self.transition(&entry, next).await?;
        }
    }

    async fn load_or_create_entry(
        &self,
        request: &MigrationRequest,
    ) -> MigrationResult<MigrationRoutingEntry> {
        match self.table.get(&request.object_id).await? {
            None => {
                let entry = MigrationRoutingEntry::new(
                    request.object_id.clone(),
                    request.old_stream.clone(),
                    request.new_stream().clone(),
                );
                self.table.put(entry.clone(), None).await?;
                info!(
                    object_id = %entry.object_id,
                    migration_id = %entry.migration_id,
                    old_stream = %entry.old_stream,
                    new_stream = %entry.new_stream,
                    "[migration.start] migration recorded"
                );
                Ok(entry)
            }
            Some(entry)
                if entry.old_stream == request.old_stream
                    && &entry.new_stream == request.new_stream() =>
            {
                info!(
                    object_id = %entry.object_id,
                    migration_id = %entry.migration_id,
                    phase = %entry.phase,
                    "[migration.start] resuming from persisted phase"
                );
                Ok(entry)
            }
            Some(entry) => Err(MigrationError::RoutingConflict {
                object_id: request.object_id.clone(),
                detail: format!(
                    "migration {} already moves '{}' to '{}'",
                    entry.migration_id, entry.old_stream, entry.new_stream
                ),
            }),
        }
    }

    async fn transition(
        &self,
        entry: &MigrationRoutingEntry,
        next: MigrationPhase,
    ) -> MigrationResult<MigrationRoutingEntry> {
        let advanced = entry.advance(next)?;
        self.table.put(advanced.clone(), Some(entry.phase)).await?;
        info!(
            object_id = %entry.object_id,
            migration_id = %entry.migration_id,
            from = %entry.phase,
            to = %next,
            "[migration.transition] phase advanced"
        );
        Ok(advanced)
    }

    async fn catch_up(
        &self,
        entry: &MigrationRoutingEntry,
        heartbeat: &LockHeartbeat,
        cancel: &CancellationToken,
    ) -> MigrationResult<CatchUp> {
        for pass in 1..=self.config.max_catch_up_passes {
            if let Some(reason) = interrupted(heartbeat, cancel) {
                return Ok(CatchUp::Interrupted(reason));
            }
            let old_version = self.store.stream_version(&entry.old_stream).await?;
            let new_version = self.store.stream_version(&entry.new_stream).await?;
            if new_version == old_version {
                debug!(object_id = %entry.object_id, version = %old_version, pass, "[migration.catch_up] level");
                return Ok(CatchUp::Level);
            }
            if new_version > old_version {
                error!(
                    object_id = %entry.object_id,
                    old_version = %old_version,
                    new_version = %new_version,
                    "[migration.catch_up] new stream is ahead of old during dual write"
                );
                return Ok(CatchUp::Stalled {
                    old_version,
                    new_version,
                });
            }
            debug!(
                object_id = %entry.object_id,
                pass,
                lag = new_version.lag_behind(old_version),
                "[migration.catch_up] copying"
            );
            if let Some(reason) = self.copy_range(entry, new_version, old_version, heartbeat, cancel).await? {
                return Ok(CatchUp::Interrupted(reason));
            }
        }

        let old_version = self.store.stream_version(&entry.old_stream).await?;
        let new_version = self.store.stream_version(&entry.new_stream).await?;
        if new_version == old_version {
            Ok(CatchUp::Level)
        } else {
            Ok(CatchUp::Stalled {
                old_version,
                new_version,
            })
        }
    }

    /// Retries deferred mirror writes before verification looks at both streams.
    async fn reconcile(&self, entry: &MigrationRoutingEntry) {
        let Some(queue) = &self.reconciliation else {
            return;
        };
        let report = queue.retry_pending(self.store.as_ref()).await;
        if report.abandoned > 0 || report.still_pending > 0 {
            warn!(
                object_id = %entry.object_id,
                abandoned = report.abandoned,
                still_pending = report.still_pending,
                total_abandoned = queue.abandoned().len(),
                "[migration.reconcile] mirror writes not reconciled, verification may fail"
            );
        } else {
            debug!(
                object_id = %entry.object_id,
                succeeded = report.succeeded,
                superseded = report.superseded,
                "[migration.reconcile] mirror writes reconciled"
            );
        }
    }

    /// Copies stragglers written to the old stream by writers still routing
    /// with `DualWrite`.
    async fn drain(
        &self,
        entry: &MigrationRoutingEntry,
        heartbeat: &LockHeartbeat,
        cancel: &CancellationToken,
    ) -> MigrationResult<Option<AbortReason>> {
        let old_version = self.store.stream_version(&entry.old_stream).await?;
        let new_version = self.store.stream_version(&entry.new_stream).await?;
        if old_version <= new_version {
            return Ok(None);
        }
        info!(
            object_id = %entry.object_id,
            lag = new_version.lag_behind(old_version),
            "[migration.drain] copying late writes from the old stream"
        );
        self.copy_range(entry, new_version, old_version, heartbeat, cancel).await
    }

    /// Copies old-stream events after `from` up to `to` into the new stream,
    /// keeping versions aligned. Mirror copies go back untransformed. Stops the
    /// pass early on a version conflict, which means a mirror write landed first.
    async fn copy_range(
        &self,
        entry: &MigrationRoutingEntry,
        from: EventVersion,
        to: EventVersion,
        heartbeat: &LockHeartbeat,
        cancel: &CancellationToken,
    ) -> MigrationResult<Option<AbortReason>> {
        let mut position = from;
        while position < to {
            if let Some(reason) = interrupted(heartbeat, cancel) {
                return Ok(Some(reason));
            }
            let batch = self
                .store
                .read(
                    &entry.old_stream,
                    &ReadOptions::new()
                        .from_version(position.next())
                        .to_version(to)
                        .with_max_events(self.config.backfill_batch_size),
                )
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut writes = Vec::with_capacity(batch.len());
            for event in &batch {
                if event.is_stream_closed() {
                    return Err(MigrationError::RoutingConflict {
                        object_id: entry.object_id.clone(),
                        detail: format!("old stream '{}' was closed during migration", entry.old_stream),
                    });
                }
                if event.mirrored_from().is_some() {
                    writes.push(event.to_unmirrored_write());
                    continue;
                }
                let transformed = self.transformer.transform(event).await.map_err(|source| {
                    MigrationError::Transform {
                        stream: entry.old_stream.clone(),
                        version: event.version,
                        source,
                    }
                })?;
                writes.push(transformed);
            }

            let count = writes.len() as u64;
            match self
                .store
                .append(&entry.new_stream, ExpectedVersion::Exact(position), writes)
                .await
            {
                Ok(version) => {
                    debug!(object_id = %entry.object_id, events = count, version = %version, "[migration.copy] batch copied");
                    position = version;
                }
                Err(EventStoreError::VersionConflict { current, .. }) => {
                    debug!(
                        object_id = %entry.object_id,
                        expected = %position,
                        current = %current,
                        "[migration.copy] new stream moved, re-reading"
                    );
                    break;
                }
                Err(copy_error) => return Err(copy_error.into()),
            }
        }
        Ok(None)
    }

    fn book_closer(&self, config: BookClosingConfig) -> BookCloser<S> {
        let mut closer = BookCloser::new(Arc::clone(&self.store), config);
        if let Some(writer) = &self.snapshots {
            closer = closer.with_snapshot_writer(Arc::clone(writer));
        }
        if let Some(archiver) = &self.archiver {
            closer = closer.with_archiver(Arc::clone(archiver));
        }
        if let Some(history) = &self.history {
            closer = closer.with_history(Arc::clone(history));
        }
        closer
    }
}

fn interrupted(heartbeat: &LockHeartbeat, cancel: &CancellationToken) -> Option<AbortReason> {
    if heartbeat.is_lost() {
        Some(AbortReason::LockLost)
    } else if cancel.is_cancelled() {
        Some(AbortReason::Cancelled)
    } else {
        None
    }
}

fn aborted(entry: &MigrationRoutingEntry, reason: AbortReason) -> MigrationOutcome {
    match reason {
        AbortReason::LockLost => error!(
            object_id = %entry.object_id,
            phase = %entry.phase,
            "[migration.abort] migration lock lost, stopping at current phase"
        ),
        AbortReason::Cancelled => info!(
            object_id = %entry.object_id,
            phase = %entry.phase,
            "[migration.abort] cancelled, stopping at current phase"
        ),
    }
    MigrationOutcome::Aborted {
        phase: entry.phase,
        reason,
    }
}

fn completed(entry: &MigrationRoutingEntry, book_closing: Option<BookClosingReport>) -> MigrationOutcome {
    info!(
        object_id = %entry.object_id,
        migration_id = %entry.migration_id,
        phase = %entry.phase,
        "[migration.complete] migration finished"
    );
    MigrationOutcome::Completed {
        phase: entry.phase,
        migration_id: Some(entry.migration_id),
        book_closing,
    }
}

fn closing_request(request: &MigrationRequest, migration_id: Option<MigrationId>) -> BookClosingRequest {
    BookClosingRequest {
        object_id: request.object_id.clone(),
        stream_id: request.old_stream.clone(),
        continuation: request.new_location.clone(),
        migration_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{LockResult, TransformError};
    use crate::event_store::{read_all, EventToWrite, RecordedEvent};
    use crate::lock::{HeartbeatConfig, LockInfo, NoOpLockProvider, ReleaseOutcome};
    use crate::routing_table::InMemoryRoutingTable;
    use crate::stream_closed::StreamClosedEvent;
    use crate::testing::VecEventStore;
    use crate::transformer::IdentityTransformer;
    use crate::types::{EventTypeName, LockId, Timestamp};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn object() -> ObjectId {
        ObjectId::try_new("order-7").unwrap()
    }

    fn old() -> StreamId {
        StreamId::try_new("orders-v1-7").unwrap()
    }

    fn new() -> StreamId {
        StreamId::try_new("orders-v2-7").unwrap()
    }

    fn request() -> MigrationRequest {
        MigrationRequest::new(object(), old(), new())
    }

    fn config(book_closing: Option<BookClosingConfig>) -> MigrationConfig {
        MigrationConfig {
            backfill_batch_size: 16,
            book_closing,
            ..MigrationConfig::default()
        }
    }

    fn orchestrator(
        store: &Arc<VecEventStore>,
        table: &Arc<InMemoryRoutingTable>,
        config: MigrationConfig,
    ) -> CutoverOrchestrator<VecEventStore> {
        CutoverOrchestrator::new(
            Arc::clone(store),
            Arc::new(NoOpLockProvider::new()),
            table.clone(),
            Arc::new(IdentityTransformer),
            config,
        )
    }

    /// Provider whose locks are refused on the first renewal.
    struct RevokingLockProvider;

    struct RevokedLock(LockInfo);

    #[async_trait]
    impl DistributedLock for RevokedLock {
        fn info(&self) -> LockInfo {
            self.0.clone()
        }

        async fn renew(&self) -> LockResult<bool> {
            Ok(false)
        }

        fn is_valid(&self) -> bool {
            true
        }

        async fn release(&self) -> LockResult<ReleaseOutcome> {
            Ok(ReleaseOutcome::AlreadyReleased)
        }
    }

    #[async_trait]
    impl LockProvider for RevokingLockProvider {
        async fn acquire_lock(
            &self,
            key: &LockKey,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> LockResult<Option<Box<dyn DistributedLock>>> {
            Ok(Some(Box::new(RevokedLock(LockInfo {
                lock_id: LockId::new(),
                lock_key: key.clone(),
                acquired_at: Timestamp::now(),
                expires_at: None,
            }))))
        }

        async fn is_locked(&self, _key: &LockKey) -> LockResult<bool> {
            Ok(true)
        }

        fn lease_duration(&self) -> Option<Duration> {
            None
        }
    }

    /// Provider that never grants.
    struct BusyLockProvider;

    #[async_trait]
    impl LockProvider for BusyLockProvider {
        async fn acquire_lock(
            &self,
            _key: &LockKey,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> LockResult<Option<Box<dyn DistributedLock>>> {
            Ok(None)
        }

        async fn is_locked(&self, _key: &LockKey) -> LockResult<bool> {
            Ok(true)
        }

        fn lease_duration(&self) -> Option<Duration> {
            None
        }
    }

    /// Provider whose lock answers renewals until `revoked` is set and whose
    /// lease reports `valid`.
    struct SwitchableLockProvider {
        revoked: Arc<AtomicBool>,
        valid: bool,
    }

    struct SwitchableLock {
        info: LockInfo,
        revoked: Arc<AtomicBool>,
        valid: bool,
    }

    #[async_trait]
    impl DistributedLock for SwitchableLock {
        fn info(&self) -> LockInfo {
            self.info.clone()
        }

        async fn renew(&self) -> LockResult<bool> {
            Ok(!self.revoked.load(Ordering::SeqCst))
        }

        fn is_valid(&self) -> bool {
            self.valid
        }

        async fn release(&self) -> LockResult<ReleaseOutcome> {
            Ok(ReleaseOutcome::Released)
        }
    }

    #[async_trait]
    impl LockProvider for SwitchableLockProvider {
        async fn acquire_lock(
            &self,
            key: &LockKey,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> LockResult<Option<Box<dyn DistributedLock>>> {
            Ok(Some(Box::new(SwitchableLock {
                info: LockInfo {
                    lock_id: LockId::new(),
                    lock_key: key.clone(),
                    acquired_at: Timestamp::now(),
                    expires_at: None,
                },
                revoked: Arc::clone(&self.revoked),
                valid: self.valid,
            })))
        }

        async fn is_locked(&self, _key: &LockKey) -> LockResult<bool> {
            Ok(true)
        }

        fn lease_duration(&self) -> Option<Duration> {
            None
        }
    }

    /// Copies events unchanged; from call `revoke_after + 1` on it revokes
    /// the lock and slows down.
    struct RevokingTransformer {
        calls: AtomicUsize,
        revoke_after: usize,
        revoked: Arc<AtomicBool>,
    }

    #[async_trait]
    impl EventTransformer for RevokingTransformer {
        async fn transform(&self, event: &RecordedEvent) -> Result<EventToWrite, TransformError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.revoke_after {
                self.revoked.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
            Ok(event.to_event_to_write())
        }
    }

    struct SlowTransformer;

    #[async_trait]
    impl EventTransformer for SlowTransformer {
        async fn transform(&self, event: &RecordedEvent) -> Result<EventToWrite, TransformError> {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok(event.to_event_to_write())
        }
    }

    #[tokio::test]
    async fn migrates_through_every_phase_and_closes_the_old_stream() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 100).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(&store, &table, config(Some(BookClosingConfig::default())));

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        let MigrationOutcome::Completed {
            phase,
            migration_id,
            book_closing: Some(report),
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(phase, MigrationPhase::BookClosed);
        assert_eq!(report.last_business_version, EventVersion::new(100));
        assert_eq!(report.closed_at_version, EventVersion::new(101));

        assert_eq!(store.stream_version(&new()).await.unwrap(), EventVersion::new(100));
        let closed = store
            .append(
                &old(),
                ExpectedVersion::Any,
                vec![EventToWrite::new(
                    EventTypeName::try_new("ItemAdded").unwrap(),
                    serde_json::json!({}),
                )],
            )
            .await;
        assert!(matches!(closed, Err(EventStoreError::StreamClosed { .. })));

        let old_events = read_all(store.as_ref(), &old()).await.unwrap();
        let sentinel = StreamClosedEvent::from_recorded(old_events.last().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(sentinel.continuation_stream_id, new());
        assert_eq!(sentinel.migration_id, migration_id);

        let entry = orchestrator.status(&object()).await.unwrap().unwrap();
        assert_eq!(entry.phase, MigrationPhase::BookClosed);
        assert!(orchestrator.retire(&object()).await.unwrap());
        assert!(orchestrator.status(&object()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stops_at_cutover_without_book_closing() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 5).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(&store, &table, config(None));

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            MigrationOutcome::Completed {
                phase: MigrationPhase::Cutover,
                book_closing: None,
                ..
            }
        ));
        assert_eq!(store.stream_version(&old()).await.unwrap(), EventVersion::new(5));
        assert!(matches!(
            orchestrator.retire(&object()).await,
            Err(MigrationError::InvalidPhase { .. })
        ));
    }

    #[tokio::test]
    async fn close_book_finishes_a_cutover_migration() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 3).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(&store, &table, config(None));
        let cancel = CancellationToken::new();
        let _ = orchestrator.start_migration(&request(), &cancel).await.unwrap();

        let outcome = orchestrator.close_book(&request(), false, &cancel).await.unwrap();

        assert!(matches!(
            outcome,
            MigrationOutcome::Completed {
                phase: MigrationPhase::BookClosed,
                book_closing: Some(_),
                ..
            }
        ));
        assert_eq!(store.stream_version(&old()).await.unwrap(), EventVersion::new(4));
    }

    #[tokio::test]
    async fn close_book_before_cutover_requires_force() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 3).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(&store, &table, config(None));
        let cancel = CancellationToken::new();

        let refused = orchestrator.close_book(&request(), false, &cancel).await;
        assert!(matches!(
            refused,
            Err(MigrationError::InvalidPhase {
                actual: MigrationPhase::Normal,
                ..
            })
        ));

        let forced = orchestrator.close_book(&request(), true, &cancel).await.unwrap();
        assert!(matches!(
            forced,
            MigrationOutcome::Completed {
                phase: MigrationPhase::Normal,
                migration_id: None,
                ..
            }
        ));
        assert_eq!(store.stream_version(&old()).await.unwrap(), EventVersion::new(4));
    }

    #[tokio::test]
    async fn failed_verification_blocks_cutover() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 4).await;
        let _ = store
            .append(
                &new(),
                ExpectedVersion::NoStream,
                vec![EventToWrite::new(
                    EventTypeName::try_new("ItemAdded").unwrap(),
                    serde_json::json!({ "line": 999 }),
                )],
            )
            .await
            .unwrap();
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(&store, &table, config(None));

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        let MigrationOutcome::VerificationFailed { phase, result } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(phase, MigrationPhase::DualRead);
        assert!(!result.passed());
        assert_eq!(
            orchestrator.status(&object()).await.unwrap().unwrap().phase,
            MigrationPhase::DualRead
        );
    }

    #[tokio::test]
    async fn custom_validator_failure_blocks_cutover() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 2).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let config = config(None);
        let verifier = Verifier::new(config.verification.clone())
            .with_validator("always_fails", |_context| Err("nope".to_string()));
        let orchestrator = orchestrator(&store, &table, config).with_verifier(verifier);

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, MigrationOutcome::VerificationFailed { .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn resumes_from_the_persisted_phase() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 6).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let entry = MigrationRoutingEntry::new(object(), old(), new());
        let migration_id = entry.migration_id;
        let dual_write = entry.advance(MigrationPhase::DualWrite).unwrap();
        table.put(entry, None).await.unwrap();
        table
            .put(dual_write, Some(MigrationPhase::Normal))
            .await
            .unwrap();
        let orchestrator = orchestrator(&store, &table, config(None));

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MigrationOutcome::Completed {
                phase: MigrationPhase::Cutover,
                migration_id: Some(migration_id),
                book_closing: None,
            }
        );
        assert!(logs_contain("[migration.start] resuming from persisted phase"));
        assert!(logs_contain("[migration.transition] phase advanced"));
    }

    #[tokio::test]
    async fn different_stream_pair_conflicts_with_existing_migration() {
        let store = Arc::new(VecEventStore::default());
        let table = Arc::new(InMemoryRoutingTable::new());
        table
            .put(
                MigrationRoutingEntry::new(object(), old(), StreamId::try_new("orders-v3-7").unwrap()),
                None,
            )
            .await
            .unwrap();
        let orchestrator = orchestrator(&store, &table, config(None));

        let result = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(MigrationError::RoutingConflict { .. })));
    }

    #[tokio::test]
    async fn same_old_and_new_stream_is_rejected() {
        let store = Arc::new(VecEventStore::default());
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(&store, &table, config(None));

        let result = orchestrator
            .start_migration(
                &MigrationRequest::new(object(), old(), old()),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(MigrationError::Validation(_))));
        assert!(table.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_lock_changes_nothing() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 2).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = CutoverOrchestrator::new(
            Arc::clone(&store),
            Arc::new(BusyLockProvider),
            table.clone(),
            Arc::new(IdentityTransformer),
            config(None),
        );

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, MigrationOutcome::LockUnavailable);
        assert!(table.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_the_first_transition() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 2).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(&store, &table, config(None));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator.start_migration(&request(), &cancel).await.unwrap();

        assert_eq!(
            outcome,
            MigrationOutcome::Aborted {
                phase: MigrationPhase::Normal,
                reason: AbortReason::Cancelled,
            }
        );
        assert_eq!(store.stream_version(&new()).await.unwrap(), EventVersion::initial());
    }

    #[tokio::test]
    async fn lost_lock_aborts_before_cutover() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 20).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let config = MigrationConfig {
            backfill_batch_size: 1,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(10),
                max_consecutive_failures: 2,
            },
            ..MigrationConfig::default()
        };
        let orchestrator = CutoverOrchestrator::new(
            Arc::clone(&store),
            Arc::new(RevokingLockProvider),
            table.clone(),
            Arc::new(SlowTransformer),
            config,
        );

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        let MigrationOutcome::Aborted { phase, reason } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(reason, AbortReason::LockLost);
        assert!(phase < MigrationPhase::DualRead);
        assert!(store.stream_version(&new()).await.unwrap() < EventVersion::new(20));
    }

    #[tokio::test]
    async fn plan_reports_the_source_stream() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 12).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(&store, &table, config(None));

        let plan = orchestrator
            .plan(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(plan.source_analysis().event_count, 12);
        assert!(plan.blocking_prerequisites().next().is_none());
        assert!(table.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_stops_the_run_without_waiting_for_renewal() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 5).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = CutoverOrchestrator::new(
            Arc::clone(&store),
            Arc::new(SwitchableLockProvider {
                revoked: Arc::new(AtomicBool::new(false)),
                valid: false,
            }),
            table.clone(),
            Arc::new(IdentityTransformer),
            config(None),
        );

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MigrationOutcome::Aborted {
                phase: MigrationPhase::Normal,
                reason: AbortReason::LockLost,
            }
        );
        assert_eq!(store.stream_version(&new()).await.unwrap(), EventVersion::initial());
    }

    #[tokio::test]
    async fn lock_lost_during_verification_stops_it_early() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 10).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let revoked = Arc::new(AtomicBool::new(false));
        let transformer = Arc::new(RevokingTransformer {
            calls: AtomicUsize::new(0),
            revoke_after: 10,
            revoked: Arc::clone(&revoked),
        });
        let config = MigrationConfig {
            backfill_batch_size: 100,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(20),
                max_consecutive_failures: 2,
            },
            book_closing: None,
            ..MigrationConfig::default()
        };
        let orchestrator = CutoverOrchestrator::new(
            Arc::clone(&store),
            Arc::new(SwitchableLockProvider {
                revoked,
                valid: true,
            }),
            table.clone(),
            transformer.clone(),
            config,
        );

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MigrationOutcome::Aborted {
                phase: MigrationPhase::DualRead,
                reason: AbortReason::LockLost,
            }
        );
        // Ten copies, then verification gave up well before re-transforming all ten.
        assert!(transformer.calls.load(Ordering::SeqCst) < 15);
    }

    #[tokio::test]
    async fn retire_keeps_the_entry_of_a_deleted_stream() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 4).await;
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator = orchestrator(
            &store,
            &table,
            config(Some(BookClosingConfig {
                delete_without_archive: true,
                ..BookClosingConfig::default()
            })),
        );
        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            MigrationOutcome::Completed {
                phase: MigrationPhase::BookClosed,
                ..
            }
        ));
        assert_eq!(store.stream_version(&old()).await.unwrap(), EventVersion::initial());

        let refused = orchestrator.retire(&object()).await;

        assert!(matches!(refused, Err(MigrationError::RedirectStillNeeded { .. })));
        assert!(orchestrator.status(&object()).await.unwrap().is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn abandoned_mirror_writes_are_reported_before_verification() {
        let store = Arc::new(VecEventStore::default());
        store.seed(&old(), 3).await;
        let unreachable = StreamId::try_new("orders-v2-unreachable").unwrap();
        store.fail_writes_to(&unreachable);
        let queue = Arc::new(ReconciliationQueue::new(crate::config::RetryConfig {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }));
        queue.record(crate::reconciliation::PendingSecondaryWrite::new(
            unreachable,
            ExpectedVersion::NoStream,
            vec![EventToWrite::new(
                EventTypeName::try_new("ItemAdded").unwrap(),
                serde_json::json!({}),
            )],
            &EventStoreError::Timeout(Duration::from_millis(5)),
        ));
        let table = Arc::new(InMemoryRoutingTable::new());
        let orchestrator =
            orchestrator(&store, &table, config(None)).with_reconciliation(Arc::clone(&queue));

        let outcome = orchestrator
            .start_migration(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_completed());
        assert!(queue.is_empty());
        assert_eq!(queue.abandoned().len(), 1);
        assert!(logs_contain("[migration.reconcile] mirror writes not reconciled"));
    }
}
