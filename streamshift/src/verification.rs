//! Read-only checks comparing a migrated stream with its source.
//!
//! A [`Verifier`] runs a configurable set of independent checks:
//!
//! - **Event counts**: business events on the source (the closing sentinel
//!   excluded) against the same version range on the target
//! - **Checksums**: SHA-256 over ordered `(event_type, payload)` entries
//! - **Transformation sample**: re-runs the transformer on evenly spaced
//!   source events and diffs against what the target holds
//!
//! Source events mirrored back from the new stream (see
//! [`RecordedEvent::mirrored_from`]) are already in the target's
//! representation and are compared without transforming them.
//! - **Integrity**: versions start at 1, are contiguous, and a closing
//!   sentinel only ever appears last
//! - **Custom validators**: named predicates over [`ValidationContext`]
//!
//! With `fail_fast` the first failing check ends the run; otherwise every
//! check runs and all failures are reported together.

use crate::errors::{MigrationError, MigrationResult, TransformError};
use crate::event_store::{read_all, EventStore, RecordedEvent};
use crate::transformer::EventTransformer;
use crate::types::{EventTypeName, EventVersion, StreamId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Which checks a verification run performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Compare business event counts.
    pub compare_event_counts: bool,
    /// Compare payload checksums.
    pub compare_checksums: bool,
    /// Number of events to re-transform and diff; `None` disables sampling.
    pub transformation_sample_size: Option<usize>,
    /// Check version contiguity and sentinel placement on both streams.
    pub verify_integrity: bool,
    /// Stop at the first failing check.
    pub fail_fast: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            compare_event_counts: true,
            compare_checksums: true,
            transformation_sample_size: Some(10),
            verify_integrity: true,
            fail_fast: false,
        }
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Check name
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Human readable detail
    pub message: String,
}

impl ValidationResult {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
        }
    }

    fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
        }
    }
}

/// Accumulated outcome of a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Every check that ran, in order
    pub validation_results: Vec<ValidationResult>,
    /// Findings that do not fail verification
    pub warnings: Vec<String>,
    /// Findings that fail verification
    pub errors: Vec<String>,
    /// One-line summary
    pub summary: String,
}

impl VerificationResult {
    /// True iff there are no errors and every check passed.
    pub fn passed(&self) -> bool {
        self.errors.is_empty() && self.validation_results.iter().all(|result| result.passed)
    }

    /// Result of a named check, if it ran.
    pub fn result(&self, name: &str) -> Option<&ValidationResult> {
        self.validation_results.iter().find(|result| result.name == name)
    }
}

/// Figures gathered from both streams before the checks run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStatistics {
    /// Business events on the source
    pub source_event_count: u64,
    /// Last business version on the source
    pub source_last_version: EventVersion,
    /// Whether the source ends with a closing sentinel
    pub source_closed: bool,
    /// Target events within the source's version range
    pub target_event_count: u64,
    /// Target events written after the source's last business version
    pub target_events_beyond_source: u64,
}

/// What a custom validator gets to look at.
pub struct ValidationContext<'a> {
    /// Stream the events came from
    pub source_stream_id: &'a StreamId,
    /// Stream the events were copied to
    pub target_stream_id: &'a StreamId,
    /// Transformer used for the copy, if any
    pub transformer: Option<&'a dyn EventTransformer>,
    /// Figures for both streams
    pub statistics: &'a VerificationStatistics,
}

/// A named custom check. `Err` carries the failure message.
pub type CustomValidator =
    Arc<dyn Fn(&ValidationContext<'_>) -> Result<(), String> + Send + Sync>;

/// Check names used in [`ValidationResult::name`].
pub mod checks {
    /// Event count comparison
    pub const EVENT_COUNTS: &str = "event_counts";
    /// Checksum comparison
    pub const CHECKSUMS: &str = "checksums";
    /// Transformation sampling
    pub const TRANSFORMATION_SAMPLE: &str = "transformation_sample";
    /// Source stream integrity
    pub const SOURCE_INTEGRITY: &str = "source_integrity";
    /// Target stream integrity
    pub const TARGET_INTEGRITY: &str = "target_integrity";
}

/// SHA-256 over ordered `(event_type, payload)` entries, hex encoded.
pub fn checksum<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a EventTypeName, &'a serde_json::Value)>,
{
    let mut hasher = Sha256::new();
    for (event_type, payload) in entries {
        hasher.update(event_type.as_ref().as_bytes());
        hasher.update([0_u8]);
        hasher.update(payload.to_string().as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

/// Evenly spaced indices into a sequence of `len` items, at most `sample_size` of them.
pub(crate) fn stride_sample(len: usize, sample_size: usize) -> Vec<usize> {
    if len == 0 || sample_size == 0 {
        return Vec::new();
    }
    if sample_size >= len {
        return (0..len).collect();
    }
    (0..sample_size).map(|i| i * len / sample_size).collect()
}

/// Both streams, loaded once per run.
struct StreamPair {
    source: Vec<RecordedEvent>,
    target: Vec<RecordedEvent>,
}

impl StreamPair {
    async fn load<S>(store: &S, source: &StreamId, target: &StreamId) -> MigrationResult<Self>
    where
        S: EventStore + ?Sized,
    {
        Ok(Self {
            source: read_all(store, source).await?,
            target: read_all(store, target).await?,
        })
    }

    fn source_business(&self) -> impl Iterator<Item = &RecordedEvent> {
        self.source.iter().filter(|event| !event.is_stream_closed())
    }

    fn source_last_version(&self) -> EventVersion {
        self.source_business()
            .last()
            .map_or_else(EventVersion::initial, |event| event.version)
    }

    fn target_in_range(&self) -> impl Iterator<Item = &RecordedEvent> {
        let last = self.source_last_version();
        self.target
            .iter()
            .filter(move |event| !event.is_stream_closed() && event.version <= last)
    }

    fn statistics(&self) -> VerificationStatistics {
        let last = self.source_last_version();
        VerificationStatistics {
            source_event_count: self.source_business().count() as u64,
            source_last_version: last,
            source_closed: self.source.last().is_some_and(RecordedEvent::is_stream_closed),
            target_event_count: self.target_in_range().count() as u64,
            target_events_beyond_source: self
                .target
                .iter()
                .filter(|event| !event.is_stream_closed() && event.version > last)
                .count() as u64,
        }
    }
}

/// Runs verification checks against a source and target stream.
#[derive(Clone)]
pub struct Verifier {
    config: VerificationConfig,
    validators: Vec<(String, CustomValidator)>,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("config", &self.config)
            .field(
                "validators",
                &self.validators.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Verifier {
    /// Creates a verifier with no custom validators.
    pub const fn new(config: VerificationConfig) -> Self {
        Self {
            config,
            validators: Vec::new(),
        }
    }

    /// Adds a named custom validator.
    #[must_use]
    pub fn with_validator<F>(mut self, name: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&ValidationContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push((name.into(), Arc::new(validator)));
        self
    }

    /// The configuration in use.
    pub const fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Compares business event counts.
    pub async fn compare_event_counts<S>(
        &self,
        store: &S,
        source: &StreamId,
        target: &StreamId,
    ) -> MigrationResult<ValidationResult>
    where
        S: EventStore + ?Sized,
    {
        let pair = StreamPair::load(store, source, target).await?;
        Ok(count_check(&pair.statistics()))
    }

    /// Compares checksums of the source (transformed, when a transformer is
    /// given) and the target over the source's version range.
    pub async fn compare_checksums<S>(
        &self,
        store: &S,
        source: &StreamId,
        target: &StreamId,
        transformer: Option<&dyn EventTransformer>,
        cancel: &CancellationToken,
    ) -> MigrationResult<ValidationResult>
    where
        S: EventStore + ?Sized,
    {
        let pair = StreamPair::load(store, source, target).await?;
        checksum_check(&pair, transformer, cancel).await
    }

    /// Re-transforms a sample of source events and diffs them against the target.
    pub async fn verify_transformation_sample<S>(
        &self,
        store: &S,
        source: &StreamId,
        target: &StreamId,
        transformer: &dyn EventTransformer,
        sample_size: usize,
        cancel: &CancellationToken,
    ) -> MigrationResult<ValidationResult>
    where
        S: EventStore + ?Sized,
    {
        let pair = StreamPair::load(store, source, target).await?;
        sample_check(&pair, transformer, sample_size, cancel).await
    }

    /// Checks version contiguity and sentinel placement of one stream.
    pub async fn verify_stream_integrity<S>(
        &self,
        store: &S,
        stream_id: &StreamId,
    ) -> MigrationResult<ValidationResult>
    where
        S: EventStore + ?Sized,
    {
        let events = read_all(store, stream_id).await?;
        Ok(integrity_check(checks::SOURCE_INTEGRITY, stream_id, &events))
    }

    /// Runs every configured check and the custom validators.
    #[instrument(skip(self, store, transformer, cancel))]
    pub async fn run<S>(
        &self,
        store: &S,
        source: &StreamId,
        target: &StreamId,
        transformer: Option<&dyn EventTransformer>,
        cancel: &CancellationToken,
    ) -> MigrationResult<VerificationResult>
    where
        S: EventStore + ?Sized,
    {
        let pair = StreamPair::load(store, source, target).await?;
        let statistics = pair.statistics();
        let mut run = RunState::new(self.config.fail_fast);

        if statistics.target_events_beyond_source > 0 {
            run.warnings.push(format!(
                "target '{target}' holds {} events beyond source version {}",
                statistics.target_events_beyond_source, statistics.source_last_version
            ));
        }

        if self.config.verify_integrity && !run.stopped() {
            run.record(integrity_check(checks::SOURCE_INTEGRITY, source, &pair.source));
            if !run.stopped() {
                run.record(integrity_check(checks::TARGET_INTEGRITY, target, &pair.target));
            }
        }

        if self.config.compare_event_counts && !run.stopped() {
            ensure_not_cancelled(cancel)?;
            run.record(count_check(&statistics));
        }

        if self.config.compare_checksums && !run.stopped() {
            run.record(checksum_check(&pair, transformer, cancel).await?);
        }

        if let Some(sample_size) = self.config.transformation_sample_size {
            if !run.stopped() {
                match transformer {
                    Some(transformer) => {
                        run.record(sample_check(&pair, transformer, sample_size, cancel).await?);
                    }
                    None => run
                        .warnings
                        .push("transformation sample skipped: no transformer supplied".to_string()),
                }
            }
        }

        for (name, validator) in &self.validators {
            if run.stopped() {
                break;
            }
            ensure_not_cancelled(cancel)?;
            let context = ValidationContext {
                source_stream_id: source,
                target_stream_id: target,
                transformer,
                statistics: &statistics,
            };
            run.record(match validator(&context) {
                Ok(()) => ValidationResult::pass(name, "custom validator passed"),
                Err(message) => ValidationResult::fail(name, message),
            });
        }

        let result = run.finish();
        if result.passed() {
            info!(source = %source, target = %target, summary = %result.summary, "[verification.run] passed");
        } else {
            warn!(
                source = %source,
                target = %target,
                errors = result.errors.len(),
                summary = %result.summary,
                "[verification.run] failed"
            );
        }
        Ok(result)
    }
}

struct RunState {
    fail_fast: bool,
    results: Vec<ValidationResult>,
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl RunState {
    const fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            results: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn record(&mut self, result: ValidationResult) {
        if !result.passed {
            self.errors.push(format!("{}: {}", result.name, result.message));
        }
        self.results.push(result);
    }

    fn stopped(&self) -> bool {
        self.fail_fast && !self.errors.is_empty()
    }

    fn finish(self) -> VerificationResult {
        let passed = self.results.iter().filter(|result| result.passed).count();
        let summary = format!(
            "{passed}/{} checks passed, {} errors, {} warnings",
            self.results.len(),
            self.errors.len(),
            self.warnings.len()
        );
        VerificationResult {
            validation_results: self.results,
            warnings: self.warnings,
            errors: self.errors,
            summary,
        }
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> MigrationResult<()> {
    if cancel.is_cancelled() {
        return Err(MigrationError::Cancelled);
    }
    Ok(())
}

fn count_check(statistics: &VerificationStatistics) -> ValidationResult {
    if statistics.source_event_count == statistics.target_event_count {
        ValidationResult::pass(
            checks::EVENT_COUNTS,
            format!("{} events on both streams", statistics.source_event_count),
        )
    } else {
        ValidationResult::fail(
            checks::EVENT_COUNTS,
            format!(
                "source has {} events, target has {}",
                statistics.source_event_count, statistics.target_event_count
            ),
        )
    }
}

/// What the target should hold for a source event.
async fn target_form(
    transformer: &dyn EventTransformer,
    event: &RecordedEvent,
) -> Result<(EventTypeName, serde_json::Value), TransformError> {
    if event.mirrored_from().is_some() {
        return Ok((event.event_type.clone(), event.payload.clone()));
    }
    let output = transformer.transform(event).await?;
    Ok((output.event_type, output.payload))
}

async fn checksum_check(
    pair: &StreamPair,
    transformer: Option<&dyn EventTransformer>,
    cancel: &CancellationToken,
) -> MigrationResult<ValidationResult> {
    let expected: Vec<(EventTypeName, serde_json::Value)> = match transformer {
        Some(transformer) => {
            let mut expected = Vec::new();
            for event in pair.source_business() {
                ensure_not_cancelled(cancel)?;
                match target_form(transformer, event).await {
                    Ok(entry) => expected.push(entry),
                    Err(transform_error) => {
                        return Ok(ValidationResult::fail(
                            checks::CHECKSUMS,
                            format!(
                                "source event {} could not be transformed: {transform_error}",
                                event.version
                            ),
                        ));
                    }
                }
            }
            expected
        }
        None => pair
            .source_business()
            .map(|event| (event.event_type.clone(), event.payload.clone()))
            .collect(),
    };

    let source_digest = checksum(expected.iter().map(|(event_type, payload)| (event_type, payload)));
    let target_digest = checksum(
        pair.target_in_range()
            .map(|event| (&event.event_type, &event.payload)),
    );

    Ok(if source_digest == target_digest {
        ValidationResult::pass(checks::CHECKSUMS, format!("sha256 {source_digest}"))
    } else {
        ValidationResult::fail(
            checks::CHECKSUMS,
            format!("source sha256 {source_digest} != target sha256 {target_digest}"),
        )
    })
}

async fn sample_check(
    pair: &StreamPair,
    transformer: &dyn EventTransformer,
    sample_size: usize,
    cancel: &CancellationToken,
) -> MigrationResult<ValidationResult> {
    let source: Vec<&RecordedEvent> = pair.source_business().collect();
    let indices = stride_sample(source.len(), sample_size);
    let mut mismatches = Vec::new();

    for index in &indices {
        ensure_not_cancelled(cancel)?;
        let event = source[*index];
        let Some(written) = pair.target.iter().find(|target| target.version == event.version) else {
            mismatches.push(format!("version {} missing on target", event.version));
            continue;
        };
        match target_form(transformer, event).await {
            Ok((event_type, payload)) => {
                if event_type != written.event_type {
                    mismatches.push(format!(
                        "version {}: type {event_type} != {}",
                        event.version, written.event_type
                    ));
                } else if payload != written.payload {
                    mismatches.push(format!("version {}: payload differs", event.version));
                }
            }
            Err(transform_error) => {
                mismatches.push(format!("version {}: {transform_error}", event.version));
            }
        }
    }

    Ok(if mismatches.is_empty() {
        ValidationResult::pass(
            checks::TRANSFORMATION_SAMPLE,
            format!("{} sampled events match", indices.len()),
        )
    } else {
        ValidationResult::fail(
            checks::TRANSFORMATION_SAMPLE,
            format!(
                "{} of {} sampled events differ: {}",
                mismatches.len(),
                indices.len(),
                mismatches.join("; ")
            ),
        )
    })
}

fn integrity_check(name: &str, stream_id: &StreamId, events: &[RecordedEvent]) -> ValidationResult {
    for (index, event) in events.iter().enumerate() {
        let expected = EventVersion::new(index as u64 + 1);
        if event.version != expected {
            return ValidationResult::fail(
                name,
                format!("'{stream_id}' has version {} where {expected} was expected", event.version),
            );
        }
        if event.is_stream_closed() && index + 1 != events.len() {
            return ValidationResult::fail(
                name,
                format!("'{stream_id}' has events after its closing sentinel at {}", event.version),
            );
        }
    }
    ValidationResult::pass(name, format!("'{stream_id}' has {} contiguous events", events.len()))
}
