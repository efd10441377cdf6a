//! Guards decisions against stale reads.
//!
//! A caller records the stream versions it observed when it made a decision
//! (a [`Checkpoint`]) and validates them again before acting. Staleness is a
//! value, [`CheckpointValidation::VersionMismatch`], so the caller can pick
//! its own conflict policy.
//!
//! A missing checkpoint, or a stream the checkpoint does not mention, is
//! valid: such callers cannot have observed a version that is now stale.

use crate::errors::{MigrationResult, ValidationError};
use crate::event_store::EventStore;
use crate::types::{EventVersion, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Versions a caller observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    /// Comma separated `stream@version` pairs, e.g. `orders-1@5,orders-2@12`.
    Fingerprint(String),
    /// Explicit stream to version map.
    Versions(HashMap<StreamId, EventVersion>),
}

impl Checkpoint {
    /// Builds a fingerprint with pairs sorted by stream id.
    pub fn fingerprint_of(versions: &HashMap<StreamId, EventVersion>) -> Self {
        let mut pairs: Vec<_> = versions.iter().collect();
        pairs.sort_by(|left, right| left.0.cmp(right.0));
        Self::Fingerprint(
            pairs
                .into_iter()
                .map(|(stream, version)| format!("{stream}@{version}"))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Records the current version of each stream.
    pub async fn capture<S>(store: &S, streams: &[StreamId]) -> MigrationResult<Self>
    where
        S: EventStore + ?Sized,
    {
        let mut versions = HashMap::with_capacity(streams.len());
        for stream_id in streams {
            let version = store.stream_version(stream_id).await?;
            let _ = versions.insert(stream_id.clone(), version);
        }
        Ok(Self::Versions(versions))
    }

    /// The stream to version map, parsing a fingerprint if needed.
    pub fn versions(&self) -> Result<HashMap<StreamId, EventVersion>, ValidationError> {
        match self {
            Self::Versions(versions) => Ok(versions.clone()),
            Self::Fingerprint(fingerprint) => parse_fingerprint(fingerprint),
        }
    }

    /// Version recorded for one stream.
    pub fn expected_version(&self, stream_id: &StreamId) -> Result<Option<EventVersion>, ValidationError> {
        match self {
            Self::Versions(versions) => Ok(versions.get(stream_id).copied()),
            Self::Fingerprint(fingerprint) => Ok(parse_fingerprint(fingerprint)?.get(stream_id).copied()),
        }
    }
}

fn parse_fingerprint(fingerprint: &str) -> Result<HashMap<StreamId, EventVersion>, ValidationError> {
    let mut versions = HashMap::new();
    for pair in fingerprint.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (stream, version) = pair.rsplit_once('@').ok_or_else(|| {
            ValidationError::InvalidFormat(format!("checkpoint entry '{pair}' is not stream@version"))
        })?;
        let stream_id = StreamId::try_new(stream).map_err(|e| {
            ValidationError::InvalidIdentifier(format!("checkpoint stream '{stream}': {e}"))
        })?;
        let version = version.trim().parse::<u64>().map(EventVersion::new).map_err(|e| {
            ValidationError::InvalidFormat(format!("checkpoint version '{version}': {e}"))
        })?;
        if let Some(previous) = versions.insert(stream_id.clone(), version) {
            if previous != version {
                return Err(ValidationError::InvalidFormat(format!(
                    "checkpoint lists '{stream_id}' at both {previous} and {version}"
                )));
            }
        }
    }
    Ok(versions)
}

/// Why a validation was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The caller supplied no checkpoint.
    NoCheckpoint,
    /// The checkpoint does not mention the stream.
    StreamNotInCheckpoint,
}

/// Result of validating a checkpoint against a live version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointValidation {
    /// The recorded version matches.
    Valid,
    /// Nothing to compare; treated as valid.
    Skipped(SkipReason),
    /// The stream moved since the checkpoint was taken.
    VersionMismatch {
        /// The stream that moved
        stream_id: StreamId,
        /// Version in the checkpoint
        expected: EventVersion,
        /// Live version
        actual: EventVersion,
    },
}

impl CheckpointValidation {
    /// Whether the caller may proceed.
    pub const fn is_valid(&self) -> bool {
        !matches!(self, Self::VersionMismatch { .. })
    }
}

/// Compares checkpoints with live stream versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointValidator;

impl CheckpointValidator {
    /// Validates `checkpoint` for `stream_id` currently at `current_version`.
    ///
    /// Only a malformed fingerprint is an error.
    pub fn validate(
        stream_id: &StreamId,
        current_version: EventVersion,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<CheckpointValidation, ValidationError> {
        let Some(checkpoint) = checkpoint else {
            return Ok(CheckpointValidation::Skipped(SkipReason::NoCheckpoint));
        };
        let Some(expected) = checkpoint.expected_version(stream_id)? else {
            return Ok(CheckpointValidation::Skipped(SkipReason::StreamNotInCheckpoint));
        };
        if expected == current_version {
            Ok(CheckpointValidation::Valid)
        } else {
            debug!(
                stream = %stream_id,
                expected = %expected,
                actual = %current_version,
                "[checkpoint.validate] stale checkpoint"
            );
            Ok(CheckpointValidation::VersionMismatch {
                stream_id: stream_id.clone(),
                expected,
                actual: current_version,
            })
        }
    }

    /// Validates against the version currently in `store`.
    pub async fn validate_store<S>(
        store: &S,
        stream_id: &StreamId,
        checkpoint: Option<&Checkpoint>,
    ) -> MigrationResult<CheckpointValidation>
    where
        S: EventStore + ?Sized,
    {
        if checkpoint.is_none() {
            return Ok(CheckpointValidation::Skipped(SkipReason::NoCheckpoint));
        }
        let current = store.stream_version(stream_id).await?;
        Ok(Self::validate(stream_id, current, checkpoint)?)
    }
}
