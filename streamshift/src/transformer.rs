//! Conversion of events from the source to the target representation.
//!
//! The engine consumes this interface; applications provide the real
//! transformation. A transformer maps exactly one source event to one target
//! event, which keeps old and new streams version-aligned during migration.
//! Implementations should keep the source `event_id` so drift between the two
//! streams stays detectable.

use crate::errors::TransformError;
use crate::event_store::{EventToWrite, RecordedEvent};
use async_trait::async_trait;

/// Converts a source event into the event written to the new stream.
#[async_trait]
pub trait EventTransformer: Send + Sync {
    /// Transforms one event.
    async fn transform(&self, event: &RecordedEvent) -> Result<EventToWrite, TransformError>;
}

/// Copies events unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

#[async_trait]
impl EventTransformer for IdentityTransformer {
    async fn transform(&self, event: &RecordedEvent) -> Result<EventToWrite, TransformError> {
        Ok(event.to_event_to_write())
    }
}

/// Adapts a synchronous closure into an [`EventTransformer`].
pub struct FnTransformer<F> {
    transform: F,
}

impl<F> FnTransformer<F>
where
    F: Fn(&RecordedEvent) -> Result<EventToWrite, TransformError> + Send + Sync,
{
    /// Wraps `transform`.
    pub const fn new(transform: F) -> Self {
        Self { transform }
    }
}

#[async_trait]
impl<F> EventTransformer for FnTransformer<F>
where
    F: Fn(&RecordedEvent) -> Result<EventToWrite, TransformError> + Send + Sync,
{
    async fn transform(&self, event: &RecordedEvent) -> Result<EventToWrite, TransformError> {
        (self.transform)(event)
    }
}
