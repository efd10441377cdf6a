use std::collections::HashSet;

use async_trait::async_trait;
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use streamshift::errors::{EventStoreError, EventStoreResult, Operation};
use streamshift::event_store::{EventStore, EventToWrite, ExpectedVersion, ReadOptions, RecordedEvent};
use streamshift::types::{EventVersion, StreamId};

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```ignore
/// use streamshift_testing::chaos::Probability;
///
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// // Values outside [0.0, 1.0] are rejected
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

/// What to inject, and where.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    version_conflict_probability: Probability,
    target_streams: Option<HashSet<StreamId>>,
}

impl ChaosConfig {
    /// Seeded configuration; the same calls fail on every run.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Chance that an operation fails with `StoreFailure`.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }

    /// Chance that an append fails with `VersionConflict`.
    #[must_use]
    pub fn with_version_conflict_probability(mut self, probability: f32) -> Self {
        self.version_conflict_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }

    /// Restricts injection to operations on `stream_id`; may be called repeatedly.
    #[must_use]
    pub fn only_stream(mut self, stream_id: StreamId) -> Self {
        let _ = self
            .target_streams
            .get_or_insert_with(HashSet::new)
            .insert(stream_id);
        self
    }

    fn targets(&self, stream_id: &StreamId) -> bool {
        self.target_streams
            .as_ref()
            .map_or(true, |streams| streams.contains(stream_id))
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::try_new(0.0).expect("0.0 is valid probability"),
            version_conflict_probability: Probability::try_new(0.0)
                .expect("0.0 is valid probability"),
            target_streams: None,
        }
    }
}

/// Wraps any store in a [`ChaosEventStore`].
pub trait ChaosEventStoreExt: Sized {
    /// Wraps `self`, injecting failures per `config`.
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventStore<Self>;
}

/// Store wrapper that fails operations at random.
///
/// Injected failures happen before the inner store is called, so a failed
/// append never writes.
pub struct ChaosEventStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<S> ChaosEventStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.store
    }

    fn should_inject(&self, stream_id: &StreamId, probability: Probability) -> bool {
        if !self.config.targets(stream_id) {
            return false;
        }

        let prob_f32: f32 = probability.into();

        if prob_f32 <= 0.0 {
            return false;
        }

        if prob_f32 >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(prob_f32))
    }
}

#[async_trait]
impl<S> EventStore for ChaosEventStore<S>
where
    S: EventStore,
{
    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<EventToWrite>,
    ) -> EventStoreResult<EventVersion> {
        if self.should_inject(stream_id, self.config.version_conflict_probability) {
            let current = self.store.stream_version(stream_id).await?;
            return Err(EventStoreError::VersionConflict {
                stream: stream_id.clone(),
                expected,
                current,
            });
        }

        if self.should_inject(stream_id, self.config.failure_probability) {
            return Err(EventStoreError::StoreFailure {
                operation: Operation::Append,
                detail: "chaos: injected append failure".to_string(),
            });
        }

        self.store.append(stream_id, expected, events).await
    }

    async fn read(
        &self,
        stream_id: &StreamId,
        options: &ReadOptions,
    ) -> EventStoreResult<Vec<RecordedEvent>> {
        if self.should_inject(stream_id, self.config.failure_probability) {
            return Err(EventStoreError::StoreFailure {
                operation: Operation::Read,
                detail: "chaos: injected read failure".to_string(),
            });
        }

        self.store.read(stream_id, options).await
    }

    async fn stream_version(&self, stream_id: &StreamId) -> EventStoreResult<EventVersion> {
        self.store.stream_version(stream_id).await
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> EventStoreResult<()> {
        self.store.delete_stream(stream_id).await
    }
}

impl<S> ChaosEventStoreExt for S
where
    S: EventStore,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventStore<Self> {
        ChaosEventStore::new(self, config)
    }
}
