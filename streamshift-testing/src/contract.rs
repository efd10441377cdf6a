use std::fmt;
use std::time::Duration;

use streamshift::errors::{EventStoreError, LockError};
use streamshift::event_store::{EventStore, EventToWrite, ExpectedVersion, ReadOptions};
use streamshift::lock::{LockProvider, ReleaseOutcome};
use streamshift::stream_closed::{ClosureReason, StreamClosedEvent, StreamLocation};
use streamshift::types::{EventVersion, LockKey, StreamId};
use tokio_util::sync::CancellationToken;

use crate::fixtures::{numbered_events, unique_lock_key, unique_stream_id};

/// A contract scenario that did not hold.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: EventStoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn lock_error(scenario: &'static str, operation: &'static str, error: LockError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn contract_stream_id(scenario: &'static str, label: &str) -> Result<StreamId, ContractTestFailure> {
    unique_stream_id(&format!("contract-{scenario}-{label}")).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct stream id: {error}"))
    })
}

fn contract_lock_key(scenario: &'static str) -> Result<LockKey, ContractTestFailure> {
    unique_lock_key(&format!("contract-{scenario}")).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct lock key: {error}"))
    })
}

fn sentinel(continuation: &StreamId, last_business_version: EventVersion) -> EventToWrite {
    StreamClosedEvent::new(
        &StreamLocation::stream(continuation.clone()),
        ClosureReason::Migration,
        last_business_version,
    )
    .to_event_to_write()
}

async fn append<S>(
    scenario: &'static str,
    store: &S,
    stream_id: &StreamId,
    expected: ExpectedVersion,
    events: Vec<EventToWrite>,
) -> Result<EventVersion, ContractTestFailure>
where
    S: EventStore + ?Sized,
{
    store
        .append(stream_id, expected, events)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "append", error))
}

async fn version<S>(
    scenario: &'static str,
    store: &S,
    stream_id: &StreamId,
) -> Result<EventVersion, ContractTestFailure>
where
    S: EventStore + ?Sized,
{
    store
        .stream_version(stream_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "stream_version", error))
}

/// Appended events read back in order with versions 1..=n.
pub async fn test_basic_append_read<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "basic_append_read";

    let store = make_store();
    let stream_id = contract_stream_id(SCENARIO, "single")?;

    let written = append(SCENARIO, &store, &stream_id, ExpectedVersion::NoStream, numbered_events(3)).await?;
    if written != EventVersion::new(3) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("append of three events to an empty stream returned version {written}"),
        ));
    }

    let events = store
        .read(&stream_id, &ReadOptions::new())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read", error))?;
    let versions: Vec<u64> = events.iter().map(|event| event.version.into_inner()).collect();
    if versions != [1, 2, 3] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected versions [1, 2, 3], observed {versions:?}"),
        ));
    }
    if events.iter().any(|event| event.stream_id != stream_id) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "read returned events recorded against another stream",
        ));
    }

    Ok(())
}

/// Stale expectations are rejected without writing anything.
pub async fn test_version_conflicts<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "version_conflicts";

    let store = make_store();
    let stream_id = contract_stream_id(SCENARIO, "shared")?;
    let _ = append(SCENARIO, &store, &stream_id, ExpectedVersion::NoStream, numbered_events(1)).await?;

    for expected in [
        ExpectedVersion::NoStream,
        ExpectedVersion::Exact(EventVersion::initial()),
        ExpectedVersion::Exact(EventVersion::new(2)),
    ] {
        match store.append(&stream_id, expected, numbered_events(2)).await {
            Err(EventStoreError::VersionConflict { current, .. }) if current == EventVersion::new(1) => {}
            Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "append", error)),
            Ok(version) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("expected a version conflict for {expected:?} but append returned {version}"),
                ));
            }
        }
    }

    let current = version(SCENARIO, &store, &stream_id).await?;
    if current != EventVersion::new(1) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("rejected appends changed the stream version to {current}"),
        ));
    }

    let _ = append(
        SCENARIO,
        &store,
        &stream_id,
        ExpectedVersion::Exact(EventVersion::new(1)),
        numbered_events(1),
    )
    .await?;
    Ok(())
}

/// An untouched stream reads empty at version 0.
pub async fn test_missing_stream_reads<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "missing_stream_reads";

    let store = make_store();
    let stream_id = contract_stream_id(SCENARIO, "ghost")?;

    let events = store
        .read(&stream_id, &ReadOptions::new())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read", error))?;
    if !events.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected read to succeed with no events for an untouched stream",
        ));
    }
    let current = version(SCENARIO, &store, &stream_id).await?;
    if current != EventVersion::initial() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("untouched stream reported version {current}"),
        ));
    }

    Ok(())
}

/// Writes to one stream never show up in another.
pub async fn test_stream_isolation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "stream_isolation";

    let store = make_store();
    let left = contract_stream_id(SCENARIO, "left")?;
    let right = contract_stream_id(SCENARIO, "right")?;
    let _ = append(SCENARIO, &store, &left, ExpectedVersion::Any, numbered_events(2)).await?;
    let _ = append(SCENARIO, &store, &right, ExpectedVersion::Any, numbered_events(5)).await?;

    let left_version = version(SCENARIO, &store, &left).await?;
    let right_version = version(SCENARIO, &store, &right).await?;
    if left_version != EventVersion::new(2) || right_version != EventVersion::new(5) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected versions 2 and 5, observed {left_version} and {right_version}"),
        ));
    }

    Ok(())
}

/// Version range and limit options bound what a read returns.
pub async fn test_read_range_and_limit<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "read_range_and_limit";

    let store = make_store();
    let stream_id = contract_stream_id(SCENARIO, "ranged")?;
    let _ = append(SCENARIO, &store, &stream_id, ExpectedVersion::NoStream, numbered_events(10)).await?;

    let cases = [
        (
            ReadOptions::new()
                .from_version(EventVersion::new(4))
                .to_version(EventVersion::new(6)),
            vec![4, 5, 6],
        ),
        (
            ReadOptions::new()
                .from_version(EventVersion::new(8))
                .with_max_events(5),
            vec![8, 9, 10],
        ),
        (ReadOptions::new().with_max_events(2), vec![1, 2]),
    ];
    for (options, expected) in cases {
        let events = store
            .read(&stream_id, &options)
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read", error))?;
        let versions: Vec<u64> = events.iter().map(|event| event.version.into_inner()).collect();
        if versions != expected {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("{options:?} returned versions {versions:?}, expected {expected:?}"),
            ));
        }
    }

    Ok(())
}

/// A stream ending with the closed sentinel refuses every further append.
pub async fn test_closed_stream_rejects_appends<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "closed_stream_rejects_appends";

    let store = make_store();
    let stream_id = contract_stream_id(SCENARIO, "closed")?;
    let continuation = contract_stream_id(SCENARIO, "continuation")?;
    let last = append(SCENARIO, &store, &stream_id, ExpectedVersion::NoStream, numbered_events(2)).await?;
    let closed_at = append(
        SCENARIO,
        &store,
        &stream_id,
        ExpectedVersion::Exact(last),
        vec![sentinel(&continuation, last)],
    )
    .await?;

    for expected in [ExpectedVersion::Any, ExpectedVersion::Exact(closed_at)] {
        match store.append(&stream_id, expected, numbered_events(1)).await {
            Err(EventStoreError::StreamClosed { .. }) => {}
            Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "append", error)),
            Ok(version) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("append after the sentinel succeeded at version {version}"),
                ));
            }
        }
    }

    let current = version(SCENARIO, &store, &stream_id).await?;
    if current != closed_at {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("closed stream moved from {closed_at} to {current}"),
        ));
    }

    Ok(())
}

/// A batch carrying events after its sentinel is rejected as a whole.
pub async fn test_sentinel_must_end_batch<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "sentinel_must_end_batch";

    let store = make_store();
    let stream_id = contract_stream_id(SCENARIO, "batch")?;
    let continuation = contract_stream_id(SCENARIO, "continuation")?;
    let mut batch = numbered_events(1);
    batch.push(sentinel(&continuation, EventVersion::new(1)));
    batch.extend(numbered_events(1));

    match store.append(&stream_id, ExpectedVersion::Any, batch).await {
        Err(EventStoreError::StreamClosed { .. }) => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "append", error)),
        Ok(version) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("batch with events after its sentinel was written up to {version}"),
            ));
        }
    }

    let current = version(SCENARIO, &store, &stream_id).await?;
    if current != EventVersion::initial() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("rejected batch left the stream at {current}"),
        ));
    }

    Ok(())
}

/// Deleting a stream removes all of its events.
pub async fn test_delete_stream<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "delete_stream";

    let store = make_store();
    let stream_id = contract_stream_id(SCENARIO, "doomed")?;
    let survivor = contract_stream_id(SCENARIO, "survivor")?;
    let _ = append(SCENARIO, &store, &stream_id, ExpectedVersion::Any, numbered_events(3)).await?;
    let _ = append(SCENARIO, &store, &survivor, ExpectedVersion::Any, numbered_events(1)).await?;

    store
        .delete_stream(&stream_id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "delete_stream", error))?;

    if version(SCENARIO, &store, &stream_id).await? != EventVersion::initial() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "deleted stream still reports events",
        ));
    }
    if version(SCENARIO, &store, &survivor).await? != EventVersion::new(1) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "deleting one stream changed another",
        ));
    }

    Ok(())
}

const SHORT_WAIT: Duration = Duration::from_millis(50);

/// Only one holder at a time; release lets the next one in.
pub async fn test_exclusive_acquire<F, P>(make_provider: F) -> ContractTestResult
where
    F: Fn() -> P + Send + Sync + Clone + 'static,
    P: LockProvider + 'static,
{
    const SCENARIO: &str = "exclusive_acquire";

    let provider = make_provider();
    let key = contract_lock_key(SCENARIO)?;
    let cancel = CancellationToken::new();

    let first = provider
        .acquire_lock(&key, SHORT_WAIT, &cancel)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire_lock", error))?
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "free key was not granted"))?;

    let second = provider
        .acquire_lock(&key, SHORT_WAIT, &cancel)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire_lock", error))?;
    if second.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "a held key was granted a second time",
        ));
    }

    let released = first
        .release()
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))?;
    if released != ReleaseOutcome::Released {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("releasing a held lock reported {released:?}"),
        ));
    }

    let third = provider
        .acquire_lock(&key, SHORT_WAIT, &cancel)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire_lock", error))?;
    if third.is_none() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "released key could not be acquired again",
        ));
    }

    Ok(())
}

/// Releasing twice reports `AlreadyReleased` instead of failing.
pub async fn test_release_is_idempotent<F, P>(make_provider: F) -> ContractTestResult
where
    F: Fn() -> P + Send + Sync + Clone + 'static,
    P: LockProvider + 'static,
{
    const SCENARIO: &str = "release_is_idempotent";

    let provider = make_provider();
    let key = contract_lock_key(SCENARIO)?;
    let lock = provider
        .acquire_lock(&key, SHORT_WAIT, &CancellationToken::new())
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire_lock", error))?
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "free key was not granted"))?;

    let _ = lock
        .release()
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))?;
    let again = lock
        .release()
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))?;
    if again != ReleaseOutcome::AlreadyReleased {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("second release reported {again:?}"),
        ));
    }
    if lock.is_valid() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "released lock still reports itself valid",
        ));
    }

    Ok(())
}

/// A held lock renews; the grant describes the requested key.
pub async fn test_renew_while_held<F, P>(make_provider: F) -> ContractTestResult
where
    F: Fn() -> P + Send + Sync + Clone + 'static,
    P: LockProvider + 'static,
{
    const SCENARIO: &str = "renew_while_held";

    let provider = make_provider();
    let key = contract_lock_key(SCENARIO)?;
    let lock = provider
        .acquire_lock(&key, SHORT_WAIT, &CancellationToken::new())
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire_lock", error))?
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "free key was not granted"))?;

    if lock.info().lock_key != key {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("grant covers '{}' instead of '{key}'", lock.info().lock_key),
        ));
    }
    let renewed = lock
        .renew()
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "renew", error))?;
    if !renewed || !lock.is_valid() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "held lock could not be renewed",
        ));
    }

    let _ = lock
        .release()
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))?;
    Ok(())
}

/// A cancelled acquisition gives up promptly with `None`.
pub async fn test_cancelled_acquire_gives_up<F, P>(make_provider: F) -> ContractTestResult
where
    F: Fn() -> P + Send + Sync + Clone + 'static,
    P: LockProvider + 'static,
{
    const SCENARIO: &str = "cancelled_acquire_gives_up";

    let provider = make_provider();
    let key = contract_lock_key(SCENARIO)?;
    let holder = provider
        .acquire_lock(&key, SHORT_WAIT, &CancellationToken::new())
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire_lock", error))?
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "free key was not granted"))?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let waited = tokio::time::timeout(
        Duration::from_secs(2),
        provider.acquire_lock(&key, Duration::from_secs(30), &cancel),
    )
    .await
    .map_err(|_| ContractTestFailure::assertion(SCENARIO, "cancelled acquisition kept waiting"))?
    .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire_lock", error))?;
    if waited.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "cancelled acquisition was granted a held key",
        ));
    }

    let _ = holder
        .release()
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))?;
    Ok(())
}

/// Generates one test per event store contract scenario.
#[macro_export]
macro_rules! event_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_basic_append_read, test_closed_stream_rejects_appends, test_delete_stream,
                test_missing_stream_reads, test_read_range_and_limit, test_sentinel_must_end_batch,
                test_stream_isolation, test_version_conflicts,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn basic_append_read_contract() {
                test_basic_append_read($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn version_conflicts_contract() {
                test_version_conflicts($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_stream_reads_contract() {
                test_missing_stream_reads($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn stream_isolation_contract() {
                test_stream_isolation($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn read_range_and_limit_contract() {
                test_read_range_and_limit($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn closed_stream_rejects_appends_contract() {
                test_closed_stream_rejects_appends($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn sentinel_must_end_batch_contract() {
                test_sentinel_must_end_batch($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn delete_stream_contract() {
                test_delete_stream($make_store)
                    .await
                    .expect("event store contract failed");
            }
        }
    };
}

pub use event_store_contract_tests;

/// Generates one test per lock provider contract scenario.
#[macro_export]
macro_rules! lock_provider_contract_tests {
    (suite = $suite:ident, make_provider = $make_provider:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_cancelled_acquire_gives_up, test_exclusive_acquire, test_release_is_idempotent,
                test_renew_while_held,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn exclusive_acquire_contract() {
                test_exclusive_acquire($make_provider)
                    .await
                    .expect("lock provider contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn release_is_idempotent_contract() {
                test_release_is_idempotent($make_provider)
                    .await
                    .expect("lock provider contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn renew_while_held_contract() {
                test_renew_while_held($make_provider)
                    .await
                    .expect("lock provider contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn cancelled_acquire_gives_up_contract() {
                test_cancelled_acquire_gives_up($make_provider)
                    .await
                    .expect("lock provider contract failed");
            }
        }
    };
}

pub use lock_provider_contract_tests;
