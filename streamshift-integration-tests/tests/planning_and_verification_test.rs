//! Read-only planning, verification and checkpoint checks on real stores.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use streamshift::checkpoint::{Checkpoint, CheckpointValidation, CheckpointValidator, SkipReason};
use streamshift::errors::TransformError;
use streamshift::event_store::{read_all, EventStore, EventToWrite, ExpectedVersion, RecordedEvent};
use streamshift::lock::NoOpLockProvider;
use streamshift::orchestrator::{CutoverOrchestrator, MigrationRequest};
use streamshift::planner::Prerequisite;
use streamshift::routing::MigrationPhase;
use streamshift::routing_table::InMemoryRoutingTable;
use streamshift::transformer::{FnTransformer, IdentityTransformer};
use streamshift::types::{EventTypeName, EventVersion, StreamId};
use streamshift::verification::{checks, checksum, VerificationConfig, Verifier};
use streamshift::MigrationConfig;
use streamshift_memory::InMemoryEventStore;
use streamshift_testing::fixtures::{line_added, seed_stream, unique_object_id, unique_stream_id};
use tokio_util::sync::CancellationToken;

fn request() -> MigrationRequest {
    MigrationRequest::new(
        unique_object_id("invoice").unwrap(),
        unique_stream_id("invoices-v1").unwrap(),
        unique_stream_id("invoices-v2").unwrap(),
    )
}

fn orchestrator(store: &Arc<InMemoryEventStore>) -> CutoverOrchestrator<InMemoryEventStore> {
    CutoverOrchestrator::new(
        Arc::clone(store),
        Arc::new(NoOpLockProvider::new()),
        Arc::new(InMemoryRoutingTable::new()),
        Arc::new(IdentityTransformer),
        MigrationConfig::default(),
    )
}

/// Renames `LineAdded` to `LineRecorded`, rejecting anything else.
fn renaming_transformer(
) -> FnTransformer<impl Fn(&RecordedEvent) -> Result<EventToWrite, TransformError> + Send + Sync> {
    FnTransformer::new(|event: &RecordedEvent| {
        if event.event_type.as_ref() != "LineAdded" {
            return Err(TransformError::UnsupportedEventType(event.event_type.to_string()));
        }
        let mut write = event.to_event_to_write();
        write.event_type = EventTypeName::try_new("LineRecorded")
            .map_err(|error| TransformError::Failed(error.to_string()))?;
        Ok(write)
    })
}

#[tokio::test]
async fn planning_twice_gives_the_same_analysis_and_writes_nothing() {
    // Given: a populated source stream
    let store = Arc::new(InMemoryEventStore::new());
    let request = request().with_prerequisite(Prerequisite::new(
        "maintenance_window",
        "change approved",
        true,
        false,
    ));
    let _ = seed_stream(store.as_ref(), &request.old_stream, 40).await.unwrap();
    let orchestrator = orchestrator(&store);
    let cancel = CancellationToken::new();

    // When: the migration is planned twice
    let first = orchestrator.plan(&request, &cancel).await.unwrap();
    let second = orchestrator.plan(&request, &cancel).await.unwrap();

    // Then: both plans agree on everything derived from the data
    assert_eq!(first.source_analysis(), second.source_analysis());
    assert_eq!(first.prerequisites(), second.prerequisites());
    assert_eq!(
        first.transformation_simulation().success_count,
        second.transformation_simulation().success_count
    );
    assert_eq!(first.source_analysis().event_count, 40);
    assert!(first.is_feasible());
    assert_eq!(
        first.recommended_phases().last(),
        Some(&MigrationPhase::BookClosed)
    );
    assert!(first
        .prerequisites()
        .iter()
        .any(|prerequisite| prerequisite.name == "maintenance_window"));

    // And: planning had no side effects
    assert_eq!(store.stream_version(request.new_stream()).await.unwrap(), EventVersion::initial());
    assert_eq!(store.stream_ids().unwrap(), vec![request.old_stream.clone()]);
    assert!(orchestrator.status(&request.object_id).await.unwrap().is_none());
}

#[tokio::test]
async fn a_populated_target_makes_the_plan_infeasible() {
    // Given: a target stream that already has events
    let store = Arc::new(InMemoryEventStore::new());
    let request = request();
    let _ = seed_stream(store.as_ref(), &request.old_stream, 5).await.unwrap();
    let _ = seed_stream(store.as_ref(), request.new_stream(), 1).await.unwrap();

    // When
    let plan = orchestrator(&store)
        .plan(&request, &CancellationToken::new())
        .await
        .unwrap();

    // Then
    assert!(!plan.is_feasible());
    let blocking: Vec<_> = plan
        .blocking_prerequisites()
        .map(|prerequisite| prerequisite.name.as_str())
        .collect();
    assert_eq!(blocking, vec!["target_stream_empty"]);
}

#[tokio::test]
async fn transformed_copy_verifies_against_its_source() {
    // Given: a source and a target produced by a renaming transformer
    let store = InMemoryEventStore::new();
    let source = unique_stream_id("lines-v1").unwrap();
    let target = unique_stream_id("lines-v2").unwrap();
    let _ = seed_stream(&store, &source, 30).await.unwrap();
    let transformer = renaming_transformer();
    let mut copied = Vec::new();
    for event in read_all(&store, &source).await.unwrap() {
        copied.push(
            streamshift::transformer::EventTransformer::transform(&transformer, &event)
                .await
                .unwrap(),
        );
    }
    let _ = store.append(&target, ExpectedVersion::NoStream, copied).await.unwrap();
    let verifier = Verifier::new(VerificationConfig::default());
    let cancel = CancellationToken::new();

    // When: verifying with and without the transformer
    let with_transformer = verifier
        .run(&store, &source, &target, Some(&transformer), &cancel)
        .await
        .unwrap();
    let raw_checksums = verifier
        .compare_checksums(&store, &source, &target, None, &cancel)
        .await
        .unwrap();

    // Then: the transformed view matches, the raw view does not
    assert!(with_transformer.passed(), "{with_transformer:?}");
    assert!(with_transformer.result(checks::TRANSFORMATION_SAMPLE).is_some_and(|result| result.passed));
    assert!(!raw_checksums.passed);
}

#[tokio::test]
async fn same_count_with_different_content_fails_checksums_only() {
    // Given: streams of equal length whose last payload differs
    let store = InMemoryEventStore::new();
    let source = unique_stream_id("lines-v1").unwrap();
    let target = unique_stream_id("lines-v2").unwrap();
    let _ = seed_stream(&store, &source, 10).await.unwrap();
    let _ = seed_stream(&store, &target, 9).await.unwrap();
    let _ = store
        .append(&target, ExpectedVersion::Exact(EventVersion::new(9)), vec![line_added(1_000)])
        .await
        .unwrap();
    let verifier = Verifier::new(VerificationConfig {
        transformation_sample_size: None,
        ..VerificationConfig::default()
    });

    // When
    let result = verifier
        .run(&store, &source, &target, None, &CancellationToken::new())
        .await
        .unwrap();

    // Then: counts agree, checksums catch the difference
    assert!(!result.passed());
    assert!(result.result(checks::EVENT_COUNTS).is_some_and(|check| check.passed));
    assert!(result.result(checks::CHECKSUMS).is_some_and(|check| !check.passed));
}

#[tokio::test]
async fn checkpoint_flags_a_stream_that_moved() {
    // Given: a checkpoint taken at version 5
    let store = InMemoryEventStore::new();
    let stream_id = unique_stream_id("accounts").unwrap();
    let untouched = unique_stream_id("ledger").unwrap();
    let _ = seed_stream(&store, &stream_id, 5).await.unwrap();
    let checkpoint = Checkpoint::capture(&store, &[stream_id.clone()]).await.unwrap();
    let fingerprint = Checkpoint::fingerprint_of(&checkpoint.versions().unwrap());

    // When: two more events land
    let _ = seed_stream(&store, &stream_id, 2).await.unwrap();

    // Then: both checkpoint forms report 5 against 7
    for recorded in [&checkpoint, &fingerprint] {
        let validation = CheckpointValidator::validate_store(&store, &stream_id, Some(recorded))
            .await
            .unwrap();
        assert_eq!(
            validation,
            CheckpointValidation::VersionMismatch {
                stream_id: stream_id.clone(),
                expected: EventVersion::new(5),
                actual: EventVersion::new(7),
            }
        );
    }

    // And: streams absent from the checkpoint are not judged
    assert_eq!(
        CheckpointValidator::validate_store(&store, &untouched, Some(&checkpoint))
            .await
            .unwrap(),
        CheckpointValidation::Skipped(SkipReason::StreamNotInCheckpoint)
    );
}

fn stream_name() -> impl Strategy<Value = StreamId> {
    "[a-z]{1,12}(-[0-9]{1,3})?".prop_map(|name| StreamId::try_new(name).unwrap())
}

proptest! {
    #[test]
    fn fingerprints_survive_parsing(
        versions in prop::collection::hash_map(stream_name(), 0u64..10_000, 0..8)
    ) {
        let versions: HashMap<StreamId, EventVersion> = versions
            .into_iter()
            .map(|(stream, version)| (stream, EventVersion::new(version)))
            .collect();

        let fingerprint = Checkpoint::fingerprint_of(&versions);

        prop_assert_eq!(fingerprint.versions().unwrap(), versions);
    }

    #[test]
    fn checksum_depends_on_order(payloads in prop::collection::vec(0u64..1_000, 2..10)) {
        let event_type = EventTypeName::try_new("LineAdded").unwrap();
        let values: Vec<serde_json::Value> = payloads
            .iter()
            .map(|line| serde_json::json!({ "line": line }))
            .collect();
        let forward = checksum(values.iter().map(|value| (&event_type, value)));
        let backward = checksum(values.iter().rev().map(|value| (&event_type, value)));

        let palindrome = payloads.iter().eq(payloads.iter().rev());
        prop_assert_eq!(forward == backward, palindrome);
    }
}
