//! Walks one object through a complete cutover while it keeps receiving writes.
//!
//! This example shows:
//! - Planning a migration before touching anything
//! - Application writes through the routed store during every phase
//! - Book closing with a snapshot and a cold-storage archive
//!
//! Run with `RUST_LOG=streamshift=debug` to see every phase change.

#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;
use std::time::Duration;

use streamshift::book_closing::BookClosingConfig;
use streamshift::event_store::{EventStore, ExpectedVersion, ReadOptions};
use streamshift::orchestrator::{CutoverOrchestrator, MigrationOutcome, MigrationRequest};
use streamshift::reconciliation::ReconciliationQueue;
use streamshift::routed_store::RoutedEventStore;
use streamshift::routing_table::InMemoryRoutingTable;
use streamshift::transformer::IdentityTransformer;
use streamshift::types::{ObjectId, StreamId};
use streamshift::MigrationConfig;
use streamshift_memory::{
    InMemoryArchive, InMemoryEventStore, InMemoryLockProvider, InMemoryObjectHistory,
    InMemorySnapshotStore,
};
use streamshift_testing::fixtures::{line_added, seed_stream};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let store = Arc::new(InMemoryEventStore::new());
    let table = Arc::new(InMemoryRoutingTable::new());
    let queue = Arc::new(ReconciliationQueue::new(MigrationConfig::default().retry));
    let archive = InMemoryArchive::new();

    let object_id = ObjectId::try_new("order-1042")?;
    let old_stream = StreamId::try_new("orders-v1-1042")?;
    let new_stream = StreamId::try_new("orders-v2-1042")?;
    let _ = seed_stream(store.as_ref(), &old_stream, 250).await?;

    let config = MigrationConfig {
        backfill_batch_size: 50,
        book_closing: Some(BookClosingConfig {
            create_snapshot: true,
            archive_location: Some("cold-orders".to_string()),
            ..BookClosingConfig::default()
        }),
        ..MigrationConfig::default()
    };
    let orchestrator = CutoverOrchestrator::new(
        Arc::clone(&store),
        Arc::new(InMemoryLockProvider::new(Duration::from_secs(30))?),
        table.clone(),
        Arc::new(IdentityTransformer),
        config,
    )
    .with_reconciliation(Arc::clone(&queue))
    .with_snapshot_writer(Arc::new(InMemorySnapshotStore::new()))
    .with_archiver(Arc::new(archive.clone()))
    .with_history(Arc::new(InMemoryObjectHistory::new()));

    let request = MigrationRequest::new(object_id.clone(), old_stream.clone(), new_stream.clone());
    let cancel = CancellationToken::new();

    let plan = orchestrator.plan(&request, &cancel).await?;
    println!("\n=== Plan ===");
    println!("events to copy:  {}", plan.source_analysis().event_count);
    println!("feasible:        {}", plan.is_feasible());
    println!("phases:          {:?}", plan.recommended_phases());
    println!("estimated time:  {:?}", plan.resource_estimate().estimated_duration);
    for risk in plan.risks() {
        println!("risk [{:?}]: {}", risk.severity, risk.description);
    }

    // An application instance that keeps writing while the migration runs.
    let routed = Arc::new(RoutedEventStore::new(
        Arc::clone(&store),
        table.clone(),
        Arc::new(IdentityTransformer),
        Arc::clone(&queue),
    ));
    let writer_stop = CancellationToken::new();
    let writer = {
        let routed = Arc::clone(&routed);
        let object_id = object_id.clone();
        let old_stream = old_stream.clone();
        let stop = writer_stop.clone();
        tokio::spawn(async move {
            let mut line = 1_000;
            while !stop.is_cancelled() {
                match routed
                    .append(&object_id, &old_stream, ExpectedVersion::Any, vec![line_added(line)])
                    .await
                {
                    Ok(outcome) => {
                        info!(phase = %outcome.phase, stream = %outcome.stream_id, "application write");
                    }
                    Err(error) => {
                        info!(error = %error, "application write rejected");
                        break;
                    }
                }
                line += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            line - 1_000
        })
    };

    println!("\n=== Migrating ===");
    let outcome = orchestrator.start_migration(&request, &cancel).await?;
    writer_stop.cancel();
    let written = writer.await?;

    println!("\n=== Outcome ===");
    match &outcome {
        MigrationOutcome::Completed {
            phase,
            book_closing: Some(report),
            ..
        } => {
            println!("finished in {phase}");
            println!("sentinel at version {}", report.closed_at_version);
            println!("archive: {:?}", report.archive);
            println!("snapshot: {:?}", report.snapshot);
        }
        other => println!("{other:?}"),
    }
    println!("application writes during migration: {written}");
    println!("mirror writes still pending: {}", queue.len());
    println!(
        "old stream version: {}, new stream version: {}",
        store.stream_version(&old_stream).await?,
        store.stream_version(&new_stream).await?
    );
    println!(
        "archived events: {}",
        archive.archived("cold-orders", &old_stream).map_or(0, |events| events.len())
    );

    let latest = routed
        .read(&object_id, &old_stream, &ReadOptions::new())
        .await?;
    println!("routed reads now serve {} events from the new stream", latest.len());

    Ok(())
}
