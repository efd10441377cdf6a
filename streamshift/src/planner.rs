//! Dry-run migration planning.
//!
//! The planner never writes. It scans the source stream, runs the transformer
//! over a deterministic sample, extrapolates resource use, and reports
//! prerequisites and risks. An infeasible plan is a normal result with
//! `is_feasible() == false`, never an error.

use crate::book_closing::BookClosingConfig;
use crate::errors::{MigrationError, MigrationResult, ValidationError};
use crate::event_store::{EventStore, ReadOptions, RecordedEvent};
use crate::routing::MigrationPhase;
use crate::transformer::EventTransformer;
use crate::types::{EventVersion, ObjectId, PlanId, StreamId, Timestamp};
use crate::verification::stride_sample;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Planner tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Events run through the transformer during simulation.
    pub sample_size: usize,
    /// Failure examples kept in the simulation report.
    pub max_failure_examples: usize,
    /// Events read per page while scanning the source.
    pub scan_batch_size: usize,
    /// Storage and transfer time per event, on top of transformation.
    #[serde(with = "crate::config::duration_ms")]
    pub per_event_io_time: Duration,
    /// Storage price per GB.
    pub cost_per_gb: f64,
    /// Price per 10,000 storage operations.
    pub cost_per_10k_operations: f64,
    /// Flat cost added when book closing writes a snapshot.
    pub snapshot_cost_hint: f64,
    /// Event count above which a stream counts as large.
    pub large_stream_threshold: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            sample_size: 100,
            max_failure_examples: 10,
            scan_batch_size: 1000,
            per_event_io_time: Duration::from_millis(2),
            cost_per_gb: 0.02,
            cost_per_10k_operations: 0.05,
            snapshot_cost_hint: 0.01,
            large_stream_threshold: 100_000,
        }
    }
}

impl PlannerConfig {
    /// Rejects unusable settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sample_size == 0 {
            return Err(ValidationError::InvalidConfiguration(
                "planner sample_size must be at least 1".to_string(),
            ));
        }
        if self.scan_batch_size == 0 {
            return Err(ValidationError::InvalidConfiguration(
                "planner scan_batch_size must be at least 1".to_string(),
            ));
        }
        let prices = [self.cost_per_gb, self.cost_per_10k_operations, self.snapshot_cost_hint];
        if prices.iter().any(|price| !price.is_finite() || *price < 0.0) {
            return Err(ValidationError::InvalidConfiguration(
                "planner costs must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Condition checked before a migration may start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisite {
    /// Short identifier
    pub name: String,
    /// What the condition means
    pub description: String,
    /// Whether the condition holds
    pub is_met: bool,
    /// Whether an unmet condition makes the plan infeasible
    pub is_blocking: bool,
}

impl Prerequisite {
    /// Creates a prerequisite.
    pub fn new(name: impl Into<String>, description: impl Into<String>, is_met: bool, is_blocking: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            is_met,
            is_blocking,
        }
    }
}

/// How serious a risk is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskSeverity {
    /// Worth knowing.
    Low,
    /// Should be planned for.
    Medium,
    /// Likely to cause a failed or degraded migration.
    High,
    /// The migration cannot succeed as configured.
    Critical,
}

/// Area a risk concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskCategory {
    /// Events failing to transform.
    Transformation,
    /// Amount of data to move.
    DataVolume,
    /// Time the migration runs.
    Duration,
    /// Irreversible loss of data.
    DataLoss,
}

/// Advisory finding; never affects feasibility by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRisk {
    /// Area the risk concerns
    pub category: RiskCategory,
    /// What could go wrong
    pub description: String,
    /// How serious it is
    pub severity: RiskSeverity,
    /// Suggested mitigations
    pub mitigations: Vec<String>,
}

/// Read-only scan results for the source stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAnalysis {
    /// The scanned stream
    pub stream_id: StreamId,
    /// Business events (closing sentinel excluded)
    pub event_count: u64,
    /// Total payload bytes
    pub total_bytes: u64,
    /// Events per type name
    pub event_type_histogram: BTreeMap<String, u64>,
    /// Time of the first event
    pub first_event_at: Option<Timestamp>,
    /// Time of the last event
    pub last_event_at: Option<Timestamp>,
    /// Stream version at scan time
    pub current_version: EventVersion,
    /// Whether the stream ends with a closing sentinel
    pub is_closed: bool,
}

/// One sampled event the transformer rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformFailure {
    /// Version of the failing event
    pub event_version: EventVersion,
    /// Type name of the failing event
    pub event_name: String,
    /// The transformer's error
    pub error: String,
}

/// Results of running the transformer on the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationSimulation {
    /// Events sampled
    pub sample_size: usize,
    /// Successful transformations
    pub success_count: usize,
    /// Failed transformations
    pub failure_count: usize,
    /// Up to `max_failure_examples` failures
    pub failures: Vec<TransformFailure>,
    /// Mean time per transformation
    pub average_transform_time: Duration,
    /// Output payload bytes per input payload byte over successful samples
    pub size_ratio: f64,
}

impl TransformationSimulation {
    /// Share of sampled events that failed, 0.0 for an empty sample.
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        if self.sample_size == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.sample_size as f64
        }
    }
}

/// Linear extrapolation of migration cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    /// Expected wall time of the copy
    pub estimated_duration: Duration,
    /// Bytes written to the new stream
    pub estimated_storage_bytes: u64,
    /// Bytes read plus bytes written
    pub estimated_bandwidth_bytes: u64,
    /// Storage reads plus writes
    pub estimated_operations: u64,
    /// Estimated monetary cost
    pub estimated_cost: f64,
}

/// Immutable result of a dry run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    plan_id: PlanId,
    created_at: Timestamp,
    object_id: ObjectId,
    target_stream: StreamId,
    source_analysis: StreamAnalysis,
    transformation_simulation: TransformationSimulation,
    resource_estimate: ResourceEstimate,
    prerequisites: Vec<Prerequisite>,
    risks: Vec<MigrationRisk>,
    recommended_phases: Vec<MigrationPhase>,
    is_feasible: bool,
}

impl MigrationPlan {
    /// Plan identifier.
    pub const fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// When the plan was produced.
    pub const fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Object the plan is for.
    pub const fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// Stream the plan migrates to.
    pub const fn target_stream(&self) -> &StreamId {
        &self.target_stream
    }

    /// Source stream scan.
    pub const fn source_analysis(&self) -> &StreamAnalysis {
        &self.source_analysis
    }

    /// Transformer simulation.
    pub const fn transformation_simulation(&self) -> &TransformationSimulation {
        &self.transformation_simulation
    }

    /// Resource estimate.
    pub const fn resource_estimate(&self) -> &ResourceEstimate {
        &self.resource_estimate
    }

    /// All prerequisites, met or not.
    pub fn prerequisites(&self) -> &[Prerequisite] {
        &self.prerequisites
    }

    /// Advisory risks.
    pub fn risks(&self) -> &[MigrationRisk] {
        &self.risks
    }

    /// Phases the migration should move through.
    pub fn recommended_phases(&self) -> &[MigrationPhase] {
        &self.recommended_phases
    }

    /// Whether every blocking prerequisite is met.
    pub const fn is_feasible(&self) -> bool {
        self.is_feasible
    }

    /// Unmet blocking prerequisites.
    pub fn blocking_prerequisites(&self) -> impl Iterator<Item = &Prerequisite> {
        self.prerequisites
            .iter()
            .filter(|prerequisite| prerequisite.is_blocking && !prerequisite.is_met)
    }

    /// Most severe risk, if any.
    pub fn highest_risk(&self) -> Option<&MigrationRisk> {
        self.risks.iter().max_by_key(|risk| risk.severity)
    }
}

/// Input to a dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRequest {
    /// Object being migrated
    pub object_id: ObjectId,
    /// Stream to migrate from
    pub source_stream: StreamId,
    /// Stream to migrate to
    pub target_stream: StreamId,
    /// Lock lease of the provider that will guard the migration; `None` never expires
    pub lock_lease: Option<Duration>,
    /// Heartbeat interval the migration will use
    pub heartbeat_interval: Duration,
    /// Book closing that will follow cutover, if any
    pub book_closing: Option<BookClosingConfig>,
    /// Caller-specific prerequisites
    pub custom_prerequisites: Vec<Prerequisite>,
}

impl PlanRequest {
    /// Request with default timing and no book closing.
    pub fn new(object_id: ObjectId, source_stream: StreamId, target_stream: StreamId) -> Self {
        Self {
            object_id,
            source_stream,
            target_stream,
            lock_lease: None,
            heartbeat_interval: crate::lock::HeartbeatConfig::default().interval,
            book_closing: None,
            custom_prerequisites: Vec::new(),
        }
    }

    /// Sets the lock timing the migration will run with.
    #[must_use]
    pub const fn with_lock_timing(mut self, lock_lease: Option<Duration>, heartbeat_interval: Duration) -> Self {
        self.lock_lease = lock_lease;
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Sets the book closing that follows cutover.
    #[must_use]
    pub fn with_book_closing(mut self, book_closing: Option<BookClosingConfig>) -> Self {
        self.book_closing = book_closing;
        self
    }

    /// Adds a caller-specific prerequisite.
    #[must_use]
    pub fn with_prerequisite(mut self, prerequisite: Prerequisite) -> Self {
        self.custom_prerequisites.push(prerequisite);
        self
    }
}

/// Produces migration plans.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlanner {
    config: PlannerConfig,
}

impl MigrationPlanner {
    /// Creates a planner.
    pub const fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Runs a dry run. Cancellation yields `MigrationError::Cancelled`.
    #[instrument(skip(self, store, transformer, cancel), fields(object_id = %request.object_id))]
    pub async fn plan<S>(
        &self,
        store: &S,
        request: &PlanRequest,
        transformer: &dyn EventTransformer,
        cancel: &CancellationToken,
    ) -> MigrationResult<MigrationPlan>
    where
        S: EventStore + ?Sized,
    {
        self.config.validate()?;

        let (source_analysis, sample) = self.analyze(store, &request.source_stream, cancel).await?;
        let transformation_simulation = self.simulate(&sample, transformer, cancel).await?;
        let resource_estimate = self.estimate(&source_analysis, &transformation_simulation, request);

        let target_version = store.stream_version(&request.target_stream).await?;
        let prerequisites = prerequisites(request, &source_analysis, target_version);
        let risks = self.risks(request, &source_analysis, &transformation_simulation, &resource_estimate);
        let is_feasible = prerequisites
            .iter()
            .all(|prerequisite| prerequisite.is_met || !prerequisite.is_blocking);

        let mut recommended_phases = vec![
            MigrationPhase::DualWrite,
            MigrationPhase::DualRead,
            MigrationPhase::Cutover,
        ];
        if request.book_closing.is_some() {
            recommended_phases.push(MigrationPhase::BookClosed);
        }

        let plan = MigrationPlan {
            plan_id: PlanId::new(),
            created_at: Timestamp::now(),
            object_id: request.object_id.clone(),
            target_stream: request.target_stream.clone(),
            source_analysis,
            transformation_simulation,
            resource_estimate,
            prerequisites,
            risks,
            recommended_phases,
            is_feasible,
        };

        info!(
            object_id = %request.object_id,
            plan_id = %plan.plan_id,
            events = plan.source_analysis.event_count,
            feasible = plan.is_feasible,
            risks = plan.risks.len(),
            "[planner.plan] plan produced"
        );
        Ok(plan)
    }

    async fn analyze<S>(
        &self,
        store: &S,
        stream_id: &StreamId,
        cancel: &CancellationToken,
    ) -> MigrationResult<(StreamAnalysis, Vec<RecordedEvent>)>
    where
        S: EventStore + ?Sized,
    {
        let current_version = store.stream_version(stream_id).await?;
        let wanted: BTreeSet<u64> = stride_sample(
            usize::try_from(current_version.into_inner()).unwrap_or(usize::MAX),
            self.config.sample_size,
        )
        .into_iter()
        .map(|index| index as u64 + 1)
        .collect();

        let mut analysis = StreamAnalysis {
            stream_id: stream_id.clone(),
            event_count: 0,
            total_bytes: 0,
            event_type_histogram: BTreeMap::new(),
            first_event_at: None,
            last_event_at: None,
            current_version,
            is_closed: false,
        };
        let mut sample = Vec::new();
        let mut from = EventVersion::initial().next();

        while from <= current_version {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            let page = store
                .read(
                    stream_id,
                    &ReadOptions::new()
                        .from_version(from)
                        .to_version(current_version)
                        .with_max_events(self.config.scan_batch_size),
                )
                .await?;
            let Some(last) = page.last() else { break };
            from = last.version.next();

            for event in page {
                if event.is_stream_closed() {
                    analysis.is_closed = true;
                    continue;
                }
                analysis.event_count += 1;
                analysis.total_bytes += event.payload_size();
                *analysis
                    .event_type_histogram
                    .entry(event.event_type.to_string())
                    .or_insert(0) += 1;
                let _ = analysis.first_event_at.get_or_insert(event.recorded_at);
                analysis.last_event_at = Some(event.recorded_at);
                if wanted.contains(&event.version.into_inner()) {
                    sample.push(event);
                }
            }
        }

        Ok((analysis, sample))
    }

    async fn simulate(
        &self,
        sample: &[RecordedEvent],
        transformer: &dyn EventTransformer,
        cancel: &CancellationToken,
    ) -> MigrationResult<TransformationSimulation> {
        let mut success_count = 0;
        let mut failures = Vec::new();
        let mut failure_count = 0;
        let mut elapsed = Duration::ZERO;
        let mut input_bytes = 0_u64;
        let mut output_bytes = 0_u64;

        for event in sample {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            let started = Instant::now();
            let result = transformer.transform(event).await;
            elapsed += started.elapsed();
            match result {
                Ok(output) => {
                    success_count += 1;
                    input_bytes += event.payload_size();
                    output_bytes += output.payload.to_string().len() as u64;
                }
                Err(transform_error) => {
                    failure_count += 1;
                    if failures.len() < self.config.max_failure_examples {
                        failures.push(TransformFailure {
                            event_version: event.version,
                            event_name: event.event_type.to_string(),
                            error: transform_error.to_string(),
                        });
                    }
                }
            }
        }

        let average_transform_time = u32::try_from(sample.len())
            .ok()
            .filter(|count| *count > 0)
            .map_or(Duration::ZERO, |count| elapsed / count);
        #[allow(clippy::cast_precision_loss)]
        let size_ratio = if input_bytes == 0 {
            1.0
        } else {
            output_bytes as f64 / input_bytes as f64
        };

        Ok(TransformationSimulation {
            sample_size: sample.len(),
            success_count,
            failure_count,
            failures,
            average_transform_time,
            size_ratio,
        })
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn estimate(
        &self,
        analysis: &StreamAnalysis,
        simulation: &TransformationSimulation,
        request: &PlanRequest,
    ) -> ResourceEstimate {
        let per_event = simulation.average_transform_time + self.config.per_event_io_time;
        let estimated_duration = per_event.mul_f64(analysis.event_count as f64);
        let estimated_storage_bytes = (analysis.total_bytes as f64 * simulation.size_ratio).ceil() as u64;
        let estimated_bandwidth_bytes = analysis.total_bytes + estimated_storage_bytes;
        let estimated_operations = analysis.event_count * 2;

        let mut estimated_cost = estimated_storage_bytes as f64 / BYTES_PER_GB * self.config.cost_per_gb
            + estimated_operations as f64 / 10_000.0 * self.config.cost_per_10k_operations;
        if request
            .book_closing
            .as_ref()
            .is_some_and(|book_closing| book_closing.create_snapshot)
        {
            estimated_cost += self.config.snapshot_cost_hint;
        }

        ResourceEstimate {
            estimated_duration,
            estimated_storage_bytes,
            estimated_bandwidth_bytes,
            estimated_operations,
            estimated_cost,
        }
    }

    fn risks(
        &self,
        request: &PlanRequest,
        analysis: &StreamAnalysis,
        simulation: &TransformationSimulation,
        estimate: &ResourceEstimate,
    ) -> Vec<MigrationRisk> {
        let mut risks = Vec::new();

        if simulation.failure_count > 0 {
            let severity = if simulation.success_count == 0 {
                RiskSeverity::Critical
            } else {
                RiskSeverity::High
            };
            risks.push(MigrationRisk {
                category: RiskCategory::Transformation,
                description: format!(
                    "{} of {} sampled events failed to transform",
                    simulation.failure_count, simulation.sample_size
                ),
                severity,
                mitigations: vec![
                    "fix the transformer for the failing event types".to_string(),
                    "re-run the plan with a larger sample".to_string(),
                ],
            });
        }

        if analysis.event_count > self.config.large_stream_threshold {
            risks.push(MigrationRisk {
                category: RiskCategory::DataVolume,
                description: format!(
                    "stream has {} events, above the {} event threshold",
                    analysis.event_count, self.config.large_stream_threshold
                ),
                severity: RiskSeverity::Medium,
                mitigations: vec!["schedule the migration outside peak traffic".to_string()],
            });
        }

        if let Some(lease) = request.lock_lease {
            if estimate.estimated_duration > lease {
                risks.push(MigrationRisk {
                    category: RiskCategory::Duration,
                    description: format!(
                        "estimated duration {:?} outlasts the {lease:?} lock lease; the migration depends on heartbeats",
                        estimate.estimated_duration
                    ),
                    severity: RiskSeverity::Low,
                    mitigations: vec!["keep the heartbeat interval well below the lease".to_string()],
                });
            }
        }

        if request
            .book_closing
            .as_ref()
            .is_some_and(BookClosingConfig::deletes_without_archive)
        {
            risks.push(MigrationRisk {
                category: RiskCategory::DataLoss,
                description: "book closing deletes the old stream without an archive".to_string(),
                severity: RiskSeverity::High,
                mitigations: vec!["configure an archive location and delete_after_archive instead".to_string()],
            });
        }

        risks
    }
}

fn prerequisites(
    request: &PlanRequest,
    analysis: &StreamAnalysis,
    target_version: EventVersion,
) -> Vec<Prerequisite> {
    let lease_ok = request
        .lock_lease
        .map_or(true, |lease| request.heartbeat_interval < lease);

    let mut prerequisites = vec![
        Prerequisite::new(
            "source_stream_exists",
            format!("source stream '{}' has events", request.source_stream),
            analysis.current_version > EventVersion::initial(),
            true,
        ),
        Prerequisite::new(
            "source_stream_open",
            format!("source stream '{}' is not already closed", request.source_stream),
            !analysis.is_closed,
            true,
        ),
        Prerequisite::new(
            "target_stream_empty",
            format!(
                "target stream '{}' is empty (currently at version {target_version})",
                request.target_stream
            ),
            target_version == EventVersion::initial(),
            true,
        ),
        Prerequisite::new(
            "lock_lease_sufficient",
            format!(
                "heartbeat interval {:?} is shorter than the lock lease {:?}",
                request.heartbeat_interval, request.lock_lease
            ),
            lease_ok,
            true,
        ),
    ];
    prerequisites.extend(request.custom_prerequisites.iter().cloned());
    prerequisites
}
