//! Continuous computation framework
//!
//! A continuous computation pairs a cheap live layer, updated on every
//! incoming event, with a batch job that periodically recomputes canonical
//! results from the durable logs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    COMPUTATION ENGINE                           │
//! │                                                                 │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐     │
//! │  │ statistics               │  │ answer_summaries         │     │
//! │  │ kinds: start, complete   │  │ kinds: answer_submitted  │     │
//! │  │ live:  LiveCounterLayer  │  │ live:  (none)            │     │
//! │  │ batch: StatisticsJob     │  │ batch: AnswerSummariesJob│     │
//! │  └────────────┬─────────────┘  └────────────┬─────────────┘     │
//! │               ▼                             ▼                   │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │           ComputationEngine.run_batch()                 │   │
//! │  │  - Rotates the live generation                          │   │
//! │  │  - Runs the batch job up to a fixed cutoff              │   │
//! │  │  - Hands events past the cutoff back to the live layer  │   │
//! │  │  - Records BatchRunResult in batch_runs                 │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::content::ExplorationSource;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{EventKind, EventRecord, Generation};
use chrono::{DateTime, Utc};
use std::time::Instant;

/// Maximum number of failed keys spelled out in a run's error message.
const MAX_REPORTED_FAILURES: usize = 5;

// ============================================
// Live layer and batch job seams
// ============================================

/// What a successful batch run hands back to its computation's live layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveHandoff {
    pub computation: String,
    /// Generation opened by the run
    pub active: Generation,
    /// Last event-log id the run could see
    pub event_watermark: i64,
    /// Events dated at or after this instant were not absorbed by the run
    pub cutoff: DateTime<Utc>,
}

/// Fast, approximate per-event bookkeeping for a computation.
pub trait LiveLayer: Send + Sync {
    /// Record one event into the given generation.
    fn record(&self, db: &Database, generation: Generation, event: &EventRecord) -> Result<()>;

    /// Replace the generations older than `handoff.active` with the events
    /// the run left out.
    ///
    /// Returns the number of records removed.
    fn absorb(&self, db: &Database, handoff: &LiveHandoff) -> Result<usize>;
}

/// Inputs shared by every batch job.
pub struct BatchContext<'a> {
    /// Store holding the logs and receiving the outputs
    pub db: &'a Database,
    /// Exploration content lookup
    pub content: &'a dyn ExplorationSource,
    /// Only records created strictly before this instant are read
    pub cutoff: DateTime<Utc>,
    /// Only events logged at or below this id are read
    pub event_watermark: i64,
}

/// What a batch job did, reported back to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchJobReport {
    /// Records read by the map phase
    pub input_count: usize,
    /// Reduce keys that produced output
    pub keys_written: usize,
    /// Reduce keys abandoned without output (e.g. deleted exploration)
    pub keys_skipped: usize,
    /// Reduce keys that failed, with the reason
    pub failed_keys: Vec<(String, String)>,
}

/// A map/reduce pass over the durable logs.
pub trait BatchJob: Send + Sync {
    fn run(&self, ctx: &BatchContext) -> Result<BatchJobReport>;
}

// ============================================
// Continuous computation
// ============================================

/// One continuous computation: the event kinds it listens to, its optional
/// live layer, and its batch job.
pub struct ContinuousComputation {
    name: String,
    event_kinds: Vec<EventKind>,
    live_layer: Option<Box<dyn LiveLayer>>,
    batch_job: Box<dyn BatchJob>,
}

impl ContinuousComputation {
    pub fn new(
        name: &str,
        event_kinds: Vec<EventKind>,
        live_layer: Option<Box<dyn LiveLayer>>,
        batch_job: Box<dyn BatchJob>,
    ) -> Self {
        Self {
            name: name.to_string(),
            event_kinds,
            live_layer,
            batch_job,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_kinds(&self) -> &[EventKind] {
        &self.event_kinds
    }

    pub fn listens_to(&self, kind: &EventKind) -> bool {
        self.event_kinds.contains(kind)
    }

    pub fn has_live_layer(&self) -> bool {
        self.live_layer.is_some()
    }

    /// Forward an incoming event to the live layer under `generation`.
    pub fn handle_incoming_event(
        &self,
        db: &Database,
        generation: Generation,
        event: &EventRecord,
    ) -> Result<()> {
        match &self.live_layer {
            Some(layer) => layer.record(db, generation, event),
            None => Ok(()),
        }
    }
}

// ============================================
// Batch run results
// ============================================

/// Result of one batch run.
///
/// Stored in the `batch_runs` table for observability and debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRunResult {
    /// Computation whose batch job ran
    pub job_name: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Snapshot boundary used by the run
    pub cutoff: DateTime<Utc>,
    /// How long the run took (milliseconds)
    pub duration_ms: i64,
    pub status: BatchRunStatus,
    /// Why the run (or some of its keys) failed
    pub error_message: Option<String>,
    pub input_count: usize,
    pub keys_written: usize,
    pub keys_skipped: usize,
    pub keys_failed: usize,
}

/// Status of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRunStatus {
    /// Every key was reduced (or skipped)
    Success,
    /// Some keys failed; the others were written
    Partial,
    /// The job failed as a whole
    Error,
}

impl BatchRunStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchRunStatus::Success => "success",
            BatchRunStatus::Partial => "partial",
            BatchRunStatus::Error => "error",
        }
    }

    /// Parse status string from storage.
    pub fn from_storage(value: &str) -> Self {
        match value {
            "success" => BatchRunStatus::Success,
            "partial" => BatchRunStatus::Partial,
            _ => BatchRunStatus::Error,
        }
    }
}

// ============================================
// Computation engine
// ============================================

/// Registry and runner for continuous computations.
pub struct ComputationEngine {
    computations: Vec<ContinuousComputation>,
}

impl ComputationEngine {
    /// Create a new empty engine.
    pub fn new() -> Self {
        Self {
            computations: Vec::new(),
        }
    }

    /// Register a computation with the engine.
    pub fn register(&mut self, computation: ContinuousComputation) {
        tracing::info!(
            computation = computation.name(),
            kinds = ?computation.event_kinds(),
            "Registered continuous computation"
        );
        self.computations.push(computation);
    }

    /// Get list of registered computation names.
    pub fn computation_names(&self) -> Vec<&str> {
        self.computations.iter().map(|c| c.name()).collect()
    }

    pub fn has_computation(&self, name: &str) -> bool {
        self.computations.iter().any(|c| c.name() == name)
    }

    /// Computations that listen to the given kind.
    pub fn listeners(&self, kind: &EventKind) -> impl Iterator<Item = &ContinuousComputation> {
        let kind = kind.clone();
        self.computations.iter().filter(move |c| c.listens_to(&kind))
    }

    fn computation(&self, name: &str) -> Result<&ContinuousComputation> {
        self.computations
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::NotFound(format!("computation {}", name)))
    }

    fn record_batch_run(db: &Database, result: &BatchRunResult) {
        if let Err(e) = db.insert_batch_run(result) {
            tracing::warn!(error = %e, "Failed to record batch run");
        }
    }

    /// Run one computation's batch job.
    ///
    /// This method:
    /// 1. Rotates the computation's live generation so that events arriving
    ///    from now on are not absorbed by this run
    /// 2. Runs the batch job over records created before `cutoff` and logged
    ///    before the rotation
    /// 3. If the job completed, hands the events it left out to the live
    ///    layer, which drops the older generations
    /// 4. Records the run for observability
    ///
    /// A failed job leaves the live layer untouched. Job and hand-off
    /// failures are reported in the result, not as an `Err`.
    pub fn run_batch(
        &self,
        name: &str,
        db: &Database,
        content: &dyn ExplorationSource,
        cutoff: DateTime<Utc>,
    ) -> Result<BatchRunResult> {
        let computation = self.computation(name)?;
        let started_at = Utc::now();
        let start = Instant::now();

        let (absorbed, state) = db.rotate_generation(name, &cutoff)?;

        tracing::info!(
            computation = name,
            cutoff = %cutoff,
            absorbed_generation = %absorbed,
            active_generation = %state.active,
            event_watermark = state.opened_after_event,
            "Starting batch run"
        );

        let ctx = BatchContext {
            db,
            content,
            cutoff,
            event_watermark: state.opened_after_event,
        };

        let result = match computation.batch_job.run(&ctx) {
            Ok(report) => {
                let handoff_error = computation.live_layer.as_ref().and_then(|layer| {
                    let handoff = LiveHandoff {
                        computation: name.to_string(),
                        active: state.active,
                        event_watermark: state.opened_after_event,
                        cutoff,
                    };
                    match layer.absorb(db, &handoff) {
                        Ok(cleared) => {
                            tracing::debug!(computation = name, cleared, "Absorbed live counters");
                            None
                        }
                        Err(e) => {
                            tracing::error!(
                                computation = name,
                                error = %e,
                                "Snapshots written but live counters not absorbed"
                            );
                            Some(e)
                        }
                    }
                });

                let (status, error_message) = if let Some(e) = handoff_error {
                    (
                        BatchRunStatus::Error,
                        Some(format!("live counters not absorbed: {e}")),
                    )
                } else if report.failed_keys.is_empty() {
                    (BatchRunStatus::Success, None)
                } else {
                    let shown: Vec<String> = report
                        .failed_keys
                        .iter()
                        .take(MAX_REPORTED_FAILURES)
                        .map(|(key, reason)| format!("{key}: {reason}"))
                        .collect();
                    (
                        BatchRunStatus::Partial,
                        Some(format!(
                            "{} key(s) failed: {}",
                            report.failed_keys.len(),
                            shown.join("; ")
                        )),
                    )
                };

                BatchRunResult {
                    job_name: name.to_string(),
                    started_at,
                    cutoff,
                    duration_ms: start.elapsed().as_millis() as i64,
                    status,
                    error_message,
                    input_count: report.input_count,
                    keys_written: report.keys_written,
                    keys_skipped: report.keys_skipped,
                    keys_failed: report.failed_keys.len(),
                }
            }
            Err(e) => {
                tracing::error!(computation = name, error = %e, "Batch run failed");
                BatchRunResult {
                    job_name: name.to_string(),
                    started_at,
                    cutoff,
                    duration_ms: start.elapsed().as_millis() as i64,
                    status: BatchRunStatus::Error,
                    error_message: Some(e.to_string()),
                    input_count: 0,
                    keys_written: 0,
                    keys_skipped: 0,
                    keys_failed: 0,
                }
            }
        };

        Self::record_batch_run(db, &result);

        tracing::info!(
            computation = name,
            status = result.status.as_str(),
            input = result.input_count,
            written = result.keys_written,
            skipped = result.keys_skipped,
            failed = result.keys_failed,
            duration_ms = result.duration_ms,
            "Batch run finished"
        );

        Ok(result)
    }

    /// Most recent runs of one computation, newest first.
    pub fn batch_runs(&self, db: &Database, name: &str, limit: usize) -> Result<Vec<BatchRunResult>> {
        self.computation(name)?;
        db.get_batch_runs(name, limit)
    }

    /// Run every registered computation with the same cutoff.
    pub fn run_all(
        &self,
        db: &Database,
        content: &dyn ExplorationSource,
        cutoff: DateTime<Utc>,
    ) -> Vec<BatchRunResult> {
        self.computations
            .iter()
            .filter_map(|c| match self.run_batch(c.name(), db, content, cutoff) {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::error!(computation = c.name(), error = %e, "Could not start batch run");
                    None
                }
            })
            .collect()
    }
}

impl Default for ComputationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::{LiveCounterLayer, LiveCounterTier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingLayer {
        recorded: Arc<AtomicUsize>,
        absorb_fails: bool,
    }

    impl LiveLayer for CountingLayer {
        fn record(&self, _db: &Database, _generation: Generation, _event: &EventRecord) -> Result<()> {
            self.recorded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn absorb(&self, _db: &Database, _handoff: &LiveHandoff) -> Result<usize> {
            if self.absorb_fails {
                return Err(Error::Config("disk full".to_string()));
            }
            Ok(0)
        }
    }

    struct FixedJob {
        report: Option<BatchJobReport>,
    }

    impl BatchJob for FixedJob {
        fn run(&self, _ctx: &BatchContext) -> Result<BatchJobReport> {
            self.report
                .clone()
                .ok_or_else(|| Error::Config("job exploded".to_string()))
        }
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn cutoff() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_engine_registration_and_listeners() {
        let mut engine = ComputationEngine::new();
        assert!(engine.computation_names().is_empty());

        engine.register(ContinuousComputation::new(
            "test.counts",
            vec![EventKind::Start, EventKind::Complete],
            None,
            Box::new(FixedJob {
                report: Some(BatchJobReport::default()),
            }),
        ));

        assert!(engine.has_computation("test.counts"));
        assert_eq!(engine.listeners(&EventKind::Start).count(), 1);
        assert_eq!(engine.listeners(&EventKind::StateHit).count(), 0);
    }

    #[test]
    fn test_handle_incoming_event_uses_live_layer() {
        let db = test_db();
        let recorded = Arc::new(AtomicUsize::new(0));
        let computation = ContinuousComputation::new(
            "test.live",
            vec![EventKind::Start],
            Some(Box::new(CountingLayer {
                recorded: recorded.clone(),
                absorb_fails: false,
            })),
            Box::new(FixedJob { report: None }),
        );

        let event = EventRecord {
            kind: EventKind::Start,
            exploration_id: "exp1".to_string(),
            version: None,
            session_id: "s1".to_string(),
            state_name: None,
            created_on: cutoff(),
            answer: None,
        };
        computation
            .handle_incoming_event(&db, Generation(0), &event)
            .unwrap();
        assert_eq!(recorded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_batch_rotates_generation_and_records_run() {
        let db = test_db();
        let mut engine = ComputationEngine::new();
        engine.register(ContinuousComputation::new(
            "test.partial",
            vec![],
            None,
            Box::new(FixedJob {
                report: Some(BatchJobReport {
                    input_count: 4,
                    keys_written: 1,
                    keys_skipped: 1,
                    failed_keys: vec![("exp1:all".to_string(), "boom".to_string())],
                }),
            }),
        ));

        let result = engine
            .run_batch("test.partial", &db, &db, cutoff())
            .unwrap();
        assert_eq!(result.status, BatchRunStatus::Partial);
        assert_eq!(result.keys_failed, 1);
        assert!(result.error_message.unwrap().contains("exp1:all: boom"));
        assert_eq!(
            db.get_generation_state("test.partial").unwrap().active,
            Generation(1)
        );

        let runs = db.get_batch_runs("test.partial", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].input_count, 4);
        assert_eq!(runs[0].status, BatchRunStatus::Partial);
    }

    #[test]
    fn test_failed_job_is_reported_not_raised() {
        let db = test_db();
        let mut engine = ComputationEngine::new();
        engine.register(ContinuousComputation::new(
            "test.failing",
            vec![],
            None,
            Box::new(FixedJob { report: None }),
        ));

        let result = engine
            .run_batch("test.failing", &db, &db, cutoff())
            .unwrap();
        assert_eq!(result.status, BatchRunStatus::Error);
        assert!(result.error_message.unwrap().contains("job exploded"));

        assert!(matches!(
            engine.run_batch("test.missing", &db, &db, cutoff()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_failed_absorb_is_recorded_with_job_counts() {
        let db = test_db();
        let mut engine = ComputationEngine::new();
        engine.register(ContinuousComputation::new(
            "test.absorb",
            vec![EventKind::Start],
            Some(Box::new(CountingLayer {
                recorded: Arc::new(AtomicUsize::new(0)),
                absorb_fails: true,
            })),
            Box::new(FixedJob {
                report: Some(BatchJobReport {
                    input_count: 3,
                    keys_written: 2,
                    ..Default::default()
                }),
            }),
        ));

        let result = engine
            .run_batch("test.absorb", &db, &db, cutoff())
            .unwrap();
        assert_eq!(result.status, BatchRunStatus::Error);
        assert_eq!(result.keys_written, 2);
        assert!(result.error_message.unwrap().contains("disk full"));

        let runs = db.get_batch_runs("test.absorb", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, BatchRunStatus::Error);
        assert_eq!(runs[0].input_count, 3);
    }

    #[test]
    fn test_failed_job_keeps_live_counts_readable() {
        let db = test_db();
        let mut engine = ComputationEngine::new();
        engine.register(ContinuousComputation::new(
            "test.live_failing",
            vec![EventKind::Start],
            Some(Box::new(LiveCounterLayer)),
            Box::new(FixedJob { report: None }),
        ));

        let before = db.get_generation_state("test.live_failing").unwrap();
        let tier = LiveCounterTier::for_state(&db, &before);
        tier.increment_start("exp1").unwrap();
        tier.increment_start("exp1").unwrap();

        let result = engine
            .run_batch("test.live_failing", &db, &db, cutoff())
            .unwrap();
        assert_eq!(result.status, BatchRunStatus::Error);

        let after = db.get_generation_state("test.live_failing").unwrap();
        assert_eq!(after.active, Generation(1));
        assert_eq!(after.oldest_live, Generation(0));
        let counts = LiveCounterTier::for_state(&db, &after).read("exp1").unwrap();
        assert_eq!(counts.num_starts, 2);
    }
}
