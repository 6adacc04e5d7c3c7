//! Exploration statistics batch job
//!
//! Rebuilds one [`CanonicalSnapshot`] per `(exploration, version scope)` from
//! the event log and the legacy counters.
//!
//! ## Map
//!
//! | Input | Keys emitted |
//! |-------|--------------|
//! | event with version `v` | `(exp, v)`, `(exp, all)` |
//! | event without version | `(exp, none)`, `(exp, all)` |
//! | legacy counter | `(exp, none)`, `(exp, all)` |
//!
//! ## Reduce
//!
//! Each key resolves its exploration content, then feeds every value through
//! a [`SessionReconstructor`]. Keys whose exploration cannot be resolved are
//! skipped without output.

mod reconstructor;

pub use reconstructor::{ReducedStatistics, SessionReconstructor};

use super::engine::{BatchContext, BatchJob, BatchJobReport, ContinuousComputation};
use super::mapreduce::{reduce_parallel, Shuffle};
use crate::config::StatsConfig;
use crate::content::ExplorationSource;
use crate::error::{Error, Result};
use crate::live::LiveCounterLayer;
use crate::types::{
    CanonicalSnapshot, EventKind, EventRecord, ExplorationContent, LegacyStateCounter,
    VersionScope,
};
use chrono::{DateTime, Utc};

/// Name of the statistics computation.
pub const STATISTICS: &str = "statistics";

/// Reduce key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatsKey {
    pub exploration_id: String,
    pub version_scope: VersionScope,
}

impl std::fmt::Display for StatsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exploration_id, self.version_scope)
    }
}

/// Event fields the reducer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub session_id: String,
    pub state_name: Option<String>,
    pub created_on: DateTime<Utc>,
}

/// Shuffled value, tagged by origin.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsValue {
    Event(NormalizedEvent),
    Legacy(LegacyStateCounter),
}

// ============================================
// Map
// ============================================

fn key(exploration_id: &str, version_scope: VersionScope) -> StatsKey {
    StatsKey {
        exploration_id: exploration_id.to_string(),
        version_scope,
    }
}

/// Emit an event under its own version scope and under `all`.
pub fn map_event(event: EventRecord) -> [(StatsKey, StatsValue); 2] {
    let own = key(&event.exploration_id, VersionScope::from_version(event.version));
    let all = key(&event.exploration_id, VersionScope::All);
    let value = StatsValue::Event(NormalizedEvent {
        kind: event.kind,
        session_id: event.session_id,
        state_name: event.state_name,
        created_on: event.created_on,
    });
    [(own, value.clone()), (all, value)]
}

/// Emit a legacy counter under the unspecified scope and under `all`.
pub fn map_legacy_counter(counter: LegacyStateCounter) -> [(StatsKey, StatsValue); 2] {
    let none = key(&counter.exploration_id, VersionScope::Unspecified);
    let all = key(&counter.exploration_id, VersionScope::All);
    let value = StatsValue::Legacy(counter);
    [(none, value.clone()), (all, value)]
}

// ============================================
// Content resolution
// ============================================

/// Content the statistics of `version_scope` are computed against.
///
/// The unspecified scope walks back from the latest version to the one in
/// force at `migration_cutoff`, stopping at version 1.
pub fn resolve_for_scope(
    source: &dyn ExplorationSource,
    exploration_id: &str,
    version_scope: VersionScope,
    migration_cutoff: DateTime<Utc>,
) -> Result<ExplorationContent> {
    match version_scope {
        VersionScope::Version(version) => source.resolve_at_version(exploration_id, version),
        VersionScope::All => source.resolve(exploration_id, None),
        VersionScope::Unspecified => {
            let mut content = source.resolve(exploration_id, None)?;
            while content.last_updated > migration_cutoff && content.version > 1 {
                content = source.resolve_at_version(exploration_id, content.version - 1)?;
            }
            Ok(content)
        }
    }
}

// ============================================
// Job
// ============================================

enum KeyOutcome {
    Written { ignored_values: usize },
    Skipped,
}

/// Batch job producing canonical snapshots.
pub struct StatisticsJob {
    config: StatsConfig,
}

impl StatisticsJob {
    pub fn new(config: StatsConfig) -> Self {
        Self { config }
    }

    fn reduce_key(
        &self,
        ctx: &BatchContext,
        key: &StatsKey,
        values: Vec<StatsValue>,
    ) -> Result<KeyOutcome> {
        let content = match resolve_for_scope(
            ctx.content,
            &key.exploration_id,
            key.version_scope,
            self.config.migration_cutoff,
        ) {
            Ok(content) => content,
            Err(Error::NotFound(what)) => {
                tracing::debug!(key = %key, missing = %what, "Skipping key without content");
                return Ok(KeyOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let mut reconstructor =
            SessionReconstructor::new(&content, &self.config.legacy_terminal_state);
        for value in values {
            reconstructor.consume(value);
        }
        let reduced = reconstructor.finish();

        ctx.db.put_canonical_snapshot(&CanonicalSnapshot {
            exploration_id: key.exploration_id.clone(),
            version_scope: key.version_scope,
            num_starts: reduced.num_starts,
            num_completions: reduced.num_completions,
            state_hit_counts: reduced.state_hit_counts,
            last_updated: ctx.cutoff,
        })?;

        Ok(KeyOutcome::Written {
            ignored_values: reduced.ignored_values,
        })
    }
}

impl BatchJob for StatisticsJob {
    fn run(&self, ctx: &BatchContext) -> Result<BatchJobReport> {
        let mut shuffle = Shuffle::new();

        let events = ctx
            .db
            .for_each_event_before(&ctx.cutoff, ctx.event_watermark, |event| {
                for (key, value) in map_event(event) {
                    shuffle.emit(key, value);
                }
            })?;
        let legacy = ctx.db.for_each_legacy_counter_before(&ctx.cutoff, |counter| {
            for (key, value) in map_legacy_counter(counter) {
                shuffle.emit(key, value);
            }
        })?;

        tracing::debug!(
            events,
            legacy,
            keys = shuffle.key_count(),
            emitted = shuffle.emitted(),
            "Statistics map phase complete"
        );

        let outcomes = reduce_parallel(
            shuffle.into_groups(),
            self.config.reduce_workers,
            |key, values| self.reduce_key(ctx, key, values),
        );

        let mut report = BatchJobReport {
            input_count: events + legacy,
            ..Default::default()
        };
        let mut ignored = 0;
        for (key, outcome) in outcomes {
            match outcome {
                Ok(KeyOutcome::Written { ignored_values }) => {
                    report.keys_written += 1;
                    ignored += ignored_values;
                }
                Ok(KeyOutcome::Skipped) => report.keys_skipped += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Statistics reduce failed");
                    report.failed_keys.push((key.to_string(), e.to_string()));
                }
            }
        }

        if ignored > 0 {
            tracing::debug!(ignored, "Values with uninterpreted event kinds");
        }

        Ok(report)
    }
}

impl ContinuousComputation {
    /// Start/completion and per-state statistics.
    pub fn statistics(config: &StatsConfig) -> Self {
        ContinuousComputation::new(
            STATISTICS,
            vec![
                EventKind::Start,
                EventKind::MaybeLeave,
                EventKind::Complete,
                EventKind::StateHit,
            ],
            Some(Box::new(LiveCounterLayer)),
            Box::new(StatisticsJob::new(config.clone())),
        )
    }
}
