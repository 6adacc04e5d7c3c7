//! Answer summary batch job
//!
//! Groups submitted answers by `(exploration, version scope, state)`, runs
//! every calculation registered for the state's interaction over the
//! combined list and stores one [`CalculationOutput`] per calculation.
//!
//! A failing key only loses its own outputs; other keys and the statistics
//! computation are unaffected.

use super::calculations::CalculationRegistry;
use super::engine::{BatchContext, BatchJob, BatchJobReport, ContinuousComputation};
use super::mapreduce::{reduce_parallel, Shuffle};
use crate::error::Result;
use crate::types::{AnswerBatch, CalculationOutput, EventKind, StateAnswersRecord, VersionScope};
use serde_json::Value;
use std::sync::Arc;

/// Name of the answer summary computation.
pub const ANSWER_SUMMARIES: &str = "answer_summaries";

/// Reduce key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnswerKey {
    pub exploration_id: String,
    pub version_scope: VersionScope,
    pub state_name: String,
}

impl std::fmt::Display for AnswerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.exploration_id, self.version_scope, self.state_name
        )
    }
}

/// Answers of one logged record.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerPayload {
    pub interaction_id: String,
    pub submitted_answer_list: Vec<Value>,
}

/// Emit a record under its version and under `all`.
pub fn map_state_answers(record: StateAnswersRecord) -> [(AnswerKey, AnswerPayload); 2] {
    let versioned = AnswerKey {
        exploration_id: record.exploration_id.clone(),
        version_scope: VersionScope::Version(record.version),
        state_name: record.state_name.clone(),
    };
    let all = AnswerKey {
        version_scope: VersionScope::All,
        ..versioned.clone()
    };
    let payload = AnswerPayload {
        interaction_id: record.interaction_id,
        submitted_answer_list: record.submitted_answer_list,
    };
    [(versioned, payload.clone()), (all, payload)]
}

/// Concatenate every payload of a key into one batch.
///
/// The interaction id is taken from the first payload. Returns `None` for an
/// empty group.
pub fn combine_answers(key: &AnswerKey, payloads: Vec<AnswerPayload>) -> Option<AnswerBatch> {
    let interaction_id = payloads.first()?.interaction_id.clone();
    let submitted_answer_list = payloads
        .into_iter()
        .flat_map(|p| p.submitted_answer_list)
        .collect();

    Some(AnswerBatch {
        exploration_id: key.exploration_id.clone(),
        version_scope: key.version_scope,
        state_name: key.state_name.clone(),
        interaction_id,
        submitted_answer_list,
    })
}

/// Batch job producing calculation outputs.
pub struct AnswerSummariesJob {
    registry: Arc<CalculationRegistry>,
    workers: usize,
}

impl AnswerSummariesJob {
    pub fn new(registry: Arc<CalculationRegistry>, workers: usize) -> Self {
        Self { registry, workers }
    }

    /// Returns the number of outputs written.
    fn reduce_key(&self, ctx: &BatchContext, key: &AnswerKey, payloads: Vec<AnswerPayload>) -> Result<usize> {
        let Some(batch) = combine_answers(key, payloads) else {
            return Ok(0);
        };

        let calculation_ids = self
            .registry
            .calculation_ids_for_interaction(&batch.interaction_id)?;

        for calculation_id in calculation_ids {
            let calculation = self.registry.calculation(calculation_id)?;
            let output = calculation.compute(&batch.submitted_answer_list)?;
            ctx.db.put_calculation_output(&CalculationOutput {
                exploration_id: batch.exploration_id.clone(),
                version_scope: batch.version_scope,
                state_name: batch.state_name.clone(),
                calculation_id: calculation_id.clone(),
                output,
            })?;
        }

        Ok(calculation_ids.len())
    }
}

impl BatchJob for AnswerSummariesJob {
    fn run(&self, ctx: &BatchContext) -> Result<BatchJobReport> {
        let mut shuffle = Shuffle::new();
        let records = ctx.db.for_each_state_answers_before(&ctx.cutoff, |record| {
            for (key, payload) in map_state_answers(record) {
                shuffle.emit(key, payload);
            }
        })?;

        tracing::debug!(
            records,
            keys = shuffle.key_count(),
            "Answer summary map phase complete"
        );

        let outcomes = reduce_parallel(shuffle.into_groups(), self.workers, |key, payloads| {
            self.reduce_key(ctx, key, payloads)
        });

        let mut report = BatchJobReport {
            input_count: records,
            ..Default::default()
        };
        for (key, outcome) in outcomes {
            match outcome {
                Ok(0) => report.keys_skipped += 1,
                Ok(_) => report.keys_written += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Answer summary failed");
                    report.failed_keys.push((key.to_string(), e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

impl ContinuousComputation {
    /// Calculation outputs over submitted answers. Has no live layer.
    pub fn answer_summaries(registry: Arc<CalculationRegistry>, workers: usize) -> Self {
        ContinuousComputation::new(
            ANSWER_SUMMARIES,
            vec![EventKind::AnswerSubmitted],
            None,
            Box::new(AnswerSummariesJob::new(registry, workers)),
        )
    }
}
