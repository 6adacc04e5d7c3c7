//! Continuous computations over the event log
//!
//! Two computations are built in:
//! - [`statistics`]: start/completion totals and per-state visit and
//!   abandonment counts, with a live tier for recent starts and completions
//! - [`answers`]: calculation outputs over submitted answers
//!
//! Both are [`ContinuousComputation`] values run by the same
//! [`ComputationEngine`]. Results are read through [`QueryFacade`].
//!
//! See [`engine`] for the framework.

pub mod answers;
pub mod calculations;
pub mod engine;
pub mod mapreduce;
pub mod query;
pub mod statistics;

pub use answers::{AnswerSummariesJob, ANSWER_SUMMARIES};
pub use calculations::{create_default_registry, AnswerCalculation, CalculationRegistry};
pub use engine::{
    BatchContext, BatchJob, BatchJobReport, BatchRunResult, BatchRunStatus, ComputationEngine,
    ContinuousComputation, LiveHandoff, LiveLayer,
};
pub use query::{ExplorationStatistics, QueryFacade};
pub use statistics::{SessionReconstructor, StatisticsJob, STATISTICS};

use crate::config::Config;
use std::sync::Arc;

/// Engine with the statistics and answer summary computations registered.
pub fn create_default_engine(config: &Config) -> ComputationEngine {
    let mut engine = ComputationEngine::new();
    engine.register(ContinuousComputation::statistics(&config.stats));
    engine.register(ContinuousComputation::answer_summaries(
        Arc::new(create_default_registry(&config.answers)),
        config.stats.reduce_workers,
    ));
    engine
}
