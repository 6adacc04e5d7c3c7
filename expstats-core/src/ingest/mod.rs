//! Event ingestion
//!
//! [`EventIngestionRouter`] is the single entry point for inbound events. It
//! classifies each event by kind, appends it to the matching durable log and
//! forwards it to every continuous computation listening to that kind.
//!
//! ```text
//! event ──► answer_submitted ──► state_answers log ──► answer_summaries
//!       └─► start/complete/… ──► events log ─────────► statistics (live tier)
//!       └─► unknown kind ──────► events log (warned, not forwarded)
//! ```

use crate::analytics::{ComputationEngine, ContinuousComputation};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{EventKind, EventRecord, StateAnswersRecord};

/// Summary of a batch of recorded events.
#[derive(Debug, Default)]
pub struct IngestSummary {
    /// Events appended to the event log
    pub events_recorded: usize,
    /// Answer submissions appended to the answer log
    pub answers_recorded: usize,
    /// Events with a kind this build does not recognize (logged, not forwarded)
    pub unrecognized: usize,
    /// Logged events whose live update failed; the next batch run counts them
    pub live_update_failed: usize,
    /// Events rejected (position in the batch → error message)
    pub rejected: Vec<(usize, String)>,
}

/// Where a single event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Event,
    Answer,
    Unrecognized,
    /// Appended to the event log, but a live layer could not be updated
    EventLiveFailed,
}

pub struct EventIngestionRouter<'a> {
    db: &'a Database,
    engine: &'a ComputationEngine,
}

impl<'a> EventIngestionRouter<'a> {
    pub fn new(db: &'a Database, engine: &'a ComputationEngine) -> Self {
        Self { db, engine }
    }

    /// Log one event durably and forward it to its listeners.
    ///
    /// An `Err` means nothing was logged. A live-layer failure after the
    /// event was logged is reported as [`RecordOutcome::EventLiveFailed`].
    pub fn record(&self, event: &EventRecord) -> Result<RecordOutcome> {
        let (outcome, event_id) = match &event.kind {
            EventKind::AnswerSubmitted => {
                self.db.append_state_answers(&Self::to_answers_record(event)?)?;
                (RecordOutcome::Answer, None)
            }
            EventKind::Unrecognized(kind) => {
                tracing::warn!(
                    kind = %kind,
                    exploration_id = %event.exploration_id,
                    "Unrecognized event kind, logging without forwarding"
                );
                self.db.append_event(event)?;
                return Ok(RecordOutcome::Unrecognized);
            }
            _ => (RecordOutcome::Event, Some(self.db.append_event(event)?)),
        };

        for computation in self.engine.listeners(&event.kind) {
            if !computation.has_live_layer() {
                continue;
            }
            if let Err(e) = self.forward_live(computation, event_id, event) {
                tracing::warn!(
                    computation = computation.name(),
                    exploration_id = %event.exploration_id,
                    error = %e,
                    "Live update failed, event left to the next batch run"
                );
                return Ok(RecordOutcome::EventLiveFailed);
            }
        }

        Ok(outcome)
    }

    /// Count a logged event in the computation's active generation, unless a
    /// batch run rotated after the event was logged and so owns it already.
    fn forward_live(
        &self,
        computation: &ContinuousComputation,
        event_id: Option<i64>,
        event: &EventRecord,
    ) -> Result<()> {
        let state = self.db.get_generation_state(computation.name())?;
        if let Some(id) = event_id {
            if !state.owns_event(id) {
                tracing::debug!(
                    computation = computation.name(),
                    event_id = id,
                    "Event predates the active generation, skipping live update"
                );
                return Ok(());
            }
        }
        computation.handle_incoming_event(self.db, state.active, event)
    }

    /// Record events in order. A rejected event does not stop the batch.
    pub fn record_batch(&self, events: &[EventRecord]) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for (i, event) in events.iter().enumerate() {
            match self.record(event) {
                Ok(RecordOutcome::Event) => summary.events_recorded += 1,
                Ok(RecordOutcome::Answer) => summary.answers_recorded += 1,
                Ok(RecordOutcome::Unrecognized) => summary.unrecognized += 1,
                Ok(RecordOutcome::EventLiveFailed) => {
                    summary.events_recorded += 1;
                    summary.live_update_failed += 1;
                }
                Err(e) => {
                    tracing::warn!(index = i, error = %e, "Rejected event");
                    summary.rejected.push((i, e.to_string()));
                }
            }
        }

        tracing::info!(
            events = summary.events_recorded,
            answers = summary.answers_recorded,
            unrecognized = summary.unrecognized,
            live_update_failed = summary.live_update_failed,
            rejected = summary.rejected.len(),
            "Recorded event batch"
        );
        summary
    }

    fn to_answers_record(event: &EventRecord) -> Result<StateAnswersRecord> {
        let missing = |field: &str| {
            Error::InvalidEvent(format!(
                "answer_submitted for {} has no {}",
                event.exploration_id, field
            ))
        };

        let answer = event.answer.as_ref().ok_or_else(|| missing("answer"))?;
        Ok(StateAnswersRecord {
            exploration_id: event.exploration_id.clone(),
            version: event.version.ok_or_else(|| missing("version"))?,
            state_name: event.state_name.clone().ok_or_else(|| missing("state_name"))?,
            interaction_id: answer.interaction_id.clone(),
            submitted_answer_list: vec![answer.answer.clone()],
            created_on: event.created_on,
        })
    }
}
