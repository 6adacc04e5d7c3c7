//! Live counter tier
//!
//! Start and completion counts that no canonical snapshot covers yet.
//! Counters belong to a generation. A batch run rotates the generation when
//! it starts; when it succeeds, the older generations are replaced by the
//! counts of events the run left out (dated at or after its cutoff). Until
//! then readers sum every generation from the oldest live one to the active
//! one, so a failed run hides nothing.

use crate::analytics::{LiveHandoff, LiveLayer};
use crate::db::{Database, LiveCounterField};
use crate::error::Result;
use crate::types::{EventKind, EventRecord, Generation, LiveCounts, LiveGenerationState};
use chrono::{DateTime, Utc};

/// Live counters written to one generation and read over a range of them.
pub struct LiveCounterTier<'a> {
    db: &'a Database,
    generation: Generation,
    oldest: Generation,
}

impl<'a> LiveCounterTier<'a> {
    /// Tier writing and reading `generation` only.
    pub fn new(db: &'a Database, generation: Generation) -> Self {
        Self {
            db,
            generation,
            oldest: generation,
        }
    }

    /// Tier writing the active generation and reading every live one.
    pub fn for_state(db: &'a Database, state: &LiveGenerationState) -> Self {
        Self {
            db,
            generation: state.active,
            oldest: state.oldest_live.min(state.active),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Add one start, creating the counter if needed.
    pub fn increment_start(&self, exploration_id: &str) -> Result<()> {
        self.db
            .increment_live_counter(self.generation, exploration_id, LiveCounterField::Starts)
    }

    /// Add one completion, creating the counter if needed.
    pub fn increment_completion(&self, exploration_id: &str) -> Result<()> {
        self.db.increment_live_counter(
            self.generation,
            exploration_id,
            LiveCounterField::Completions,
        )
    }

    /// Counts for one exploration; zero when nothing was recorded.
    pub fn read(&self, exploration_id: &str) -> Result<LiveCounts> {
        self.db
            .get_live_counts(self.oldest, self.generation, exploration_id)
    }

    /// Counts for many explorations, in input order.
    pub fn read_multi(&self, exploration_ids: &[String]) -> Result<Vec<LiveCounts>> {
        self.db
            .get_live_counts_multi(self.oldest, self.generation, exploration_ids)
    }

    /// Replace older generations with the events a finished run left out.
    ///
    /// `self` must be the tier of the run's new active generation.
    pub fn absorb(
        &self,
        computation: &str,
        event_watermark: i64,
        cutoff: &DateTime<Utc>,
    ) -> Result<usize> {
        let (carried, deleted) = self.db.absorb_live_counters(
            computation,
            self.generation,
            event_watermark,
            cutoff,
        )?;
        tracing::debug!(
            computation,
            generation = %self.generation,
            carried,
            deleted,
            "Absorbed older live generations"
        );
        Ok(deleted)
    }
}

/// [`LiveLayer`] of the statistics computation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveCounterLayer;

impl LiveLayer for LiveCounterLayer {
    fn record(&self, db: &Database, generation: Generation, event: &EventRecord) -> Result<()> {
        let tier = LiveCounterTier::new(db, generation);
        match event.kind {
            EventKind::Start => tier.increment_start(&event.exploration_id),
            EventKind::Complete => tier.increment_completion(&event.exploration_id),
            _ => Ok(()),
        }
    }

    fn absorb(&self, db: &Database, handoff: &LiveHandoff) -> Result<usize> {
        LiveCounterTier::new(db, handoff.active).absorb(
            &handoff.computation,
            handoff.event_watermark,
            &handoff.cutoff,
        )
    }
}
