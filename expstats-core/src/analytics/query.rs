//! Read side: canonical snapshots merged with the live tier.
//!
//! The live tier has no version granularity, so its counts are added to the
//! totals of every scope and never attributed to a state.

use super::statistics::STATISTICS;
use crate::db::Database;
use crate::error::Result;
use crate::live::LiveCounterTier;
use crate::types::{CalculationOutput, LiveGenerationState, StateHitCounts, VersionScope};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Statistics of one exploration in one version scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExplorationStatistics {
    pub num_starts: i64,
    pub num_completions: i64,
    pub state_hit_counts: BTreeMap<String, StateHitCounts>,
    /// Cutoff of the batch run that wrote the snapshot; `None` before the first run
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct QueryFacade<'a> {
    db: &'a Database,
    live: LiveCounterTier<'a>,
}

impl<'a> QueryFacade<'a> {
    /// Facade reading the live generations described by `state`.
    pub fn new(db: &'a Database, state: &LiveGenerationState) -> Self {
        Self {
            db,
            live: LiveCounterTier::for_state(db, state),
        }
    }

    /// Facade reading the statistics computation's current live generations.
    pub fn current(db: &'a Database) -> Result<Self> {
        let state = db.get_generation_state(STATISTICS)?;
        Ok(Self::new(db, &state))
    }

    pub fn get_statistics(
        &self,
        exploration_id: &str,
        version_scope: VersionScope,
    ) -> Result<ExplorationStatistics> {
        let mut stats = self
            .db
            .get_canonical_snapshot(exploration_id, version_scope)?
            .map(|snapshot| ExplorationStatistics {
                num_starts: snapshot.num_starts,
                num_completions: snapshot.num_completions,
                state_hit_counts: snapshot.state_hit_counts,
                last_updated: Some(snapshot.last_updated),
            })
            .unwrap_or_default();

        let live = self.live.read(exploration_id)?;
        stats.num_starts += live.num_starts;
        stats.num_completions += live.num_completions;
        Ok(stats)
    }

    /// Start counts under the `all` scope, in input order.
    ///
    /// One batched snapshot read and one batched live read; long id lists
    /// are split into chunks inside each read.
    pub fn get_views_multi(&self, exploration_ids: &[String]) -> Result<Vec<i64>> {
        let snapshots = self
            .db
            .get_canonical_snapshots_multi(exploration_ids, VersionScope::All)?;
        let live = self.live.read_multi(exploration_ids)?;

        Ok(snapshots
            .iter()
            .zip(live.iter())
            .map(|(snapshot, live)| {
                snapshot.as_ref().map_or(0, |s| s.num_starts) + live.num_starts
            })
            .collect())
    }

    /// Stored calculation output; pass `VersionScope::All` for the default scope.
    pub fn get_calculation_output(
        &self,
        exploration_id: &str,
        state_name: &str,
        calculation_id: &str,
        version_scope: VersionScope,
    ) -> Result<Option<CalculationOutput>> {
        self.db
            .get_calculation_output(exploration_id, version_scope, state_name, calculation_id)
    }
}
