//! Exploration content lookup
//!
//! The aggregator only needs a narrow view of exploration content: the state
//! names, the initial state, and when each version was committed. Content
//! authoring lives elsewhere; [`ExplorationSource`] is the seam.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::ExplorationContent;

/// Read access to versioned exploration content.
pub trait ExplorationSource: Send + Sync {
    /// Resolve a specific version, or the latest one when `version` is `None`.
    ///
    /// Fails with [`Error::NotFound`] if the exploration or version does not exist.
    fn resolve(&self, exploration_id: &str, version: Option<u32>) -> Result<ExplorationContent>;

    /// Resolve an exact version.
    fn resolve_at_version(&self, exploration_id: &str, version: u32) -> Result<ExplorationContent> {
        self.resolve(exploration_id, Some(version))
    }
}

impl ExplorationSource for Database {
    fn resolve(&self, exploration_id: &str, version: Option<u32>) -> Result<ExplorationContent> {
        let found = match version {
            Some(v) => self.get_exploration_version(exploration_id, v)?,
            None => self.get_latest_exploration_version(exploration_id)?,
        };

        found.ok_or_else(|| {
            Error::NotFound(match version {
                Some(v) => format!("exploration {} version {}", exploration_id, v),
                None => format!("exploration {}", exploration_id),
            })
        })
    }
}
