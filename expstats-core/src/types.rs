//! Core domain types for expstats
//!
//! These types describe the interaction event log (Layer 1) and the
//! statistics derived from it (Layer 2).
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Exploration** | A versioned interactive document composed of named states |
//! | **Session** | One learner's continuous attempt at an exploration, possibly spanning many states |
//! | **Version scope** | A concrete version, the aggregate over all versions, or the "unspecified" scope for pre-migration data |
//! | **Live tier** | Fast, approximate counters that have not yet been absorbed by a batch run |
//! | **Canonical snapshot** | The fully recomputed statistics record written by a batch run |
//! | **Legacy counter** | Pre-event-log aggregate counter, only valid before the migration cutoff |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================
// Events
// ============================================

/// Kind of interaction event emitted by the player.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A learner opened the exploration
    Start,
    /// A learner may have left (tab closed, navigated away)
    MaybeLeave,
    /// A learner reached a terminal state
    Complete,
    /// A learner entered a state
    StateHit,
    /// A learner submitted an answer to a state's interaction
    AnswerSubmitted,
    /// A kind this build does not know about, kept verbatim
    Unrecognized(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Start => "start",
            EventKind::MaybeLeave => "maybe_leave",
            EventKind::Complete => "complete",
            EventKind::StateHit => "state_hit",
            EventKind::AnswerSubmitted => "answer_submitted",
            EventKind::Unrecognized(kind) => kind,
        }
    }

    /// Parse a stored or inbound kind. Never fails: unknown kinds are kept
    /// as [`EventKind::Unrecognized`].
    pub fn parse(s: &str) -> Self {
        match s {
            "start" => EventKind::Start,
            "maybe_leave" => EventKind::MaybeLeave,
            "complete" => EventKind::Complete,
            "state_hit" => EventKind::StateHit,
            "answer_submitted" => EventKind::AnswerSubmitted,
            other => EventKind::Unrecognized(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EventKind::parse(&raw))
    }
}

/// Answer payload carried by `answer_submitted` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedAnswer {
    /// Interaction type of the state (e.g. "TextInput")
    pub interaction_id: String,
    /// The answer as submitted; shape depends on the interaction
    pub answer: serde_json::Value,
}

/// A single interaction event. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub exploration_id: String,
    /// Exploration version the learner was playing, if known
    #[serde(default)]
    pub version: Option<u32>,
    pub session_id: String,
    /// State the event refers to; absent for some historical hits
    #[serde(default)]
    pub state_name: Option<String>,
    pub created_on: DateTime<Utc>,
    /// Only present on `answer_submitted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SubmittedAnswer>,
}

// ============================================
// Version scope
// ============================================

/// Which slice of an exploration's history a statistic covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VersionScope {
    /// A single concrete version
    Version(u32),
    /// Aggregate over every version
    All,
    /// Events with no recorded version, plus legacy counters
    Unspecified,
}

impl VersionScope {
    pub const ALL: &'static str = "all";
    pub const UNSPECIFIED: &'static str = "none";

    /// Scope for an event's own version field.
    pub fn from_version(version: Option<u32>) -> Self {
        version.map_or(VersionScope::Unspecified, VersionScope::Version)
    }

    /// Storage key fragment ("3", "all", "none").
    pub fn as_key(&self) -> String {
        match self {
            VersionScope::Version(v) => v.to_string(),
            VersionScope::All => Self::ALL.to_string(),
            VersionScope::Unspecified => Self::UNSPECIFIED.to_string(),
        }
    }
}

impl std::fmt::Display for VersionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_key())
    }
}

impl std::str::FromStr for VersionScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::ALL => Ok(VersionScope::All),
            Self::UNSPECIFIED => Ok(VersionScope::Unspecified),
            other => other
                .parse::<u32>()
                .map(VersionScope::Version)
                .map_err(|_| format!("unknown version scope: {}", other)),
        }
    }
}

// ============================================
// Legacy counters
// ============================================

/// Aggregate per-state counter recorded before session-level events existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyStateCounter {
    pub exploration_id: String,
    pub state_name: String,
    /// Times the state was entered for the first time in a session
    pub first_entry_count: i64,
    /// Times the state was re-entered within a session
    pub subsequent_entries_count: i64,
    /// Answers later resolved by an editor
    pub resolved_answer_count: i64,
    /// Answers still unresolved
    pub active_answer_count: i64,
    /// When the counter record was written
    pub created_on: DateTime<Utc>,
}

// ============================================
// Live tier
// ============================================

/// Identifier of a live-counter generation.
///
/// A batch run rotates the active generation when it starts. When the run
/// finishes, counters of the older generations are replaced by whatever the
/// run left out (events dated at or after its cutoff).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Generation(pub i64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live-tier bookkeeping of one computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveGenerationState {
    /// Generation receiving new increments
    pub active: Generation,
    /// Oldest generation readers still count
    pub oldest_live: Generation,
    /// Last event-log id that existed when `active` was opened.
    ///
    /// Events up to this id belong to the batch run that opened `active`.
    pub opened_after_event: i64,
}

impl LiveGenerationState {
    /// Whether the live layer should count the logged event `event_id`.
    pub fn owns_event(&self, event_id: i64) -> bool {
        event_id > self.opened_after_event
    }
}

/// Start/completion counts for one exploration in one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveCounterSnapshot {
    pub exploration_id: String,
    pub generation: Generation,
    pub num_starts: i64,
    pub num_completions: i64,
}

/// Counts as read from the live tier; zero when no counter exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveCounts {
    pub num_starts: i64,
    pub num_completions: i64,
}

impl From<&LiveCounterSnapshot> for LiveCounts {
    fn from(snapshot: &LiveCounterSnapshot) -> Self {
        Self {
            num_starts: snapshot.num_starts,
            num_completions: snapshot.num_completions,
        }
    }
}

// ============================================
// Canonical snapshots
// ============================================

/// Per-state visit and drop-off counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHitCounts {
    /// Distinct sessions that reached the state
    pub first_entry_count: i64,
    /// Every recorded entry into the state
    pub total_entry_count: i64,
    /// Entries that ended without an answer (abandonment)
    pub no_answer_count: i64,
}

/// Authoritative statistics for one (exploration, version scope) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSnapshot {
    pub exploration_id: String,
    #[serde(with = "scope_serde")]
    pub version_scope: VersionScope,
    pub num_starts: i64,
    pub num_completions: i64,
    pub state_hit_counts: BTreeMap<String, StateHitCounts>,
    /// Cutoff of the batch run that produced this snapshot
    pub last_updated: DateTime<Utc>,
}

// ============================================
// Answers
// ============================================

/// One row of the durable answer log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateAnswersRecord {
    pub exploration_id: String,
    pub version: u32,
    pub state_name: String,
    pub interaction_id: String,
    pub submitted_answer_list: Vec<serde_json::Value>,
    pub created_on: DateTime<Utc>,
}

/// All answers for one (exploration, version scope, state) key.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerBatch {
    pub exploration_id: String,
    pub version_scope: VersionScope,
    pub state_name: String,
    pub interaction_id: String,
    pub submitted_answer_list: Vec<serde_json::Value>,
}

/// Output of one calculation over one [`AnswerBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationOutput {
    pub exploration_id: String,
    #[serde(with = "scope_serde")]
    pub version_scope: VersionScope,
    pub state_name: String,
    pub calculation_id: String,
    pub output: serde_json::Value,
}

// ============================================
// Exploration content
// ============================================

/// The parts of an exploration version the aggregator needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorationContent {
    pub exploration_id: String,
    pub version: u32,
    pub states: BTreeSet<String>,
    pub init_state_name: String,
    /// Commit time of this version
    pub last_updated: DateTime<Utc>,
}

mod scope_serde {
    use super::VersionScope;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(scope: &VersionScope, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&scope.as_key())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<VersionScope, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
