//! Per-key session reconstruction.
//!
//! [`SessionReconstructor`] is the reduce-side accumulator for one
//! `(exploration, version scope)` key. It consumes each shuffled value once
//! and derives first-entry, total-entry and abandonment counts per state.

use super::StatsValue;
use crate::types::{EventKind, ExplorationContent, LegacyStateCounter, StateHitCounts};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Last known position of a session that may have left.
#[derive(Debug, Clone)]
struct LeaveMarker {
    created_on: DateTime<Utc>,
    state_name: Option<String>,
}

/// Totals for one reduce key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedStatistics {
    pub num_starts: i64,
    pub num_completions: i64,
    pub state_hit_counts: BTreeMap<String, StateHitCounts>,
    /// Values with an event kind this reducer does not interpret
    pub ignored_values: usize,
}

/// Accumulator over the values of one reduce key.
#[derive(Debug)]
pub struct SessionReconstructor<'a> {
    init_state_name: &'a str,
    terminal_state_name: &'a str,
    state_hit_counts: BTreeMap<String, StateHitCounts>,
    first_seen_sessions: BTreeMap<String, HashSet<String>>,
    legacy_starts: i64,
    legacy_completions: i64,
    new_starts: i64,
    new_completions: i64,
    completed_sessions: HashSet<String>,
    latest_leave: HashMap<String, LeaveMarker>,
    ignored_values: usize,
}

impl<'a> SessionReconstructor<'a> {
    /// Start with a zeroed bucket for every state of the resolved content.
    pub fn new(content: &'a ExplorationContent, terminal_state_name: &'a str) -> Self {
        let state_hit_counts = content
            .states
            .iter()
            .map(|state| (state.clone(), StateHitCounts::default()))
            .collect();
        let first_seen_sessions = content
            .states
            .iter()
            .map(|state| (state.clone(), HashSet::new()))
            .collect();

        Self {
            init_state_name: &content.init_state_name,
            terminal_state_name,
            state_hit_counts,
            first_seen_sessions,
            legacy_starts: 0,
            legacy_completions: 0,
            new_starts: 0,
            new_completions: 0,
            completed_sessions: HashSet::new(),
            latest_leave: HashMap::new(),
            ignored_values: 0,
        }
    }

    fn bucket(&mut self, state_name: &str) -> &mut StateHitCounts {
        self.state_hit_counts
            .entry(state_name.to_string())
            .or_default()
    }

    pub fn consume(&mut self, value: StatsValue) {
        match value {
            StatsValue::Legacy(counter) => self.consume_legacy(&counter),
            StatsValue::Event(event) => match event.kind {
                EventKind::Start => self.new_starts += 1,
                EventKind::Complete => {
                    self.new_completions += 1;
                    self.completed_sessions.insert(event.session_id);
                }
                EventKind::MaybeLeave => {
                    let marker = LeaveMarker {
                        created_on: event.created_on,
                        state_name: event.state_name,
                    };
                    let is_latest = self
                        .latest_leave
                        .get(&event.session_id)
                        .map_or(true, |existing| marker.created_on > existing.created_on);
                    if is_latest {
                        self.latest_leave.insert(event.session_id, marker);
                    }
                }
                EventKind::StateHit => {
                    if let Some(state_name) = event.state_name {
                        self.bucket(&state_name).total_entry_count += 1;
                        self.first_seen_sessions
                            .entry(state_name)
                            .or_default()
                            .insert(event.session_id);
                    }
                }
                EventKind::AnswerSubmitted | EventKind::Unrecognized(_) => {
                    self.ignored_values += 1;
                }
            },
        }
    }

    fn consume_legacy(&mut self, counter: &LegacyStateCounter) {
        if counter.state_name == self.init_state_name {
            self.legacy_starts = counter.first_entry_count;
        }

        if counter.state_name == self.terminal_state_name {
            self.legacy_completions = counter.first_entry_count;
        } else {
            let bucket = self.bucket(&counter.state_name);
            bucket.no_answer_count += counter.first_entry_count
                + counter.subsequent_entries_count
                - counter.resolved_answer_count
                - counter.active_answer_count;
            bucket.first_entry_count += counter.first_entry_count;
            bucket.total_entry_count +=
                counter.first_entry_count + counter.subsequent_entries_count;
        }
    }

    pub fn finish(mut self) -> ReducedStatistics {
        for (state_name, sessions) in std::mem::take(&mut self.first_seen_sessions) {
            self.bucket(&state_name).first_entry_count += sessions.len() as i64;
        }

        let abandoned: Vec<String> = self
            .latest_leave
            .iter()
            .filter(|(session_id, _)| !self.completed_sessions.contains(*session_id))
            .filter_map(|(_, marker)| marker.state_name.clone())
            .collect();
        for state_name in abandoned {
            self.bucket(&state_name).no_answer_count += 1;
        }

        ReducedStatistics {
            num_starts: self.legacy_starts + self.new_starts,
            num_completions: self.legacy_completions + self.new_completions,
            state_hit_counts: self.state_hit_counts,
            ignored_values: self.ignored_values,
        }
    }
}
