//! Database repository layer
//!
//! Provides query and insert operations for all entity types.

use crate::analytics::{BatchRunResult, BatchRunStatus};
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Which live counter an increment applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveCounterField {
    Starts,
    Completions,
}

impl LiveCounterField {
    fn column(&self) -> &'static str {
        match self {
            LiveCounterField::Starts => "num_starts",
            LiveCounterField::Completions => "num_completions",
        }
    }
}

/// Format a timestamp for storage.
///
/// Always microsecond precision with a `Z` suffix so stored values compare
/// lexically in range filters.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_scope(idx: usize, raw: &str) -> rusqlite::Result<VersionScope> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// Ids bound per `IN (...)` list; larger requests are split into chunks.
const MAX_IN_PARAMS: usize = 500;

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        super::schema::run_migrations(&conn)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Event log
    // ============================================

    /// Append an event to the durable event log
    pub fn append_event(&self, event: &EventRecord) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO events (kind, exploration_id, version, session_id, state_name, created_on)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.kind.as_str(),
                event.exploration_id,
                event.version,
                event.session_id,
                event.state_name,
                format_ts(&event.created_on),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Stream every event created strictly before `cutoff` and logged at or
    /// below `event_watermark`, in insertion order.
    ///
    /// Returns the number of events visited.
    pub fn for_each_event_before<F>(
        &self,
        cutoff: &DateTime<Utc>,
        event_watermark: i64,
        mut f: F,
    ) -> Result<usize>
    where
        F: FnMut(EventRecord),
    {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT kind, exploration_id, version, session_id, state_name, created_on
            FROM events
            WHERE created_on < ?1 AND id <= ?2
            ORDER BY id
            "#,
        )?;

        let mut rows = stmt.query(params![format_ts(cutoff), event_watermark])?;
        let mut visited = 0;
        while let Some(row) = rows.next()? {
            f(Self::row_to_event(row)?);
            visited += 1;
        }
        Ok(visited)
    }

    /// Count all logged events
    pub fn count_events(&self) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<EventRecord> {
        let kind: String = row.get(0)?;
        let created_on: String = row.get(5)?;
        Ok(EventRecord {
            kind: EventKind::parse(&kind),
            exploration_id: row.get(1)?,
            version: row.get(2)?,
            session_id: row.get(3)?,
            state_name: row.get(4)?,
            created_on: parse_ts(5, &created_on)?,
            answer: None,
        })
    }

    // ============================================
    // Legacy counters
    // ============================================

    /// Insert or replace a legacy per-state counter
    pub fn upsert_legacy_counter(&self, counter: &LegacyStateCounter) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO legacy_state_counters (exploration_id, state_name, first_entry_count,
                                               subsequent_entries_count, resolved_answer_count,
                                               active_answer_count, created_on)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(exploration_id, state_name) DO UPDATE SET
                first_entry_count = excluded.first_entry_count,
                subsequent_entries_count = excluded.subsequent_entries_count,
                resolved_answer_count = excluded.resolved_answer_count,
                active_answer_count = excluded.active_answer_count,
                created_on = excluded.created_on
            "#,
            params![
                counter.exploration_id,
                counter.state_name,
                counter.first_entry_count,
                counter.subsequent_entries_count,
                counter.resolved_answer_count,
                counter.active_answer_count,
                format_ts(&counter.created_on),
            ],
        )?;
        Ok(())
    }

    /// Stream every legacy counter created strictly before `cutoff`
    pub fn for_each_legacy_counter_before<F>(
        &self,
        cutoff: &DateTime<Utc>,
        mut f: F,
    ) -> Result<usize>
    where
        F: FnMut(LegacyStateCounter),
    {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT exploration_id, state_name, first_entry_count, subsequent_entries_count,
                   resolved_answer_count, active_answer_count, created_on
            FROM legacy_state_counters
            WHERE created_on < ?1
            ORDER BY exploration_id, state_name
            "#,
        )?;

        let mut rows = stmt.query([format_ts(cutoff)])?;
        let mut visited = 0;
        while let Some(row) = rows.next()? {
            let created_on: String = row.get(6)?;
            f(LegacyStateCounter {
                exploration_id: row.get(0)?,
                state_name: row.get(1)?,
                first_entry_count: row.get(2)?,
                subsequent_entries_count: row.get(3)?,
                resolved_answer_count: row.get(4)?,
                active_answer_count: row.get(5)?,
                created_on: parse_ts(6, &created_on)?,
            });
            visited += 1;
        }
        Ok(visited)
    }

    // ============================================
    // Answer log
    // ============================================

    /// Append submitted answers for a state
    pub fn append_state_answers(&self, record: &StateAnswersRecord) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO state_answers (exploration_id, version, state_name, interaction_id,
                                       submitted_answer_list, created_on)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.exploration_id,
                record.version,
                record.state_name,
                record.interaction_id,
                serde_json::to_string(&record.submitted_answer_list)?,
                format_ts(&record.created_on),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Stream every answer record created strictly before `cutoff`
    pub fn for_each_state_answers_before<F>(
        &self,
        cutoff: &DateTime<Utc>,
        mut f: F,
    ) -> Result<usize>
    where
        F: FnMut(StateAnswersRecord),
    {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT exploration_id, version, state_name, interaction_id,
                   submitted_answer_list, created_on
            FROM state_answers
            WHERE created_on < ?1
            ORDER BY id
            "#,
        )?;

        let mut rows = stmt.query([format_ts(cutoff)])?;
        let mut visited = 0;
        while let Some(row) = rows.next()? {
            let answers: String = row.get(4)?;
            let created_on: String = row.get(5)?;
            f(StateAnswersRecord {
                exploration_id: row.get(0)?,
                version: row.get(1)?,
                state_name: row.get(2)?,
                interaction_id: row.get(3)?,
                submitted_answer_list: parse_json(4, &answers)?,
                created_on: parse_ts(5, &created_on)?,
            });
            visited += 1;
        }
        Ok(visited)
    }

    // ============================================
    // Exploration content
    // ============================================

    /// Store one committed version of an exploration
    pub fn put_exploration_version(&self, content: &ExplorationContent) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO exploration_versions (exploration_id, version, init_state_name, states, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(exploration_id, version) DO UPDATE SET
                init_state_name = excluded.init_state_name,
                states = excluded.states,
                last_updated = excluded.last_updated
            "#,
            params![
                content.exploration_id,
                content.version,
                content.init_state_name,
                serde_json::to_string(&content.states)?,
                format_ts(&content.last_updated),
            ],
        )?;
        Ok(())
    }

    /// Get a specific version of an exploration
    pub fn get_exploration_version(
        &self,
        exploration_id: &str,
        version: u32,
    ) -> Result<Option<ExplorationContent>> {
        let conn = self.lock();
        conn.query_row(
            r#"
            SELECT exploration_id, version, init_state_name, states, last_updated
            FROM exploration_versions
            WHERE exploration_id = ?1 AND version = ?2
            "#,
            params![exploration_id, version],
            Self::row_to_exploration,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get the highest committed version of an exploration
    pub fn get_latest_exploration_version(
        &self,
        exploration_id: &str,
    ) -> Result<Option<ExplorationContent>> {
        let conn = self.lock();
        conn.query_row(
            r#"
            SELECT exploration_id, version, init_state_name, states, last_updated
            FROM exploration_versions
            WHERE exploration_id = ?1
            ORDER BY version DESC
            LIMIT 1
            "#,
            [exploration_id],
            Self::row_to_exploration,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_exploration(row: &Row) -> rusqlite::Result<ExplorationContent> {
        let states: String = row.get(3)?;
        let last_updated: String = row.get(4)?;
        Ok(ExplorationContent {
            exploration_id: row.get(0)?,
            version: row.get(1)?,
            init_state_name: row.get(2)?,
            states: parse_json::<BTreeSet<String>>(3, &states)?,
            last_updated: parse_ts(4, &last_updated)?,
        })
    }

    // ============================================
    // Live counters
    // ============================================

    /// Atomically create-or-increment a live counter.
    ///
    /// The read and the write happen inside one IMMEDIATE transaction, so
    /// concurrent writers (threads or processes) cannot lose updates.
    pub fn increment_live_counter(
        &self,
        generation: Generation,
        exploration_id: &str,
        field: LiveCounterField,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT {} FROM live_counters WHERE generation = ?1 AND exploration_id = ?2",
                    field.column()
                ),
                params![generation.0, exploration_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO live_counters (generation, exploration_id, {}) VALUES (?1, ?2, 1)",
                        field.column()
                    ),
                    params![generation.0, exploration_id],
                )?;
            }
            Some(count) => {
                tx.execute(
                    &format!(
                        "UPDATE live_counters SET {} = ?3 WHERE generation = ?1 AND exploration_id = ?2",
                        field.column()
                    ),
                    params![generation.0, exploration_id, count + 1],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get the live counter for one exploration in one generation
    pub fn get_live_counter(
        &self,
        generation: Generation,
        exploration_id: &str,
    ) -> Result<Option<LiveCounterSnapshot>> {
        let conn = self.lock();
        conn.query_row(
            r#"
            SELECT generation, exploration_id, num_starts, num_completions
            FROM live_counters
            WHERE generation = ?1 AND exploration_id = ?2
            "#,
            params![generation.0, exploration_id],
            Self::row_to_live_counter,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Counts of one exploration summed over generations `oldest..=newest`
    pub fn get_live_counts(
        &self,
        oldest: Generation,
        newest: Generation,
        exploration_id: &str,
    ) -> Result<LiveCounts> {
        let conn = self.lock();
        let counts = conn.query_row(
            r#"
            SELECT COALESCE(SUM(num_starts), 0), COALESCE(SUM(num_completions), 0)
            FROM live_counters
            WHERE generation BETWEEN ?1 AND ?2 AND exploration_id = ?3
            "#,
            params![oldest.0, newest.0, exploration_id],
            |row| {
                Ok(LiveCounts {
                    num_starts: row.get(0)?,
                    num_completions: row.get(1)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// Counts for many explorations summed over generations `oldest..=newest`.
    ///
    /// The result is positional: entry `i` belongs to `exploration_ids[i]`,
    /// zero when nothing was counted.
    pub fn get_live_counts_multi(
        &self,
        oldest: Generation,
        newest: Generation,
        exploration_ids: &[String],
    ) -> Result<Vec<LiveCounts>> {
        let conn = self.lock();
        let mut found: HashMap<String, LiveCounts> = HashMap::new();

        for chunk in exploration_ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                r#"
                SELECT exploration_id, SUM(num_starts), SUM(num_completions)
                FROM live_counters
                WHERE generation BETWEEN ? AND ? AND exploration_id IN ({})
                GROUP BY exploration_id
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;

            let mut args: Vec<rusqlite::types::Value> = vec![oldest.0.into(), newest.0.into()];
            args.extend(chunk.iter().map(|id| id.clone().into()));

            let rows = stmt.query_map(params_from_iter(args), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    LiveCounts {
                        num_starts: row.get(1)?,
                        num_completions: row.get(2)?,
                    },
                ))
            })?;
            for row in rows {
                let (id, counts) = row?;
                found.insert(id, counts);
            }
        }

        Ok(exploration_ids
            .iter()
            .map(|id| found.get(id).copied().unwrap_or_default())
            .collect())
    }

    /// Hand what a finished batch run left out to the `active` generation.
    ///
    /// In one IMMEDIATE transaction: starts and completions logged up to
    /// `event_watermark` but dated at or after `cutoff` are added to
    /// `active`, every older generation is deleted, and readers of
    /// `computation` stop counting them.
    ///
    /// Returns `(carried, deleted)`: counter rows written to `active` and
    /// counter rows removed.
    pub fn absorb_live_counters(
        &self,
        computation: &str,
        active: Generation,
        event_watermark: i64,
        cutoff: &DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let carried = tx.execute(
            r#"
            INSERT INTO live_counters (generation, exploration_id, num_starts, num_completions)
            SELECT ?1, exploration_id, SUM(kind = ?4), SUM(kind = ?5)
            FROM events
            WHERE id <= ?2 AND created_on >= ?3 AND kind IN (?4, ?5)
            GROUP BY exploration_id
            ON CONFLICT(generation, exploration_id) DO UPDATE SET
                num_starts = num_starts + excluded.num_starts,
                num_completions = num_completions + excluded.num_completions
            "#,
            params![
                active.0,
                event_watermark,
                format_ts(cutoff),
                EventKind::Start.as_str(),
                EventKind::Complete.as_str(),
            ],
        )?;

        let deleted = tx.execute(
            "DELETE FROM live_counters WHERE generation < ?1",
            [active.0],
        )?;

        tx.execute(
            "UPDATE computation_state SET oldest_live_generation = ?2 WHERE name = ?1",
            params![computation, active.0],
        )?;

        tx.commit()?;
        Ok((carried, deleted))
    }

    fn row_to_live_counter(row: &Row) -> rusqlite::Result<LiveCounterSnapshot> {
        Ok(LiveCounterSnapshot {
            generation: Generation(row.get(0)?),
            exploration_id: row.get(1)?,
            num_starts: row.get(2)?,
            num_completions: row.get(3)?,
        })
    }

    // ============================================
    // Computation state (active generation)
    // ============================================

    /// Live-tier bookkeeping of a computation (all zero if never rotated)
    pub fn get_generation_state(&self, computation: &str) -> Result<LiveGenerationState> {
        let conn = self.lock();
        let state = conn
            .query_row(
                r#"
                SELECT active_generation, oldest_live_generation, opened_after_event
                FROM computation_state
                WHERE name = ?1
                "#,
                [computation],
                |row| {
                    Ok(LiveGenerationState {
                        active: Generation(row.get(0)?),
                        oldest_live: Generation(row.get(1)?),
                        opened_after_event: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    /// Switch a computation to a fresh generation for a batch run.
    ///
    /// Returns the generation the run absorbs and the new state. The new
    /// generation opens after the last logged event: every event logged so
    /// far belongs to this run.
    pub fn rotate_generation(
        &self,
        computation: &str,
        cutoff: &DateTime<Utc>,
    ) -> Result<(Generation, LiveGenerationState)> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(i64, i64)> = tx
            .query_row(
                r#"
                SELECT active_generation, oldest_live_generation
                FROM computation_state
                WHERE name = ?1
                "#,
                [computation],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (absorbed, oldest_live) = current
            .map(|(active, oldest)| (Generation(active), Generation(oldest)))
            .unwrap_or_default();

        let watermark: i64 =
            tx.query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |row| {
                row.get(0)
            })?;

        let state = LiveGenerationState {
            active: absorbed.next(),
            oldest_live,
            opened_after_event: watermark,
        };

        tx.execute(
            r#"
            INSERT INTO computation_state (name, active_generation, oldest_live_generation,
                                           opened_after_event, last_cutoff)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name) DO UPDATE SET
                active_generation = excluded.active_generation,
                opened_after_event = excluded.opened_after_event,
                last_cutoff = excluded.last_cutoff
            "#,
            params![
                computation,
                state.active.0,
                state.oldest_live.0,
                state.opened_after_event,
                format_ts(cutoff)
            ],
        )?;

        tx.commit()?;
        Ok((absorbed, state))
    }

    // ============================================
    // Canonical snapshots
    // ============================================

    /// Write a snapshot, fully replacing any previous one for the same key
    pub fn put_canonical_snapshot(&self, snapshot: &CanonicalSnapshot) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO canonical_snapshots (exploration_id, version_scope, num_starts,
                                                       num_completions, state_hit_counts, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                snapshot.exploration_id,
                snapshot.version_scope.as_key(),
                snapshot.num_starts,
                snapshot.num_completions,
                serde_json::to_string(&snapshot.state_hit_counts)?,
                format_ts(&snapshot.last_updated),
            ],
        )?;
        Ok(())
    }

    /// Get the snapshot for one key
    pub fn get_canonical_snapshot(
        &self,
        exploration_id: &str,
        version_scope: VersionScope,
    ) -> Result<Option<CanonicalSnapshot>> {
        let conn = self.lock();
        conn.query_row(
            r#"
            SELECT exploration_id, version_scope, num_starts, num_completions,
                   state_hit_counts, last_updated
            FROM canonical_snapshots
            WHERE exploration_id = ?1 AND version_scope = ?2
            "#,
            params![exploration_id, version_scope.as_key()],
            Self::row_to_snapshot,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get snapshots for many explorations under one scope.
    ///
    /// The result is positional: entry `i` belongs to `exploration_ids[i]`.
    pub fn get_canonical_snapshots_multi(
        &self,
        exploration_ids: &[String],
        version_scope: VersionScope,
    ) -> Result<Vec<Option<CanonicalSnapshot>>> {
        let conn = self.lock();
        let mut found: HashMap<String, CanonicalSnapshot> = HashMap::new();

        for chunk in exploration_ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                r#"
                SELECT exploration_id, version_scope, num_starts, num_completions,
                       state_hit_counts, last_updated
                FROM canonical_snapshots
                WHERE version_scope = ? AND exploration_id IN ({})
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;

            let mut args: Vec<rusqlite::types::Value> = vec![version_scope.as_key().into()];
            args.extend(chunk.iter().map(|id| id.clone().into()));

            for snapshot in stmt.query_map(params_from_iter(args), Self::row_to_snapshot)? {
                let snapshot = snapshot?;
                found.insert(snapshot.exploration_id.clone(), snapshot);
            }
        }

        Ok(exploration_ids
            .iter()
            .map(|id| found.get(id).cloned())
            .collect())
    }

    /// Count stored snapshots
    pub fn count_canonical_snapshots(&self) -> Result<i64> {
        let conn = self.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM canonical_snapshots", [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    fn row_to_snapshot(row: &Row) -> rusqlite::Result<CanonicalSnapshot> {
        let scope: String = row.get(1)?;
        let counts: String = row.get(4)?;
        let last_updated: String = row.get(5)?;
        Ok(CanonicalSnapshot {
            exploration_id: row.get(0)?,
            version_scope: parse_scope(1, &scope)?,
            num_starts: row.get(2)?,
            num_completions: row.get(3)?,
            state_hit_counts: parse_json::<BTreeMap<String, StateHitCounts>>(4, &counts)?,
            last_updated: parse_ts(5, &last_updated)?,
        })
    }

    // ============================================
    // Calculation outputs
    // ============================================

    /// Insert or replace a calculation output
    pub fn put_calculation_output(&self, output: &CalculationOutput) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO calculation_outputs (exploration_id, version_scope, state_name,
                                             calculation_id, output, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(exploration_id, version_scope, state_name, calculation_id) DO UPDATE SET
                output = excluded.output,
                computed_at = excluded.computed_at
            "#,
            params![
                output.exploration_id,
                output.version_scope.as_key(),
                output.state_name,
                output.calculation_id,
                serde_json::to_string(&output.output)?,
                format_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Get a calculation output, if one was computed
    pub fn get_calculation_output(
        &self,
        exploration_id: &str,
        version_scope: VersionScope,
        state_name: &str,
        calculation_id: &str,
    ) -> Result<Option<CalculationOutput>> {
        let conn = self.lock();
        conn.query_row(
            r#"
            SELECT exploration_id, version_scope, state_name, calculation_id, output
            FROM calculation_outputs
            WHERE exploration_id = ?1 AND version_scope = ?2
              AND state_name = ?3 AND calculation_id = ?4
            "#,
            params![
                exploration_id,
                version_scope.as_key(),
                state_name,
                calculation_id
            ],
            |row| {
                let scope: String = row.get(1)?;
                let output: String = row.get(4)?;
                Ok(CalculationOutput {
                    exploration_id: row.get(0)?,
                    version_scope: parse_scope(1, &scope)?,
                    state_name: row.get(2)?,
                    calculation_id: row.get(3)?,
                    output: parse_json(4, &output)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // ============================================
    // Batch runs
    // ============================================

    /// Insert a batch run record for observability.
    ///
    /// Returns the ID of the inserted record.
    pub fn insert_batch_run(&self, run: &BatchRunResult) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO batch_runs (job_name, started_at, cutoff, duration_ms, status, error_message,
                                    input_count, keys_written, keys_skipped, keys_failed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                run.job_name,
                format_ts(&run.started_at),
                format_ts(&run.cutoff),
                run.duration_ms,
                run.status.as_str(),
                run.error_message,
                run.input_count as i64,
                run.keys_written as i64,
                run.keys_skipped as i64,
                run.keys_failed as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get recent batch runs for a job, newest first
    pub fn get_batch_runs(&self, job_name: &str, limit: usize) -> Result<Vec<BatchRunResult>> {
        let conn = self.lock();

        let mut stmt = conn.prepare(
            r#"
            SELECT job_name, started_at, cutoff, duration_ms, status, error_message,
                   input_count, keys_written, keys_skipped, keys_failed
            FROM batch_runs
            WHERE job_name = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let runs = stmt
            .query_map(params![job_name, limit as i64], |row| {
                let started_at: String = row.get(1)?;
                let cutoff: String = row.get(2)?;
                let status: String = row.get(4)?;
                Ok(BatchRunResult {
                    job_name: row.get(0)?,
                    started_at: parse_ts(1, &started_at)?,
                    cutoff: parse_ts(2, &cutoff)?,
                    duration_ms: row.get(3)?,
                    status: BatchRunStatus::from_storage(&status),
                    error_message: row.get(5)?,
                    input_count: row.get::<_, i64>(6)? as usize,
                    keys_written: row.get::<_, i64>(7)? as usize,
                    keys_skipped: row.get::<_, i64>(8)? as usize,
                    keys_failed: row.get::<_, i64>(9)? as usize,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(runs)
    }
}
