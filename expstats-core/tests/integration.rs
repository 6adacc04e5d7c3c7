//! End-to-end tests for ingestion, batch recomputation and queries
//!
//! Each test records events through the router, runs the batch computations
//! against a file-backed database and reads the results back through the
//! query facade.

use chrono::{DateTime, Duration, TimeZone, Utc};
use expstats_core::analytics::{
    BatchContext, BatchJob, BatchJobReport, ANSWER_SUMMARIES, STATISTICS,
};
use expstats_core::live::LiveCounterLayer;
use expstats_core::{
    create_default_engine, BatchRunStatus, ComputationEngine, Config, ContinuousComputation, Database,
    EventIngestionRouter, EventKind, EventRecord, ExplorationContent, LegacyStateCounter,
    QueryFacade, SubmittedAnswer, VersionScope,
};
use serde_json::json;
use std::collections::BTreeSet;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    db: Database,
    engine: ComputationEngine,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("stats.db")).unwrap();
        db.migrate().unwrap();
        Self {
            _dir: dir,
            db,
            engine: create_default_engine(&Config::default()),
        }
    }

    fn router(&self) -> EventIngestionRouter<'_> {
        EventIngestionRouter::new(&self.db, &self.engine)
    }

    fn facade(&self) -> QueryFacade<'_> {
        QueryFacade::current(&self.db).unwrap()
    }

    fn put_content(&self, exploration_id: &str, version: u32, committed: DateTime<Utc>) {
        let states: BTreeSet<String> = ["Intro", "Question", "Outro"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.db
            .put_exploration_version(&ExplorationContent {
                exploration_id: exploration_id.to_string(),
                version,
                states,
                init_state_name: "Intro".to_string(),
                last_updated: committed,
            })
            .unwrap();
    }

    fn record(&self, event: EventRecord) {
        self.router().record(&event).unwrap();
    }

    fn run(&self, name: &str, cutoff: DateTime<Utc>) {
        let result = self
            .engine
            .run_batch(name, &self.db, &self.db, cutoff)
            .unwrap();
        assert_eq!(result.status, BatchRunStatus::Success, "{:?}", result);
    }
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    base() + Duration::minutes(minutes)
}

fn event(
    kind: EventKind,
    exploration_id: &str,
    version: Option<u32>,
    session: &str,
    state: Option<&str>,
    minutes: i64,
) -> EventRecord {
    EventRecord {
        kind,
        exploration_id: exploration_id.to_string(),
        version,
        session_id: session.to_string(),
        state_name: state.map(str::to_string),
        created_on: at(minutes),
        answer: None,
    }
}

// ============================================
// Start / completion totals
// ============================================

#[test]
fn test_batch_counts_starts_and_completions_per_version() {
    let h = Harness::new();
    h.put_content("exp1", 1, base() - Duration::days(30));

    for i in 0..7 {
        h.record(event(EventKind::Start, "exp1", Some(1), &format!("s{i}"), Some("Intro"), i));
    }
    for i in 0..3 {
        h.record(event(EventKind::Complete, "exp1", Some(1), &format!("s{i}"), Some("Outro"), 10 + i));
    }

    h.run(STATISTICS, at(60));

    let facade = h.facade();
    let v1 = facade.get_statistics("exp1", VersionScope::Version(1)).unwrap();
    assert_eq!(v1.num_starts, 7);
    assert_eq!(v1.num_completions, 3);
    assert_eq!(v1.last_updated, Some(at(60)));

    let all = facade.get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(all.num_starts, 7);
    assert_eq!(all.num_completions, 3);
}

#[test]
fn test_live_tier_bridges_until_next_batch() {
    let h = Harness::new();
    h.put_content("exp1", 1, base() - Duration::days(30));

    h.record(event(EventKind::Start, "exp1", Some(1), "s1", Some("Intro"), 0));
    h.record(event(EventKind::Start, "exp1", Some(1), "s2", Some("Intro"), 1));

    // Before any batch run only the live tier knows about the starts.
    let before = h.facade().get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(before.num_starts, 2);
    assert!(before.last_updated.is_none());

    h.run(STATISTICS, at(5));

    // The absorbed generation is gone; the snapshot carries the count alone.
    let after = h.facade().get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(after.num_starts, 2);

    h.record(event(EventKind::Start, "exp1", Some(1), "s3", Some("Intro"), 10));
    let live = h.facade().get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(live.num_starts, 3);
}

// ============================================
// Session reconstruction
// ============================================

#[test]
fn test_state_hits_count_sessions_and_abandonment() {
    let h = Harness::new();
    h.put_content("exp1", 2, base() - Duration::days(1));

    // s1 visits Question twice and leaves there.
    h.record(event(EventKind::StateHit, "exp1", Some(2), "s1", Some("Question"), 0));
    h.record(event(EventKind::StateHit, "exp1", Some(2), "s1", Some("Question"), 1));
    h.record(event(EventKind::MaybeLeave, "exp1", Some(2), "s1", Some("Question"), 2));

    // s2 leaves at Question, comes back and completes.
    h.record(event(EventKind::StateHit, "exp1", Some(2), "s2", Some("Question"), 3));
    h.record(event(EventKind::MaybeLeave, "exp1", Some(2), "s2", Some("Question"), 4));
    h.record(event(EventKind::Complete, "exp1", Some(2), "s2", Some("Outro"), 5));

    // s3 leaves at Intro first, later at Question.
    h.record(event(EventKind::MaybeLeave, "exp1", Some(2), "s3", Some("Intro"), 6));
    h.record(event(EventKind::StateHit, "exp1", Some(2), "s3", Some("Question"), 7));
    h.record(event(EventKind::MaybeLeave, "exp1", Some(2), "s3", Some("Question"), 8));

    h.run(STATISTICS, at(30));

    let stats = h
        .facade()
        .get_statistics("exp1", VersionScope::Version(2))
        .unwrap();
    let question = stats.state_hit_counts["Question"];
    assert_eq!(question.total_entry_count, 4);
    assert_eq!(question.first_entry_count, 3);
    assert_eq!(question.no_answer_count, 2);
    assert_eq!(stats.state_hit_counts["Intro"].no_answer_count, 0);
    assert_eq!(stats.state_hit_counts["Outro"].first_entry_count, 0);
}

#[test]
fn test_events_after_cutoff_stay_live_until_absorbed() {
    let h = Harness::new();
    h.put_content("exp1", 1, base() - Duration::days(1));

    h.record(event(EventKind::Start, "exp1", Some(1), "s1", Some("Intro"), 0));
    h.record(event(EventKind::Start, "exp1", Some(1), "s2", Some("Intro"), 20));
    h.record(event(EventKind::Complete, "exp1", Some(1), "s2", Some("Outro"), 25));

    h.run(STATISTICS, at(10));
    let snapshot = h
        .db
        .get_canonical_snapshot("exp1", VersionScope::All)
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.num_starts, 1);
    assert_eq!(snapshot.num_completions, 0);

    // The run left the later start and completion to the live tier.
    let stats = h.facade().get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(stats.num_starts, 2);
    assert_eq!(stats.num_completions, 1);

    h.run(STATISTICS, at(30));
    let stats = h.facade().get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(stats.num_starts, 2);
    assert_eq!(stats.num_completions, 1);
}

#[test]
fn test_cutoff_earlier_than_previous_run_loses_nothing() {
    let h = Harness::new();
    h.put_content("exp1", 1, base() - Duration::days(1));

    for i in 0..4 {
        h.record(event(EventKind::Start, "exp1", Some(1), &format!("s{i}"), Some("Intro"), i * 10));
    }
    h.run(STATISTICS, at(100));
    h.record(event(EventKind::Start, "exp1", Some(1), "s9", Some("Intro"), 110));

    // Rerun with a cutoff in the past of both the previous run and the new event.
    h.run(STATISTICS, at(15));
    let snapshot = h
        .db
        .get_canonical_snapshot("exp1", VersionScope::All)
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.num_starts, 2);

    let stats = h.facade().get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(stats.num_starts, 5);
    assert_eq!(h.facade().get_views_multi(&["exp1".to_string()]).unwrap(), vec![5]);
}

struct FailingJob;

impl BatchJob for FailingJob {
    fn run(&self, _ctx: &BatchContext) -> expstats_core::Result<BatchJobReport> {
        Err(expstats_core::Error::Config("content store offline".to_string()))
    }
}

#[test]
fn test_failed_run_keeps_totals_unchanged() {
    let h = Harness::new();
    h.put_content("exp1", 1, base() - Duration::days(1));

    let mut failing = ComputationEngine::new();
    failing.register(ContinuousComputation::new(
        STATISTICS,
        vec![EventKind::Start, EventKind::Complete],
        Some(Box::new(LiveCounterLayer)),
        Box::new(FailingJob),
    ));

    h.record(event(EventKind::Start, "exp1", Some(1), "s1", Some("Intro"), 0));
    h.record(event(EventKind::Start, "exp1", Some(1), "s2", Some("Intro"), 1));
    let before = h.facade().get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(before.num_starts, 2);

    let result = failing
        .run_batch(STATISTICS, &h.db, &h.db, at(10))
        .unwrap();
    assert_eq!(result.status, BatchRunStatus::Error);
    assert_eq!(
        h.facade().get_statistics("exp1", VersionScope::All).unwrap(),
        before
    );

    // Recorded while the failed run's generation is still live.
    h.record(event(EventKind::Start, "exp1", Some(1), "s3", Some("Intro"), 12));
    assert_eq!(
        h.facade()
            .get_statistics("exp1", VersionScope::All)
            .unwrap()
            .num_starts,
        3
    );

    // A later successful run reconciles everything exactly once.
    h.run(STATISTICS, at(11));
    let stats = h.facade().get_statistics("exp1", VersionScope::All).unwrap();
    assert_eq!(stats.num_starts, 3);
    assert_eq!(
        h.db.get_canonical_snapshot("exp1", VersionScope::All)
            .unwrap()
            .unwrap()
            .num_starts,
        2
    );
}

// ============================================
// Legacy counters
// ============================================

fn legacy(state: &str, first: i64, subsequent: i64) -> LegacyStateCounter {
    LegacyStateCounter {
        exploration_id: "old".to_string(),
        state_name: state.to_string(),
        first_entry_count: first,
        subsequent_entries_count: subsequent,
        resolved_answer_count: 0,
        active_answer_count: 0,
        created_on: Utc.with_ymd_and_hms(2014, 3, 1, 0, 0, 0).unwrap(),
    }
}

#[test]
fn test_legacy_counters_merge_into_unspecified_and_all() {
    let h = Harness::new();
    h.put_content("old", 1, Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap());
    h.put_content("old", 2, Utc.with_ymd_and_hms(2014, 9, 1, 0, 0, 0).unwrap());
    h.put_content("old", 3, Utc.with_ymd_and_hms(2015, 2, 1, 0, 0, 0).unwrap());

    h.db.upsert_legacy_counter(&legacy("Intro", 40, 5)).unwrap();
    h.db.upsert_legacy_counter(&legacy("Question", 30, 10)).unwrap();
    h.db.upsert_legacy_counter(&legacy("END", 25, 0)).unwrap();

    // New events for the same exploration add on top without double counting.
    h.record(event(EventKind::Start, "old", Some(3), "n1", Some("Intro"), 0));
    h.record(event(EventKind::Complete, "old", Some(3), "n1", Some("Outro"), 1));

    h.run(STATISTICS, at(10));
    let facade = h.facade();

    let unspecified = facade
        .get_statistics("old", VersionScope::Unspecified)
        .unwrap();
    assert_eq!(unspecified.num_starts, 40);
    assert_eq!(unspecified.num_completions, 25);
    assert_eq!(unspecified.state_hit_counts["Question"].first_entry_count, 30);
    assert_eq!(unspecified.state_hit_counts["Question"].total_entry_count, 40);
    assert!(!unspecified.state_hit_counts.contains_key("END"));

    let all = facade.get_statistics("old", VersionScope::All).unwrap();
    assert_eq!(all.num_starts, 41);
    assert_eq!(all.num_completions, 26);

    let v3 = facade.get_statistics("old", VersionScope::Version(3)).unwrap();
    assert_eq!(v3.num_starts, 1);
    assert_eq!(v3.num_completions, 1);
}

// ============================================
// Batched reads and idempotence
// ============================================

#[test]
fn test_views_multi_matches_single_reads() {
    let h = Harness::new();
    h.put_content("e1", 1, base() - Duration::days(1));
    h.put_content("e2", 1, base() - Duration::days(1));

    for i in 0..3 {
        h.record(event(EventKind::Start, "e1", Some(1), &format!("a{i}"), Some("Intro"), i));
    }
    for i in 0..5 {
        h.record(event(EventKind::Start, "e2", Some(1), &format!("b{i}"), Some("Intro"), i));
    }

    let ids = vec!["e1".to_string(), "e2".to_string()];
    assert_eq!(h.facade().get_views_multi(&ids).unwrap(), vec![3, 5]);

    h.run(STATISTICS, at(10));
    let facade = h.facade();
    let views = facade.get_views_multi(&ids).unwrap();
    assert_eq!(views, vec![3, 5]);
    for (id, count) in ids.iter().zip(views) {
        assert_eq!(
            facade.get_statistics(id, VersionScope::All).unwrap().num_starts,
            count
        );
    }
}

#[test]
fn test_rerun_with_same_cutoff_is_identical() {
    let h = Harness::new();
    h.put_content("exp1", 1, base() - Duration::days(1));
    h.db.upsert_legacy_counter(&LegacyStateCounter {
        exploration_id: "exp1".to_string(),
        ..legacy("Intro", 4, 1)
    })
    .unwrap();

    for i in 0..6 {
        let session = format!("s{}", i % 2);
        h.record(event(EventKind::StateHit, "exp1", None, &session, Some("Question"), i));
        h.record(event(EventKind::MaybeLeave, "exp1", Some(1), &session, Some("Question"), i));
    }

    let cutoff = at(60);
    h.run(STATISTICS, cutoff);
    let first: Vec<_> = [VersionScope::All, VersionScope::Unspecified, VersionScope::Version(1)]
        .into_iter()
        .map(|scope| h.db.get_canonical_snapshot("exp1", scope).unwrap())
        .collect();

    h.run(STATISTICS, cutoff);
    let second: Vec<_> = [VersionScope::All, VersionScope::Unspecified, VersionScope::Version(1)]
        .into_iter()
        .map(|scope| h.db.get_canonical_snapshot("exp1", scope).unwrap())
        .collect();

    assert!(first.iter().all(Option::is_some));
    assert_eq!(first, second);
    assert_eq!(h.db.count_canonical_snapshots().unwrap(), 3);
}

// ============================================
// Answer summaries
// ============================================

fn answer(version: u32, value: serde_json::Value, minutes: i64) -> EventRecord {
    EventRecord {
        answer: Some(SubmittedAnswer {
            interaction_id: "TextInput".to_string(),
            answer: value,
        }),
        ..event(EventKind::AnswerSubmitted, "exp1", Some(version), "s1", Some("Question"), minutes)
    }
}

#[test]
fn test_answers_aggregate_across_versions() {
    let h = Harness::new();
    h.record(answer(1, json!("a"), 0));
    h.record(answer(1, json!("b"), 1));
    h.record(answer(2, json!("c"), 2));

    h.run(ANSWER_SUMMARIES, at(10));
    let facade = h.facade();

    let all = facade
        .get_calculation_output("exp1", "Question", "AnswerFrequencies", VersionScope::All)
        .unwrap()
        .unwrap();
    let answers: BTreeSet<String> = all
        .output
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["answer"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        answers,
        ["a", "b", "c"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<String>>()
    );

    let v2 = facade
        .get_calculation_output("exp1", "Question", "AnswerFrequencies", VersionScope::Version(2))
        .unwrap()
        .unwrap();
    assert_eq!(v2.output, json!([{"answer": "c", "frequency": 1}]));

    // Statistics are independent of the answer pipeline.
    assert!(h
        .db
        .get_canonical_snapshot("exp1", VersionScope::All)
        .unwrap()
        .is_none());
}

#[test]
fn test_run_all_records_both_computations() {
    let h = Harness::new();
    h.put_content("exp1", 1, base() - Duration::days(1));
    h.record(event(EventKind::Start, "exp1", Some(1), "s1", Some("Intro"), 0));
    h.record(answer(1, json!("x"), 1));

    let results = h.engine.run_all(&h.db, &h.db, at(10));
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == BatchRunStatus::Success));

    let runs = h.engine.batch_runs(&h.db, STATISTICS, 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].keys_written, 2);
    assert_eq!(runs[0].cutoff, at(10));
}
