use expstats_core::{Database, VersionScope};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    base: PathBuf,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            base,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("expstats/stats.db")
    }

    fn write(&self, name: &str, contents: &str) -> String {
        let path = self.base.join(name);
        fs::write(&path, contents).expect("failed to write input file");
        path.to_string_lossy().into_owned()
    }

    fn seed_content(&self) {
        let content = self.write(
            "content.json",
            r#"[
              {"exploration_id": "exp1", "version": 1, "states": ["Intro", "Question", "END"],
               "init_state_name": "Intro", "last_updated": "2014-01-01T00:00:00Z"},
              {"exploration_id": "exp1", "version": 2, "states": ["Intro", "Question", "Outro"],
               "init_state_name": "Intro", "last_updated": "2020-01-01T00:00:00Z"},
              {"exploration_id": "exp2", "version": 1, "states": ["Intro"],
               "init_state_name": "Intro", "last_updated": "2020-01-01T00:00:00Z"}
            ]"#,
        );
        let output = run_bin(self, &["import-content", &content]);
        assert_success(&["import-content", &content], &output);
    }

    fn seed_events(&self) {
        let mut lines = Vec::new();
        for i in 0..3 {
            lines.push(format!(
                r#"{{"kind":"start","exploration_id":"exp1","version":2,"session_id":"a{i}","state_name":"Intro","created_on":"2024-01-01T10:0{i}:00Z"}}"#
            ));
        }
        for i in 0..5 {
            lines.push(format!(
                r#"{{"kind":"start","exploration_id":"exp2","version":1,"session_id":"b{i}","state_name":"Intro","created_on":"2024-01-01T11:0{i}:00Z"}}"#
            ));
        }
        lines.push(
            r#"{"kind":"state_hit","exploration_id":"exp1","version":2,"session_id":"a0","state_name":"Question","created_on":"2024-01-01T10:10:00Z"}"#
                .to_string(),
        );
        lines.push(
            r#"{"kind":"maybe_leave","exploration_id":"exp1","version":2,"session_id":"a0","state_name":"Question","created_on":"2024-01-01T10:11:00Z"}"#
                .to_string(),
        );
        lines.push(
            r#"{"kind":"answer_submitted","exploration_id":"exp1","version":2,"session_id":"a1","state_name":"Question","created_on":"2024-01-01T10:12:00Z","answer":{"interaction_id":"TextInput","answer":"blue"}}"#
                .to_string(),
        );
        lines.push(
            r#"{"kind":"hint_used","exploration_id":"exp1","version":2,"session_id":"a1","created_on":"2024-01-01T10:13:00Z"}"#
                .to_string(),
        );

        let events = self.write("events.jsonl", &lines.join("\n"));
        let output = run_bin(self, &["record", &events]);
        assert_success(&["record", &events], &output);

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("Events:        10"), "got:\n{stdout}");
        assert!(stdout.contains("Answers:       1"), "got:\n{stdout}");
        assert!(stdout.contains("Unrecognized:  1"), "got:\n{stdout}");
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("expstats"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute expstats: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "expstats {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn record_counts_live_starts_before_any_batch() {
    let env = CliTestEnv::new();
    env.seed_content();
    env.seed_events();

    let output = run_bin(&env, &["views", "exp1", "exp2"]);
    assert_success(&["views", "exp1", "exp2"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let counts: Vec<&str> = stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();
    assert_eq!(counts, vec!["3", "5"], "got:\n{stdout}");

    let db_path = env.db_path();
    assert!(
        db_path.exists(),
        "database file should exist at {}",
        db_path.display()
    );
}

#[test]
fn batch_then_stats_reports_canonical_counts() {
    let env = CliTestEnv::new();
    env.seed_content();
    env.seed_events();

    let args = ["batch", "--cutoff", "2024-06-01T00:00:00Z"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("statistics [success]"), "got:\n{stdout}");
    assert!(stdout.contains("answer_summaries [success]"), "got:\n{stdout}");

    let args = ["stats", "exp1", "--scope", "2", "--format", "json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let stats: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stats output should be JSON");
    assert_eq!(stats["num_starts"], 3);
    assert_eq!(stats["state_hit_counts"]["Question"]["first_entry_count"], 1);
    assert_eq!(stats["state_hit_counts"]["Question"]["no_answer_count"], 1);

    let db = Database::open(&env.db_path()).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    let snapshot = db
        .get_canonical_snapshot("exp2", VersionScope::All)
        .expect("failed to read snapshot")
        .expect("snapshot should exist");
    assert_eq!(snapshot.num_starts, 5);

    let output = run_bin(&env, &["views", "exp1", "exp2"]);
    assert_success(&["views", "exp1", "exp2"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("exp1"));
    assert!(stdout.lines().any(|l| l.ends_with(" 5")), "got:\n{stdout}");

    let args = ["calc-output", "exp1", "Question", "AnswerFrequencies"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let calc: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("calc output should be JSON");
    assert_eq!(calc[0]["answer"], "blue");
    assert_eq!(calc[0]["frequency"], 1);

    let output = run_bin(&env, &["runs"]);
    assert_success(&["runs"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("statistics [success]"), "got:\n{stdout}");
}

#[test]
fn legacy_import_feeds_unspecified_scope() {
    let env = CliTestEnv::new();
    env.seed_content();

    let legacy = env.write(
        "legacy.jsonl",
        concat!(
            r#"{"exploration_id":"exp1","state_name":"Intro","first_entry_count":12,"subsequent_entries_count":3,"resolved_answer_count":1,"active_answer_count":2,"created_on":"2014-05-01T00:00:00Z"}"#,
            "\n",
            r#"{"exploration_id":"exp1","state_name":"END","first_entry_count":7,"subsequent_entries_count":0,"resolved_answer_count":0,"active_answer_count":0,"created_on":"2014-05-01T00:00:00Z"}"#,
            "\n",
        ),
    );
    let output = run_bin(&env, &["import-legacy", &legacy]);
    assert_success(&["import-legacy", &legacy], &output);

    let args = ["batch", "--job", "statistics", "--cutoff", "2024-06-01T00:00:00Z"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let args = ["stats", "exp1", "--scope", "none"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Starts:       12"), "got:\n{stdout}");
    assert!(stdout.contains("Completions:  7"), "got:\n{stdout}");
}

#[test]
fn unknown_job_fails() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["batch", "--job", "nonexistent"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nonexistent"), "got:\n{stderr}");
}
