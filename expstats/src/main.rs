//! expstats - record exploration events, run batch aggregation, query statistics
//!
//! All state lives in the SQLite database under the XDG data directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use expstats_core::analytics::{BatchRunResult, ExplorationStatistics};
use expstats_core::{
    create_default_engine, Config, Database, EventIngestionRouter, EventRecord,
    ExplorationContent, LegacyStateCounter, QueryFacade, VersionScope,
};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "expstats")]
#[command(about = "Usage statistics for versioned explorations")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record events from a JSON Lines file (one event per line)
    Record {
        /// Path to the events file
        file: PathBuf,
    },

    /// Import exploration content versions from a JSON array
    ImportContent {
        /// Path to the content file
        file: PathBuf,
    },

    /// Import legacy per-state counters from a JSON Lines file
    ImportLegacy {
        /// Path to the counters file
        file: PathBuf,
    },

    /// Recompute canonical statistics and answer summaries
    Batch {
        /// Run only this computation (statistics, answer_summaries)
        #[arg(short, long)]
        job: Option<String>,

        /// Only records created before this instant are read (RFC 3339, default: now)
        #[arg(short, long)]
        cutoff: Option<DateTime<Utc>>,
    },

    /// Show statistics for one exploration
    Stats {
        /// Exploration ID
        exploration_id: String,

        /// Version scope: a version number, "all" or "none"
        #[arg(short, long, default_value = "all")]
        scope: VersionScope,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show start counts for several explorations
    Views {
        /// Exploration IDs
        #[arg(required = true)]
        exploration_ids: Vec<String>,
    },

    /// Show the stored output of one answer calculation
    CalcOutput {
        exploration_id: String,
        state_name: String,
        calculation_id: String,

        /// Version scope: a version number, "all" or "none"
        #[arg(short, long, default_value = "all")]
        scope: VersionScope,
    },

    /// Show recent batch runs
    Runs {
        /// Computation to show (default: all)
        #[arg(short, long)]
        job: Option<String>,

        /// Maximum runs per computation
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        expstats_core::logging::init(&config.logging).context("failed to initialize logging")?;

    // Open database
    let db_path = Config::database_path();
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let engine = create_default_engine(&config);

    match args.command {
        Command::Record { file } => {
            let events: Vec<EventRecord> = read_json_lines(&file)?;
            let summary = EventIngestionRouter::new(&db, &engine).record_batch(&events);

            println!("Recorded {} event(s):", events.len());
            println!("  Events:        {}", summary.events_recorded);
            println!("  Answers:       {}", summary.answers_recorded);
            println!("  Unrecognized:  {}", summary.unrecognized);
            println!("  Live failed:   {}", summary.live_update_failed);
            println!("  Rejected:      {}", summary.rejected.len());
            for (index, error) in &summary.rejected {
                eprintln!("  line {}: {}", index + 1, error);
            }
        }

        Command::ImportContent { file } => {
            let reader = BufReader::new(open(&file)?);
            let versions: Vec<ExplorationContent> = serde_json::from_reader(reader)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            for content in &versions {
                db.put_exploration_version(content)?;
            }
            println!("Imported {} exploration version(s)", versions.len());
        }

        Command::ImportLegacy { file } => {
            let counters: Vec<LegacyStateCounter> = read_json_lines(&file)?;
            for counter in &counters {
                db.upsert_legacy_counter(counter)?;
            }
            println!("Imported {} legacy counter(s)", counters.len());
        }

        Command::Batch { job, cutoff } => {
            let cutoff = cutoff.unwrap_or_else(Utc::now);
            let results = match job {
                Some(name) => vec![engine.run_batch(&name, &db, &db, cutoff)?],
                None => engine.run_all(&db, &db, cutoff),
            };

            println!("Batch cutoff: {}", cutoff.to_rfc3339());
            for result in &results {
                print_run(result);
            }
        }

        Command::Stats {
            exploration_id,
            scope,
            format,
        } => {
            let stats = QueryFacade::current(&db)?
                .get_statistics(&exploration_id, scope)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text => print_statistics(&exploration_id, scope, &stats),
            }
        }

        Command::Views { exploration_ids } => {
            let views = QueryFacade::current(&db)?.get_views_multi(&exploration_ids)?;
            for (id, count) in exploration_ids.iter().zip(views) {
                println!("{:<24} {}", id, count);
            }
        }

        Command::CalcOutput {
            exploration_id,
            state_name,
            calculation_id,
            scope,
        } => {
            let output = QueryFacade::current(&db)?.get_calculation_output(
                &exploration_id,
                &state_name,
                &calculation_id,
                scope,
            )?;
            match output {
                Some(output) => println!("{}", serde_json::to_string_pretty(&output.output)?),
                None => {
                    println!(
                        "No output for {} at {}:{}:{}",
                        calculation_id, exploration_id, scope, state_name
                    );
                    println!("Run 'expstats batch' first to compute answer summaries.");
                }
            }
        }

        Command::Runs { job, limit } => {
            let names: Vec<String> = match job {
                Some(name) => vec![name],
                None => engine
                    .computation_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            };

            for name in names {
                let runs = engine.batch_runs(&db, &name, limit)?;
                if runs.is_empty() {
                    println!("{}: no runs yet", name);
                }
                for run in &runs {
                    print_run(run);
                }
            }
        }
    }

    Ok(())
}

fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("failed to open {}", path.display()))
}

/// One JSON value per non-empty line.
fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(open(path)?);
    let mut items = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), i + 1))?;
        items.push(item);
    }
    Ok(items)
}

fn print_run(run: &BatchRunResult) {
    println!(
        "{} [{}] at {}: {} input(s), {} written, {} skipped, {} failed ({}ms)",
        run.job_name,
        run.status.as_str(),
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.input_count,
        run.keys_written,
        run.keys_skipped,
        run.keys_failed,
        run.duration_ms
    );
    if let Some(ref message) = run.error_message {
        println!("  {}", message);
    }
}

fn print_statistics(exploration_id: &str, scope: VersionScope, stats: &ExplorationStatistics) {
    println!("Exploration {} (scope: {})", exploration_id, scope);
    println!("  Starts:       {}", stats.num_starts);
    println!("  Completions:  {}", stats.num_completions);
    match stats.last_updated {
        Some(ts) => println!("  Last batch:   {}", ts.to_rfc3339()),
        None => println!("  Last batch:   never"),
    }

    if stats.state_hit_counts.is_empty() {
        return;
    }

    println!();
    println!(
        "  {:<24} {:>8} {:>8} {:>10}",
        "State", "First", "Total", "No answer"
    );
    for (state, counts) in &stats.state_hit_counts {
        println!(
            "  {:<24} {:>8} {:>8} {:>10}",
            state, counts.first_entry_count, counts.total_entry_count, counts.no_answer_count
        );
    }
}
