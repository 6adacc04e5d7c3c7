//! # expstats-core
//!
//! Core library for expstats - usage statistics for versioned interactive
//! explorations.
//!
//! This library provides:
//! - Domain types for events, legacy counters and snapshots
//! - Database storage layer with SQLite
//! - Event ingestion and the live counter tier
//! - Batch recomputation of canonical statistics and answer summaries
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Data flows through two layers:
//! - **Layer 1 (Logs):** Append-only event, answer and legacy counter tables
//! - **Layer 2 (Derived):** Canonical snapshots and calculation outputs (regenerable)
//!
//! Recent starts and completions are counted in the live tier until the next
//! batch run absorbs them; [`QueryFacade`] adds both together.
//!
//! ## Example
//!
//! ```rust,no_run
//! use expstats_core::{create_default_engine, Config, Database, EventIngestionRouter, QueryFacade, VersionScope};
//!
//! let config = Config::load().expect("failed to load config");
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let engine = create_default_engine(&config);
//! let router = EventIngestionRouter::new(&db, &engine);
//! # let events = vec![];
//! router.record_batch(&events);
//!
//! engine.run_all(&db, &db, chrono::Utc::now());
//!
//! let stats = QueryFacade::current(&db)
//!     .and_then(|q| q.get_statistics("exp1", VersionScope::All))
//!     .expect("query failed");
//! println!("{} starts", stats.num_starts);
//! ```

// Re-export commonly used items at the crate root
pub use analytics::{
    create_default_engine, create_default_registry, BatchRunResult, BatchRunStatus,
    ComputationEngine, ContinuousComputation, ExplorationStatistics, QueryFacade,
};
pub use config::Config;
pub use content::ExplorationSource;
pub use db::Database;
pub use error::{Error, Result};
pub use ingest::{EventIngestionRouter, IngestSummary, RecordOutcome};
pub use live::LiveCounterTier;
pub use types::*;

// Public modules
pub mod analytics;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod ingest;
pub mod live;
pub mod logging;
pub mod types;
