//! Database layer for expstats
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Append-only event and answer logs
//! - Live counters keyed by generation
//! - Canonical snapshots and calculation outputs

pub mod repo;
pub mod schema;

pub use repo::{format_ts, Database, LiveCounterField};
