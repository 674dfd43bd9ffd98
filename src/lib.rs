//! Kuba point values - time-series point value storage and query core
//!
//! This library provides:
//! - A pluggable [`PointValueStore`](engine::PointValueStore) backend contract
//!   with optional capabilities
//! - Chunked per-series reads and time-ordered merging across series
//! - Wide and bookend queries for charting and reporting
//! - A sharded asynchronous writer pool with back-pressure
//! - Scheduled purging of old values

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Storage backends and the database handle
pub mod engine;

/// Asynchronous writer pool with batching and back-pressure
pub mod ingestion;

/// Tracing subscriber setup
pub mod logging;

/// Chunked iteration, merging and the query operations
pub mod query;

/// Background services: lifecycle management and scheduled purge
pub mod services;

// Re-export main types
pub use config::Config;
pub use engine::{MemoryStore, PointValueDb, PointValueDbBuilder, PointValueStore};
pub use error::{Error, Result};
pub use types::{
    DataValue, IdPointValueTime, PointRef, PointValueTime, SeriesId, TimeOrder, TimeRange,
};
