//! # fastbi-stats: Warehouse Statistics Aggregation
//!
//! `fastbi-stats` collects usage and cost statistics from the data warehouse
//! backing a FastBI deployment and publishes them as a single canonical
//! snapshot. One warehouse is active per deployment (selected by
//! `platform_dwh`); BigQuery, Snowflake, Redshift and Microsoft Fabric are
//! supported.
//!
//! ## Overview
//!
//! Each warehouse adapter exposes the same nine metric operations: three
//! counts (datasets, executed queries, tables), two rates (average execution
//! time, failure percentage) and four JSON-encoded breakdowns (monthly and
//! daily cost charts, per-user and per-table costs). The [`collector`] runs
//! all nine concurrently and assembles a [`snapshot::MetricSnapshot`].
//! Operations degrade independently: a failed count becomes `null`, a failed
//! breakdown becomes `"[]"`, and the rest of the snapshot is unaffected. A
//! warehouse that simply does not track something (Fabric keeps no query
//! history) reports the same defaults.
//!
//! The [`scheduler`] refreshes the snapshot once at startup and then daily
//! at a configured UTC time, publishing into the in-memory [`cache`] under
//! the `global_stats` key with a TTL. Nothing is written on a failed
//! refresh, so consumers keep the previous snapshot until it expires.
//!
//! Warehouse credentials are read by the [`secrets`] store: environment
//! variables first with mounted secret files as fallback, except BigQuery
//! and Fabric which are file-only. Credentials are resolved when a
//! connection is made and never logged or persisted.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use fastbi_stats::{cache::StatsCache, config, scheduler::RefreshScheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = config::Args::parse();
//!     let config = config::Config::load(&args)?;
//!     fastbi_stats::telemetry::init_telemetry(&config.log_level)?;
//!
//!     let cache = StatsCache::new(config.cache.ttl);
//!     let scheduler = RefreshScheduler::new(config, cache);
//!     let shutdown = tokio_util::sync::CancellationToken::new();
//!     scheduler.run(shutdown).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod cache;
pub mod collector;
pub mod config;
pub mod errors;
pub mod scheduler;
pub mod secrets;
pub mod snapshot;
pub mod telemetry;
pub mod warehouse;

pub use cache::{GLOBAL_STATS_KEY, StatsCache};
pub use config::Config;
pub use errors::{Result, StatsError};
pub use snapshot::MetricSnapshot;
pub use warehouse::{WarehouseKind, WarehouseStats, create_adapter};
