//! Persistent performance and feature data for algorithm portfolios.
//!
//! Two stores sit at the center of the crate: a performance store holding one
//! value per objective, instance, run and solver, and a feature store holding
//! one value per feature and instance. Both persist as a single csv file that
//! independent worker processes update through a lock around a
//! load-mutate-save transaction.
//!
//! On top of the stores the crate derives the remaining work, aggregates the
//! virtual best solver, ranks solvers, simulates selector schedules and
//! computes marginal contributions against an oracle or an actually trained
//! selector.
//!
//! Example
//! ```rust
//! use portfolio_data::objective::Objective;
//! use portfolio_data::performance_data::PerformanceDataStore;
//! use portfolio_data::Persisted;
//! # use anyhow::Result;
//! # use std::time::Duration;
//!
//! fn example() -> Result<()> {
//!     let path = std::path::Path::new("performance_data.csv");
//!     let objectives = Objective::parse_list("PAR10")?;
//!     PerformanceDataStore::create(path, &["A", "B"], &objectives, &["i1", "i2"], 1)?;
//!
//!     // every worker writes its own cell under the store lock
//!     PerformanceDataStore::update(path, Duration::from_secs(60), |store| {
//!         store.set_value(5.0, "A", "i1", None, None)
//!     })?;
//!
//!     let store = PerformanceDataStore::load(path)?;
//!     for job in store.get_job_list(false) {
//!         println!("outstanding: {job}");
//!     }
//!     println!("{:?}", store.marginal_contribution(None, true)?);
//!     Ok(())
//! }
//! ```

/// Error kinds carried inside `anyhow::Error`.
pub mod error;

/// Objectives, aggregators and solver status tags.
pub mod objective;

/// Shared value types and the platform settings.
pub mod datastructures;

/// File lock and atomic rewrite around persisted stores.
pub mod lock;

/// Encoding and decoding of the persisted csv files.
pub mod csv_parser;

/// Small string table used for registries.
pub mod table;

/// Feature values per instance.
pub mod feature_data;

/// Performance values per objective, instance, run and solver.
pub mod performance_data;

/// Perfect and actual selector marginal contribution.
pub mod marginal_contribution;

/// Interface to an external algorithm selector tool.
pub mod selector;

/// Dispatching worker commands.
pub mod runner;

/// Decoding worker results and writing them back into the stores.
pub mod worker;

pub use lock::Persisted;
