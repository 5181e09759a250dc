//! Backend-agnostic schema migration engine for heterogeneous data-store
//! fleets: relational (PostgreSQL), time-series (GreptimeDB), and
//! key-value (etcd).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bfm_core::backend::default_driver_map;
//! use bfm_core::config::BfmConfig;
//! use bfm_core::executor::{ExecutionContext, Executor};
//! use bfm_core::registry::ScriptRegistry;
//! use bfm_core::script::MigrationTarget;
//! use bfm_core::tracker::StateTracker;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BfmConfig::from_env()?;
//! let registry = Arc::new(ScriptRegistry::new());
//! bfm_core::loader::load_into(&config.scripts.root, &registry)?;
//!
//! let tracker = Arc::new(StateTracker::connect(&config.state)?);
//! tracker.initialize().await?;
//!
//! let executor = Executor::new(
//!     registry,
//!     tracker,
//!     default_driver_map(),
//!     config.connections.clone(),
//! );
//! let result = executor
//!     .execute_up(
//!         &MigrationTarget::default(),
//!         "",
//!         &[],
//!         false,
//!         &ExecutionContext::default(),
//!     )
//!     .await;
//! println!("Applied {} migrations", result.applied.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`] — Environment-driven configuration + TOML connection map
//! - [`script`] — Migration entities and migration-id normalization
//! - [`directive`] — `bfm:*` comment directive parsing in script headers
//! - [`loader`] — Script corpus scanning and the filesystem watcher
//! - [`registry`] — In-memory script index shared across components
//! - [`backend`] — Driver contract + PostgreSQL/GreptimeDB/etcd drivers
//! - [`tracker`] — Persistent state tables, queries, legacy import, reindex
//! - [`dependency`] — Dependency graph and topological ordering
//! - [`executor`] — Planner and driver for up/down/rollback requests
//! - [`queue`] — Async offload envelopes, transports, and the worker loop
//! - [`error`] — Error types and boundary classification

pub mod backend;
pub mod config;
pub mod dependency;
pub mod directive;
pub mod error;
pub mod executor;
pub mod loader;
pub mod queue;
pub mod registry;
pub mod script;
pub mod tracker;

pub use config::BfmConfig;
pub use error::{BfmError, ErrorKind, Result};
pub use executor::{ExecutionContext, Executor, MigrationResult};
pub use registry::ScriptRegistry;
pub use script::{Backend, MigrationScript, MigrationStatus, MigrationTarget};
pub use tracker::{ReindexReport, StateTracker};
