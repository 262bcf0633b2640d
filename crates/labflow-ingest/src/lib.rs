//! Labflow Ingest Library
//!
//! Moves instrument result files from watched inbox directories into a
//! PostgreSQL relation with exactly-once semantics per file.
//!
//! # Flow
//!
//! - [`watcher`]: settled-file notifications and backlog discovery
//! - [`normalizer`]: delimited text to [`normalizer::CanonicalRecord`]s
//! - [`loader`]: one transaction per file, rows plus [`ledger`] entry
//! - [`pipeline`]: per-inbox state machine, quarantine and retry
//! - [`service`]: wires everything together for the `labflow` binary
//!
//! # Example
//!
//! ```no_run
//! use labflow_ingest::{config::IngestConfig, service::IngestService};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let service = IngestService::connect(config).await?;
//!     service.run_backlog(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod ledger;
pub mod loader;
pub mod normalizer;
pub mod pipeline;
pub mod queries;
pub mod service;
pub mod store;
pub mod watcher;

pub use store::{CommitResult, CommitStore, FileBatch, LoadError};
