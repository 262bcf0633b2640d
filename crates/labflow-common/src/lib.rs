//! Labflow Common Library
//!
//! Shared utilities for the labflow workspace.
//!
//! - **Error Handling**: [`LabflowError`] and the crate-wide [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: SHA-256 digests of source files and record keys
//!
//! # Example
//!
//! ```no_run
//! use labflow_common::checksum::file_sha256;
//!
//! fn fingerprint(path: &str) -> labflow_common::Result<()> {
//!     let digest = file_sha256(path)?;
//!     tracing::info!(%digest, "Fingerprinted inbox file");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{LabflowError, Result};
