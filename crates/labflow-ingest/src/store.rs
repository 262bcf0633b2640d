//! Storage interface used by the inbox pipeline
//!
//! The pipeline only needs two things from storage: "is this file already
//! committed?" and "commit these rows together with the ledger entry". The
//! PostgreSQL [`Loader`](crate::loader::Loader) is the production
//! implementation.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::normalizer::CanonicalRecord;

/// Everything needed to commit one source file
#[derive(Debug, Clone)]
pub struct FileBatch {
    /// Canonical inbox path; with `filename` it forms the ledger key
    pub inbox: String,
    /// File name without its directory
    pub filename: String,
    /// SHA-256 of the file content
    pub checksum: String,
    pub records: Vec<CanonicalRecord>,
}

/// Outcome of a successful commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    /// Rows and ledger entry are durable
    Committed {
        inserted: u64,
        /// Records already present in the relation, skipped by the key constraint
        duplicates: u64,
    },
    /// The ledger already had this file; nothing was written
    AlreadyCommitted,
}

/// Failure of a load; the transaction has been rolled back in every case
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("database operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("database connection failed: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("constraint violation [{code}]: {message}")]
    Constraint { code: String, message: String },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl LoadError {
    /// Stable description of a deterministic failure.
    ///
    /// Two attempts failing with the same signature will keep failing; the
    /// scheduler uses this to stop retrying a file. Transient failures have
    /// no signature.
    pub fn signature(&self) -> Option<String> {
        match self {
            LoadError::Constraint { code, message } => Some(format!("{code}:{message}")),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for LoadError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                // Class 22 (data exception) and 23 (integrity constraint)
                // repeat identically on every attempt
                if code.starts_with("22") || code.starts_with("23") {
                    LoadError::Constraint {
                        code,
                        message: db.message().to_string(),
                    }
                } else {
                    LoadError::Database(err)
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => LoadError::Connection(err),
            other => LoadError::Database(other),
        }
    }
}

#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Ledger lookup for `filename` delivered to `inbox`
    async fn is_processed(&self, inbox: &str, filename: &str) -> Result<bool, LoadError>;

    /// Insert the batch and append its ledger entry in one transaction
    async fn commit(&self, batch: &FileBatch) -> Result<CommitResult, LoadError>;
}
