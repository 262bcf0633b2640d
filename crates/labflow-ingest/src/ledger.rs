//! Processed-file ledger
//!
//! The ledger is the single source of truth for "this file's rows are
//! durably stored". Entries are only ever inserted, and only by the loader
//! inside the transaction that writes the rows themselves. Everything else
//! reads.
//!
//! Entries are keyed by inbox and file name: two inboxes may each deliver a
//! `results.csv`, and those are different files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};

/// One committed source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ProcessedFileEntry {
    /// Canonical path of the inbox the file arrived in
    pub inbox: String,
    pub filename: String,
    pub committed_at: DateTime<Utc>,
    /// SHA-256 of the file content that was loaded
    pub checksum: String,
    /// Records inserted by this file (repeats of existing rows excluded)
    pub record_count: i64,
}

/// Read/append access to the ledger table
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: PgPool,
    table: String,
}

impl Ledger {
    /// `table` must already be a validated SQL identifier
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether `filename` from `inbox` has been committed
    pub async fn is_processed(&self, inbox: &str, filename: &str) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE inbox = $1 AND filename = $2)",
            self.table
        );
        sqlx::query_scalar::<_, bool>(&sql)
            .bind(inbox)
            .bind(filename)
            .fetch_one(&self.pool)
            .await
    }

    /// Append `filename` within the caller's transaction.
    ///
    /// Returns `false` when the file was already in the ledger, in which case
    /// nothing was written and the caller must not load its rows again.
    pub async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        inbox: &str,
        filename: &str,
        checksum: &str,
        record_count: i64,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} (inbox, filename, committed_at, checksum, record_count) \
             VALUES ($1, $2, NOW(), $3, $4) \
             ON CONFLICT (inbox, filename) DO NOTHING",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(inbox)
            .bind(filename)
            .bind(checksum)
            .bind(record_count)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Most recent entries first
    pub async fn list(&self, limit: i64) -> Result<Vec<ProcessedFileEntry>, sqlx::Error> {
        let sql = format!(
            "SELECT inbox, filename, committed_at, checksum, record_count FROM {} \
             ORDER BY committed_at DESC, inbox, filename LIMIT $1",
            self.table
        );
        sqlx::query_as::<_, ProcessedFileEntry>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }
}
