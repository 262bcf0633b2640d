//! Transactional bulk loader
//!
//! Writes one file's canonical records and its ledger entry in a single
//! PostgreSQL transaction. Duplicate rows are prevented at insert time: each
//! row carries the SHA-256 natural key of its fields under a unique
//! constraint, and `ON CONFLICT DO NOTHING` keeps whichever row was inserted
//! first.

pub mod schema;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::config::TableNames;
use crate::ledger::Ledger;
use crate::normalizer::CanonicalRecord;
use crate::store::{CommitResult, CommitStore, FileBatch, LoadError};

/// Rows per INSERT statement; 19 binds per row stays well under the
/// 65535 bind-parameter limit
const INSERT_CHUNK_ROWS: usize = 1_000;

/// PostgreSQL loader for canonical records
pub struct Loader {
    pool: PgPool,
    tables: TableNames,
    ledger: Ledger,
    timeout: Duration,
    schema_ready: OnceCell<()>,
}

impl Loader {
    /// `tables` must have passed [`TableNames::validate`]
    pub fn new(pool: PgPool, tables: TableNames, timeout: Duration) -> Self {
        let ledger = Ledger::new(pool.clone(), tables.ledger.clone());
        Self {
            pool,
            tables,
            ledger,
            timeout,
            schema_ready: OnceCell::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Create the results relation and ledger if they do not exist.
    ///
    /// Runs its DDL at most once per loader.
    pub async fn ensure_schema(&self) -> Result<(), LoadError> {
        self.schema_ready
            .get_or_try_init(|| async {
                self.bounded(async {
                    let mut tx = self.pool.begin().await?;
                    for statement in schema::create_statements(&self.tables) {
                        sqlx::query(&statement).execute(&mut *tx).await?;
                    }
                    tx.commit().await?;
                    info!(
                        results = %self.tables.results,
                        ledger = %self.tables.ledger,
                        "Schema ready"
                    );
                    Ok::<(), LoadError>(())
                })
                .await
            })
            .await
            .map(|_| ())
    }

    /// Commit `batch` exactly once.
    ///
    /// Rows and the ledger entry become visible together or not at all. If
    /// the ledger already names the file, the transaction is rolled back and
    /// [`CommitResult::AlreadyCommitted`] is returned.
    #[instrument(skip(self, batch), fields(inbox = %batch.inbox, file = %batch.filename, records = batch.records.len()))]
    pub async fn load(&self, batch: &FileBatch) -> Result<CommitResult, LoadError> {
        self.ensure_schema().await?;
        self.bounded(self.load_in_transaction(batch)).await
    }

    async fn load_in_transaction(&self, batch: &FileBatch) -> Result<CommitResult, LoadError> {
        let mut tx = self.pool.begin().await?;

        let mut inserted = 0u64;
        for chunk in batch.records.chunks(INSERT_CHUNK_ROWS) {
            inserted += self.insert_chunk(&mut tx, chunk).await?;
        }

        let appended = self
            .ledger
            .mark_processed(
                &mut tx,
                &batch.inbox,
                &batch.filename,
                &batch.checksum,
                inserted as i64,
            )
            .await?;

        if !appended {
            tx.rollback().await?;
            info!("File already in ledger, rolled back");
            return Ok(CommitResult::AlreadyCommitted);
        }

        tx.commit().await?;

        let duplicates = batch.records.len() as u64 - inserted;
        debug!(inserted, duplicates, "Batch committed");

        Ok(CommitResult::Committed {
            inserted,
            duplicates,
        })
    }

    async fn insert_chunk(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        records: &[CanonicalRecord],
    ) -> Result<u64, LoadError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            self.tables.results,
            schema::insert_columns().join(", ")
        ));

        query_builder.push_values(records, |mut b, record| {
            b.push_bind(record.test_datetime)
                .push_bind(&record.profile_id)
                .push_bind(&record.patient_id)
                .push_bind(&record.test_result)
                .push_bind(&record.test_status)
                .push_bind(&record.lab_name)
                .push_bind(&record.user_name)
                .push_bind(&record.sample_type)
                .push_bind(&record.truelab_id)
                .push_bind(&record.lot)
                .push_bind(&record.chip_serial_no)
                .push_bind(&record.raw_data_filename)
                .push_bind(record.ct1)
                .push_bind(record.ct2)
                .push_bind(record.ct3)
                .push_bind(&record.bayno)
                .push_bind(&record.chip_batchno)
                .push_bind(record.result_received_date)
                .push_bind(record.natural_key());
        });
        query_builder.push(" ON CONFLICT (natural_key) DO NOTHING");

        let result = query_builder.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    /// Apply the loader's timeout; an elapsed timer drops the future, which
    /// rolls back any open transaction
    async fn bounded<T, F>(&self, fut: F) -> Result<T, LoadError>
    where
        F: std::future::Future<Output = Result<T, LoadError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| LoadError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl CommitStore for Loader {
    async fn is_processed(&self, inbox: &str, filename: &str) -> Result<bool, LoadError> {
        self.ensure_schema().await?;
        self.bounded(async {
            let processed = self.ledger.is_processed(inbox, filename).await?;
            Ok::<bool, LoadError>(processed)
        })
        .await
    }

    async fn commit(&self, batch: &FileBatch) -> Result<CommitResult, LoadError> {
        self.load(batch).await
    }
}
