//! Read-only queries for reporting consumers
//!
//! Dashboards filter committed results by a test-time window and a set of
//! lots. Every query here runs inside a `READ ONLY` transaction, so this
//! module cannot mutate ingestion state even by accident.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::normalizer::{CanonicalRecord, Field};

/// Status value counted as an invalid test
pub const INVALID_STATUS: &str = "Invalid";

/// Time window (inclusive) and lot filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultQuery {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
    pub lots: Vec<String>,
}

/// A committed row with its identifier
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredResult {
    pub row_id: i64,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub record: CanonicalRecord,
}

/// Columns the status counts are broken down by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryGrouping {
    #[default]
    Lot,
    Chip,
    LotChip,
    LotBatchChip,
}

impl SummaryGrouping {
    fn by_lot(self) -> bool {
        !matches!(self, SummaryGrouping::Chip)
    }

    fn by_batch(self) -> bool {
        matches!(self, SummaryGrouping::LotBatchChip)
    }

    fn by_chip(self) -> bool {
        !matches!(self, SummaryGrouping::Lot)
    }

    fn columns(self) -> Vec<&'static str> {
        [
            (self.by_lot(), "lot"),
            (self.by_batch(), "chip_batchno"),
            (self.by_chip(), "chip_serial_no"),
        ]
        .into_iter()
        .filter_map(|(used, column)| used.then_some(column))
        .collect()
    }
}

impl FromStr for SummaryGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "lot" => Ok(SummaryGrouping::Lot),
            "chip" => Ok(SummaryGrouping::Chip),
            "lot_chip" => Ok(SummaryGrouping::LotChip),
            "lot_batch_chip" => Ok(SummaryGrouping::LotBatchChip),
            other => Err(format!(
                "unknown grouping '{other}' (expected lot, chip, lot-chip or lot-batch-chip)"
            )),
        }
    }
}

/// Test counts by status for one group; columns outside the grouping are `None`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chip_batchno: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chip_serial_no: Option<String>,
    pub by_status: BTreeMap<String, i64>,
    pub total: i64,
    /// Share of `Invalid` results, in percent, rounded to two decimals
    pub invalid_percent: f64,
}

#[derive(sqlx::FromRow)]
struct StatusCount {
    lot: Option<String>,
    chip_batchno: Option<String>,
    chip_serial_no: Option<String>,
    test_status: String,
    tests: i64,
}

type GroupKey = (Option<String>, Option<String>, Option<String>);

async fn read_only(pool: &PgPool) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Canonical rows tested within the window for any of the lots
pub async fn fetch_results(
    pool: &PgPool,
    table: &str,
    query: &ResultQuery,
) -> Result<Vec<StoredResult>, sqlx::Error> {
    if query.lots.is_empty() {
        return Ok(Vec::new());
    }

    let columns: Vec<&str> = Field::ALL.iter().map(|f| f.column()).collect();
    let sql = format!(
        "SELECT row_id, {} FROM {} \
         WHERE test_datetime BETWEEN $1 AND $2 AND lot = ANY($3) \
         ORDER BY test_datetime, row_id",
        columns.join(", "),
        table
    );

    let mut tx = read_only(pool).await?;
    let rows = sqlx::query_as::<_, StoredResult>(&sql)
        .bind(query.from)
        .bind(query.to)
        .bind(&query.lots)
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(rows)
}

/// Status counts per lot over the window, with the invalid rate
pub async fn summarize_by_lot(
    pool: &PgPool,
    table: &str,
    query: &ResultQuery,
) -> Result<Vec<StatusSummary>, sqlx::Error> {
    summarize(pool, table, query, SummaryGrouping::Lot).await
}

/// Status counts over the window for each group of `grouping`
pub async fn summarize(
    pool: &PgPool,
    table: &str,
    query: &ResultQuery,
    grouping: SummaryGrouping,
) -> Result<Vec<StatusSummary>, sqlx::Error> {
    if query.lots.is_empty() {
        return Ok(Vec::new());
    }

    let select: Vec<String> = ["lot", "chip_batchno", "chip_serial_no"]
        .into_iter()
        .map(|column| {
            if grouping.columns().contains(&column) {
                column.to_string()
            } else {
                format!("NULL::TEXT AS {column}")
            }
        })
        .collect();
    let group_by = grouping.columns().join(", ");

    let sql = format!(
        "SELECT {}, test_status, COUNT(patient_id) AS tests FROM {} \
         WHERE test_datetime BETWEEN $1 AND $2 AND lot = ANY($3) AND test_status <> '' \
         GROUP BY {group_by}, test_status \
         ORDER BY {group_by}, test_status",
        select.join(", "),
        table
    );

    let mut tx = read_only(pool).await?;
    let counts = sqlx::query_as::<_, StatusCount>(&sql)
        .bind(query.from)
        .bind(query.to)
        .bind(&query.lots)
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(summarize_counts(counts))
}

fn summarize_counts(counts: Vec<StatusCount>) -> Vec<StatusSummary> {
    let mut groups: BTreeMap<GroupKey, BTreeMap<String, i64>> = BTreeMap::new();
    for count in counts {
        *groups
            .entry((count.lot, count.chip_batchno, count.chip_serial_no))
            .or_default()
            .entry(count.test_status)
            .or_insert(0) += count.tests;
    }

    groups
        .into_iter()
        .map(|((lot, chip_batchno, chip_serial_no), by_status)| {
            let total: i64 = by_status.values().sum();
            let invalid = by_status.get(INVALID_STATUS).copied().unwrap_or(0);
            let invalid_percent = if total == 0 {
                0.0
            } else {
                (invalid as f64 / total as f64 * 10_000.0).round() / 100.0
            };
            StatusSummary {
                lot,
                chip_batchno,
                chip_serial_no,
                by_status,
                total,
                invalid_percent,
            }
        })
        .collect()
}
