//! Record normalization
//!
//! Pure transformation from a [`RawTable`] to [`CanonicalRecord`]s. Applied in
//! order:
//!
//! 1. rows from the service account or the QC lab are excluded
//! 2. `truelab_id` is cut at its first `-`
//! 3. `chip_serial_no` is reduced to its first two characters
//! 4. `ct1`..`ct3` are coerced to floats, anything unusable becoming `0.0`
//! 5. exact repeats of an earlier row are dropped (first one wins)
//! 6. chip codes that are not letter-then-digit are rejected
//!
//! Row problems never fail the table. Only structural problems (unknown
//! layout, missing required columns) reject the whole file.

pub mod models;
pub mod reader;

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub use models::{CanonicalRecord, Field, Normalized, RawTable, RejectReason, RejectedRow};
pub use reader::{parse_table, read_file, SourceFile};

/// Reserved user name of the instrument service account
pub const SERVICE_USER: &str = "Service";

/// Reserved lab name used for quality-control runs
pub const QC_LAB: &str = "QC";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Structural problems that make a whole file unusable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedInput {
    #[error("file has no header row")]
    EmptyFile,

    #[error("required column '{0}' is missing")]
    MissingColumn(&'static str),

    #[error("column '{0}' appears more than once")]
    DuplicateColumn(String),

    #[error("line {line}: expected {expected} fields, found {found}")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: content is not valid UTF-8")]
    InvalidEncoding { line: usize },

    #[error("unreadable table: {0}")]
    Unreadable(String),
}

/// Failure to turn a file into canonical records
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed input: {0}")]
    Malformed(#[from] MalformedInput),
}

impl NormalizeError {
    /// I/O failures may clear up on their own; malformed input never does
    pub fn is_transient(&self) -> bool {
        matches!(self, NormalizeError::Io { .. })
    }

    fn with_path(self, file: &Path) -> Self {
        match self {
            NormalizeError::Io { source, .. } => NormalizeError::Io {
                path: file.to_path_buf(),
                source,
            },
            other => other,
        }
    }
}

/// Parse an instrument timestamp cell
pub fn parse_timestamp(cell: &str) -> Option<NaiveDateTime> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cell, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(cell, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Coerce a Ct cell; missing or non-numeric text yields `0.0`
pub fn coerce_ct(cell: Option<&str>) -> f64 {
    cell.and_then(|c| c.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        // folds -0.0 into 0.0
        .map(|v| v + 0.0)
        .unwrap_or(0.0)
}

/// `truelab_id` up to (not including) the first `-`
pub fn truncate_truelab_id(raw: &str) -> &str {
    raw.split('-').next().unwrap_or(raw)
}

/// First two characters of the instrument chip serial
pub fn chip_code(raw: &str) -> String {
    raw.chars().take(2).collect()
}

/// A chip code is valid when it is exactly a non-digit followed by a digit
pub fn is_valid_chip_code(code: &str) -> bool {
    let mut chars = code.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(first), Some(second), None) => !first.is_numeric() && second.is_numeric(),
        _ => false,
    }
}

/// Map each canonical field to its column index in `headers`
fn resolve_columns(headers: &[String]) -> Result<HashMap<Field, usize>, MalformedInput> {
    let mut columns = HashMap::new();
    for (index, header) in headers.iter().enumerate() {
        if let Some(field) = Field::from_header(header) {
            if columns.insert(field, index).is_some() {
                return Err(MalformedInput::DuplicateColumn(header.clone()));
            }
        }
    }

    if let Some(missing) = Field::ALL
        .iter()
        .find(|f| f.is_required() && !columns.contains_key(f))
    {
        return Err(MalformedInput::MissingColumn(missing.column()));
    }

    Ok(columns)
}

/// Normalize one table into canonical records and rejected rows
pub fn normalize(table: &RawTable) -> Result<Normalized, MalformedInput> {
    let columns = resolve_columns(&table.headers)?;
    let width = table.headers.len();

    if let Some((index, row)) = table.rows.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(MalformedInput::RaggedRow {
            line: RawTable::line_of(index),
            expected: width,
            found: row.len(),
        });
    }

    let mut out = Normalized::default();
    let mut seen = HashSet::new();
    let mut candidates = Vec::with_capacity(table.rows.len());

    for (index, row) in table.rows.iter().enumerate() {
        let line = RawTable::line_of(index);
        let cell = |field: Field| columns.get(&field).map(|&i| row[i].as_str());
        let text = |field: Field| cell(field).unwrap_or_default().to_string();

        let user_name = text(Field::UserName);
        let lab_name = text(Field::LabName);
        if user_name == SERVICE_USER {
            out.rejected.push(RejectedRow { line, reason: RejectReason::ServiceAccount });
            continue;
        }
        if lab_name == QC_LAB {
            out.rejected.push(RejectedRow { line, reason: RejectReason::QcLab });
            continue;
        }

        let timestamps = (
            cell(Field::TestDatetime).and_then(parse_timestamp),
            cell(Field::ResultReceivedDate).and_then(parse_timestamp),
        );
        let (Some(test_datetime), Some(result_received_date)) = timestamps else {
            out.rejected.push(RejectedRow { line, reason: RejectReason::InvalidTimestamp });
            continue;
        };

        let record = CanonicalRecord {
            test_datetime,
            profile_id: text(Field::ProfileId),
            patient_id: text(Field::PatientId),
            test_result: text(Field::TestResult),
            test_status: text(Field::TestStatus),
            lab_name,
            user_name,
            sample_type: text(Field::SampleType),
            truelab_id: truncate_truelab_id(&text(Field::TruelabId)).to_string(),
            lot: text(Field::Lot),
            chip_serial_no: chip_code(&text(Field::ChipSerialNo)),
            raw_data_filename: text(Field::RawDataFilename),
            ct1: coerce_ct(cell(Field::Ct1)),
            ct2: coerce_ct(cell(Field::Ct2)),
            ct3: coerce_ct(cell(Field::Ct3)),
            bayno: text(Field::Bayno),
            chip_batchno: text(Field::ChipBatchno),
            result_received_date,
        };

        if !seen.insert(record.natural_key()) {
            out.duplicates += 1;
            continue;
        }
        candidates.push((line, record));
    }

    for (line, record) in candidates {
        if is_valid_chip_code(&record.chip_serial_no) {
            out.records.push(record);
        } else {
            out.rejected.push(RejectedRow { line, reason: RejectReason::InvalidChipSerial });
        }
    }
    out.rejected.sort_by_key(|r| r.line);

    debug!(
        rows = table.rows.len(),
        records = out.records.len(),
        rejected = out.rejected.len(),
        duplicates = out.duplicates,
        "Normalized table"
    );

    Ok(out)
}
