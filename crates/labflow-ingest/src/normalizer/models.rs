//! Data model for instrument result files
//!
//! A [`RawTable`] is what the reader hands over: the header row exactly as
//! written plus string cells. A [`CanonicalRecord`] is one normalized test
//! result ready for the `lab_results` relation.

use chrono::NaiveDateTime;
use labflow_common::checksum::fields_sha256;
use serde::{Deserialize, Serialize};

/// A delimited table as read from one inbox file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    /// Column names as the file declares them
    pub headers: Vec<String>,
    /// Data rows, one cell per header column
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// File line number of the data row at `index` (the header is line 1)
    pub fn line_of(index: usize) -> usize {
        index + 2
    }
}

/// Canonical columns of the results relation, in storage order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    TestDatetime,
    ProfileId,
    PatientId,
    TestResult,
    TestStatus,
    LabName,
    UserName,
    SampleType,
    TruelabId,
    Lot,
    ChipSerialNo,
    RawDataFilename,
    Ct1,
    Ct2,
    Ct3,
    Bayno,
    ChipBatchno,
    ResultReceivedDate,
}

impl Field {
    pub const ALL: [Field; 18] = [
        Field::TestDatetime,
        Field::ProfileId,
        Field::PatientId,
        Field::TestResult,
        Field::TestStatus,
        Field::LabName,
        Field::UserName,
        Field::SampleType,
        Field::TruelabId,
        Field::Lot,
        Field::ChipSerialNo,
        Field::RawDataFilename,
        Field::Ct1,
        Field::Ct2,
        Field::Ct3,
        Field::Bayno,
        Field::ChipBatchno,
        Field::ResultReceivedDate,
    ];

    /// Column name in the results relation
    pub fn column(self) -> &'static str {
        match self {
            Field::TestDatetime => "test_datetime",
            Field::ProfileId => "profile_id",
            Field::PatientId => "patient_id",
            Field::TestResult => "test_result",
            Field::TestStatus => "test_status",
            Field::LabName => "lab_name",
            Field::UserName => "user_name",
            Field::SampleType => "sample_type",
            Field::TruelabId => "truelab_id",
            Field::Lot => "lot",
            Field::ChipSerialNo => "chip_serial_no",
            Field::RawDataFilename => "raw_data_filename",
            Field::Ct1 => "ct1",
            Field::Ct2 => "ct2",
            Field::Ct3 => "ct3",
            Field::Bayno => "bayno",
            Field::ChipBatchno => "chip_batchno",
            Field::ResultReceivedDate => "result_received_date",
        }
    }

    /// Ct columns may be missing entirely; they default to 0.0
    pub fn is_required(self) -> bool {
        !matches!(self, Field::Ct1 | Field::Ct2 | Field::Ct3)
    }

    /// Resolve a file header to a canonical field.
    ///
    /// Matching ignores case, spaces, `_` and `-`, and accepts the
    /// instrument spellings `Test_date_time` and `Result_recieved_date`.
    pub fn from_header(header: &str) -> Option<Field> {
        let key: String = header
            .trim()
            .trim_start_matches('\u{feff}')
            .chars()
            .filter(|c| !matches!(c, '_' | ' ' | '-'))
            .flat_map(char::to_lowercase)
            .collect();

        let field = match key.as_str() {
            "testdatetime" => Field::TestDatetime,
            "profileid" => Field::ProfileId,
            "patientid" => Field::PatientId,
            "testresult" => Field::TestResult,
            "teststatus" => Field::TestStatus,
            "labname" => Field::LabName,
            "username" => Field::UserName,
            "sampletype" => Field::SampleType,
            "truelabid" => Field::TruelabId,
            "lot" => Field::Lot,
            "chipserialno" => Field::ChipSerialNo,
            "rawdatafilename" => Field::RawDataFilename,
            "ct1" => Field::Ct1,
            "ct2" => Field::Ct2,
            "ct3" => Field::Ct3,
            "bayno" => Field::Bayno,
            "chipbatchno" => Field::ChipBatchno,
            "resultreceiveddate" | "resultrecieveddate" => Field::ResultReceivedDate,
            _ => return None,
        };
        Some(field)
    }
}

/// One normalized test result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CanonicalRecord {
    pub test_datetime: NaiveDateTime,
    pub profile_id: String,
    pub patient_id: String,
    pub test_result: String,
    pub test_status: String,
    pub lab_name: String,
    pub user_name: String,
    pub sample_type: String,
    pub truelab_id: String,
    pub lot: String,
    pub chip_serial_no: String,
    pub raw_data_filename: String,
    pub ct1: f64,
    pub ct2: f64,
    pub ct3: f64,
    pub bayno: String,
    pub chip_batchno: String,
    pub result_received_date: NaiveDateTime,
}

const KEY_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

impl CanonicalRecord {
    /// SHA-256 over every persisted field, in storage order.
    ///
    /// Two records with equal keys are duplicates; the results relation
    /// carries this value under a unique constraint.
    pub fn natural_key(&self) -> String {
        let test_datetime = self.test_datetime.format(KEY_TIMESTAMP_FORMAT).to_string();
        let received = self.result_received_date.format(KEY_TIMESTAMP_FORMAT).to_string();
        let ct1 = self.ct1.to_string();
        let ct2 = self.ct2.to_string();
        let ct3 = self.ct3.to_string();

        fields_sha256([
            test_datetime.as_str(),
            self.profile_id.as_str(),
            self.patient_id.as_str(),
            self.test_result.as_str(),
            self.test_status.as_str(),
            self.lab_name.as_str(),
            self.user_name.as_str(),
            self.sample_type.as_str(),
            self.truelab_id.as_str(),
            self.lot.as_str(),
            self.chip_serial_no.as_str(),
            self.raw_data_filename.as_str(),
            ct1.as_str(),
            ct2.as_str(),
            ct3.as_str(),
            self.bayno.as_str(),
            self.chip_batchno.as_str(),
            received.as_str(),
        ])
    }
}

/// Why a single row did not make it into the canonical output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ServiceAccount,
    QcLab,
    InvalidTimestamp,
    InvalidChipSerial,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ServiceAccount => "service_account",
            RejectReason::QcLab => "qc_lab",
            RejectReason::InvalidTimestamp => "invalid_timestamp",
            RejectReason::InvalidChipSerial => "invalid_chip_serial",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dropped row and where it was in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub line: usize,
    pub reason: RejectReason,
}

/// Output of normalizing one table
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    /// Surviving records in file order
    pub records: Vec<CanonicalRecord>,
    pub rejected: Vec<RejectedRow>,
    /// Rows dropped as exact repeats of an earlier row in the same file
    pub duplicates: usize,
}

impl Normalized {
    /// Rejection counts grouped by reason, for the per-file outcome
    pub fn rejection_summary(&self) -> std::collections::BTreeMap<RejectReason, usize> {
        let mut summary = std::collections::BTreeMap::new();
        for row in &self.rejected {
            *summary.entry(row.reason).or_insert(0) += 1;
        }
        summary
    }
}
