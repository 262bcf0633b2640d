//! Delimited-text reader
//!
//! Turns an inbox file into a [`RawTable`]. Anything the `csv` crate cannot
//! make sense of structurally becomes [`MalformedInput`]; plain I/O failures
//! stay retryable.

use csv::{ErrorKind, ReaderBuilder, Trim};
use labflow_common::checksum::bytes_sha256;
use std::io::Read;
use std::path::Path;

use super::models::RawTable;
use super::{MalformedInput, NormalizeError};

/// One inbox file as read from disk
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// SHA-256 of exactly the bytes that were parsed
    pub checksum: String,
    pub table: RawTable,
}

/// Read and parse a comma-delimited file with a header row
pub fn read_file(path: &Path) -> Result<SourceFile, NormalizeError> {
    let bytes = std::fs::read(path).map_err(|source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let checksum = bytes_sha256(&bytes);
    let table = parse_table(bytes.as_slice()).map_err(|e| e.with_path(path))?;
    Ok(SourceFile { checksum, table })
}

/// Parse a comma-delimited table from any reader
pub fn parse_table<R: Read>(input: R) -> Result<RawTable, NormalizeError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(Trim::All)
        .from_reader(input);

    let headers: Vec<String> = reader
        .headers()
        .map_err(classify)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(MalformedInput::EmptyFile.into());
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(classify)?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(RawTable::new(headers, rows))
}

fn classify(err: csv::Error) -> NormalizeError {
    let line = err.position().map(|p| p.line() as usize);
    match err.into_kind() {
        ErrorKind::Io(source) => NormalizeError::Io {
            path: Default::default(),
            source,
        },
        ErrorKind::UnequalLengths {
            pos,
            expected_len,
            len,
        } => MalformedInput::RaggedRow {
            line: pos.map(|p| p.line() as usize).or(line).unwrap_or(0),
            expected: expected_len as usize,
            found: len as usize,
        }
        .into(),
        ErrorKind::Utf8 { .. } => MalformedInput::InvalidEncoding {
            line: line.unwrap_or(0),
        }
        .into(),
        other => MalformedInput::Unreadable(format!("{:?}", other)).into(),
    }
}
