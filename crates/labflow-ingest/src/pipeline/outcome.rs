//! File lifecycle states and per-file outcome reporting

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::normalizer::RejectReason;

/// Where a file is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Discovered,
    Normalizing,
    Loading,
    Committed,
    /// Committed and removed from the inbox
    Cleaned,
    /// Quarantined; never retried
    Rejected,
    /// Left in the inbox for a later attempt
    Failed,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Discovered => "discovered",
            FileState::Normalizing => "normalizing",
            FileState::Loading => "loading",
            FileState::Committed => "committed",
            FileState::Cleaned => "cleaned",
            FileState::Rejected => "rejected",
            FileState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Cleaned | FileState::Rejected)
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one processing attempt of one file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub file: String,
    pub state: FileState,
    pub inserted: u64,
    /// Exact repeats within the file plus rows already in the relation
    pub duplicates: u64,
    pub rejected: usize,
    pub rejections: BTreeMap<RejectReason, usize>,
    /// The file was already in the ledger; only the leftover was removed
    pub already_committed: bool,
    /// Failure or quarantine reason
    pub detail: Option<String>,
    /// Delay before the next attempt of a failed file
    pub retry_in: Option<Duration>,
    pub duration: Duration,
}

impl FileOutcome {
    pub fn new(file: impl Into<String>, state: FileState) -> Self {
        Self {
            file: file.into(),
            state,
            inserted: 0,
            duplicates: 0,
            rejected: 0,
            rejections: BTreeMap::new(),
            already_committed: false,
            detail: None,
            retry_in: None,
            duration: Duration::ZERO,
        }
    }

    /// Emit the structured log line for this outcome
    pub fn log(&self) {
        let duration_ms = self.duration.as_millis() as u64;
        match self.state {
            FileState::Cleaned if self.already_committed => info!(
                file = %self.file,
                state = %self.state,
                duration_ms,
                "Removed file already recorded in the ledger"
            ),
            FileState::Committed | FileState::Cleaned => info!(
                file = %self.file,
                state = %self.state,
                inserted = self.inserted,
                duplicates = self.duplicates,
                rejected = self.rejected,
                rejections = ?self.rejections,
                duration_ms,
                "File committed"
            ),
            FileState::Rejected => warn!(
                file = %self.file,
                state = %self.state,
                reason = self.detail.as_deref().unwrap_or_default(),
                duration_ms,
                "File quarantined"
            ),
            FileState::Failed => warn!(
                file = %self.file,
                state = %self.state,
                error = self.detail.as_deref().unwrap_or_default(),
                retry_in_ms = self.retry_in.map(|d| d.as_millis() as u64).unwrap_or_default(),
                duration_ms,
                "File load failed, will retry"
            ),
            FileState::Discovered | FileState::Normalizing | FileState::Loading => info!(
                file = %self.file,
                state = %self.state,
                duration_ms,
                "File processing interrupted"
            ),
        }
    }
}
