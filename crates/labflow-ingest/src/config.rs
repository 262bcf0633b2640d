//! Ingester configuration
//!
//! Loaded once at startup from the environment (after reading `.env` when
//! present) and passed explicitly to the service. Nothing reads the
//! environment after [`IngestConfig::load`] returns.

use labflow_common::LabflowError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::db::DatabaseConfig;

/// Default inbox directory.
pub const DEFAULT_INBOX: &str = "./inbox";

/// Default quarantine directory for structurally invalid files.
pub const DEFAULT_QUARANTINE: &str = "./quarantine";

/// Default rescan interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default quiet period a file must see before it is read, in milliseconds.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 2_000;

/// Default number of identical failures before a file is quarantined.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default first retry delay in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Default bound on a whole load transaction, in seconds.
pub const DEFAULT_DB_TIMEOUT_SECS: u64 = 60;

/// Default extension of inbox files.
pub const DEFAULT_FILE_EXTENSION: &str = "csv";

/// Default name of the results relation.
pub const DEFAULT_RESULTS_TABLE: &str = "lab_results";

/// Default name of the ledger relation.
pub const DEFAULT_LEDGER_TABLE: &str = "processed_files";

/// Relation names used by the loader, ledger and read queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableNames {
    pub results: String,
    pub ledger: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            results: DEFAULT_RESULTS_TABLE.to_string(),
            ledger: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl TableNames {
    pub fn validate(&self) -> Result<(), LabflowError> {
        validate_identifier(&self.results)?;
        validate_identifier(&self.ledger)?;
        if self.results == self.ledger {
            return Err(LabflowError::config(
                "results and ledger tables must have different names",
            ));
        }
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass
pub fn validate_identifier(name: &str) -> Result<(), LabflowError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 48 {
        Ok(())
    } else {
        Err(LabflowError::InvalidIdentifier(name.to_string()))
    }
}

/// Top-level ingester configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Watched directories; each gets its own serialized pipeline
    pub inbox_paths: Vec<PathBuf>,
    pub quarantine_path: PathBuf,
    pub database: DatabaseConfig,
    pub poll_interval_secs: u64,
    pub settle_delay_ms: u64,
    /// Consecutive identical constraint failures tolerated before quarantine
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub db_timeout_secs: u64,
    /// Extension (without dot) of files picked up from the inbox
    pub file_extension: String,
    pub tables: TableNames,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            inbox_paths: vec![PathBuf::from(DEFAULT_INBOX)],
            quarantine_path: PathBuf::from(DEFAULT_QUARANTINE),
            database: DatabaseConfig::default(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            db_timeout_secs: DEFAULT_DB_TIMEOUT_SECS,
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
            tables: TableNames::default(),
        }
    }
}

/// Read `key`, falling back to `default` when unset.
///
/// A value that is set but does not parse is an error rather than a silent
/// fallback.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, LabflowError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| LabflowError::config(format!("{key} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

impl IngestConfig {
    /// Load configuration from `.env` and environment variables
    pub fn load() -> Result<Self, LabflowError> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by whatever is set in the environment
    pub fn from_env() -> Result<Self, LabflowError> {
        let defaults = Self::default();

        let inbox_paths = match std::env::var("LABFLOW_INBOX") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            Err(_) => defaults.inbox_paths,
        };

        Ok(Self {
            inbox_paths,
            quarantine_path: env_or("LABFLOW_QUARANTINE", defaults.quarantine_path)?,
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", defaults.database.url)?,
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    defaults.database.min_connections,
                )?,
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    defaults.database.connect_timeout_secs,
                )?,
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    defaults.database.idle_timeout_secs,
                )?,
            },
            poll_interval_secs: env_or("LABFLOW_POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
            settle_delay_ms: env_or("LABFLOW_SETTLE_MS", defaults.settle_delay_ms)?,
            max_retries: env_or("LABFLOW_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay_ms: env_or("LABFLOW_RETRY_BASE_MS", defaults.retry_base_delay_ms)?,
            db_timeout_secs: env_or("LABFLOW_DB_TIMEOUT_SECS", defaults.db_timeout_secs)?,
            file_extension: env_or::<String>("LABFLOW_FILE_EXTENSION", defaults.file_extension)?
                .trim_start_matches('.')
                .to_string(),
            tables: TableNames {
                results: env_or("LABFLOW_RESULTS_TABLE", defaults.tables.results)?,
                ledger: env_or("LABFLOW_LEDGER_TABLE", defaults.tables.ledger)?,
            },
        })
    }

    pub fn validate(&self) -> Result<(), LabflowError> {
        if self.inbox_paths.is_empty() {
            return Err(LabflowError::config("at least one inbox path is required"));
        }
        if self.inbox_paths.iter().any(|p| p == &self.quarantine_path) {
            return Err(LabflowError::config(
                "quarantine path must differ from every inbox path",
            ));
        }
        let mut unique = self.inbox_paths.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != self.inbox_paths.len() {
            return Err(LabflowError::config("inbox paths must be distinct"));
        }
        if self.poll_interval_secs == 0 {
            return Err(LabflowError::config("poll interval must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(LabflowError::config("max_retries must be greater than 0"));
        }
        if self.db_timeout_secs == 0 {
            return Err(LabflowError::config("database timeout must be greater than 0"));
        }
        if self.file_extension.is_empty() {
            return Err(LabflowError::config("file extension cannot be empty"));
        }
        self.database
            .validate()
            .map_err(|e| LabflowError::config(e.to_string()))?;
        self.tables.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs)
    }
}
