//! Per-inbox processing pipeline
//!
//! One [`DirectoryPipeline`] owns one inbox. It processes files strictly one
//! at a time: normalize, commit through a [`CommitStore`], then delete the
//! source. Files that cannot be normalized are quarantined; files whose load
//! fails stay in place and are retried with exponential backoff.

pub mod outcome;
pub mod quarantine;
pub mod retry;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::IngestConfig;
use crate::normalizer::{normalize, read_file, NormalizeError, Normalized};
use crate::store::{CommitResult, CommitStore, FileBatch};
use crate::watcher::{scan_inbox, InboxWatcher, WatchError};

pub use outcome::{FileOutcome, FileState};
pub use quarantine::quarantine_file;
pub use retry::{backoff_delay, RetryState};

/// Backoff never exceeds this many poll intervals
const BACKOFF_CAP_POLL_INTERVALS: u32 = 8;

/// Settings of a single inbox pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub inbox: PathBuf,
    pub quarantine: PathBuf,
    pub extension: String,
    /// Write activity must have been quiet this long before a file is read
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl PipelineSettings {
    pub fn for_inbox(config: &IngestConfig, inbox: &Path) -> Self {
        Self {
            inbox: inbox.to_path_buf(),
            quarantine: config.quarantine_path.clone(),
            extension: config.file_extension.clone(),
            settle_delay: config.settle_delay(),
            poll_interval: config.poll_interval(),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
        }
    }

    pub fn backoff_cap(&self) -> Duration {
        self.poll_interval.saturating_mul(BACKOFF_CAP_POLL_INTERVALS)
    }
}

/// Serialized worker for one inbox directory
pub struct DirectoryPipeline<S: CommitStore> {
    settings: PipelineSettings,
    /// Inbox half of every ledger key written by this pipeline
    inbox_key: String,
    store: Arc<S>,
    queue: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
    retries: HashMap<PathBuf, RetryState>,
}

impl<S: CommitStore> DirectoryPipeline<S> {
    pub fn new(settings: PipelineSettings, store: Arc<S>) -> Self {
        let inbox_key = ledger_inbox_key(&settings.inbox);
        Self {
            settings,
            inbox_key,
            store,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            retries: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Inbox identity recorded in the ledger next to each file name
    pub fn inbox_key(&self) -> &str {
        &self.inbox_key
    }

    /// Files waiting to be processed
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Earliest time a failed file becomes due again
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retries.values().filter_map(|r| r.next_at).min()
    }

    /// Queue a path unless it is already waiting
    pub fn enqueue(&mut self, path: PathBuf) -> bool {
        if self.queued.insert(path.clone()) {
            self.queue.push_back(path);
            true
        } else {
            false
        }
    }

    /// Queue every inbox file whose retry backoff has elapsed, oldest first
    pub fn rescan(&mut self) -> Result<usize, WatchError> {
        let now = Instant::now();
        let files = scan_inbox(&self.settings.inbox, &self.settings.extension)?;

        let present: HashSet<&PathBuf> = files.iter().collect();
        self.retries.retain(|path, _| present.contains(path));

        let mut added = 0;
        for path in files {
            if self.retries.get(&path).is_some_and(|r| !r.is_due(now)) {
                continue;
            }
            if self.enqueue(path) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Process the current backlog once and return.
    ///
    /// Used at startup and by one-shot runs.
    pub async fn process_backlog(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Vec<FileOutcome>, WatchError> {
        let found = self.rescan()?;
        info!(
            inbox = %self.settings.inbox.display(),
            files = found,
            "Processing inbox backlog"
        );
        Ok(self.drain(token).await)
    }

    /// Process queued files until the queue is empty or shutdown is requested
    pub async fn drain(&mut self, token: &CancellationToken) -> Vec<FileOutcome> {
        let mut outcomes = Vec::new();
        while !token.is_cancelled() {
            let Some(path) = self.queue.pop_front() else {
                break;
            };
            self.queued.remove(&path);

            if self
                .retries
                .get(&path)
                .is_some_and(|r| !r.is_due(Instant::now()))
            {
                continue;
            }

            if let Some(outcome) = self.process_file(&path).await {
                outcome.log();
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Watch the inbox until `token` is cancelled.
    ///
    /// The backlog is drained first. After that, settled notifications and
    /// the periodic rescan feed the queue. A file being processed when
    /// shutdown is requested is finished before returning.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), WatchError> {
        let mut watcher = InboxWatcher::new(&self.settings.inbox, &self.settings.extension)?;
        let mut events = watcher.start(self.settings.settle_delay).await?;

        self.process_backlog(&token).await?;

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the backlog already ran
        ticker.tick().await;

        let mut watching = true;
        loop {
            let retry_at = self.next_retry_at();
            let retry_sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(
                retry_at.unwrap_or_else(Instant::now),
            ));

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = events.recv(), if watching => match event {
                    Some(path) => {
                        self.enqueue(path);
                    },
                    None => {
                        warn!(
                            inbox = %self.settings.inbox.display(),
                            "Inbox notifications stopped, relying on periodic rescan"
                        );
                        watching = false;
                    },
                },
                _ = ticker.tick() => self.rescan_logged(),
                _ = retry_sleep, if retry_at.is_some() => self.rescan_logged(),
            }
            self.drain(&token).await;
        }

        watcher.stop();
        info!(inbox = %self.settings.inbox.display(), "Inbox pipeline stopped");
        Ok(())
    }

    fn rescan_logged(&mut self) {
        if let Err(e) = self.rescan() {
            error!(inbox = %self.settings.inbox.display(), error = %e, "Inbox rescan failed");
            // Pending retries wait for the next poll while the inbox is unreadable
            let resume = Instant::now() + self.settings.poll_interval;
            for state in self.retries.values_mut() {
                if state.next_at.is_some_and(|at| at < resume) {
                    state.next_at = Some(resume);
                }
            }
        }
    }

    /// Take one file through its lifecycle.
    ///
    /// Returns `None` when there was nothing to do: the file vanished or is
    /// still being written.
    #[instrument(skip(self), fields(inbox = %self.settings.inbox.display()))]
    pub async fn process_file(&mut self, path: &Path) -> Option<FileOutcome> {
        let started = Instant::now();
        let filename = path.file_name().and_then(|n| n.to_str())?.to_string();

        let modified = match std::fs::metadata(path) {
            Ok(metadata) => metadata.modified().ok(),
            Err(_) => {
                self.retries.remove(path);
                return None;
            },
        };
        if !is_settled(modified, self.settings.settle_delay) {
            debug!(file = %filename, "File still being written, deferring");
            if let Some(state) = self.retries.get_mut(path) {
                state.next_at = Some(Instant::now() + self.settings.settle_delay);
            }
            return None;
        }
        debug!(file = %filename, state = %FileState::Discovered, "File discovered");

        match self.store.is_processed(&self.inbox_key, &filename).await {
            Ok(true) => return Some(self.remove_leftover(path, filename, started)),
            Ok(false) => {},
            Err(e) => return Some(self.fail(path, filename, started, None, e.to_string())),
        }

        debug!(file = %filename, state = %FileState::Normalizing, "Normalizing file");
        let read_path = path.to_path_buf();
        let prepared = tokio::task::spawn_blocking(move || prepare(&read_path)).await;
        let (checksum, normalized) = match prepared {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) if e.is_transient() => {
                return Some(self.fail(path, filename, started, None, e.to_string()))
            },
            Ok(Err(e)) => return Some(self.reject(path, filename, started, e.to_string())),
            Err(e) => {
                let detail = format!("normalizer task failed: {e}");
                return Some(self.fail(path, filename, started, None, detail));
            },
        };

        debug!(
            file = %filename,
            state = %FileState::Loading,
            records = normalized.records.len(),
            "Loading records"
        );
        let rejections = normalized.rejection_summary();
        let rejected = normalized.rejected.len();
        let in_file_duplicates = normalized.duplicates as u64;
        let batch = FileBatch {
            inbox: self.inbox_key.clone(),
            filename: filename.clone(),
            checksum,
            records: normalized.records,
        };

        match self.store.commit(&batch).await {
            Ok(CommitResult::Committed {
                inserted,
                duplicates,
            }) => {
                self.retries.remove(path);
                let mut outcome = FileOutcome::new(filename, FileState::Committed);
                outcome.inserted = inserted;
                outcome.duplicates = duplicates + in_file_duplicates;
                outcome.rejected = rejected;
                outcome.rejections = rejections;

                match std::fs::remove_file(path) {
                    Ok(()) => outcome.state = FileState::Cleaned,
                    Err(e) => {
                        // Next pass finds it in the ledger and removes it
                        outcome.detail = Some(format!("committed but not removed: {e}"));
                    },
                }
                outcome.duration = started.elapsed();
                Some(outcome)
            },
            Ok(CommitResult::AlreadyCommitted) => {
                Some(self.remove_leftover(path, filename, started))
            },
            Err(e) => {
                let signature = e.signature();
                Some(self.fail(path, filename, started, signature, e.to_string()))
            },
        }
    }

    fn remove_leftover(&mut self, path: &Path, filename: String, started: Instant) -> FileOutcome {
        self.retries.remove(path);
        let mut outcome = FileOutcome::new(filename, FileState::Cleaned);
        outcome.already_committed = true;
        if let Err(e) = std::fs::remove_file(path) {
            outcome.state = FileState::Committed;
            outcome.detail = Some(format!("leftover not removed: {e}"));
        }
        outcome.duration = started.elapsed();
        outcome
    }

    fn reject(&mut self, path: &Path, filename: String, started: Instant, reason: String) -> FileOutcome {
        self.retries.remove(path);
        let mut outcome = FileOutcome::new(filename, FileState::Rejected);

        if let Err(e) = quarantine_file(path, &self.settings.quarantine, &reason) {
            // Leave it in place; a later pass rejects it again
            error!(
                file = %outcome.file,
                quarantine = %self.settings.quarantine.display(),
                error = %e,
                "Failed to quarantine file"
            );
            outcome.state = FileState::Failed;
            outcome.retry_in = Some(self.settings.backoff_cap());
            self.retries.insert(
                path.to_path_buf(),
                RetryState {
                    next_at: Some(Instant::now() + self.settings.backoff_cap()),
                    ..RetryState::default()
                },
            );
        }

        outcome.detail = Some(reason);
        outcome.duration = started.elapsed();
        outcome
    }

    /// Record a failed attempt; quarantine once the same deterministic
    /// failure has repeated `max_retries` times
    fn fail(
        &mut self,
        path: &Path,
        filename: String,
        started: Instant,
        signature: Option<String>,
        detail: String,
    ) -> FileOutcome {
        let now = Instant::now();
        let base = self.settings.retry_base_delay;
        let cap = self.settings.backoff_cap();
        let state = self.retries.entry(path.to_path_buf()).or_default();
        let repeats = state.record_failure(signature, now, base, cap);
        let retry_in = state.wait(now);

        if repeats >= self.settings.max_retries {
            let reason = format!("failed {repeats} times with the same error: {detail}");
            return self.reject(path, filename, started, reason);
        }

        let mut outcome = FileOutcome::new(filename, FileState::Failed);
        outcome.retry_in = Some(retry_in);
        outcome.detail = Some(detail);
        outcome.duration = started.elapsed();
        outcome
    }
}

/// Canonical form of `inbox`, or the path as given when it cannot be resolved
fn ledger_inbox_key(inbox: &Path) -> String {
    std::fs::canonicalize(inbox)
        .unwrap_or_else(|_| inbox.to_path_buf())
        .display()
        .to_string()
}

/// Read, fingerprint and normalize one file
fn prepare(path: &Path) -> Result<(String, Normalized), NormalizeError> {
    let source = read_file(path)?;
    let normalized = normalize(&source.table)?;
    Ok((source.checksum, normalized))
}

fn is_settled(modified: Option<SystemTime>, settle_delay: Duration) -> bool {
    match modified.and_then(|m| m.elapsed().ok()) {
        Some(age) => age >= settle_delay,
        // Unknown or future mtime: rely on the debouncer having waited
        None => true,
    }
}

#[cfg(test)]
mod tests;
