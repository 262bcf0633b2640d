//! Inbox watching and backlog discovery
//!
//! Notification events only say that a file may be new. The pipeline treats
//! them as hints; the periodic [`scan_inbox`] is what guarantees that every
//! file present in the inbox is eventually picked up.

use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Capacity of the event channel between the notify thread and the pipeline
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How often the notify thread checks whether it should stop
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("inbox not found: {0}")]
    PathNotFound(String),

    #[error("watcher already running")]
    AlreadyRunning,

    #[error("watcher thread exited before it started watching")]
    ThreadExited,

    #[error("failed to scan inbox {path}: {source}")]
    Scan {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Whether `path` names a candidate input file for this extension
pub fn is_candidate(path: &Path, extension: &str) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

/// List candidate files in an inbox, oldest first.
///
/// Order is by modification time, then by file name, so a backlog is
/// replayed in the order the instrument wrote it.
pub fn scan_inbox(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, WatchError> {
    let scan_err = |source: std::io::Error| WatchError::Scan {
        path: dir.display().to_string(),
        source,
    };

    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(scan_err)? {
        let entry = entry.map_err(scan_err)?;
        let path = entry.path();
        if !is_candidate(&path, extension) {
            continue;
        }
        // A file removed between listing and stat is simply skipped
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((modified, path));
    }

    found.sort_by(|(a_time, a_path), (b_time, b_path)| {
        a_time
            .cmp(b_time)
            .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
    });

    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Watches one inbox directory and reports settled files
pub struct InboxWatcher {
    dir: PathBuf,
    extension: String,
    running: Arc<AtomicBool>,
}

impl InboxWatcher {
    pub fn new(dir: &Path, extension: &str) -> Result<Self, WatchError> {
        if !dir.is_dir() {
            return Err(WatchError::PathNotFound(dir.display().to_string()));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            extension: extension.to_string(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start the notify thread.
    ///
    /// Events are debounced for `settle_delay`, so a path is only reported
    /// once writes to it have been quiet for that long. Resolves once the
    /// thread is watching or has failed to.
    pub async fn start(
        &mut self,
        settle_delay: Duration,
    ) -> Result<mpsc::Receiver<PathBuf>, WatchError> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Err(WatchError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let dir = self.dir.clone();
        let extension = self.extension.clone();
        let running = self.running.clone();

        std::thread::spawn(move || {
            run_watcher(dir, extension, settle_delay, tx, running, ready_tx);
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => {
                self.running.store(false, Ordering::Relaxed);
                Err(e)
            },
            Err(_) => {
                self.running.store(false, Ordering::Relaxed);
                Err(WatchError::ThreadExited)
            },
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for InboxWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocking loop of the notify thread
fn run_watcher(
    dir: PathBuf,
    extension: String,
    settle_delay: Duration,
    tx: mpsc::Sender<PathBuf>,
    running: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), WatchError>>,
) {
    let (debounce_tx, debounce_rx) = std::sync::mpsc::channel::<DebounceEventResult>();

    let mut debouncer = match new_debouncer(settle_delay, None, debounce_tx) {
        Ok(debouncer) => debouncer,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        },
    };

    if let Err(e) = debouncer.watch(&dir, RecursiveMode::NonRecursive) {
        let _ = ready.send(Err(e.into()));
        return;
    }
    if ready.send(Ok(())).is_err() {
        return;
    }
    debug!(inbox = %dir.display(), "Watching inbox");

    while running.load(Ordering::Relaxed) && !tx.is_closed() {
        match debounce_rx.recv_timeout(STOP_POLL_INTERVAL) {
            Ok(Ok(events)) => {
                for path in events.iter().flat_map(|e| settled_paths(e, &extension)) {
                    // A full channel drops the hint; the next rescan finds the file
                    if tx.try_send(path).is_err() && tx.is_closed() {
                        break;
                    }
                }
            },
            Ok(Err(errors)) => {
                for error in errors {
                    warn!(inbox = %dir.display(), error = %error, "Inbox watcher error");
                }
            },
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(inbox = %dir.display(), "Inbox watcher stopped");
}

/// Paths of a debounced event that may now hold a complete input file
fn settled_paths<'a>(
    event: &'a DebouncedEvent,
    extension: &'a str,
) -> impl Iterator<Item = PathBuf> + 'a {
    let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
    event
        .paths
        .iter()
        .filter(move |p| relevant && is_candidate(p, extension))
        .cloned()
}
