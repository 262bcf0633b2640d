#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::normalizer::CanonicalRecord;
use crate::store::LoadError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

const HEADER: &str = "Test_date_time,Profile_id,Patient_id,Test_result,Test_status,Lab_name,\
User_name,Sample_type,Truelab_id,Lot,Chip_serial_no,Raw_data_filename,Ct1,Ct2,Ct3,Bayno,\
Chip_batchno,Result_recieved_date";

fn row(user: &str, chip: &str, ct1: &str) -> String {
    format!(
        "2024-03-01 10:15:00,MTB,P-100,DETECTED,Valid,Lab North,{user},Sputum,TL123-45,LOT7,{chip},run.raw,{ct1},22.5,,B1,CB9,2024-03-01 12:00:00"
    )
}

/// Two valid rows, one exact repeat, one service-account row, one bad chip
fn five_row_file() -> String {
    [
        HEADER.to_string(),
        row("alice", "A1XYZ", "18.2"),
        row("bob", "B2QQ", "19.0"),
        row("Service", "C3", "17.0"),
        row("carol", "12AB", "16.0"),
        row("alice", "A1XYZ", "18.2"),
    ]
    .join("\n")
}

#[derive(Default)]
struct MemoryState {
    ledger: HashMap<(String, String), u64>,
    keys: HashSet<String>,
    rows: Vec<CanonicalRecord>,
    commits: Vec<String>,
    fail_next: VecDeque<LoadError>,
}

/// In-memory store with the same exactly-once contract as the loader
#[derive(Default)]
struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    fn with_committed(inbox: &Path, filename: &str) -> Self {
        let store = Self::default();
        store
            .state
            .lock()
            .unwrap()
            .ledger
            .insert((ledger_inbox_key(inbox), filename.to_string()), 0);
        store
    }

    fn fail_with(&self, err: LoadError) {
        self.state.lock().unwrap().fail_next.push_back(err);
    }

    fn row_count(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    fn ledger_len(&self) -> usize {
        self.state.lock().unwrap().ledger.len()
    }

    fn commits(&self) -> Vec<String> {
        self.state.lock().unwrap().commits.clone()
    }
}

#[async_trait]
impl CommitStore for MemoryStore {
    async fn is_processed(&self, inbox: &str, filename: &str) -> Result<bool, LoadError> {
        let key = (inbox.to_string(), filename.to_string());
        Ok(self.state.lock().unwrap().ledger.contains_key(&key))
    }

    async fn commit(&self, batch: &FileBatch) -> Result<CommitResult, LoadError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.pop_front() {
            return Err(err);
        }
        let key = (batch.inbox.clone(), batch.filename.clone());
        if state.ledger.contains_key(&key) {
            return Ok(CommitResult::AlreadyCommitted);
        }

        let mut inserted = 0;
        for record in &batch.records {
            if state.keys.insert(record.natural_key()) {
                state.rows.push(record.clone());
                inserted += 1;
            }
        }
        state.ledger.insert(key, inserted);
        state.commits.push(batch.filename.clone());

        Ok(CommitResult::Committed {
            inserted,
            duplicates: batch.records.len() as u64 - inserted,
        })
    }
}

struct Fixture {
    inbox: TempDir,
    quarantine: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            inbox: tempfile::tempdir().unwrap(),
            quarantine: tempfile::tempdir().unwrap(),
        }
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            inbox: self.inbox.path().to_path_buf(),
            quarantine: self.quarantine.path().to_path_buf(),
            extension: "csv".to_string(),
            settle_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(100),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(10),
        }
    }

    fn pipeline(&self, store: Arc<MemoryStore>) -> DirectoryPipeline<MemoryStore> {
        DirectoryPipeline::new(self.settings(), store)
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.inbox.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }
}

#[tokio::test]
async fn test_five_row_file_commits_two_records_and_removes_source() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    let path = fx.write("run1.csv", &five_row_file());

    let outcomes = fx
        .pipeline(store.clone())
        .process_backlog(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert_eq!(outcome.state, FileState::Cleaned);
    assert_eq!(outcome.inserted, 2);
    assert_eq!(outcome.duplicates, 1);
    assert_eq!(outcome.rejected, 2);
    assert!(!outcome.already_committed);

    assert!(!path.exists());
    assert_eq!(store.row_count(), 2);
    assert_eq!(store.ledger_len(), 1);
}

#[tokio::test]
async fn test_same_rows_under_new_name_insert_nothing() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    let mut pipeline = fx.pipeline(store.clone());
    let token = CancellationToken::new();

    fx.write("run1.csv", &five_row_file());
    pipeline.process_backlog(&token).await.unwrap();

    fx.write("run1-copy.csv", &five_row_file());
    let outcomes = pipeline.process_backlog(&token).await.unwrap();

    assert_eq!(outcomes[0].state, FileState::Cleaned);
    assert_eq!(outcomes[0].inserted, 0);
    assert_eq!(outcomes[0].duplicates, 3);
    assert_eq!(store.row_count(), 2);
    assert_eq!(store.ledger_len(), 2);
}

#[tokio::test]
async fn test_ledger_entry_removes_leftover_without_reload() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::with_committed(fx.inbox.path(), "run1.csv"));
    let path = fx.write("run1.csv", &five_row_file());

    let outcomes = fx
        .pipeline(store.clone())
        .process_backlog(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcomes[0].state, FileState::Cleaned);
    assert!(outcomes[0].already_committed);
    assert!(!path.exists());
    assert_eq!(store.row_count(), 0);
    assert!(store.commits().is_empty());
}

#[tokio::test]
async fn test_same_file_name_in_two_inboxes_loads_both() {
    let first = Fixture::new();
    let second = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    let token = CancellationToken::new();

    first.write("results.csv", &five_row_file());
    first
        .pipeline(store.clone())
        .process_backlog(&token)
        .await
        .unwrap();

    let other = [HEADER.to_string(), row("dave", "D4", "21.0")].join("\n");
    let path = second.write("results.csv", &other);
    let mut pipeline = second.pipeline(store.clone());
    let outcomes = pipeline.process_backlog(&token).await.unwrap();

    assert_ne!(pipeline.inbox_key(), first.pipeline(store.clone()).inbox_key());
    assert_eq!(outcomes[0].state, FileState::Cleaned);
    assert!(!outcomes[0].already_committed);
    assert_eq!(outcomes[0].inserted, 1);
    assert!(!path.exists());
    assert_eq!(store.row_count(), 3);
    assert_eq!(store.ledger_len(), 2);
    assert_eq!(store.commits(), vec!["results.csv", "results.csv"]);
}

#[tokio::test]
async fn test_malformed_file_is_quarantined_with_reason() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    let path = fx.write("broken.csv", "Patient_id,Lot\nP-1,LOT7\n");

    let outcomes = fx
        .pipeline(store.clone())
        .process_backlog(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcomes[0].state, FileState::Rejected);
    assert!(outcomes[0].detail.as_deref().unwrap().contains("missing"));
    assert!(!path.exists());
    assert!(fx.quarantine.path().join("broken.csv").exists());
    assert!(fx.quarantine.path().join("broken.csv.reason.txt").exists());
    assert_eq!(store.ledger_len(), 0);
}

#[tokio::test]
async fn test_failed_load_leaves_file_and_retries_after_backoff() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    store.fail_with(LoadError::Timeout(Duration::from_secs(60)));
    let path = fx.write("run1.csv", &five_row_file());
    let mut pipeline = fx.pipeline(store.clone());
    let token = CancellationToken::new();

    let outcomes = pipeline.process_backlog(&token).await.unwrap();
    assert_eq!(outcomes[0].state, FileState::Failed);
    assert_eq!(outcomes[0].retry_in, Some(Duration::from_millis(10)));
    assert!(path.exists());
    assert_eq!(store.ledger_len(), 0);
    assert_eq!(store.row_count(), 0);

    // Not due yet
    assert!(pipeline.next_retry_at().is_some());
    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcomes = pipeline.process_backlog(&token).await.unwrap();
    assert_eq!(outcomes[0].state, FileState::Cleaned);
    assert!(!path.exists());
    assert_eq!(store.row_count(), 2);
    assert!(pipeline.next_retry_at().is_none());
}

#[tokio::test]
async fn test_unreadable_inbox_defers_pending_retries_to_next_poll() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    store.fail_with(LoadError::Timeout(Duration::from_secs(1)));
    fx.write("run1.csv", &five_row_file());
    let mut pipeline = fx.pipeline(store.clone());
    let token = CancellationToken::new();

    let outcomes = pipeline.process_backlog(&token).await.unwrap();
    assert_eq!(outcomes[0].state, FileState::Failed);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(pipeline.next_retry_at().unwrap() <= Instant::now());

    fs::remove_dir_all(fx.inbox.path()).unwrap();
    let before = Instant::now();
    pipeline.rescan_logged();

    let retry_at = pipeline.next_retry_at().unwrap();
    assert!(retry_at >= before + fx.settings().poll_interval);
}

/// Counts error-level events
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[tokio::test]
async fn test_run_with_vanished_inbox_waits_between_rescans() {
    let errors = Arc::new(AtomicUsize::new(0));
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(ErrorCounter(errors.clone())),
    );

    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    store.fail_with(LoadError::Timeout(Duration::from_secs(1)));
    let path = fx.write("run1.csv", &five_row_file());
    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(60))
        .unwrap();
    let mut settings = fx.settings();
    settings.settle_delay = Duration::from_millis(50);
    settings.retry_base_delay = Duration::from_millis(150);
    let pipeline = DirectoryPipeline::new(settings, store.clone());
    let token = CancellationToken::new();

    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::remove_dir_all(fx.inbox.path()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(pipeline.run(token.clone()), stop);

    result.unwrap();
    assert!(store.commits().is_empty());
    // Roughly one failed rescan per poll interval
    let failed_rescans = errors.load(Ordering::Relaxed);
    assert!(failed_rescans >= 1);
    assert!(failed_rescans <= 20, "{failed_rescans} failed rescans in 500ms");
}

#[tokio::test]
async fn test_quarantine_without_reason_note_is_still_rejected() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    fs::create_dir(fx.quarantine.path().join("broken.csv.reason.txt")).unwrap();
    let path = fx.write("broken.csv", "Patient_id,Lot\nP-1,LOT7\n");
    let mut pipeline = fx.pipeline(store.clone());

    let outcome = pipeline.process_file(&path).await.unwrap();

    assert_eq!(outcome.state, FileState::Rejected);
    assert!(outcome.retry_in.is_none());
    assert!(pipeline.next_retry_at().is_none());
    assert!(!path.exists());
    assert!(fx.quarantine.path().join("broken.csv").exists());
}

#[tokio::test]
async fn test_repeated_identical_constraint_failure_quarantines() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    for _ in 0..3 {
        store.fail_with(LoadError::Constraint {
            code: "23514".to_string(),
            message: "check constraint violated".to_string(),
        });
    }
    let path = fx.write("run1.csv", &five_row_file());
    let mut pipeline = fx.pipeline(store.clone());

    let first = pipeline.process_file(&path).await.unwrap();
    let second = pipeline.process_file(&path).await.unwrap();
    assert_eq!(first.state, FileState::Failed);
    assert_eq!(second.state, FileState::Failed);
    assert!(path.exists());

    let third = pipeline.process_file(&path).await.unwrap();
    assert_eq!(third.state, FileState::Rejected);
    assert!(!path.exists());
    assert!(fx.quarantine.path().join("run1.csv").exists());
    assert_eq!(store.ledger_len(), 0);
}

#[tokio::test]
async fn test_transient_failures_never_quarantine() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    for _ in 0..5 {
        store.fail_with(LoadError::Timeout(Duration::from_secs(1)));
    }
    let path = fx.write("run1.csv", &five_row_file());
    let mut pipeline = fx.pipeline(store.clone());

    for _ in 0..5 {
        let outcome = pipeline.process_file(&path).await.unwrap();
        assert_eq!(outcome.state, FileState::Failed);
    }
    assert!(path.exists());

    let outcome = pipeline.process_file(&path).await.unwrap();
    assert_eq!(outcome.state, FileState::Cleaned);
}

#[tokio::test]
async fn test_backlog_is_processed_oldest_first() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    let mut mtime = 1_000;
    for (name, user) in [("b.csv", "u1"), ("a.csv", "u2"), ("c.csv", "u3")] {
        let content = [HEADER.to_string(), row(user, "A1", "1")].join("\n");
        let path = fx.write(name, &content);
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime))
            .unwrap();
        mtime += 10;
    }

    fx.pipeline(store.clone())
        .process_backlog(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.commits(), vec!["b.csv", "a.csv", "c.csv"]);
}

#[tokio::test]
async fn test_cancelled_pipeline_leaves_queue_untouched() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    let path = fx.write("run1.csv", &five_row_file());
    let token = CancellationToken::new();
    token.cancel();

    let mut pipeline = fx.pipeline(store.clone());
    let outcomes = pipeline.process_backlog(&token).await.unwrap();

    assert!(outcomes.is_empty());
    assert_eq!(pipeline.pending(), 1);
    assert!(path.exists());
}

#[tokio::test]
async fn test_queue_deduplicates_paths() {
    let fx = Fixture::new();
    let mut pipeline = fx.pipeline(Arc::new(MemoryStore::default()));
    let path = fx.inbox.path().join("run1.csv");

    assert!(pipeline.enqueue(path.clone()));
    assert!(!pipeline.enqueue(path));
    assert_eq!(pipeline.pending(), 1);
}

#[tokio::test]
async fn test_unsettled_file_is_deferred() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    let path = fx.write("run1.csv", &five_row_file());
    let mut settings = fx.settings();
    settings.settle_delay = Duration::from_secs(3600);
    let mut pipeline = DirectoryPipeline::new(settings, store.clone());

    assert!(pipeline.process_file(&path).await.is_none());
    assert!(path.exists());
    assert!(store.commits().is_empty());
}

#[tokio::test]
async fn test_run_picks_up_new_files_until_cancelled() {
    let fx = Fixture::new();
    let store = Arc::new(MemoryStore::default());
    let mut settings = fx.settings();
    settings.settle_delay = Duration::from_millis(50);
    let pipeline = DirectoryPipeline::new(settings, store.clone());
    let token = CancellationToken::new();
    let handle = tokio::spawn(pipeline.run(token.clone()));

    let path = fx.write("live.csv", &five_row_file());
    let deadline = Instant::now() + Duration::from_secs(10);
    while path.exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    token.cancel();
    handle.await.unwrap().unwrap();

    assert!(!path.exists());
    assert_eq!(store.commits(), vec!["live.csv"]);
}

#[test]
fn test_backoff_cap_is_eight_poll_intervals() {
    let fx = Fixture::new();
    assert_eq!(fx.settings().backoff_cap(), Duration::from_millis(800));
}
