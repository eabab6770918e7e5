//! End-to-end worker tests against the mock upload adapter
//!
//! These drive the worker step by step with synthetic timestamps, so pacing
//! and backoff behavior is exercised without real sleeping.

use libdriftpost::commands::Command;
use libdriftpost::config::{Config, LibraryConfig, StateConfig, VaultConfig};
use libdriftpost::error::UploadError;
use libdriftpost::store::StateStore;
use libdriftpost::types::MediaStatus;
use libdriftpost::uploader::{MockUploader, Uploader};
use libdriftpost::vault::{Credentials, VaultKey};
use libdriftpost::worker::{StepOutcome, UploadWorker};
use std::path::PathBuf;
use tempfile::TempDir;

const T0: i64 = 1_700_000_000;

struct TestEnv {
    root: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::default_config();
        config.library = LibraryConfig {
            media_dir: self.root.path().join("media").display().to_string(),
            uploaded_dir: self.root.path().join("media/uploaded").display().to_string(),
        };
        config.state = StateConfig {
            dir: self.root.path().join("state").display().to_string(),
        };
        config.session.file = self.root.path().join("session.age").display().to_string();
        config.vault = VaultConfig {
            credentials_file: self.root.path().join("credentials.age").display().to_string(),
        };
        config
    }

    fn drop_media(&self, name: &str, content: &[u8]) -> PathBuf {
        let dir = self.root.path().join("media");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn worker_with(&self, config: Config, uploader: Box<dyn Uploader>) -> UploadWorker {
        UploadWorker::new(
            config,
            uploader,
            Credentials::new("poster".to_string(), "pw-123456".to_string()),
            Some(VaultKey::new("integration-test-key".to_string()).unwrap()),
        )
        .unwrap()
    }

    fn store(&self) -> StateStore {
        StateStore::open(&self.root.path().join("state")).unwrap()
    }
}

fn fixed_cooldown(config: &mut Config, secs: u64) {
    config.pacing.min_success_delay_secs = secs;
    config.pacing.max_success_delay_secs = secs;
}

#[tokio::test]
async fn test_fifo_upload_with_cooldown_between_items() {
    let env = TestEnv::new();
    env.drop_media("a.png", b"content-a");
    env.drop_media("b.png", b"content-b");
    env.drop_media("c.png", b"content-c");

    let mock = MockUploader::success();
    let recorder = mock.recorder_handle();
    let mut worker = env.worker_with(env.config(), Box::new(mock));
    let mut snapshots = worker.snapshots();

    worker.startup(T0).unwrap();
    assert_eq!(snapshots.borrow_and_update().backlog.len(), 3);

    // First item goes out immediately
    assert_eq!(worker.step(T0).await.unwrap(), StepOutcome::Dispatched);
    assert_eq!(recorder.published().len(), 1);

    let snapshot = snapshots.borrow_and_update().clone();
    let next_allowed = snapshot.pacing.next_allowed_at;
    assert!(next_allowed >= T0 + 300 && next_allowed <= T0 + 900);
    assert_eq!(snapshot.backlog.len(), 2);

    // The cooldown holds the rest of the backlog
    match worker.step(T0 + 1).await.unwrap() {
        StepOutcome::Idle { wake_at } => assert_eq!(wake_at, Some(next_allowed)),
        other => panic!("cooldown must hold the queue, got {:?}", other),
    }
    assert_eq!(recorder.published().len(), 1);

    // At the window boundary the second item goes out
    assert_eq!(
        worker.step(next_allowed).await.unwrap(),
        StepOutcome::Dispatched
    );
    assert_eq!(recorder.published().len(), 2);

    // Filename order is scan order
    let history = env.store().load_history().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].filename, "a.png");
    assert_eq!(history[1].filename, "b.png");
}

#[tokio::test]
async fn test_uploaded_file_moves_out_of_library() {
    let env = TestEnv::new();
    let path = env.drop_media("a.png", b"content-a");

    let mut worker = env.worker_with(env.config(), Box::new(MockUploader::success()));
    worker.startup(T0).unwrap();
    worker.step(T0).await.unwrap();

    assert!(!path.exists(), "uploaded file must leave the library");
    assert!(env
        .root
        .path()
        .join("media/uploaded/a.png")
        .exists());

    // A rescan must not rediscover it
    worker.inbox().push(Command::Rescan);
    let mut snapshots = worker.snapshots();
    worker.step(T0 + 1).await.unwrap();
    assert!(snapshots.borrow_and_update().backlog.is_empty());
}

#[tokio::test]
async fn test_due_schedule_entry_preempts_cooldown() {
    let env = TestEnv::new();
    env.drop_media("backlog.png", b"content-backlog");
    let scheduled_path = env.drop_media("launch.png", b"content-launch");

    let mut config = env.config();
    fixed_cooldown(&mut config, 3600);

    let mock = MockUploader::success();
    let recorder = mock.recorder_handle();
    let mut worker = env.worker_with(config, Box::new(mock));

    worker.startup(T0).unwrap();
    worker.inbox().push(Command::ScheduleAt {
        path: scheduled_path,
        target_at: T0 + 120,
        one_shot: true,
    });

    // Backlog item first; success opens a one-hour cooldown
    assert_eq!(worker.step(T0).await.unwrap(), StepOutcome::Dispatched);

    // The pinned entry still fires on time, inside the cooldown
    assert_eq!(
        worker.step(T0 + 120).await.unwrap(),
        StepOutcome::Dispatched
    );
    assert_eq!(recorder.published().len(), 2);

    let history = env.store().load_history().unwrap();
    assert_eq!(history[1].filename, "launch.png");
}

#[tokio::test]
async fn test_transient_failures_then_success_single_record() {
    let env = TestEnv::new();
    env.drop_media("a.png", b"content-a");

    let mock = MockUploader::success();
    mock.push_outcome(Err(UploadError::Transient("timeout".to_string())));
    mock.push_outcome(Err(UploadError::Transient("reset".to_string())));
    mock.push_outcome(Ok("remote-9".to_string()));

    let mut worker = env.worker_with(env.config(), Box::new(mock));
    let mut snapshots = worker.snapshots();
    worker.startup(T0).unwrap();

    let mut now = T0;
    for _ in 0..2 {
        assert_eq!(worker.step(now).await.unwrap(), StepOutcome::Dispatched);
        let snapshot = snapshots.borrow_and_update().clone();
        // Item requeued, nothing in history yet
        assert_eq!(snapshot.backlog.len(), 1);
        assert!(snapshot.pacing.next_allowed_at > now, "backoff must gate");
        now = snapshot.pacing.next_allowed_at;
    }

    assert_eq!(worker.step(now).await.unwrap(), StepOutcome::Dispatched);

    let history = env.store().load_history().unwrap();
    assert_eq!(history.len(), 1, "retries collapse into one record");
    assert!(history[0].outcome.is_success());
    assert_eq!(history[0].attempts, 3);

    let snapshot = snapshots.borrow_and_update().clone();
    assert!(snapshot.backlog.is_empty());
    assert_eq!(snapshot.pacing.backoff_level, 0, "success resets backoff");
}

#[tokio::test]
async fn test_terminal_failure_keeps_file_and_records_failure() {
    let env = TestEnv::new();
    let path = env.drop_media("bad.png", b"content-bad");

    let mock = MockUploader::success();
    mock.push_outcome(Err(UploadError::Terminal("media rejected".to_string())));

    let mut worker = env.worker_with(env.config(), Box::new(mock));
    let mut snapshots = worker.snapshots();
    worker.startup(T0).unwrap();

    assert_eq!(worker.step(T0).await.unwrap(), StepOutcome::Dispatched);

    let history = env.store().load_history().unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].outcome.is_success());
    assert_eq!(history[0].attempts, 1);

    assert!(path.exists(), "failed media stays in the library");
    assert!(snapshots.borrow_and_update().backlog.is_empty());

    // A rescan must not re-admit it: the Failure record is terminal
    worker.inbox().push(Command::Rescan);
    worker.step(T0 + 1).await.unwrap();
    assert!(snapshots.borrow_and_update().backlog.is_empty());
}

#[tokio::test]
async fn test_auth_rejection_never_publishes_and_requeues() {
    let env = TestEnv::new();
    env.drop_media("a.png", b"content-a");

    let mock = MockUploader::auth_failure();
    let recorder = mock.recorder_handle();
    let mut worker = env.worker_with(env.config(), Box::new(mock));
    let mut snapshots = worker.snapshots();
    worker.startup(T0).unwrap();

    assert_eq!(worker.step(T0).await.unwrap(), StepOutcome::Dispatched);

    assert_eq!(recorder.publish_calls(), 0, "no session, no publish");
    assert!(env.store().load_history().unwrap().is_empty());

    let snapshot = snapshots.borrow_and_update().clone();
    assert_eq!(snapshot.backlog.len(), 1, "item survives the auth failure");
    assert_eq!(snapshot.backlog[0].status, MediaStatus::Pending);
    assert!(snapshot.pacing.backoff_level > 0);
}

#[tokio::test]
async fn test_repeated_auth_rejections_do_not_consume_item() {
    let env = TestEnv::new();
    env.drop_media("a.png", b"content-a");

    let mut config = env.config();
    config.pacing.max_attempts = 3;

    let mock = MockUploader::auth_failure();
    let recorder = mock.recorder_handle();
    let mut worker = env.worker_with(config, Box::new(mock));
    let mut snapshots = worker.snapshots();
    worker.startup(T0).unwrap();

    // Drive well past the attempt cap; the platform never sees the item,
    // so no cycle may count against it
    let mut now = T0;
    for _ in 0..5 {
        assert_eq!(worker.step(now).await.unwrap(), StepOutcome::Dispatched);
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.backlog.len(), 1, "item must survive every cycle");
        assert_eq!(snapshot.backlog[0].attempts, 0, "attempt not charged");
        now = snapshot.pacing.next_allowed_at;
    }

    assert_eq!(recorder.publish_calls(), 0);
    assert!(
        env.store().load_history().unwrap().is_empty(),
        "a never-published item must not get a terminal record"
    );

    // Operator fixes the password: the same item publishes normally
    let mock = MockUploader::success();
    let recorder = mock.recorder_handle();
    let mut worker = env.worker_with(env.config(), Box::new(mock));
    worker.startup(now).unwrap();
    assert_eq!(worker.step(now).await.unwrap(), StepOutcome::Dispatched);
    assert_eq!(recorder.published().len(), 1);

    let history = env.store().load_history().unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].outcome.is_success());
    assert_eq!(history[0].attempts, 1, "only the real attempt counts");
}

#[tokio::test]
async fn test_stale_persisted_session_falls_back_to_fresh_login() {
    let env = TestEnv::new();
    env.drop_media("a.png", b"content-a");

    // First run establishes and persists a session
    {
        let mut worker = env.worker_with(env.config(), Box::new(MockUploader::success()));
        worker.startup(T0).unwrap();
        worker.step(T0).await.unwrap();
    }
    assert!(env.root.path().join("session.age").exists());

    // Second run: the platform rejects the persisted token; the worker
    // logs in fresh and still publishes
    env.drop_media("b.png", b"content-b");
    let mock = MockUploader::stale_session();
    let recorder = mock.recorder_handle();
    let mut worker = env.worker_with(env.config(), Box::new(mock));
    worker.startup(T0 + 1000).unwrap();

    assert_eq!(
        worker.step(T0 + 1000).await.unwrap(),
        StepOutcome::Dispatched
    );
    assert_eq!(recorder.published().len(), 1);
}

#[tokio::test]
async fn test_duplicate_content_uploaded_once() {
    let env = TestEnv::new();
    env.drop_media("a.png", b"same-pixels");
    env.drop_media("a-copy.png", b"same-pixels");

    let mock = MockUploader::success();
    let recorder = mock.recorder_handle();
    let mut worker = env.worker_with(env.config(), Box::new(mock));
    let mut snapshots = worker.snapshots();
    worker.startup(T0).unwrap();

    assert_eq!(snapshots.borrow_and_update().backlog.len(), 1);

    worker.step(T0).await.unwrap();
    assert_eq!(recorder.published().len(), 1);

    // The copy still in the library shares the uploaded content id and
    // must never be admitted
    worker.inbox().push(Command::Rescan);
    worker.step(T0 + 1).await.unwrap();
    assert!(snapshots.borrow_and_update().backlog.is_empty());
}
