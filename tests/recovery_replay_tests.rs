//! Crash recovery: persisted messages replay exactly once, in persisted
//! order, with per-job serialization intact.
//! Testing library/framework: Rust built-in test framework with Tokio async
//! runtime (#[tokio::test]) and tempfile scratch directories.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;

use dockhand::dispatch::{ExecutionOutcome, JobDispatcher, MessageExecutor};
use dockhand::recovery::Recovery;
use dockhand::state::{Job, JobStatus, MessageKind, QueuedMessage, StateStore};

struct RecordingExecutor {
    log: AsyncMutex<Vec<String>>,
    delay: Duration,
}

impl RecordingExecutor {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            log: AsyncMutex::new(Vec::new()),
            delay,
        })
    }

    async fn log_snapshot(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl MessageExecutor for RecordingExecutor {
    async fn execute(&self, message: &QueuedMessage) -> ExecutionOutcome {
        self.log
            .lock()
            .await
            .push(format!("start:{}", message.message_id));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log
            .lock()
            .await
            .push(format!("end:{}", message.message_id));
        ExecutionOutcome::Continue
    }
}

fn message(job: &str, id: &str) -> QueuedMessage {
    QueuedMessage {
        message_id: id.to_string(),
        job_id: job.to_string(),
        kind: MessageKind::UserMessage,
        payload: serde_json::json!({"prompt": "p"}),
        received_at: chrono::Utc::now(),
    }
}

/// Seed messages [J1-a, J2-a, J1-b], "crash" (drop the store), restart, and
/// verify the replay: all three run exactly once, and J1's messages stay
/// strictly serial even with two worker slots.
#[tokio::test]
async fn replay_preserves_persisted_order_and_per_job_serialization() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = StateStore::load(&path).await.unwrap();
        store.persist_queued_message(&message("J1", "J1-a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.persist_queued_message(&message("J2", "J2-a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.persist_queued_message(&message("J1", "J1-b")).await.unwrap();
        // Dropped without acknowledging anything: the crash.
    }

    let store = Arc::new(StateStore::load(&path).await.unwrap());
    let exec = RecordingExecutor::new(Duration::from_millis(20));
    let dispatcher = JobDispatcher::new(2, exec.clone(), Arc::clone(&store));

    let report = Recovery::new(Arc::clone(&store), Arc::clone(&dispatcher), None)
        .run()
        .await
        .unwrap();
    assert_eq!(report.replayed, 3);

    dispatcher.shutdown().await;

    let log = exec.log_snapshot().await;
    assert_eq!(log.len(), 6, "each message ran exactly once: {log:?}");

    let pos = |needle: &str| log.iter().position(|l| l == needle).unwrap();
    // Strict serialization within J1: a finished before b started. Across
    // J1 and J2 no ordering is guaranteed, and none is asserted.
    assert!(pos("end:J1-a") < pos("start:J1-b"), "J1 overlapped itself: {log:?}");

    // Acknowledged messages left the store; nothing replays twice.
    assert!(store.queued_messages_snapshot().await.is_empty());
}

#[tokio::test]
async fn recovery_clears_vanished_worktrees_and_resumes_in_progress_jobs() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::load(dir.path().join("state.json")).await.unwrap());

    let mut stuck = Job::new("J1");
    stuck.status = JobStatus::InProgress;
    stuck.worktree_path = Some(dir.path().join("does-not-exist"));
    store.upsert_job(stuck).await.unwrap();

    let mut done = Job::new("J2");
    done.status = JobStatus::Completed;
    store.upsert_job(done).await.unwrap();

    let exec = RecordingExecutor::new(Duration::ZERO);
    let dispatcher = JobDispatcher::new(1, exec, Arc::clone(&store));
    let report = Recovery::new(Arc::clone(&store), dispatcher, None)
        .run()
        .await
        .unwrap();

    assert_eq!(report.cleared_worktrees, 1);
    assert_eq!(report.dropped_terminal, 1);

    let job = store.get_job("J1").await.unwrap();
    assert_eq!(job.status, JobStatus::AwaitingInput);
    assert!(job.worktree_path.is_none());
    assert!(store.get_job("J2").await.is_none());
}

/// Dispatching the same message twice must not double-execute state: the
/// second delivery re-runs the executor, which is a no-op continuation by
/// the session model, and leaves the store clean.
#[tokio::test]
async fn duplicate_dispatch_leaves_store_clean() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::load(dir.path().join("state.json")).await.unwrap());
    let exec = RecordingExecutor::new(Duration::ZERO);
    let dispatcher = JobDispatcher::new(1, exec.clone(), Arc::clone(&store));

    let msg = message("J1", "dup");
    store.persist_queued_message(&msg).await.unwrap();
    dispatcher.dispatch(msg.clone());
    dispatcher.dispatch(msg);
    dispatcher.shutdown().await;

    assert_eq!(exec.log_snapshot().await.len(), 4); // two runs, both harmless
    assert!(store.queued_messages_snapshot().await.is_empty());
}
