//! Per-job sequencing over a shared bounded worker pool.
//!
//! Every job owns a private FIFO of pending messages. A job submits at most
//! one drain task at a time; the task occupies one worker slot until the
//! job's queue runs dry. Ordering within a job is absolute, concurrency
//! across jobs is bounded by the pool.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::state::{QueuedMessage, StateStore};

/// Queue key for strictly process-serial work (token refresh and similar)
/// that must never interleave with itself.
pub const PROCESS_JOB_KEY: &str = "__process";

/// Size of the instant pool that keeps idle checks off the blocking pool.
pub const INSTANT_POOL_SIZE: usize = 5;

/// What the executor tells the dispatcher after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Keep draining this job's queue.
    Continue,
    /// The control plane declared the job lost: poison the job id and
    /// discard whatever is still queued for it.
    Evict,
}

/// Seam between the dispatcher and the job executor.
#[async_trait]
pub trait MessageExecutor: Send + Sync + 'static {
    async fn execute(&self, message: &QueuedMessage) -> ExecutionOutcome;
}

#[derive(Default)]
struct DispatchInner {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    running: HashSet<String>,
    evicted: HashSet<String>,
    accepting: bool,
}

pub struct JobDispatcher {
    inner: Mutex<DispatchInner>,
    slots: Arc<Semaphore>,
    executor: Arc<dyn MessageExecutor>,
    store: Arc<StateStore>,
    tracker: TaskTracker,
}

impl JobDispatcher {
    pub fn new(
        max_concurrency: usize,
        executor: Arc<dyn MessageExecutor>,
        store: Arc<StateStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(DispatchInner {
                accepting: true,
                ..Default::default()
            }),
            slots: Arc::new(Semaphore::new(max_concurrency.max(1))),
            executor,
            store,
            tracker: TaskTracker::new(),
        })
    }

    /// Enqueue a message on its job's FIFO and make sure a drain task is
    /// running for that job. Never blocks on execution.
    pub fn dispatch(self: &Arc<Self>, msg: QueuedMessage) {
        let job_id = msg.job_id.clone();
        let spawn_drain = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.accepting {
                // Persisted copy survives; the next boot replays it.
                warn!(job_id = %job_id, "dispatcher is shutting down, deferring message to next start");
                return;
            }
            if inner.evicted.contains(&job_id) {
                debug!(job_id = %job_id, message_id = %msg.message_id, "dropping message for evicted job");
                let store = Arc::clone(&self.store);
                let message_id = msg.message_id.clone();
                let evicted_job = job_id.clone();
                tokio::spawn(async move {
                    let _ = store.remove_queued_message(&evicted_job, &message_id).await;
                });
                return;
            }
            inner.queues.entry(job_id.clone()).or_default().push_back(msg);
            inner.running.insert(job_id.clone())
        };
        if spawn_drain {
            self.spawn_drain_task(job_id);
        }
    }

    fn spawn_drain_task(self: &Arc<Self>, job_id: String) {
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            let permit = this.slots.clone().acquire_owned().await;
            if permit.is_err() {
                return;
            }
            loop {
                let next = this.pop_next(&job_id);
                let Some(msg) = next else { return };

                let outcome = this.executor.execute(&msg).await;

                // The persisted copy is removed only after the executor
                // acknowledged the message; a crash in between replays it.
                if let Err(e) = this.store.remove_queued_message(&msg.job_id, &msg.message_id).await {
                    warn!(
                        job_id = %msg.job_id,
                        message_id = %msg.message_id,
                        error = %e,
                        "failed to remove acknowledged message from state"
                    );
                }

                if outcome == ExecutionOutcome::Evict {
                    this.mark_evicted(&job_id).await;
                    return;
                }
            }
        });
    }

    /// Pop the job's next message, or clear its running flag and finish the
    /// drain. Both happen under one lock so no message can slip between
    /// "queue looked empty" and "flag cleared".
    fn pop_next(&self, job_id: &str) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock().unwrap();
        if inner.evicted.contains(job_id) {
            inner.queues.remove(job_id);
            inner.running.remove(job_id);
            return None;
        }
        match inner.queues.get_mut(job_id).and_then(VecDeque::pop_front) {
            Some(msg) => Some(msg),
            None => {
                inner.queues.remove(job_id);
                inner.running.remove(job_id);
                None
            }
        }
    }

    /// Poison a job id: future dispatches drop, the queued remainder (memory
    /// and disk) is discarded.
    pub async fn mark_evicted(&self, job_id: &str) {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            inner.evicted.insert(job_id.to_string());
            inner.running.remove(job_id);
            inner.queues.remove(job_id).map(|q| q.len()).unwrap_or(0)
        };
        info!(job_id, dropped, "job evicted, remaining queue discarded");
        if let Err(e) = self.store.remove_job_messages(job_id).await {
            warn!(job_id, error = %e, "failed to drop persisted queue of evicted job");
        }
    }

    pub fn is_evicted(&self, job_id: &str) -> bool {
        self.inner.lock().unwrap().evicted.contains(job_id)
    }

    /// Stop accepting dispatches and wait for in-flight drain tasks.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.accepting = false;
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("dispatcher drained");
    }
}

/// Small parallel pool for short background checks that must not queue
/// behind long conversation turns.
pub struct InstantPool {
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl InstantPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(size.max(1))),
            tracker: TaskTracker::new(),
        })
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        self.tracker.spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            fut.await;
        });
    }

    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MessageKind;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    /// Records execution order and can stall to expose interleaving.
    struct RecordingExecutor {
        log: AsyncMutex<Vec<String>>,
        delay: Duration,
        evict_on: Option<String>,
    }

    impl RecordingExecutor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                log: AsyncMutex::new(Vec::new()),
                delay,
                evict_on: None,
            })
        }

        fn evicting(message_id: &str) -> Arc<Self> {
            Arc::new(Self {
                log: AsyncMutex::new(Vec::new()),
                delay: Duration::ZERO,
                evict_on: Some(message_id.to_string()),
            })
        }

        async fn log_snapshot(&self) -> Vec<String> {
            self.log.lock().await.clone()
        }
    }

    #[async_trait]
    impl MessageExecutor for RecordingExecutor {
        async fn execute(&self, message: &QueuedMessage) -> ExecutionOutcome {
            self.log.lock().await.push(format!("start:{}", message.message_id));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.log.lock().await.push(format!("end:{}", message.message_id));
            if self.evict_on.as_deref() == Some(message.message_id.as_str()) {
                ExecutionOutcome::Evict
            } else {
                ExecutionOutcome::Continue
            }
        }
    }

    async fn store() -> (TempDir, Arc<StateStore>) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).await.unwrap();
        (dir, Arc::new(store))
    }

    fn msg(job: &str, id: &str) -> QueuedMessage {
        QueuedMessage {
            message_id: id.to_string(),
            job_id: job.to_string(),
            kind: MessageKind::UserMessage,
            payload: serde_json::Value::Null,
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn within_a_job_messages_never_overlap() {
        let (_dir, store) = store().await;
        let exec = RecordingExecutor::new(Duration::from_millis(20));
        let dispatcher = JobDispatcher::new(4, exec.clone(), store);

        for id in ["a", "b", "c"] {
            dispatcher.dispatch(msg("j1", id));
        }
        dispatcher.shutdown().await;

        let log = exec.log_snapshot().await;
        assert_eq!(
            log,
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );
    }

    #[tokio::test]
    async fn distinct_jobs_interleave_when_slots_allow() {
        let (_dir, store) = store().await;
        let exec = RecordingExecutor::new(Duration::from_millis(50));
        let dispatcher = JobDispatcher::new(2, exec.clone(), store);

        dispatcher.dispatch(msg("j1", "a"));
        dispatcher.dispatch(msg("j2", "b"));
        dispatcher.shutdown().await;

        let log = exec.log_snapshot().await;
        // Both started before either finished.
        let first_end = log.iter().position(|l| l.starts_with("end")).unwrap();
        assert_eq!(first_end, 2, "expected both jobs to start concurrently: {log:?}");
    }

    #[tokio::test]
    async fn single_slot_serializes_across_jobs() {
        let (_dir, store) = store().await;
        let exec = RecordingExecutor::new(Duration::from_millis(10));
        let dispatcher = JobDispatcher::new(1, exec.clone(), store);

        dispatcher.dispatch(msg("j1", "a"));
        dispatcher.dispatch(msg("j2", "b"));
        dispatcher.shutdown().await;

        let log = exec.log_snapshot().await;
        // Degenerates to one global FIFO: no starts nested inside another run.
        for pair in log.chunks(2) {
            assert!(pair[0].starts_with("start:"));
            assert!(pair[1].starts_with("end:"));
            assert_eq!(pair[0][6..], pair[1][4..]);
        }
    }

    #[tokio::test]
    async fn eviction_poisons_job_and_discards_queue() {
        let (_dir, store) = store().await;
        let exec = RecordingExecutor::evicting("boom");
        let dispatcher = JobDispatcher::new(1, exec.clone(), Arc::clone(&store));

        let doomed = msg("j1", "late");
        store.persist_queued_message(&doomed).await.unwrap();

        dispatcher.dispatch(msg("j1", "boom"));
        dispatcher.dispatch(doomed);
        // Queue settles before shutdown so the drop path runs.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.is_evicted("j1"));
        dispatcher.dispatch(msg("j1", "after"));
        dispatcher.shutdown().await;

        let log = exec.log_snapshot().await;
        assert_eq!(log, vec!["start:boom", "end:boom"]);
        assert!(store.queued_messages_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn acknowledged_messages_leave_the_store() {
        let (_dir, store) = store().await;
        let exec = RecordingExecutor::new(Duration::ZERO);
        let dispatcher = JobDispatcher::new(1, exec, Arc::clone(&store));

        let m = msg("j1", "a");
        store.persist_queued_message(&m).await.unwrap();
        dispatcher.dispatch(m);
        dispatcher.shutdown().await;

        assert!(store.queued_messages_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_dispatches() {
        let (_dir, store) = store().await;
        let exec = RecordingExecutor::new(Duration::ZERO);
        let dispatcher = JobDispatcher::new(1, exec.clone(), store);

        dispatcher.shutdown().await;
        dispatcher.dispatch(msg("j1", "a"));
        // Nothing ran.
        assert!(exec.log_snapshot().await.is_empty());
    }
}
