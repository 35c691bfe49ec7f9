use std::sync::Arc;
use tracing::{debug, warn};

use super::events::EventEnvelope;
use crate::dispatch::{InstantPool, JobDispatcher, MessageExecutor, PROCESS_JOB_KEY};
use crate::state::{log_dropped_message, MessageKind, QueuedMessage, StateStore};

/// Routes inbound control-plane events to their execution lane.
///
/// Conversation kinds are persisted first and flow through the per-job FIFO;
/// idle checks jump to the instant pool so they never queue behind a long
/// conversation; everything else runs process-serial under a synthetic key.
pub struct MessageRouter {
    store: Arc<StateStore>,
    dispatcher: Arc<JobDispatcher>,
    instant: Arc<InstantPool>,
    executor: Arc<dyn MessageExecutor>,
}

impl MessageRouter {
    pub fn new(
        store: Arc<StateStore>,
        dispatcher: Arc<JobDispatcher>,
        instant: Arc<InstantPool>,
        executor: Arc<dyn MessageExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatcher,
            instant,
            executor,
        })
    }

    pub async fn route(&self, envelope: EventEnvelope) {
        let kind: MessageKind = match envelope.kind.parse() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(event_id = %envelope.id, error = %e, "ignoring inbound event");
                return;
            }
        };

        if kind == MessageKind::CheckIdleJobs {
            // Not persisted: an idle scan is worthless after a restart.
            let msg = QueuedMessage::new(PROCESS_JOB_KEY, kind, envelope.payload);
            let executor = Arc::clone(&self.executor);
            self.instant.spawn(async move {
                let _ = executor.execute(&msg).await;
            });
            return;
        }

        let msg = if kind.is_job_scoped() {
            let Some(job_id) = envelope.job_id().map(str::to_string) else {
                warn!(
                    event_id = %envelope.id,
                    kind = kind.as_str(),
                    "job-scoped event carries no jobId, dropping"
                );
                return;
            };
            QueuedMessage::new(job_id, kind, envelope.payload)
        } else {
            // Process-serial work (token refresh and friends) shares one
            // queue so it stays strictly ordered.
            QueuedMessage::new(PROCESS_JOB_KEY, kind, envelope.payload)
        };

        // Persistence gates dispatch: a message that cannot be made durable
        // is never executed.
        if let Err(e) = self.store.persist_queued_message(&msg).await {
            log_dropped_message(&msg, &e);
            return;
        }

        debug!(
            job_id = %msg.job_id,
            message_id = %msg.message_id,
            kind = kind.as_str(),
            "inbound message persisted and dispatched"
        );
        self.dispatcher.dispatch(msg);
    }
}
