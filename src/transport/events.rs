use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::state::JobStatus;

/// Event channel both directions share on the socket.
pub const MESSAGE_CHANNEL: &str = "cc_message";

/// The `{id, type, payload}` shape every control-plane event carries.
/// Payload schemas belong to the control plane and pass through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
        }
    }

    /// Job id referenced by the payload, when the kind is job-scoped.
    pub fn job_id(&self) -> Option<&str> {
        self.payload.get("jobId").and_then(|v| v.as_str())
    }
}

/// One socket frame: `{"event": "cc_message", "data": {id, type, payload}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    event: String,
    data: EventEnvelope,
}

/// Parse an inbound text frame; frames on other channels yield `None`.
pub fn parse_frame(text: &str) -> Option<EventEnvelope> {
    let frame: Frame = serde_json::from_str(text).ok()?;
    if frame.event == MESSAGE_CHANNEL {
        Some(frame.data)
    } else {
        None
    }
}

/// An event queued for delivery to the control plane.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub envelope: EventEnvelope,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundEvent {
    pub fn new(envelope: EventEnvelope) -> Self {
        Self {
            envelope,
            enqueued_at: Utc::now(),
        }
    }

    /// A conversation turn's output.
    pub fn job_output(job_id: &str, output: &str, status: JobStatus) -> Self {
        Self::new(EventEnvelope::new(
            "JobOutput",
            json!({
                "jobId": job_id,
                "output": output,
                "status": status.to_string(),
            }),
        ))
    }

    /// A job status transition, optionally carrying an error description.
    pub fn job_status(job_id: &str, status: JobStatus, error: Option<&str>) -> Self {
        Self::new(EventEnvelope::new(
            "JobStatus",
            json!({
                "jobId": job_id,
                "status": status.to_string(),
                "error": error,
            }),
        ))
    }

    /// The idle-scan summary produced by `CheckIdleJobs`.
    pub fn idle_report(idle_job_ids: &[String]) -> Self {
        Self::new(EventEnvelope::new(
            "IdleJobsReport",
            json!({ "idleJobIds": idle_job_ids }),
        ))
    }

    pub fn to_frame(&self) -> String {
        // Serialization of a Frame cannot fail: it is strings and Values.
        serde_json::to_string(&Frame {
            event: MESSAGE_CHANNEL.to_string(),
            data: self.envelope.clone(),
        })
        .unwrap_or_default()
    }
}
