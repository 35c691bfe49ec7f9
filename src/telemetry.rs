use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize tracing with structured JSON output.
///
/// Log verbosity is controlled through `RUST_LOG`; the default level is INFO
/// so job lifecycle transitions and transport state changes are always
/// visible in the daemon log.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("dockhand telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span with common job execution attributes
pub fn create_job_span(operation: &str, job_id: Option<&str>, message_id: Option<&str>) -> tracing::Span {
    tracing::info_span!(
        "job_execution",
        operation = operation,
        job.id = job_id,
        message.id = message_id,
    )
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    // For structured logging, no explicit shutdown needed
    tracing::info!("dockhand telemetry shutdown complete");
}
