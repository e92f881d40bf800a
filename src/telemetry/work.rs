//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs
//! flowing through the worker pool.

use tracing::Span;

use crate::model::QueueJob;

/// Start a span for one execution attempt of a job.
///
/// The `job.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(job: &QueueJob) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.queue" = %job.queue,
        "job.id" = %job.id,
        "job.name" = %job.payload.name,
        "job.attempt" = job.attempts,
        "workflow.id" = %job.workflow_id,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `info` event scoped to the span and updates `job.state`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
