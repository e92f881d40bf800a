//! Metric instrument factories for runrelay.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"runrelay"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for runrelay instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("runrelay")
}

/// Counter: number of jobs enqueued.
/// Labels: `queue`, `result` ("ok" | "error").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: job state transitions.
/// Labels: `queue`, `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: queue-level operations (send, read, set_vt, archive, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: events appended to run logs.
/// Labels: `type`, `result` ("ok" | "error").
pub fn events_appended() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.events.appended")
        .with_description("Number of events appended to run logs")
        .build()
}

/// Counter: live-channel publishes.
/// Labels: `result` ("ok" | "shrunk" | "error").
pub fn live_publishes() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.live.publishes")
        .with_description("Number of live status publishes")
        .build()
}

/// Counter: entries delivered to consumer groups.
/// Labels: `group`, `outcome` ("acked" | "malformed" | "failed").
pub fn events_delivered() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.events.delivered")
        .with_description("Number of log entries delivered to consumers")
        .build()
}

/// Counter: store connections opened.
/// Labels: `role`.
pub fn connections_opened() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.connections.opened")
        .with_description("Number of store connections opened")
        .build()
}

/// Up/down counter: open SSE streams.
pub fn sse_streams_open() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("runrelay.sse.streams_open")
        .with_description("Number of open SSE streams")
        .build()
}

/// Counter: finished SSE streams.
/// Labels: `outcome` ("finished" | "disconnected" | "shutdown" | "error").
pub fn sse_streams_closed() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.sse.streams_closed")
        .with_description("Number of closed SSE streams")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("runrelay.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: jobs claimed whose name no processor recognizes.
/// Labels: `queue`, `name`.
pub fn jobs_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("runrelay.jobs.unroutable")
        .with_description("Jobs with no matching workflow handler")
        .build()
}
