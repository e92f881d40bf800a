//! SSE bridge: one browser client, one run, one ephemeral subscription.
//!
//! Every client gets its own subscription to the shared status channel and
//! sees only messages for the run it asked about. The stream ends on its own
//! once a terminal update passes through or the server shuts down; a client
//! that goes away first triggers the same teardown.

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::WorkflowId;
use crate::publisher::{COMPLETED_PREFIX, FAILED_PREFIX, STATUS_CHANNEL};
use crate::store::{LiveChannel, Subscription};
use crate::telemetry::metrics;
use crate::tracker::WorkflowStateTracker;

/// Payload of the last frame of every finished stream.
pub const STREAM_FINISHED: &str = "Stream finished";

const FRAME_BUFFER: usize = 16;

/// Stream of encoded frames; an `Err` item aborts the HTTP body.
pub type FrameStream = ReceiverStream<Result<String>>;

/// `data: <payload>\n\n`, with the payload JSON-string-escaped so newlines
/// cannot break the framing.
pub fn encode_frame(payload: &str) -> String {
    let escaped = serde_json::to_string(payload).unwrap_or_else(|_| String::from("\"\""));
    format!("data: {escaped}\n\n")
}

/// The sentinel frame, sent unescaped.
pub fn finished_frame() -> String {
    format!("data: {STREAM_FINISHED}\n\n")
}

/// Whether a live message belongs to `workflow_id`, and if so whether it is terminal.
fn classify(message: &str, workflow_id: &WorkflowId) -> Option<bool> {
    let value: serde_json::Value = serde_json::from_str(message).ok()?;
    if value.get("workflowId").and_then(|v| v.as_str()) != Some(workflow_id.as_str()) {
        return None;
    }
    let content = value.get("content").and_then(|v| v.as_str()).unwrap_or("");
    Some(content.starts_with(COMPLETED_PREFIX) || content.starts_with(FAILED_PREFIX))
}

/// Releases a client's subscription exactly once, whichever path gets there first.
pub struct Teardown {
    workflow_id: WorkflowId,
    done: AtomicBool,
}

impl Teardown {
    pub fn new(workflow_id: WorkflowId) -> Self {
        metrics::sse_streams_open().add(1, &[]);
        Self {
            workflow_id,
            done: AtomicBool::new(false),
        }
    }

    /// Unsubscribe and close, each attempted regardless of the other.
    /// Returns `false` if teardown already ran.
    pub async fn run(&self, subscription: &mut dyn Subscription, outcome: &'static str) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = subscription.unsubscribe().await {
            warn!(workflow_id = %self.workflow_id, error = %e, "unsubscribe failed");
        }
        if let Err(e) = subscription.close().await {
            warn!(workflow_id = %self.workflow_id, error = %e, "closing subscription failed");
        }
        metrics::sse_streams_open().add(-1, &[]);
        metrics::sse_streams_closed().add(1, &[KeyValue::new("outcome", outcome)]);
        debug!(workflow_id = %self.workflow_id, outcome, "sse stream torn down");
        true
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct SseBridge {
    live: Arc<dyn LiveChannel>,
    tracker: WorkflowStateTracker,
    shutdown: CancellationToken,
}

impl SseBridge {
    pub fn new(live: Arc<dyn LiveChannel>, tracker: WorkflowStateTracker) -> Self {
        Self {
            live,
            tracker,
            shutdown: CancellationToken::new(),
        }
    }

    /// End every open stream (teardown plus sentinel) once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Open a filtered frame stream for one client.
    pub async fn subscribe(&self, workflow_id: WorkflowId) -> Result<FrameStream> {
        let subscription = self.live.subscribe(STATUS_CHANNEL).await?;
        let teardown = Arc::new(Teardown::new(workflow_id.clone()));
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);

        // Subscribed first, so nothing between this check and the first read is lost.
        let already_done = match self.tracker.current_state(&workflow_id).await {
            Ok(state) => state.is_terminal(),
            Err(e) => {
                warn!(%workflow_id, error = %e, "state lookup failed, streaming anyway");
                false
            }
        };

        info!(%workflow_id, already_done, "sse client subscribed");
        tokio::spawn(pump(
            subscription,
            workflow_id,
            tx,
            teardown,
            already_done,
            self.shutdown.clone(),
        ));
        Ok(ReceiverStream::new(rx))
    }

    /// The HTTP response carrying [`Self::subscribe`]'s stream.
    pub async fn response(&self, workflow_id: WorkflowId) -> Result<Response> {
        let frames = self.subscribe(workflow_id).await?;
        let mut response = Response::new(Body::from_stream(frames));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        Ok(response)
    }
}

async fn pump(
    mut subscription: Box<dyn Subscription>,
    workflow_id: WorkflowId,
    tx: mpsc::Sender<Result<String>>,
    teardown: Arc<Teardown>,
    already_done: bool,
    shutdown: CancellationToken,
) {
    if already_done {
        teardown.run(subscription.as_mut(), "finished").await;
        let _ = tx.send(Ok(finished_frame())).await;
        return;
    }

    loop {
        let message = tokio::select! {
            _ = tx.closed() => {
                debug!(%workflow_id, "sse client went away");
                teardown.run(subscription.as_mut(), "disconnected").await;
                return;
            }
            _ = shutdown.cancelled() => {
                debug!(%workflow_id, "server shutting down, ending sse stream");
                teardown.run(subscription.as_mut(), "shutdown").await;
                let _ = tx.send(Ok(finished_frame())).await;
                return;
            }
            message = subscription.next_message() => message,
        };

        match message {
            Ok(Some(message)) => {
                let Some(terminal) = classify(&message, &workflow_id) else {
                    continue;
                };
                if tx.send(Ok(encode_frame(&message))).await.is_err() {
                    teardown.run(subscription.as_mut(), "disconnected").await;
                    return;
                }
                if terminal {
                    teardown.run(subscription.as_mut(), "finished").await;
                    let _ = tx.send(Ok(finished_frame())).await;
                    return;
                }
            }
            Ok(None) => {
                teardown.run(subscription.as_mut(), "error").await;
                let _ = tx
                    .send(Err(Error::Other("live subscription ended".to_string())))
                    .await;
                return;
            }
            Err(e) => {
                warn!(%workflow_id, error = %e, "live subscription failed");
                teardown.run(subscription.as_mut(), "error").await;
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}
