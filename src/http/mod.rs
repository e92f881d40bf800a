//! HTTP surface: launch runs, look up jobs and status, stream live updates.
//!
//! Every launch goes through [`JobQueue`]; handlers never run workflow code.

pub mod error;
pub mod handlers;

pub use error::{AppError, AppResult};

use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::error::Result;
use crate::queue::JobQueue;
use crate::sse::SseBridge;
use crate::store::HealthCheck;
use crate::tracker::WorkflowStateTracker;

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
    pub tracker: WorkflowStateTracker,
    pub bridge: SseBridge,
    pub health: Arc<dyn HealthCheck>,
}

/// Build the router with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/workflows", post(handlers::launch))
        .route("/workflows/{id}/status", get(handlers::workflow_status))
        .route("/workflows/{id}/events", get(handlers::workflow_events))
        .route("/jobs/{id}", get(handlers::get_job))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Serve `router(state)` on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state, shutdown).await
}

/// Like [`serve`], on an already bound listener.
///
/// Open SSE streams are ended when `shutdown` fires; graceful shutdown
/// waits for every response body, so a live stream would otherwise hold
/// the server open.
pub async fn serve_on(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    let state = AppState {
        bridge: state.bridge.with_shutdown(shutdown.clone()),
        ..state
    };
    info!(%addr, "http server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!(%addr, "http server stopped");
    Ok(())
}
