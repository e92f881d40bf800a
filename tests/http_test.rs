//! Integration tests for the HTTP routes, driven through `oneshot`.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use runrelay::http::{AppState, router, serve_on};
use runrelay::model::Retention;
use runrelay::publisher::EventPublisher;
use runrelay::queue::{JobQueue, QueuePolicy, QueueRegistry};
use runrelay::sse::SseBridge;
use runrelay::store::MemoryStore;
use runrelay::tracker::WorkflowStateTracker;

fn state() -> (Arc<MemoryStore>, AppState) {
    let store = Arc::new(MemoryStore::new());
    let registry = QueueRegistry::empty()
        .with(QueuePolicy::new("workflow-jobs").retention(Retention::Keep, Retention::Keep))
        .unwrap();
    let tracker = WorkflowStateTracker::new(store.clone());
    let state = AppState {
        queue: JobQueue::new(store.clone(), Arc::new(registry)),
        tracker: tracker.clone(),
        bridge: SseBridge::new(store.clone(), tracker),
        health: store.clone(),
    };
    (store, state)
}

fn app() -> (Arc<MemoryStore>, Router) {
    let (store, state) = state();
    (store, router(state))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            req = req.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn launch_returns_accepted_with_ids() {
    let (_store, app) = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/workflows",
        Some(json!({
            "queue": "workflow-jobs",
            "name": "resolveIssue",
            "data": {"issueNumber": 42},
            "workflowId": "w1",
            "actor": "octocat"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["workflowId"], "w1");

    let job_id = body["jobId"].as_str().unwrap();
    let (status, job) = send(&app, Method::GET, &format!("/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "queued");
    assert_eq!(job["queue"], "workflow-jobs");
    assert_eq!(job["payload"]["name"], "resolveIssue");
    assert_eq!(job["payload"]["data"]["issueNumber"], 42);
}

#[tokio::test]
async fn launch_on_unknown_queue_is_a_bad_request() {
    let (_store, app) = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/workflows",
        Some(json!({"queue": "nope", "name": "resolveIssue", "data": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "UNKNOWN_QUEUE");
}

#[tokio::test]
async fn job_lookup_errors() {
    let (_store, app) = app();
    let (status, body) = send(&app, Method::GET, "/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let missing = uuid::Uuid::new_v4();
    let (status, body) = send(&app, Method::GET, &format!("/jobs/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn status_reflects_the_log() {
    let (store, app) = app();
    let (status, body) = send(&app, Method::GET, "/workflows/w1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["eventCount"], 0);

    let events = EventPublisher::new(store.clone(), store.clone());
    events.workflow_started(&"w1".into(), "resolveIssue").await.unwrap();
    let (_, body) = send(&app, Method::GET, "/workflows/w1/status", None).await;
    assert_eq!(body["state"], "running");
    assert_eq!(body["workflowId"], "w1");
    assert_eq!(body["lastContent"], "Started resolveIssue");
}

#[tokio::test]
async fn events_route_streams_finished_runs() {
    let (store, app) = app();
    let events = EventPublisher::new(store.clone(), store.clone());
    events.workflow_completed(&"w1".into(), None, None).await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/workflows/w1/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"data: Stream finished\n\n");
}

#[tokio::test]
async fn health_is_ok() {
    let (_store, app) = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn shutdown_ends_open_event_streams() {
    let (_store, state) = state();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_on(listener, state, shutdown.clone()));

    // w1 never finishes; only the shutdown can end this stream.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /workflows/w1/events HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut head = vec![0u8; 1024];
    let n = client.read(&mut head).await.unwrap();
    let mut received = String::from_utf8_lossy(&head[..n]).into_owned();
    assert!(received.starts_with("HTTP/1.1 200 OK"), "{received}");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server kept running with a stream open")
        .unwrap()
        .unwrap();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("connection was not closed")
        .unwrap();
    received.push_str(&String::from_utf8_lossy(&rest));
    assert!(received.contains("data: Stream finished"), "{received}");
}
