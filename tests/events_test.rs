//! Integration tests for the event log: publishing, consumer groups,
//! state tracking and archive forwarding.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use runrelay::consumer::{ConsumerConfig, EventConsumer, PollStats};
use runrelay::model::{EventKind, EventRecord, WorkflowId};
use runrelay::ports::{ArchiveForwarder, LogNotifier, MemoryArchive, RunArchive};
use runrelay::publisher::EventPublisher;
use runrelay::store::{EventLog, MemoryStore};
use runrelay::tracker::{WorkflowState, WorkflowStateTracker};

fn publisher(store: &Arc<MemoryStore>) -> EventPublisher {
    EventPublisher::new(store.clone(), store.clone())
}

fn consumer(store: &Arc<MemoryStore>) -> EventConsumer {
    EventConsumer::new(
        store.clone(),
        ConsumerConfig {
            block_timeout: Duration::ZERO,
            ..ConsumerConfig::default()
        },
    )
}

/// started, status "step1", status "step2", completed for `w1`.
async fn emit_four(events: &EventPublisher) -> WorkflowId {
    let w1 = WorkflowId::from("w1");
    events.workflow_started(&w1, "resolveIssue").await.unwrap();
    events.status(&w1, "step1").await.unwrap();
    events.status(&w1, "step2").await.unwrap();
    events.workflow_completed(&w1, None, None).await.unwrap();
    w1
}

// ---------------------------------------------------------------------------
// Consumer groups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn group_reads_four_events_in_order_and_acks_them() {
    let store = Arc::new(MemoryStore::new());
    let w1 = emit_four(&publisher(&store)).await;
    let archive = Arc::new(MemoryArchive::new());
    let handler = ArchiveForwarder::new(archive.clone(), Arc::new(LogNotifier));

    let events = consumer(&store);
    events.ensure_group(&w1, "archive").await.unwrap();
    let stats = events.poll_once(&w1, "archive", "c1", &handler).await.unwrap();
    assert_eq!(stats, PollStats { delivered: 4, acked: 4, failed: 0 });
    assert!(store.pending(&w1, "archive").await.unwrap().is_empty());

    let archived = archive.read_ordered(&w1).await.unwrap();
    let kinds: Vec<EventKind> = archived.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::WorkflowStarted,
            EventKind::Status,
            EventKind::Status,
            EventKind::WorkflowCompleted,
        ]
    );
    assert_eq!(archived[1].content.as_deref(), Some("step1"));
    assert_eq!(archived[2].content.as_deref(), Some("step2"));

    // Nothing new for the same group.
    let again = events.poll_once(&w1, "archive", "c1", &handler).await.unwrap();
    assert_eq!(again.delivered, 0);
}

#[tokio::test]
async fn groups_have_independent_cursors() {
    let store = Arc::new(MemoryStore::new());
    let w1 = emit_four(&publisher(&store)).await;
    let handler = ArchiveForwarder::new(Arc::new(MemoryArchive::new()), Arc::new(LogNotifier));
    let events = consumer(&store);

    events.ensure_group(&w1, "a").await.unwrap();
    events.ensure_group(&w1, "b").await.unwrap();
    assert_eq!(events.poll_once(&w1, "a", "c1", &handler).await.unwrap().delivered, 4);
    assert_eq!(events.poll_once(&w1, "b", "c1", &handler).await.unwrap().delivered, 4);
}

#[tokio::test]
async fn ensure_group_is_idempotent_and_keeps_the_cursor() {
    let store = Arc::new(MemoryStore::new());
    let events = publisher(&store);
    let w1 = WorkflowId::from("w1");
    events.status(&w1, "one").await.unwrap();
    events.status(&w1, "two").await.unwrap();

    assert!(store.ensure_group(&w1, "g").await.unwrap());
    let first = store
        .read_group(&w1, "g", "c1", 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    assert!(!store.ensure_group(&w1, "g").await.unwrap());
    let next = store
        .read_group(&w1, "g", "c1", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].parse().unwrap().content.as_deref(), Some("two"));
}

#[tokio::test]
async fn blocking_read_wakes_on_append() {
    let store = Arc::new(MemoryStore::new());
    let w1 = WorkflowId::from("w1");
    store.ensure_group(&w1, "g").await.unwrap();

    let reader = {
        let store = store.clone();
        let w1 = w1.clone();
        tokio::spawn(async move {
            store
                .read_group(&w1, "g", "c1", 10, Duration::from_secs(5))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    publisher(&store).status(&w1, "late").await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("read did not wake")
        .unwrap();
    assert_eq!(got.len(), 1);
}

#[tokio::test]
async fn malformed_entries_stay_pending_for_the_archive() {
    let store = Arc::new(MemoryStore::new());
    let w1 = WorkflowId::from("w1");
    store.append(&w1, "{not json", None).await.unwrap();
    publisher(&store).status(&w1, "fine").await.unwrap();

    let handler = ArchiveForwarder::new(Arc::new(MemoryArchive::new()), Arc::new(LogNotifier));
    let events = consumer(&store);
    events.ensure_group(&w1, "archive").await.unwrap();
    let stats = events.poll_once(&w1, "archive", "c1", &handler).await.unwrap();
    assert_eq!(stats, PollStats { delivered: 2, acked: 1, failed: 1 });

    let pending = store.pending(&w1, "archive").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, "c1");
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_call_and_assistant_message_survive_the_log() {
    let store = Arc::new(MemoryStore::new());
    let events = publisher(&store);
    let w1 = WorkflowId::from("w1");
    events
        .tool_call(&w1, "run_tests", "call_7", json!({"filter": "sse"}))
        .await
        .unwrap();
    events
        .assistant_message(&w1, "All tests pass.", "gpt-4o")
        .await
        .unwrap();

    let records: Vec<EventRecord> = store
        .read_all(&w1)
        .await
        .unwrap()
        .iter()
        .map(|e| e.parse().unwrap())
        .collect();

    assert_eq!(records[0].kind, EventKind::ToolCall);
    assert_eq!(records[0].tool_name.as_deref(), Some("run_tests"));
    assert_eq!(records[0].tool_call_id.as_deref(), Some("call_7"));
    assert_eq!(records[0].args, Some(json!({"filter": "sse"})));
    assert_eq!(records[1].kind, EventKind::AssistantMessage);
    assert_eq!(records[1].content.as_deref(), Some("All tests pass."));
    assert_eq!(records[1].model.as_deref(), Some("gpt-4o"));
}

#[tokio::test]
async fn first_event_for_unknown_run_creates_a_bare_run() {
    let store = Arc::new(MemoryStore::new());
    let w9 = WorkflowId::from("w9");
    assert!(store.run(&w9).await.unwrap().is_none());
    publisher(&store).status(&w9, "hello").await.unwrap();
    let run = store.run(&w9).await.unwrap().unwrap();
    assert_eq!(run.id, w9);
    assert!(run.workflow_name.is_none());
}

// ---------------------------------------------------------------------------
// State tracking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tracker_follows_the_latest_lifecycle_event() {
    let store = Arc::new(MemoryStore::new());
    let events = publisher(&store);
    let tracker = WorkflowStateTracker::new(store.clone());
    let w1 = WorkflowId::from("w1");

    assert_eq!(tracker.current_state(&w1).await.unwrap(), WorkflowState::Pending);

    events.workflow_started(&w1, "resolveIssue").await.unwrap();
    events.status(&w1, "step1").await.unwrap();
    assert_eq!(tracker.current_state(&w1).await.unwrap(), WorkflowState::Running);

    events.workflow_error(&w1, "boom").await.unwrap();
    let status = tracker.status(&w1).await.unwrap();
    assert_eq!(status.state, WorkflowState::Error);
    assert_eq!(status.event_count, 3);
    assert_eq!(status.last_content.as_deref(), Some("Failed: boom"));
}
