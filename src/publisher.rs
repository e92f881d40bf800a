//! Event publisher: the single append path for run events.
//!
//! Every helper builds an [`EventRecord`] and goes through [`EventPublisher::append`],
//! so all events of a run share one total order no matter which helper
//! produced them. After the append the record is also pushed on the shared
//! live channel for SSE clients; that publish is best-effort.

use opentelemetry::KeyValue;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::live::MAX_NOTIFY_PAYLOAD;
use crate::error::Result;
use crate::model::event::EntryId;
use crate::model::{EventKind, EventRecord, WorkflowId};
use crate::store::{EventLog, LiveChannel};
use crate::telemetry::metrics;

/// The one live channel every run's status updates are published on.
pub const STATUS_CHANNEL: &str = "workflow_status";

/// Content prefix of a successful terminal update.
pub const COMPLETED_PREFIX: &str = "Completed";
/// Content prefix of a failed terminal update.
pub const FAILED_PREFIX: &str = "Failed";

#[derive(Clone)]
pub struct EventPublisher {
    log: Arc<dyn EventLog>,
    live: Arc<dyn LiveChannel>,
    max_len: Option<usize>,
    live_limit: usize,
}

impl EventPublisher {
    pub fn new(log: Arc<dyn EventLog>, live: Arc<dyn LiveChannel>) -> Self {
        Self {
            log,
            live,
            max_len: None,
            live_limit: MAX_NOTIFY_PAYLOAD,
        }
    }

    /// The log this publisher appends to.
    pub fn log(&self) -> Arc<dyn EventLog> {
        self.log.clone()
    }

    /// Keep roughly this many entries per run log.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Largest live-channel payload in bytes; bigger records are shrunk.
    pub fn with_live_limit(mut self, limit: usize) -> Self {
        self.live_limit = limit;
        self
    }

    /// Append an event of `kind` to the run's log.
    pub async fn emit(
        &self,
        kind: EventKind,
        workflow_id: &WorkflowId,
        content: Option<String>,
        metadata: Option<Value>,
    ) -> Result<EntryId> {
        let mut record = EventRecord::new(kind, workflow_id.clone());
        record.content = content;
        record.metadata = metadata;
        self.append(record).await
    }

    /// Append a fully-built record. All helpers end up here.
    pub async fn append(&self, record: EventRecord) -> Result<EntryId> {
        let payload = serde_json::to_string(&record)?;
        let appended = self
            .log
            .append(&record.workflow_id, &payload, self.max_len)
            .await;
        metrics::events_appended().add(
            1,
            &[
                KeyValue::new("type", record.kind.as_str()),
                KeyValue::new("result", if appended.is_ok() { "ok" } else { "error" }),
            ],
        );
        let id = appended?;
        debug!(workflow_id = %record.workflow_id, kind = %record.kind, entry = %id, "event appended");

        self.publish_live(&record, payload).await;
        Ok(id)
    }

    async fn publish_live(&self, record: &EventRecord, payload: String) {
        let (payload, result) = match shrink_for_live(record, payload, self.live_limit) {
            Some(Shrunk::Unchanged(p)) => (p, "ok"),
            Some(Shrunk::Reduced(p)) => (p, "shrunk"),
            None => {
                warn!(workflow_id = %record.workflow_id, kind = %record.kind, "event too large for live channel, not published");
                metrics::live_publishes().add(1, &[KeyValue::new("result", "error")]);
                return;
            }
        };
        match self.live.publish(STATUS_CHANNEL, &payload).await {
            Ok(()) => {
                metrics::live_publishes().add(1, &[KeyValue::new("result", result)]);
            }
            Err(e) => {
                warn!(workflow_id = %record.workflow_id, error = %e, "live publish failed");
                metrics::live_publishes().add(1, &[KeyValue::new("result", "error")]);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn workflow_started(&self, workflow_id: &WorkflowId, name: &str) -> Result<EntryId> {
        self.append(
            EventRecord::new(EventKind::WorkflowStarted, workflow_id.clone())
                .content(format!("Started {name}")),
        )
        .await
    }

    /// Content is `Completed`, or `Completed: <summary>`.
    pub async fn workflow_completed(
        &self,
        workflow_id: &WorkflowId,
        summary: Option<&str>,
        result: Option<Value>,
    ) -> Result<EntryId> {
        let content = match summary {
            Some(s) => format!("{COMPLETED_PREFIX}: {s}"),
            None => COMPLETED_PREFIX.to_string(),
        };
        let mut record =
            EventRecord::new(EventKind::WorkflowCompleted, workflow_id.clone()).content(content);
        record.metadata = result;
        self.append(record).await
    }

    /// Content is `Failed: <error>`.
    pub async fn workflow_error(&self, workflow_id: &WorkflowId, error: &str) -> Result<EntryId> {
        self.append(
            EventRecord::new(EventKind::WorkflowError, workflow_id.clone())
                .content(format!("{FAILED_PREFIX}: {error}")),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    pub async fn status(&self, workflow_id: &WorkflowId, content: impl Into<String>) -> Result<EntryId> {
        self.append(EventRecord::new(EventKind::Status, workflow_id.clone()).content(content))
            .await
    }

    pub async fn issue_fetched(
        &self,
        workflow_id: &WorkflowId,
        content: impl Into<String>,
        issue: Value,
    ) -> Result<EntryId> {
        self.append(
            EventRecord::new(EventKind::IssueFetched, workflow_id.clone())
                .content(content)
                .metadata(issue),
        )
        .await
    }

    pub async fn system_prompt(&self, workflow_id: &WorkflowId, content: impl Into<String>) -> Result<EntryId> {
        self.append(EventRecord::new(EventKind::SystemPrompt, workflow_id.clone()).content(content))
            .await
    }

    pub async fn user_message(&self, workflow_id: &WorkflowId, content: impl Into<String>) -> Result<EntryId> {
        self.append(EventRecord::new(EventKind::UserMessage, workflow_id.clone()).content(content))
            .await
    }

    pub async fn assistant_message(
        &self,
        workflow_id: &WorkflowId,
        content: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<EntryId> {
        self.append(
            EventRecord::new(EventKind::AssistantMessage, workflow_id.clone())
                .content(content)
                .model(model),
        )
        .await
    }

    pub async fn tool_call(
        &self,
        workflow_id: &WorkflowId,
        tool_name: &str,
        tool_call_id: &str,
        args: Value,
    ) -> Result<EntryId> {
        self.append(
            EventRecord::new(EventKind::ToolCall, workflow_id.clone())
                .tool(tool_name, tool_call_id)
                .args(args),
        )
        .await
    }

    pub async fn tool_call_result(
        &self,
        workflow_id: &WorkflowId,
        tool_name: &str,
        tool_call_id: &str,
        content: impl Into<String>,
    ) -> Result<EntryId> {
        self.append(
            EventRecord::new(EventKind::ToolCallResult, workflow_id.clone())
                .tool(tool_name, tool_call_id)
                .content(content),
        )
        .await
    }

    pub async fn reasoning(&self, workflow_id: &WorkflowId, content: impl Into<String>) -> Result<EntryId> {
        self.append(EventRecord::new(EventKind::Reasoning, workflow_id.clone()).content(content))
            .await
    }

    pub async fn llm_started(&self, workflow_id: &WorkflowId, model: impl Into<String>) -> Result<EntryId> {
        self.append(EventRecord::new(EventKind::LlmStarted, workflow_id.clone()).model(model))
            .await
    }

    /// `usage` carries token counts or whatever the caller reports.
    pub async fn llm_completed(
        &self,
        workflow_id: &WorkflowId,
        model: impl Into<String>,
        usage: Option<Value>,
    ) -> Result<EntryId> {
        let mut record = EventRecord::new(EventKind::LlmCompleted, workflow_id.clone()).model(model);
        record.metadata = usage;
        self.append(record).await
    }
}

enum Shrunk {
    Unchanged(String),
    Reduced(String),
}

/// Fit a record into `limit` bytes for the live channel.
///
/// Drops metadata and args first, then truncates content from the end so
/// the terminal prefix survives. `None` if even an empty record is too big.
fn shrink_for_live(record: &EventRecord, payload: String, limit: usize) -> Option<Shrunk> {
    if payload.len() <= limit {
        return Some(Shrunk::Unchanged(payload));
    }
    let mut reduced = record.clone();
    reduced.metadata = None;
    reduced.args = None;
    let content = reduced.content.take().unwrap_or_default();

    let mut budget = content.len();
    loop {
        let mut cut = budget.min(content.len());
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        reduced.content = (cut > 0).then(|| content[..cut].to_string());
        let candidate = serde_json::to_string(&reduced).ok()?;
        if candidate.len() <= limit {
            return Some(Shrunk::Reduced(candidate));
        }
        if cut == 0 {
            return None;
        }
        let over = candidate.len() - limit;
        budget = cut.saturating_sub(over.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn publisher(store: &Arc<MemoryStore>) -> EventPublisher {
        EventPublisher::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn helpers_share_one_order() {
        let store = Arc::new(MemoryStore::new());
        let events = publisher(&store);
        let w1 = WorkflowId::from("w1");
        events.workflow_started(&w1, "resolveIssue").await.unwrap();
        events.tool_call(&w1, "read_file", "c1", json!({"path": "a"})).await.unwrap();
        events.status(&w1, "step1").await.unwrap();
        events.workflow_completed(&w1, None, None).await.unwrap();

        let kinds: Vec<_> = store
            .read_all(&w1)
            .await
            .unwrap()
            .iter()
            .map(|e| e.parse().unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::WorkflowStarted,
                EventKind::ToolCall,
                EventKind::Status,
                EventKind::WorkflowCompleted
            ]
        );
    }

    #[tokio::test]
    async fn emit_round_trips_fields() {
        let store = Arc::new(MemoryStore::new());
        let events = publisher(&store);
        let w1 = WorkflowId::from("w1");
        events
            .emit(EventKind::Status, &w1, Some("step1".into()), Some(json!({"n": 1})))
            .await
            .unwrap();
        let record = store.read_all(&w1).await.unwrap()[0].parse().unwrap();
        assert_eq!(record.content.as_deref(), Some("step1"));
        assert_eq!(record.metadata, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn terminal_helpers_use_prefixes() {
        let store = Arc::new(MemoryStore::new());
        let events = publisher(&store);
        let w1 = WorkflowId::from("w1");
        events.workflow_completed(&w1, Some("PR opened"), None).await.unwrap();
        events.workflow_error(&w1, "boom").await.unwrap();
        let contents: Vec<_> = store
            .read_all(&w1)
            .await
            .unwrap()
            .iter()
            .map(|e| e.parse().unwrap().content.unwrap())
            .collect();
        assert_eq!(contents, vec!["Completed: PR opened", "Failed: boom"]);
    }

    #[tokio::test]
    async fn oversized_live_payload_is_shrunk_but_log_keeps_everything() {
        let store = Arc::new(MemoryStore::new());
        let events = publisher(&store).with_live_limit(200);
        let mut live = store.subscribe(STATUS_CHANNEL).await.unwrap();
        let w1 = WorkflowId::from("w1");
        let long = format!("Failed: {}", "x".repeat(1000));
        events
            .emit(EventKind::WorkflowError, &w1, Some(long.clone()), Some(json!({"big": "y".repeat(500)})))
            .await
            .unwrap();

        let message = live.next_message().await.unwrap().unwrap();
        assert!(message.len() <= 200);
        let shrunk: EventRecord = serde_json::from_str(&message).unwrap();
        assert!(shrunk.metadata.is_none());
        assert!(shrunk.content.unwrap().starts_with(FAILED_PREFIX));

        let stored = store.read_all(&w1).await.unwrap()[0].parse().unwrap();
        assert_eq!(stored.content, Some(long));
    }

    #[test]
    fn shrink_respects_char_boundaries() {
        let record = EventRecord::new(EventKind::Status, "w1".into()).content("é".repeat(100));
        let payload = serde_json::to_string(&record).unwrap();
        match shrink_for_live(&record, payload, 80) {
            Some(Shrunk::Reduced(p)) => assert!(p.len() <= 80),
            _ => panic!("expected a reduced payload"),
        }
    }
}
