//! Structured events appended to a workflow run's log.
//!
//! Workflows report progress by emitting events; consumers and browsers
//! read them back in append order. The `type` tag is a closed set, so a
//! new kind has to be handled everywhere `EventKind` is matched.

use serde::{Deserialize, Serialize};

use super::run::WorkflowId;

/// Kind of an event. Serialized with the wire names of the event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.error")]
    WorkflowError,
    #[serde(rename = "issue.fetched")]
    IssueFetched,
    #[serde(rename = "system_prompt")]
    SystemPrompt,
    #[serde(rename = "user_message")]
    UserMessage,
    #[serde(rename = "assistant_message")]
    AssistantMessage,
    #[serde(rename = "tool_call")]
    ToolCall,
    #[serde(rename = "tool_call_result")]
    ToolCallResult,
    #[serde(rename = "reasoning")]
    Reasoning,
    #[serde(rename = "llm.started")]
    LlmStarted,
    #[serde(rename = "llm.completed")]
    LlmCompleted,
}

/// Lifecycle transition carried by an event, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Started,
    Completed,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::Status,
        EventKind::WorkflowStarted,
        EventKind::WorkflowCompleted,
        EventKind::WorkflowError,
        EventKind::IssueFetched,
        EventKind::SystemPrompt,
        EventKind::UserMessage,
        EventKind::AssistantMessage,
        EventKind::ToolCall,
        EventKind::ToolCallResult,
        EventKind::Reasoning,
        EventKind::LlmStarted,
        EventKind::LlmCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::WorkflowError => "workflow.error",
            EventKind::IssueFetched => "issue.fetched",
            EventKind::SystemPrompt => "system_prompt",
            EventKind::UserMessage => "user_message",
            EventKind::AssistantMessage => "assistant_message",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolCallResult => "tool_call_result",
            EventKind::Reasoning => "reasoning",
            EventKind::LlmStarted => "llm.started",
            EventKind::LlmCompleted => "llm.completed",
        }
    }

    /// The lifecycle transition this kind represents.
    pub fn lifecycle(self) -> Option<Lifecycle> {
        match self {
            EventKind::WorkflowStarted => Some(Lifecycle::Started),
            EventKind::WorkflowCompleted => Some(Lifecycle::Completed),
            EventKind::WorkflowError => Some(Lifecycle::Error),
            EventKind::Status
            | EventKind::IssueFetched
            | EventKind::SystemPrompt
            | EventKind::UserMessage
            | EventKind::AssistantMessage
            | EventKind::ToolCall
            | EventKind::ToolCallResult
            | EventKind::Reasoning
            | EventKind::LlmStarted
            | EventKind::LlmCompleted => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event record, stored as a single JSON field per log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub workflow_id: WorkflowId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl EventRecord {
    pub fn new(kind: EventKind, workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            kind,
            content: None,
            metadata: None,
            tool_name: None,
            tool_call_id: None,
            args: None,
            model: None,
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn tool(mut self, name: impl Into<String>, call_id: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_call_id = Some(call_id.into());
        self
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Log entries
// ---------------------------------------------------------------------------

/// Log-assigned entry id. Monotonically increasing within a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raw log entry: the id and the stored JSON text, unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    pub payload: String,
}

impl LogEntry {
    /// Parse the payload as an event record.
    pub fn parse(&self) -> Result<EventRecord, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}
