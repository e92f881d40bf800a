//! Current lifecycle state of a run, derived from its event log.
//!
//! The latest lifecycle event in log order wins. Timestamps inside event
//! metadata are ignored: log order is the only clock.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::model::event::Lifecycle;
use crate::model::{EventRecord, WorkflowId};
use crate::store::EventLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// No lifecycle event yet.
    Pending,
    Running,
    Completed,
    Error,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Error => "error",
        }
    }
}

impl From<Lifecycle> for WorkflowState {
    fn from(l: Lifecycle) -> Self {
        match l {
            Lifecycle::Started => WorkflowState::Running,
            Lifecycle::Completed => WorkflowState::Completed,
            Lifecycle::Error => WorkflowState::Error,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State plus a little context, for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    /// Content of the latest event that had any.
    pub last_content: Option<String>,
    pub event_count: usize,
}

#[derive(Clone)]
pub struct WorkflowStateTracker {
    log: Arc<dyn EventLog>,
}

impl WorkflowStateTracker {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub async fn current_state(&self, workflow_id: &WorkflowId) -> Result<WorkflowState> {
        Ok(self.status(workflow_id).await?.state)
    }

    /// Scan the whole log once. Linear in the number of events.
    pub async fn status(&self, workflow_id: &WorkflowId) -> Result<WorkflowStatus> {
        let entries = self.log.read_all(workflow_id).await?;
        let event_count = entries.len();
        let records: Vec<EventRecord> = entries
            .iter()
            .filter_map(|e| match e.parse() {
                Ok(record) => Some(record),
                Err(err) => {
                    debug!(%workflow_id, entry = %e.id, error = %err, "skipping malformed entry");
                    None
                }
            })
            .collect();
        Ok(WorkflowStatus {
            workflow_id: workflow_id.clone(),
            state: latest_state(&records),
            last_content: records.iter().rev().find_map(|r| r.content.clone()),
            event_count,
        })
    }
}

/// Latest lifecycle event by position; `Pending` if there is none.
pub fn latest_state(records: &[EventRecord]) -> WorkflowState {
    records
        .iter()
        .rev()
        .find_map(|r| r.kind.lifecycle())
        .map_or(WorkflowState::Pending, WorkflowState::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;

    fn records(kinds: &[EventKind]) -> Vec<EventRecord> {
        kinds
            .iter()
            .map(|k| EventRecord::new(*k, "w1".into()))
            .collect()
    }

    #[test]
    fn completed_after_started() {
        use EventKind::*;
        let rs = records(&[WorkflowStarted, Status, ToolCall, WorkflowCompleted]);
        assert_eq!(latest_state(&rs), WorkflowState::Completed);
    }

    #[test]
    fn error_after_started() {
        use EventKind::*;
        let rs = records(&[WorkflowStarted, Status, WorkflowError]);
        assert_eq!(latest_state(&rs), WorkflowState::Error);
    }

    #[test]
    fn running_without_terminal_event() {
        use EventKind::*;
        let rs = records(&[WorkflowStarted, Status, Reasoning]);
        let state = latest_state(&rs);
        assert_eq!(state, WorkflowState::Running);
        assert!(!state.is_terminal());
        assert_eq!(latest_state(&[]), WorkflowState::Pending);
    }

    #[test]
    fn log_order_beats_timestamps() {
        // A retried run: error from an earlier attempt, then a restart.
        use EventKind::*;
        let mut rs = records(&[WorkflowError, WorkflowStarted]);
        rs[0].metadata = Some(serde_json::json!({"timestamp": "2099-01-01T00:00:00Z"}));
        assert_eq!(latest_state(&rs), WorkflowState::Running);
    }
}
