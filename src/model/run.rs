//! Workflow runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of one workflow run, caller- or system-generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh system-generated id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for WorkflowId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One execution of a named workflow.
///
/// Recorded when its job is enqueued, or as a bare record when the first
/// event for an unknown id is appended. Progress lives in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: WorkflowId,
    pub workflow_name: Option<String>,
    /// Who asked for the run (user login, webhook, schedule...).
    pub actor: Option<String>,
    pub links: RunLinks,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(id: WorkflowId) -> Self {
        Self {
            id,
            workflow_name: None,
            actor: None,
            links: RunLinks::default(),
            created_at: Utc::now(),
        }
    }
}

/// Optional links to the external objects a run is about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLinks {
    pub repo: Option<String>,
    pub issue_number: Option<i64>,
    pub commit_sha: Option<String>,
}
