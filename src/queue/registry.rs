//! Queue policies and registry.
//!
//! Each queue has its own retry policy, retention limits, concurrency, and
//! optionally an external command that runs its jobs. Policies are loaded
//! from a directory of TOML files, one queue per file:
//!
//! ```toml
//! [queue]
//! name = "workflow-jobs"
//! concurrency = 1
//! attempts = 3
//! backoff = { type = "exponential", delay = 2000 }
//! remove_on_complete = 100
//! remove_on_fail = 500
//!
//! [queue.command]
//! path = "bin/run-workflow"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{Backoff, JobOptions, Retention};

/// pgmq derives table names from the queue name and caps their length.
const MAX_QUEUE_NAME_LEN: usize = 47;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct QueueFile {
    queue: QueuePolicy,
}

/// Policy for one queue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueuePolicy {
    pub name: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum attempts, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
    #[serde(default = "default_remove_on_complete")]
    pub remove_on_complete: Retention,
    #[serde(default = "default_remove_on_fail")]
    pub remove_on_fail: Retention,
    /// How long a claimed job stays hidden before it is redelivered, unless
    /// the worker keeps extending it.
    #[serde(default = "default_visibility_secs")]
    pub visibility_timeout_secs: u64,
    pub command: Option<CommandConfig>,
}

/// External executable that runs this queue's jobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_concurrency() -> usize {
    1
}

fn default_attempts() -> u32 {
    JobOptions::default().attempts
}

fn default_backoff() -> Backoff {
    JobOptions::default().backoff
}

fn default_remove_on_complete() -> Retention {
    JobOptions::default().remove_on_complete
}

fn default_remove_on_fail() -> Retention {
    JobOptions::default().remove_on_fail
}

fn default_visibility_secs() -> u64 {
    60
}

impl QueuePolicy {
    /// A policy with default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: default_concurrency(),
            attempts: default_attempts(),
            backoff: default_backoff(),
            remove_on_complete: default_remove_on_complete(),
            remove_on_fail: default_remove_on_fail(),
            visibility_timeout_secs: default_visibility_secs(),
            command: None,
        }
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.attempts = n;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retention(mut self, on_complete: Retention, on_fail: Retention) -> Self {
        self.remove_on_complete = on_complete;
        self.remove_on_fail = on_fail;
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs.max(1))
    }

    /// Options stamped onto every job enqueued with this policy.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.attempts,
            backoff: self.backoff,
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
        }
    }

    fn validate(&self) -> Result<()> {
        validate_queue_name(&self.name)?;
        if self.concurrency == 0 {
            return Err(Error::Config(format!("queue {}: concurrency must be at least 1", self.name)));
        }
        if self.attempts == 0 {
            return Err(Error::Config(format!("queue {}: attempts must be at least 1", self.name)));
        }
        Ok(())
    }
}

/// Queue names become pgmq table names: lowercase, digits, `-` and `_`,
/// starting with a letter.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid = name.len() <= MAX_QUEUE_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid queue name: {name:?}")))
    }
}

/// Registry of queue policies, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    queues: BTreeMap<String, QueuePolicy>,
}

impl QueueRegistry {
    /// Create an empty registry with no queues.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a policy. Names must be valid and unique.
    pub fn insert(&mut self, policy: QueuePolicy) -> Result<()> {
        policy.validate()?;
        if self.queues.contains_key(&policy.name) {
            return Err(Error::Config(format!("queue {} defined twice", policy.name)));
        }
        self.queues.insert(policy.name.clone(), policy);
        Ok(())
    }

    pub fn with(mut self, policy: QueuePolicy) -> Result<Self> {
        self.insert(policy)?;
        Ok(self)
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read queue dir {}: {e}", dir.display()))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        paths.sort();

        for path in paths {
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: QueueFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad queue config {}: {e}", path.display()))
                })?;
                registry.insert(file.queue).map_err(|e| {
                    Error::Config(format!("{}: {e}", path.display()))
                })?;
            }
        }

        Ok(registry)
    }

    /// Look up a queue by name.
    pub fn get(&self, name: &str) -> Option<&QueuePolicy> {
        self.queues.get(name)
    }

    /// Look up a queue, failing with [`Error::UnknownQueue`].
    pub fn require(&self, name: &str) -> Result<&QueuePolicy> {
        self.get(name)
            .ok_or_else(|| Error::UnknownQueue(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuePolicy> {
        self.queues.values()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names() {
        assert!(validate_queue_name("workflow-jobs").is_ok());
        assert!(validate_queue_name("review_jobs2").is_ok());
        assert!(validate_queue_name("Workflow").is_err());
        assert!(validate_queue_name("2fast").is_err());
        assert!(validate_queue_name("a b").is_err());
        assert!(validate_queue_name(&"a".repeat(48)).is_err());
    }

    #[test]
    fn policy_parses_with_defaults() {
        let file: QueueFile = toml::from_str(
            r#"
            [queue]
            name = "workflow-jobs"
            backoff = { type = "fixed", delay = 500 }
            remove_on_complete = true
            "#,
        )
        .unwrap();
        let policy = file.queue;
        assert_eq!(policy.concurrency, 1);
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff, Backoff::Fixed { delay: 500 });
        assert_eq!(policy.remove_on_complete, Retention::Remove);
        assert_eq!(policy.remove_on_fail, Retention::KeepLast(500));
        assert!(policy.command.is_none());
    }

    #[test]
    fn duplicate_queue_is_rejected() {
        let registry = QueueRegistry::empty()
            .with(QueuePolicy::new("jobs"))
            .unwrap();
        assert!(matches!(
            registry.with(QueuePolicy::new("jobs")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn shipped_queue_files_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("queues");
        let registry = QueueRegistry::load_from_dir(&dir).unwrap();
        let policy = registry.require("workflow-jobs").unwrap();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff, Backoff::Exponential { delay: 2000 });
        assert_eq!(policy.remove_on_complete, Retention::KeepLast(100));
        assert_eq!(policy.remove_on_fail, Retention::Keep);
        assert!(policy.command.is_some());
    }

    #[test]
    fn unknown_queue() {
        let registry = QueueRegistry::empty();
        assert!(matches!(registry.require("nope"), Err(Error::UnknownQueue(_))));
    }
}
