//! External-command processor: runs a workflow as a child process.
//!
//! The job payload is written to the child's stdin as JSON. Every stdout
//! line becomes a `status` event; the last line that parses as JSON is the
//! job result. A non-zero exit is a retryable failure; exit code 2 means the
//! workflow rejected its input and is permanent.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::processor::{JobContext, JobError, Processor};
use crate::queue::CommandConfig;

/// Exit code a workflow uses for "retrying will not help".
pub const EXIT_PERMANENT: i32 = 2;

pub struct CommandProcessor {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn from_config(config: &CommandConfig) -> Self {
        Self {
            command: config.path.clone(),
            args: config.args.clone(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve relative command paths against the process CWD, not the
    /// child's working directory.
    fn resolve(command: &Path) -> std::io::Result<PathBuf> {
        if command.is_relative() && command.components().count() > 1 {
            Ok(std::env::current_dir()?.join(command))
        } else {
            Ok(command.to_path_buf())
        }
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let start = Instant::now();
        let job = &ctx.job;
        let command = Self::resolve(&self.command)
            .map_err(|e| JobError::retryable(format!("resolve command: {e}")))?;

        debug!(command = %command.display(), job_id = %job.id, "running workflow command");

        if job.attempts == 1 {
            ctx.events
                .workflow_started(&job.workflow_id, &job.payload.name)
                .await?;
        }

        let mut child = Command::new(&command)
            .args(&self.args)
            .env("RELAY_JOB_ID", job.id.to_string())
            .env("RELAY_WORKFLOW_ID", job.workflow_id.as_str())
            .env("RELAY_WORKFLOW_NAME", &job.payload.name)
            .env("RELAY_ATTEMPT", job.attempts.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::retryable(format!("spawn {}: {e}", command.display())))?;

        let input = serde_json::to_vec(&job.payload)
            .map_err(|e| JobError::permanent(format!("serialize payload: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                Ok(()) => {}
                // The child may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(job_id = %job.id, "workflow command did not read its input");
                }
                Err(e) => return Err(JobError::retryable(format!("write stdin: {e}"))),
            }
            // Dropping stdin closes it so the child sees EOF.
        }

        let mut result = Value::Null;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "reading workflow output failed");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(value) if value.is_object() => result = value,
                    _ => {
                        ctx.events.status(&job.workflow_id, line).await?;
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| JobError::retryable(format!("wait for workflow: {e}")))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        match status.code() {
            Some(0) => {
                info!(job_id = %job.id, duration_ms, "workflow command succeeded");
                ctx.events
                    .workflow_completed(&job.workflow_id, None, Some(result.clone()))
                    .await?;
                Ok(result)
            }
            Some(EXIT_PERMANENT) => Err(JobError::permanent(format!(
                "{} rejected the job (exit {EXIT_PERMANENT})",
                command.display()
            ))),
            code => Err(JobError::retryable(format!(
                "{} exited with status {}",
                command.display(),
                code.unwrap_or(-1)
            ))),
        }
    }
}
