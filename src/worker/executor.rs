//! # Subprocess Executor
//!
//! Runs one task payload as an isolated OS process: arguments are the
//! request id and the JSON-encoded work item, stdin is closed, and the
//! environment is rebuilt from an explicit allow-list. The last line of
//! stdout is the structured result; everything else is operator output.
//!
//! Cancellation is wall-clock only: SIGTERM, a grace window, then SIGKILL.
//! There is no cooperative channel into the payload.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::constants::SUBPROCESS_ENV_ALLOWLIST;
use crate::error::{JobflowError, Result};
use crate::messaging::WorkItemMessage;

/// Shortest timeout a payload can be configured with.
pub const MIN_TIMEOUT_MS: u64 = 5_000;
/// Longest timeout a payload can be configured with.
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;
/// Grace window between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Structured result of a successful payload run.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadResult {
    pub output: serde_json::Value,
    pub usage: serde_json::Value,
    pub duration_ms: u64,
}

/// How one payload run ended. `Failure` is the payload's own verdict
/// (non-zero exit); infrastructure problems that prevented a run (spawn or
/// wait failures) surface as `Err` so the runtime can retry them in-process.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(PayloadResult),
    Timeout {
        timeout_ms: u64,
        elapsed_ms: u64,
        signal: String,
    },
    Failure {
        message: String,
        code: Option<String>,
    },
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, item: &WorkItemMessage) -> Result<ExecutionOutcome>;
}

/// The final stdout line a payload must emit.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadEnvelope {
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    usage: serde_json::Value,
    #[serde(default)]
    duration_ms: Option<u64>,
}

/// Clamp a configured timeout into the supported range.
pub fn clamp_timeout_ms(timeout_ms: u64) -> u64 {
    timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

pub struct SubprocessExecutor {
    command: String,
    timeout: Duration,
    extra_env: Vec<String>,
}

impl SubprocessExecutor {
    pub fn new(command: impl Into<String>, timeout_ms: u64, extra_env: Vec<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_millis(clamp_timeout_ms(timeout_ms)),
            extra_env,
        }
    }

    #[cfg(test)]
    fn with_raw_timeout(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            extra_env: Vec::new(),
        }
    }

    fn build_command(&self, item: &WorkItemMessage, input_json: &str) -> Command {
        let mut command = Command::new(&self.command);
        command
            .arg(&item.request_id)
            .arg(input_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);

        for name in SUBPROCESS_ENV_ALLOWLIST
            .iter()
            .copied()
            .chain(self.extra_env.iter().map(String::as_str))
        {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }
        command
    }
}

#[async_trait]
impl TaskExecutor for SubprocessExecutor {
    async fn execute(&self, item: &WorkItemMessage) -> Result<ExecutionOutcome> {
        let input_json = serde_json::to_string(item).map_err(|e| {
            JobflowError::ExecutionError(format!("failed to encode work item: {e}"))
        })?;

        let mut child = self.build_command(item, &input_json).spawn().map_err(|e| {
            JobflowError::ExecutionError(format!(
                "failed to spawn payload command '{}': {e}",
                self.command
            ))
        })?;

        let start = Instant::now();
        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(JobflowError::ExecutionError(format!(
                    "failed to wait on payload: {e}"
                )))
            }
            Err(_) => {
                let signal = terminate(&mut child).await;
                let elapsed_ms = start.elapsed().as_millis() as u64;
                warn!(
                    request_id = %item.request_id,
                    elapsed_ms = elapsed_ms,
                    signal = signal,
                    "Payload execution timed out"
                );
                return Ok(ExecutionOutcome::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                    elapsed_ms,
                    signal: signal.to_string(),
                });
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let stdout = stdout_reader.await.unwrap_or_default();
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            let message = if stderr.trim().is_empty() {
                format!("payload exited with status {status}")
            } else {
                stderr.trim().to_string()
            };
            return Ok(ExecutionOutcome::Failure {
                message,
                code: status.code().map(|c| c.to_string()),
            });
        }

        Ok(ExecutionOutcome::Success(parse_result(&stdout, elapsed_ms)))
    }
}

/// Read a captured pipe fully in the background so the child never blocks
/// on a full pipe buffer.
fn drain<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buffer).await;
        }
        buffer
    })
}

/// SIGTERM, grace window, then SIGKILL. Returns the signal that ended the
/// process.
async fn terminate(child: &mut Child) -> &'static str {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return "SIGTERM";
        }
    }
    let _ = child.kill().await;
    "SIGKILL"
}

/// Parse the last non-empty stdout line as the payload envelope. Malformed
/// output degrades to an empty result rather than failing the task.
fn parse_result(stdout: &str, elapsed_ms: u64) -> PayloadResult {
    let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty());
    let envelope = last_line.and_then(|line| serde_json::from_str::<PayloadEnvelope>(line).ok());

    match envelope {
        Some(envelope) => PayloadResult {
            output: envelope.output,
            usage: envelope.usage,
            duration_ms: envelope.duration_ms.unwrap_or(elapsed_ms),
        },
        None => {
            debug!("Payload emitted no structured result line");
            PayloadResult {
                output: serde_json::Value::Null,
                usage: serde_json::Value::Null,
                duration_ms: elapsed_ms,
            }
        }
    }
}
