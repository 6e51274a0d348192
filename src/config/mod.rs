//! # Jobflow Configuration System
//!
//! Layered configuration for the orchestrator and worker processes:
//! built-in defaults, an optional `jobflow.toml` file, and
//! `JOBFLOW_`-prefixed environment variable overrides, in that order.
//! Every section is explicit; there are no hidden fallbacks outside this
//! module.
//!
//! ```rust,no_run
//! use jobflow_core::config::JobflowConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = JobflowConfig::load()?;
//! let queue = &config.queues.task_queue;
//! let timeout = config.worker.execution_timeout_ms;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_RECONCILE_QUEUE, DEFAULT_TASK_QUEUE};
use crate::error::{JobflowError, Result};

/// Root configuration for all jobflow processes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobflowConfig {
    pub database: DatabaseConfig,
    pub tenant: TenantConfig,
    pub queues: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string (also used by the pgmq queues).
    pub url: String,
    /// Connection pool size.
    pub pool: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Tenant every event is scoped under.
    pub tenant_id: String,
    /// Owning application name recorded in event context.
    pub app_name: String,
    /// Deployment environment recorded in event context.
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue carrying work item messages to workers.
    pub task_queue: String,
    /// Queue carrying `{job_id}` reconciliation nudges to the dispatcher.
    pub reconcile_queue: String,
    /// Long-poll wait when receiving, in seconds.
    pub poll_wait_seconds: u64,
    /// Interval between visibility extensions / heartbeats, in milliseconds.
    pub visibility_extension_interval_ms: u64,
    /// Visibility window granted on each extension, in seconds.
    pub visibility_extension_seconds: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Visibility timeout for reconcile nudges; a failed pass redelivers
    /// after this long.
    pub reconcile_visibility_seconds: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum in-flight task executions per worker process.
    pub max_concurrent_executions: usize,
    /// Deliveries after which a message is dead-lettered.
    pub max_message_retries: i32,
    /// Review/revision iterations after which a task fails terminally.
    pub max_task_iterations: u32,
    /// Hard wall-clock limit for one payload execution, in milliseconds.
    pub execution_timeout_ms: u64,
    /// Command invoked to execute a task payload.
    pub payload_command: String,
    /// Extra environment variable names forwarded to the payload, on top of
    /// the built-in allow-list.
    pub extra_env_allowlist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address for the HTTP API.
    pub bind_address: String,
}

impl Default for JobflowConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            tenant: TenantConfig::default(),
            queues: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            worker: WorkerConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/jobflow".to_string(),
            pool: 10,
        }
    }
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            app_name: "jobflow".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            reconcile_queue: DEFAULT_RECONCILE_QUEUE.to_string(),
            poll_wait_seconds: 20,
            visibility_extension_interval_ms: 20_000,
            visibility_extension_seconds: 30,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            reconcile_visibility_seconds: 30,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 3,
            max_message_retries: 3,
            max_task_iterations: 5,
            execution_timeout_ms: 200_000,
            payload_command: "jobflow-payload".to_string(),
            extra_env_allowlist: Vec::new(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl JobflowConfig {
    /// Load configuration from defaults, `jobflow.toml` (if present), and
    /// `JOBFLOW_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit file path instead of the default
    /// `jobflow.toml` lookup.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let file = path.unwrap_or("jobflow.toml");
        builder = builder.add_source(config::File::with_name(file).required(path.is_some()));

        builder = builder.add_source(
            config::Environment::with_prefix("JOBFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| JobflowError::ConfigurationError(format!("failed to load config: {e}")))?;

        let config: JobflowConfig = settings
            .try_deserialize()
            .map_err(|e| JobflowError::ConfigurationError(format!("invalid config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that can only fail at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.worker.max_concurrent_executions == 0 {
            return Err(JobflowError::ConfigurationError(
                "worker.max_concurrent_executions must be at least 1".to_string(),
            ));
        }
        if self.queues.visibility_extension_seconds == 0 {
            return Err(JobflowError::ConfigurationError(
                "queues.visibility_extension_seconds must be at least 1".to_string(),
            ));
        }
        if self.queues.task_queue == self.queues.reconcile_queue {
            return Err(JobflowError::ConfigurationError(
                "task_queue and reconcile_queue must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between lease renewals.
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.queues.visibility_extension_interval_ms)
    }

    /// How long a freshly granted lease lasts: 1.5x the visibility window,
    /// so the lease outlives a single missed renewal but not two.
    pub fn lease_duration_seconds(&self) -> i64 {
        (self.queues.visibility_extension_seconds as i64 * 3) / 2
    }
}
