//! # Worker
//!
//! Everything a worker process runs: the lease-based queue consumption
//! state machine, the subprocess executor, failure classification, and the
//! retry helper. Workers share no in-process state with each other; all
//! coordination goes through the event store and the queue's visibility
//! timeouts.

pub mod error_classifier;
pub mod executor;
pub mod retry;
pub mod runtime;

pub use error_classifier::{classify, Classification, ErrorCategory};
pub use executor::{ExecutionOutcome, PayloadResult, SubprocessExecutor, TaskExecutor};
pub use retry::{with_retry, RetryPolicy};
pub use runtime::WorkerRuntime;
