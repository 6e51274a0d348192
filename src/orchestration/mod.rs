//! # Orchestration
//!
//! The engine's control plane: DAG validation at submission time, the
//! event-to-status projection, and the dispatcher that reconciles a job's
//! frontier after every observed change.
//!
//! All coordination is through the event store and the queues; there is no
//! lock anywhere. Correctness rests on guarded, idempotent event emission
//! and on reconciliation being stateless and safe to re-run.

pub mod dag_validator;
pub mod dispatcher;
pub mod enqueuer;
pub mod projection;

pub use dag_validator::{validate_dag, DagValidation};
pub use dispatcher::{Dispatcher, ReconcileSummary};
pub use enqueuer::TaskEnqueuer;
pub use projection::{task_status, JobStatus, TaskStatus};
