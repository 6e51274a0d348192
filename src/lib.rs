//! # Jobflow Core
//!
//! Event-sourced orchestration of DAG-shaped jobs executed by autonomous
//! agents. Clients submit a task graph; the engine validates it, derives
//! execution order, dispatches ready work through a visibility-timeout
//! queue, and tracks every state change in an append-only event log.
//!
//! ## Architecture
//!
//! - [`events`] / [`event_store`] — the append-only log and its access
//!   patterns; every piece of runtime state is derived from it.
//! - [`orchestration`] — DAG validation, the event-to-status projection,
//!   and the stateless dispatcher that reconciles a job's frontier.
//! - [`messaging`] — the pgmq-backed work and reconcile queues.
//! - [`worker`] — lease-based consumption, subprocess execution, failure
//!   classification, and retry with backoff.
//! - [`web`] — the axum API for job submission and polling.
//! - [`registry`] — reusable task templates.
//!
//! There is no lock anywhere in the system. Exactly-once dispatch is
//! approximated with at-least-once delivery, idempotent guarded event
//! emission, and time-bounded leases; the event store is the single
//! source of truth.

pub mod config;
pub mod constants;
pub mod error;
pub mod event_store;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod web;
pub mod worker;

pub use config::JobflowConfig;
pub use error::{JobflowError, Result};

/// Crate version, reported by the binaries at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
