//! # Web API
//!
//! The HTTP surface: job submission and append, the read API the
//! dashboard polls, and template management. Handlers operate purely on
//! the injected [`AppState`] handles.

pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;

pub use errors::{ApiError, ApiResult};
pub use routes::build_router;
pub use state::AppState;
