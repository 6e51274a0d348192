//! Router wiring for the HTTP API.

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::handlers::{health, jobs, task_definitions};
use super::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/jobs/:job_id/tasks", post(jobs::append_tasks))
        .route(
            "/task-definitions",
            get(task_definitions::list_task_definitions),
        )
        .route(
            "/task-definitions/:name",
            put(task_definitions::put_task_definition),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
