//! Reusable task template endpoints.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::template_name_pattern;
use crate::models::TaskTemplate;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutTaskDefinitionRequest {
    pub description: String,
    pub tag: String,
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default)]
    pub repo: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinitionListResponse {
    pub templates: Vec<TaskTemplate>,
}

/// `PUT /task-definitions/{name}` — upsert a template by name.
pub async fn put_task_definition(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<PutTaskDefinitionRequest>,
) -> ApiResult<Json<TaskTemplate>> {
    let mut errors = Vec::new();
    if !template_name_pattern().is_match(&name) {
        errors.push(format!("invalid template name: '{name}'"));
    }
    if request.description.trim().is_empty() {
        errors.push("description is required".to_string());
    }
    if request.tag.trim().is_empty() {
        errors.push("tag is required".to_string());
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let now = Utc::now();
    let stored = state
        .templates
        .upsert(TaskTemplate {
            name: name.clone(),
            description: request.description,
            tag: request.tag,
            requires_review: request.requires_review,
            repo: request.repo,
            created_at: now,
            updated_at: now,
        })
        .await?;

    info!(name = %name, "Task definition upserted");
    Ok(Json(stored))
}

/// `GET /task-definitions` — list all templates.
pub async fn list_task_definitions(
    State(state): State<AppState>,
) -> ApiResult<Json<TaskDefinitionListResponse>> {
    let templates = state.templates.list().await?;
    Ok(Json(TaskDefinitionListResponse { templates }))
}
