//! # Job Handlers
//!
//! Job creation, append, and the read API the dashboard polls. All job
//! state is read back from the event log; these handlers never hold state
//! of their own.

use std::collections::{BTreeMap, HashSet};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::event_store::EventCursor;
use crate::events::{EntityType, Event, EventPayload, EventType};
use crate::models::TaskDefinition;
use crate::orchestration::dispatcher::request_id_for;
use crate::orchestration::{task_status, validate_dag, DagValidation, JobStatus, TaskStatus};
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

const SOURCE: &str = "api";
const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: String,
    pub total_tasks: usize,
    pub root_tasks: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AppendTasksRequest {
    pub tasks: Vec<TaskDefinition>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendTasksResponse {
    pub job_id: String,
    pub added_tasks: usize,
    pub immediately_ready: Vec<String>,
    pub total_tasks_now: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub tag: String,
    pub requires_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetailResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub total_tasks: usize,
    pub progress: BTreeMap<&'static str, usize>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskRow>,
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub total_tasks: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `POST /jobs` — validate the DAG, persist it, dispatch the roots.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let order = match validate_dag(&request.tasks, &HashSet::new()) {
        DagValidation::Valid { order } => order,
        DagValidation::Invalid { errors } => return Err(ApiError::Validation(errors)),
    };

    let job_id = format!("job-{}", Uuid::new_v4());
    let total_tasks = request.tasks.len();
    let root_tasks = request.tasks.iter().filter(|t| t.is_root()).count();

    let snapshot = state.events.job_event(
        &job_id,
        SOURCE,
        EventPayload::JobSaved {
            job_id: job_id.clone(),
            tasks: request.tasks.clone(),
            total_tasks,
        },
    );
    let created_at = snapshot.timestamp;
    state.store.append(snapshot).await?;

    for task in &request.tasks {
        let saved = state.events.task_event(
            request_id_for(&job_id, &task.task_id),
            SOURCE,
            EventPayload::TaskSaved {
                job_id: Some(job_id.clone()),
                task: task.clone(),
            },
        );
        state.store.append(saved).await?;
    }

    state.dispatcher.reconcile(&job_id).await?;
    info!(
        job_id = %job_id,
        total_tasks = total_tasks,
        order = ?order,
        "Job created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id,
            status: "created".to_string(),
            total_tasks,
            root_tasks,
            created_at,
        }),
    ))
}

/// `POST /jobs/{job_id}/tasks` — grow a live job's DAG.
pub async fn append_tasks(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<AppendTasksRequest>,
) -> ApiResult<Json<AppendTasksResponse>> {
    let Some(existing) = load_snapshot_tasks(&state, &job_id).await? else {
        return Err(ApiError::NotFound(format!("job not found: {job_id}")));
    };

    let completed = state
        .store
        .latest_event_of_type_for_entity(EntityType::Job, &job_id, EventType::JobCompleted)
        .await?;
    if completed.is_some() {
        return Err(ApiError::Conflict(format!(
            "job {job_id} already completed; no further tasks accepted"
        )));
    }

    let existing_ids: HashSet<String> = existing.iter().map(|t| t.task_id.clone()).collect();
    if let DagValidation::Invalid { errors } = validate_dag(&request.tasks, &existing_ids) {
        return Err(ApiError::Validation(errors));
    }

    // Rewrite the snapshot with the combined task list.
    let mut combined = existing;
    combined.extend(request.tasks.iter().cloned());
    let total_tasks_now = combined.len();
    let snapshot = state.events.job_event(
        &job_id,
        SOURCE,
        EventPayload::JobSaved {
            job_id: job_id.clone(),
            tasks: combined,
            total_tasks: total_tasks_now,
        },
    );
    state.store.append(snapshot).await?;

    for task in &request.tasks {
        let saved = state.events.task_event(
            request_id_for(&job_id, &task.task_id),
            SOURCE,
            EventPayload::TaskSaved {
                job_id: Some(job_id.clone()),
                task: task.clone(),
            },
        );
        state.store.append(saved).await?;
    }

    let new_ids: HashSet<&str> = request.tasks.iter().map(|t| t.task_id.as_str()).collect();
    let summary = state.dispatcher.reconcile(&job_id).await?;
    let immediately_ready: Vec<String> = summary
        .dispatched
        .into_iter()
        .filter(|id| new_ids.contains(id.as_str()))
        .collect();

    info!(
        job_id = %job_id,
        added = request.tasks.len(),
        immediately_ready = immediately_ready.len(),
        "Tasks appended"
    );

    Ok(Json(AppendTasksResponse {
        job_id,
        added_tasks: request.tasks.len(),
        immediately_ready,
        total_tasks_now,
    }))
}

/// `GET /jobs/{job_id}` — full job detail with per-task rows.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobDetailResponse>> {
    let job_events = state
        .store
        .events_for_entity(EntityType::Job, &job_id)
        .await?;
    let Some(created_at) = first_saved_at(&job_events) else {
        return Err(ApiError::NotFound(format!("job not found: {job_id}")));
    };
    let tasks = latest_snapshot_tasks(&job_events).unwrap_or_default();

    let completed_at = job_events
        .iter()
        .rev()
        .find(|e| e.event_type() == EventType::JobCompleted)
        .map(|e| e.timestamp);
    let failure_detected = job_events
        .iter()
        .any(|e| e.event_type() == EventType::JobFailureDetected);
    let status = JobStatus::derive(completed_at.is_some(), failure_detected);

    let mut progress: BTreeMap<&'static str, usize> = [
        (TaskStatus::Waiting.as_str(), 0),
        (TaskStatus::Pending.as_str(), 0),
        (TaskStatus::Processing.as_str(), 0),
        (TaskStatus::InReview.as_str(), 0),
        (TaskStatus::Completed.as_str(), 0),
        (TaskStatus::Failed.as_str(), 0),
    ]
    .into();

    let mut rows = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let latest = state
            .store
            .latest_event_for_entity(EntityType::Task, &request_id_for(&job_id, &task.task_id))
            .await?;
        let status = task_status(latest.as_ref());
        *progress.entry(status.as_str()).or_insert(0) += 1;
        rows.push(TaskRow {
            task_id: task.task_id.clone(),
            name: task.name.clone(),
            description: task.description.clone(),
            tag: task.tag.clone(),
            requires_review: task.requires_review,
            repo: task.repo.clone(),
            depends_on: task.depends_on.clone(),
            status,
            last_event_type: latest.as_ref().map(|e| e.event_type().as_str().to_string()),
            last_event_at: latest.as_ref().map(|e| e.timestamp),
        });
    }

    Ok(Json(JobDetailResponse {
        job_id,
        status,
        total_tasks: tasks.len(),
        progress,
        created_at,
        completed_at,
        tasks: rows,
    }))
}

/// `GET /jobs` — newest-first job listing, cursor-paginated.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let status_filter = query
        .status
        .as_deref()
        .map(parse_job_status)
        .transpose()?;
    let mut cursor = query.cursor.as_deref().map(decode_cursor).transpose()?;

    let mut jobs = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut next_cursor = None;

    // Appended jobs have several snapshots and filtered jobs consume
    // events without filling the page, so the scan walks pages until the
    // limit is met. The returned cursor is the filling event's own cursor:
    // fetched-but-unconsumed events are served again on the next call.
    'pages: loop {
        let page = state
            .store
            .events_of_type(EventType::JobSaved, limit, cursor)
            .await?;

        for entry in &page.events {
            let EventPayload::JobSaved {
                job_id,
                total_tasks,
                ..
            } = &entry.event.payload
            else {
                continue;
            };
            if !seen.insert(job_id.clone()) {
                continue;
            }

            let job_events = state
                .store
                .events_for_entity(EntityType::Job, job_id)
                .await?;
            let completed = job_events
                .iter()
                .any(|e| e.event_type() == EventType::JobCompleted);
            let failure = job_events
                .iter()
                .any(|e| e.event_type() == EventType::JobFailureDetected);
            let status = JobStatus::derive(completed, failure);
            if let Some(filter) = status_filter {
                if status != filter {
                    continue;
                }
            }
            let Some(created_at) = first_saved_at(&job_events) else {
                continue;
            };
            jobs.push(JobSummary {
                job_id: job_id.clone(),
                status,
                total_tasks: *total_tasks,
                created_at,
            });
            if jobs.len() == limit {
                next_cursor = Some(entry.cursor);
                break 'pages;
            }
        }

        match page.next {
            Some(older) => cursor = Some(older),
            None => break,
        }
    }

    Ok(Json(JobListResponse {
        jobs,
        next_cursor: next_cursor.map(encode_cursor),
    }))
}

async fn load_snapshot_tasks(
    state: &AppState,
    job_id: &str,
) -> ApiResult<Option<Vec<TaskDefinition>>> {
    let snapshot = state
        .store
        .latest_event_of_type_for_entity(EntityType::Job, job_id, EventType::JobSaved)
        .await?;
    Ok(snapshot.and_then(|event| match event.payload {
        EventPayload::JobSaved { tasks, .. } => Some(tasks),
        _ => None,
    }))
}

fn latest_snapshot_tasks(job_events: &[Event]) -> Option<Vec<TaskDefinition>> {
    job_events.iter().rev().find_map(|event| match &event.payload {
        EventPayload::JobSaved { tasks, .. } => Some(tasks.clone()),
        _ => None,
    })
}

/// Creation time is the first snapshot's timestamp; appends rewrite the
/// snapshot but never the creation time.
fn first_saved_at(job_events: &[Event]) -> Option<DateTime<Utc>> {
    job_events
        .iter()
        .find(|e| e.event_type() == EventType::JobSaved)
        .map(|e| e.timestamp)
}

fn parse_job_status(value: &str) -> ApiResult<JobStatus> {
    match value {
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "partial_failure" => Ok(JobStatus::PartialFailure),
        other => Err(ApiError::BadRequest(format!(
            "invalid status filter: {other}"
        ))),
    }
}

fn encode_cursor(cursor: EventCursor) -> String {
    // Serialization of a plain struct cannot fail.
    let json = serde_json::to_vec(&cursor).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

fn decode_cursor(encoded: &str) -> ApiResult<EventCursor> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| ApiError::BadRequest("invalid cursor".to_string()))?;
    serde_json::from_slice(&bytes).map_err(|_| ApiError::BadRequest("invalid cursor".to_string()))
}
