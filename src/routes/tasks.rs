//! Task query endpoints.
//!
//! These are read-only views over the task store; all mutation happens in
//! the orchestrator.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::db::TaskStore;
use crate::error::ServerError;
use crate::schemas::{TaskListResponse, TaskStatusResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_task_status, list_tasks))]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/task_status/{task_id}", get(get_task_status))
        .route("/tasks", get(list_tasks))
}

/// Fetch one task's current state (`GET /api/task_status/{task_id}`).
#[utoipa::path(
    get,
    path = "/api/task_status/{task_id}",
    tag = "tasks",
    params(("task_id" = String, Path, description = "Task identifier from the submission response")),
    responses(
        (status = 200, description = "Current task state", body = TaskStatusResponse),
        (status = 404, description = "No task with this ID"),
    )
)]
pub async fn get_task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServerError> {
    let record = state
        .store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {task_id} not found")))?;
    Ok(Json(record.into()))
}

/// List all non-terminal tasks, oldest first (`GET /api/tasks`).
#[utoipa::path(
    get,
    path = "/api/tasks",
    tag = "tasks",
    responses(
        (status = 200, description = "Active (non-terminal) tasks, oldest first", body = TaskListResponse),
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TaskListResponse>, ServerError> {
    let records = state.store.list_active_tasks().await?;
    Ok(Json(TaskListResponse {
        tasks: records.into_iter().map(Into::into).collect(),
    }))
}
