use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::{ResultFiles, TaskRecord};

/// Response to a successful submission (`POST /api/transcribe`).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TranscribeResponse {
    /// Always `"success"` on the 200 path.
    pub status: String,
    /// Identifier for polling `GET /api/task_status/{task_id}`.
    pub task_id: String,
    pub message: String,
}

/// Public view of one task (`GET /api/task_status/{task_id}`).
///
/// Internal fields (file path, submitter IP, user agent) are deliberately not
/// exposed here.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: String,
    pub submit_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub file_name: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_files: Option<ResultFiles>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    pub to_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_status: Option<String>,
}

/// Response for `GET /api/tasks` (non-terminal tasks only).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskStatusResponse>,
}

impl From<TaskRecord> for TaskStatusResponse {
    fn from(r: TaskRecord) -> Self {
        TaskStatusResponse {
            task_id: r.task_id,
            status: r.status.to_string(),
            submit_time: r.submit_time,
            last_update_time: r.last_update_time,
            file_name: r.file_name,
            model: r.model,
            error: r.error,
            result_files: r.result_files,
            processing_time: r.processing_time,
            to_email: r.to_email,
            email_status: r.email_status,
        }
    }
}
