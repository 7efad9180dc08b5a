//! Audio submission route – async task pattern.
//!
//! Accepts a multipart upload, persists the file into a per-task workspace,
//! inserts the task record in `submitted`, and hands the job to the
//! orchestrator. The response returns as soon as the hand-off succeeds;
//! callers poll `GET /api/task_status/{task_id}` for progress.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Multipart, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use tracing::{debug, info, warn};
use utoipa::OpenApi;
use uuid::Uuid;
use validator::ValidateEmail;

use crate::db::TaskStore;
use crate::entities::{TaskRecord, TaskStatus, TaskUpdate, truncate_error};
use crate::error::ServerError;
use crate::pipeline::TaskWorkspace;
use crate::schemas::TranscribeResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(transcribe))]
pub struct TranscribeApi;

/// Register the submission route.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/transcribe", post(transcribe))
}

const ALLOWED_MIME_TYPES: [&str; 12] = [
    "audio/mpeg",       // MP3
    "audio/wav",        // WAV
    "audio/wave",       // WAV (alternative)
    "audio/x-wav",      // WAV (alternative)
    "audio/flac",       // FLAC
    "audio/x-flac",     // FLAC (alternative)
    "audio/mp4",        // M4A
    "audio/x-m4a",      // M4A (alternative)
    "audio/ogg",        // OGG
    "video/mp4",        // MP4 video
    "video/x-matroska", // MKV video
    "video/webm",       // WebM video
];

/// Everything read out of the multipart form before any state is created.
#[derive(Default)]
struct Submission {
    file_bytes: Vec<u8>,
    file_name: String,
    content_type: Option<String>,
    to_email: Option<String>,
    cc_emails: Option<String>,
    model: Option<String>,
    output_type: Option<String>,
}

/// Submit an audio file for transcription (`POST /api/transcribe`).
///
/// Multipart fields: `file` (required), `to_email` (required), `cc_emails`,
/// `model`, `output_type`. Returns the task ID immediately; progress is
/// available via `GET /api/task_status/{task_id}`.
#[utoipa::path(
    post,
    path = "/api/transcribe",
    tag = "transcribe",
    request_body(content = Vec<u8>, description = "Audio/video upload plus submission fields", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Task accepted", body = TranscribeResponse),
        (status = 400, description = "Invalid submission (missing file, bad email, wrong type, too large)"),
        (status = 500, description = "Storage or persistence error"),
    )
)]
pub async fn transcribe(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<TranscribeResponse>, ServerError> {
    let max_bytes = state.config.max_upload_size_mb * 1024 * 1024;
    let submission = read_submission(multipart, max_bytes, state.config.max_upload_size_mb).await?;

    // All request validation happens before a task ID, workspace, or record
    // exists; a rejected submission leaves no trace.
    if submission.file_bytes.is_empty() {
        return Err(ServerError::BadRequest("No file uploaded".into()));
    }
    let to_email = submission
        .to_email
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServerError::BadRequest("to_email is required".into()))?;
    if !to_email.validate_email() {
        return Err(ServerError::BadRequest(format!(
            "invalid to_email address: {to_email}"
        )));
    }

    // Storage misconfiguration is a deployment problem, reported as such
    // rather than as a caller error.
    if !state.config.storage_dir.is_dir() {
        return Err(ServerError::Configuration(format!(
            "storage directory {} does not exist or is not a directory",
            state.config.storage_dir.display()
        )));
    }

    let task_id = Uuid::new_v4().to_string();
    let workspace = TaskWorkspace::create(&state.config.storage_dir, &task_id)
        .map_err(|e| ServerError::Internal(format!("failed to create task workspace: {e}")))?;

    let file_name = sanitize_filename(&submission.file_name);
    let input_file = workspace.base_dir.join(&file_name);
    if let Err(e) = tokio::fs::write(&input_file, &submission.file_bytes).await {
        workspace.remove();
        return Err(ServerError::Internal(format!(
            "failed to save uploaded file: {e}"
        )));
    }
    let project_name = input_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_owned());

    info!(
        task_id = %task_id,
        file_name = %file_name,
        size_bytes = submission.file_bytes.len(),
        to_email = %to_email,
        "accepted submission"
    );

    let now = Utc::now();
    let model = submission
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.default_model.clone());
    let cc_emails = submission
        .cc_emails
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty());
    let record = TaskRecord {
        task_id: task_id.clone(),
        status: TaskStatus::Submitted,
        submit_time: now,
        last_update_time: now,
        finish_time: None,
        file_name: file_name.clone(),
        file_path: input_file.to_string_lossy().into_owned(),
        file_size: submission.file_bytes.len() as i64,
        file_type: submission.content_type,
        model: model.clone(),
        output_type: Some(
            submission
                .output_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "all".to_owned()),
        ),
        to_email: to_email.to_owned(),
        cc_emails: cc_emails.clone(),
        submitter_ip: Some(remote_addr.ip().to_string()),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        result_files: None,
        error: None,
        processing_time: None,
        email_sent: None,
        email_status: None,
    };
    if let Err(e) = state.store.insert_task(record).await {
        workspace.remove();
        return Err(ServerError::Storage(e));
    }

    let job = crate::orchestrator::TaskJob {
        task_id: task_id.clone(),
        project_name,
        input_file,
        model,
        to_email: to_email.to_owned(),
        cc_emails,
        workspace,
    };
    if let Err(e) = state.orchestrator.submit(job).await {
        // The record exists; mark it failed so it never lingers in
        // `submitted` with nothing driving it.
        warn!(task_id = %task_id, error = %e, "failed to enqueue task");
        let error_text = truncate_error(&format!("Failed to enqueue for processing: {e}"));
        let update = TaskUpdate {
            status: Some(TaskStatus::Failed),
            error: Some(error_text),
            finish_time: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(db_e) = state.store.update_task(&task_id, update).await {
            warn!(task_id = %task_id, error = %db_e, "failed to mark unenqueued task failed");
        }
        return Err(ServerError::Internal(format!(
            "failed to enqueue task for processing: {e}"
        )));
    }

    Ok(Json(TranscribeResponse {
        status: "success".to_owned(),
        task_id,
        message: "Task submitted successfully".to_owned(),
    }))
}

/// Drain the multipart form, streaming the file field with an in-flight size
/// cap so an oversized upload is rejected without buffering it whole.
async fn read_submission(
    mut multipart: Multipart,
    max_bytes: usize,
    max_mb: usize,
) -> Result<Submission, ServerError> {
    let mut submission = Submission::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Failed to read multipart field: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                submission.file_name = field.file_name().unwrap_or("upload").to_owned();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_owned();
                if !content_type.starts_with("audio/") && !content_type.starts_with("video/") {
                    return Err(ServerError::BadRequest(format!(
                        "Invalid file type: {content_type}. Only audio and video files are allowed."
                    )));
                }
                if !ALLOWED_MIME_TYPES.contains(&content_type.as_str()) {
                    return Err(ServerError::BadRequest(format!(
                        "Unsupported file format: {content_type}. Supported formats: \
                         MP3, WAV, FLAC, M4A, OGG, MP4, MKV, WebM"
                    )));
                }
                submission.content_type = Some(content_type);

                while let Some(chunk) = field.chunk().await.map_err(|e| {
                    ServerError::BadRequest(format!("Failed to read file chunk: {e}"))
                })? {
                    submission.file_bytes.extend_from_slice(&chunk);
                    if submission.file_bytes.len() > max_bytes {
                        return Err(ServerError::BadRequest(format!(
                            "File too large: {} bytes exceeds maximum of {max_mb}MB",
                            submission.file_bytes.len()
                        )));
                    }
                }
                debug!(
                    file_name = %submission.file_name,
                    size_bytes = submission.file_bytes.len(),
                    "received file upload"
                );
            }
            "to_email" => submission.to_email = Some(read_text_field(field).await?),
            "cc_emails" => submission.cc_emails = Some(read_text_field(field).await?),
            "model" => submission.model = Some(read_text_field(field).await?),
            "output_type" => submission.output_type = Some(read_text_field(field).await?),
            // Extra form fields are ignored rather than rejected.
            other => {
                debug!(field = %other, "ignoring unknown form field");
            }
        }
    }

    Ok(submission)
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ServerError> {
    field
        .text()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Failed to read form field: {e}")))
}

/// Sanitize a filename to prevent directory traversal.
fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use super::*;
    use crate::config::{Config, MailConfig, StageConfig};
    use crate::db::sqlite::SqliteStore;
    use crate::orchestrator::Orchestrator;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("Meeting 2026-08.mp3"), "Meeting_2026-08.mp3");
    }

    #[test]
    fn email_validation_catches_malformed_addresses() {
        assert!("user@example.com".validate_email());
        assert!(!"not an address".validate_email());
        assert!(!"".validate_email());
    }

    #[test]
    fn mime_allow_list_covers_common_audio() {
        for mime in ["audio/mpeg", "audio/wav", "audio/mp4", "video/mp4"] {
            assert!(ALLOWED_MIME_TYPES.contains(&mime), "{mime}");
        }
        assert!(!ALLOWED_MIME_TYPES.contains(&"application/pdf"));
    }

    // ── Route-level tests ─────────────────────────────────────────────────────

    const BOUNDARY: &str = "a2m-form-boundary";

    fn form_part(name: &str, value: &str) -> String {
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        )
    }

    fn file_part(filename: &str, mime: &str, bytes: &str) -> String {
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
             filename=\"{filename}\"\r\nContent-Type: {mime}\r\n\r\n{bytes}\r\n"
        )
    }

    fn close_form(parts: &[String]) -> String {
        let mut body = parts.concat();
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    fn test_config(storage_dir: PathBuf) -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_owned(),
            database_url: String::new(),
            storage_dir,
            log_level: "info".to_owned(),
            log_json: false,
            queue_capacity: 8,
            max_upload_size_mb: 1,
            default_model: "gpt-4o-transcribe".to_owned(),
            enable_swagger: false,
            cors_allowed_origins: None,
            mail: MailConfig::default(),
            stages: StageConfig {
                api_base: "http://127.0.0.1:0".to_owned(),
                api_key: None,
                chat_model: "gpt-4o".to_owned(),
                wordforword_prompt_path: PathBuf::from("missing"),
                memo_prompt_path: PathBuf::from("missing"),
                segment_seconds: 600,
            },
        }
    }

    async fn test_app(
        orchestrator: Orchestrator,
    ) -> (axum::Router, Arc<SqliteStore>, PathBuf) {
        let storage_dir = std::env::temp_dir().join(format!("a2m-route-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&storage_dir).expect("create storage dir");
        let db_path = std::env::temp_dir().join(format!("a2m-route-{}.db", Uuid::new_v4()));
        let store = Arc::new(
            SqliteStore::connect(&format!("sqlite://{}", db_path.display()))
                .await
                .expect("open temp sqlite store"),
        );
        let state = Arc::new(crate::state::AppState {
            config: Arc::new(test_config(storage_dir.clone())),
            store: Arc::clone(&store),
            orchestrator,
        });
        (crate::routes::build(state), store, storage_dir)
    }

    fn post_transcribe(body: String) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/transcribe")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("build request");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4321))));
        request
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        serde_json::from_slice(&bytes).expect("json response body")
    }

    #[tokio::test]
    async fn missing_to_email_is_rejected_before_any_record_exists() {
        let (app, store, _) = test_app(Orchestrator::accepting_stub()).await;

        let body = close_form(&[file_part("meeting.mp3", "audio/mpeg", "fake audio bytes")]);
        let response = app.oneshot(post_transcribe(body)).await.expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.list_active_tasks().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn blank_or_malformed_to_email_is_rejected_before_any_record_exists() {
        for bad_email in ["   ", "not-an-address"] {
            let (app, store, _) = test_app(Orchestrator::accepting_stub()).await;

            let body = close_form(&[
                file_part("meeting.mp3", "audio/mpeg", "fake audio bytes"),
                form_part("to_email", bad_email),
            ]);
            let response = app.oneshot(post_transcribe(body)).await.expect("response");

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{bad_email:?}");
            assert!(store.list_active_tasks().await.expect("list").is_empty());
        }
    }

    #[tokio::test]
    async fn valid_submission_is_immediately_readable_as_submitted() {
        let (app, store, _) = test_app(Orchestrator::accepting_stub()).await;

        // The extra `comment` field is ignored rather than rejected.
        let body = close_form(&[
            file_part("Team Meeting.mp3", "audio/mpeg", "fake audio bytes"),
            form_part("to_email", "user@example.com"),
            form_part("cc_emails", "cc@example.com"),
            form_part("comment", "please hurry"),
        ]);
        let response = app
            .clone()
            .oneshot(post_transcribe(body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "success");
        let task_id = json["task_id"].as_str().expect("task_id").to_owned();

        let record = store.get_task(&task_id).await.expect("get").expect("exists");
        assert_eq!(record.status, TaskStatus::Submitted);
        assert_eq!(record.file_name, "Team_Meeting.mp3");
        assert_eq!(record.to_email, "user@example.com");
        assert_eq!(record.cc_emails.as_deref(), Some("cc@example.com"));
        assert_eq!(record.output_type.as_deref(), Some("all"));
        assert_eq!(record.submitter_ip.as_deref(), Some("127.0.0.1"));

        // And the polling endpoint sees the same record right away.
        let status_request = Request::builder()
            .uri(format!("/api/task_status/{task_id}"))
            .body(Body::empty())
            .expect("build request");
        let response = app.oneshot(status_request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "submitted");
    }

    #[tokio::test]
    async fn handoff_failure_marks_the_record_failed() {
        let (app, store, storage_dir) = test_app(Orchestrator::disconnected()).await;

        let body = close_form(&[
            file_part("meeting.mp3", "audio/mpeg", "fake audio bytes"),
            form_part("to_email", "user@example.com"),
        ]);
        let response = app.oneshot(post_transcribe(body)).await.expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // The record never lingers in `submitted` with nothing driving it.
        assert!(store.list_active_tasks().await.expect("list").is_empty());

        // The workspace directory is named after the task ID.
        let task_id = std::fs::read_dir(&storage_dir)
            .expect("read storage dir")
            .filter_map(Result::ok)
            .find(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .expect("task workspace should exist");
        let record = store.get_task(&task_id).await.expect("get").expect("exists");
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(
            record
                .error
                .as_deref()
                .is_some_and(|e| e.contains("Failed to enqueue for processing"))
        );
    }
}
