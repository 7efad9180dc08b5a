use utoipa::OpenApi;

use crate::routes::{health, tasks, transcribe};

#[derive(OpenApi)]
#[openapi(info(
    title = "audio2memo-server",
    description = "Audio transcription to memo document service",
    version = "0.1.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(transcribe::TranscribeApi::openapi());
    root.merge(tasks::TasksApi::openapi());
    root
}
