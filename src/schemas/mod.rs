//! Wire-level request/response shapes for the HTTP API.

pub mod task;

pub use task::{TaskListResponse, TaskStatusResponse, TranscribeResponse};
