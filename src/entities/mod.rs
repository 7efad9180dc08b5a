//! Domain entities persisted by the task store.

pub mod task;

pub use task::{MAX_ERROR_LEN, ResultFiles, TaskRecord, TaskStatus, TaskUpdate, truncate_error};
