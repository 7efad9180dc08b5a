//! Database abstraction layer.
//!
//! [`TaskStore`] defines the interface for persisting task records. The
//! default implementation is [`sqlite::SqliteStore`]. To swap to another
//! database (Postgres, MySQL, …), implement [`TaskStore`] for your new type
//! and change the concrete type in [`crate::state::AppState`].
//!
//! All trait methods use `impl Future` in their signatures (stable since Rust
//! 1.75) so no extra `async-trait` crate is required.

pub mod sqlite;

use thiserror::Error;

use crate::entities::{TaskRecord, TaskUpdate};

/// Persistence-layer failure.
///
/// The store never retries internally; callers decide whether a storage
/// error is fatal to the task or retryable at the infrastructure level.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The referenced `task_id` has no record.
    #[error("task {0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Trait for persisting task records.
pub trait TaskStore: Send + Sync + 'static {
    /// Persist a freshly submitted task record.
    fn insert_task(
        &self,
        record: TaskRecord,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Retrieve a single record by task ID.
    fn get_task(
        &self,
        task_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<TaskRecord>, StorageError>> + Send;

    /// Apply a partial update atomically and return the updated record.
    ///
    /// A single UPDATE statement carries the whole transition, so a
    /// concurrent reader never observes a status change without the matching
    /// `last_update_time` bump. Returns [`StorageError::NotFound`] if the
    /// record does not exist.
    fn update_task(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> impl std::future::Future<Output = Result<TaskRecord, StorageError>> + Send;

    /// All tasks in a non-terminal status, ordered by `submit_time` ascending.
    fn list_active_tasks(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<TaskRecord>, StorageError>> + Send;
}
