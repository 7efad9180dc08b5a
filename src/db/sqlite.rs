//! SQLite implementation of [`TaskStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path **at compile time**
//! relative to `CARGO_MANIFEST_DIR` (the crate root), so the directory is
//! embedded into the binary. The database file location is determined at
//! runtime by the `A2M_DATABASE_URL` environment variable and is **not**
//! related to the current working directory at runtime.
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used deliberately so that no
//! `DATABASE_URL` environment variable is needed at compile time.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{StorageError, TaskStore};
use crate::entities::{ResultFiles, TaskRecord, TaskStatus, TaskUpdate};

/// SQLite-backed task store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://audio2memo.db"`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

const TASK_COLUMNS: &str = "task_id, status, submit_time, last_update_time, finish_time, \
     file_name, file_path, file_size, file_type, model, output_type, \
     to_email, cc_emails, submitter_ip, user_agent, \
     error, result_files, processing_time, email_sent, email_status";

impl TaskStore for SqliteStore {
    async fn insert_task(&self, record: TaskRecord) -> Result<(), StorageError> {
        let result_files = record
            .result_files
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "{}".to_owned()));
        sqlx::query(
            "INSERT INTO tasks (task_id, status, submit_time, last_update_time, finish_time, \
             file_name, file_path, file_size, file_type, model, output_type, \
             to_email, cc_emails, submitter_ip, user_agent, \
             error, result_files, processing_time, email_sent, email_status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        )
        .bind(&record.task_id)
        .bind(record.status.as_str())
        .bind(record.submit_time.to_rfc3339())
        .bind(record.last_update_time.to_rfc3339())
        .bind(record.finish_time.map(|t| t.to_rfc3339()))
        .bind(&record.file_name)
        .bind(&record.file_path)
        .bind(record.file_size)
        .bind(&record.file_type)
        .bind(&record.model)
        .bind(&record.output_type)
        .bind(&record.to_email)
        .bind(&record.cc_emails)
        .bind(&record.submitter_ip)
        .bind(&record.user_agent)
        .bind(&record.error)
        .bind(result_files)
        .bind(record.processing_time)
        .bind(record.email_sent.map(|t| t.to_rfc3339()))
        .bind(&record.email_status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StorageError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn update_task(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<TaskRecord, StorageError> {
        let result_files = update
            .result_files
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "{}".to_owned()));
        let last_update_time = Utc::now().to_rfc3339();
        // One statement per transition: readers see either the old row or the
        // new row, never a status change without its last_update_time bump.
        let result = sqlx::query(
            "UPDATE tasks SET \
             status           = COALESCE(?1, status), \
             error            = COALESCE(?2, error), \
             result_files     = COALESCE(?3, result_files), \
             processing_time  = COALESCE(?4, processing_time), \
             finish_time      = COALESCE(?5, finish_time), \
             email_sent       = COALESCE(?6, email_sent), \
             email_status     = COALESCE(?7, email_status), \
             last_update_time = ?8 \
             WHERE task_id = ?9",
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.error)
        .bind(result_files)
        .bind(update.processing_time)
        .bind(update.finish_time.map(|t| t.to_rfc3339()))
        .bind(update.email_sent.map(|t| t.to_rfc3339()))
        .bind(&update.email_status)
        .bind(&last_update_time)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(task_id.to_owned()));
        }
        self.get_task(task_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(task_id.to_owned()))
    }

    async fn list_active_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        // Status names are compile-time constants, so inlining them into the
        // IN clause is safe.
        let statuses = TaskStatus::ACTIVE
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ({statuses}) \
             ORDER BY submit_time ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| record_from_row(r).map_err(Into::into))
            .collect()
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────────

fn record_from_row(row: &SqliteRow) -> Result<TaskRecord, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status_raw).unwrap_or_else(|| {
        tracing::warn!(raw = %status_raw, "unknown task status in store; treating as failed");
        TaskStatus::Failed
    });
    let result_files: Option<String> = row.try_get("result_files")?;
    let result_files = result_files.and_then(|raw| {
        serde_json::from_str::<ResultFiles>(&raw)
            .map_err(|e| tracing::warn!(raw = %raw, error = %e, "failed to parse result_files JSON"))
            .ok()
    });
    Ok(TaskRecord {
        task_id: row.try_get("task_id")?,
        status,
        submit_time: parse_dt(&row.try_get::<String, _>("submit_time")?, "submit_time"),
        last_update_time: parse_dt(
            &row.try_get::<String, _>("last_update_time")?,
            "last_update_time",
        ),
        finish_time: row
            .try_get::<Option<String>, _>("finish_time")?
            .map(|raw| parse_dt(&raw, "finish_time")),
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        file_size: row.try_get("file_size")?,
        file_type: row.try_get("file_type")?,
        model: row.try_get("model")?,
        output_type: row.try_get("output_type")?,
        to_email: row.try_get("to_email")?,
        cc_emails: row.try_get("cc_emails")?,
        submitter_ip: row.try_get("submitter_ip")?,
        user_agent: row.try_get("user_agent")?,
        error: row.try_get("error")?,
        result_files,
        processing_time: row.try_get("processing_time")?,
        email_sent: row
            .try_get::<Option<String>, _>("email_sent")?
            .map(|raw| parse_dt(&raw, "email_sent")),
        email_status: row.try_get("email_status")?,
    })
}

fn parse_dt(raw: &str, field: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        tracing::warn!(raw = %raw, field = %field, error = %e, "failed to parse task timestamp; using now");
        Utc::now()
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    pub(crate) async fn temp_store() -> SqliteStore {
        let path = std::env::temp_dir().join(format!("a2m-test-{}.db", Uuid::new_v4()));
        SqliteStore::connect(&format!("sqlite://{}", path.display()))
            .await
            .expect("open temp sqlite store")
    }

    pub(crate) fn sample_record(task_id: &str) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            task_id: task_id.to_owned(),
            status: TaskStatus::Submitted,
            submit_time: now,
            last_update_time: now,
            finish_time: None,
            file_name: "meeting.mp3".to_owned(),
            file_path: "/tmp/meeting.mp3".to_owned(),
            file_size: 1024,
            file_type: Some("audio/mpeg".to_owned()),
            model: "gpt-4o-transcribe".to_owned(),
            output_type: Some("all".to_owned()),
            to_email: "user@example.com".to_owned(),
            cc_emails: None,
            submitter_ip: Some("127.0.0.1".to_owned()),
            user_agent: Some("test-agent".to_owned()),
            result_files: None,
            error: None,
            processing_time: None,
            email_sent: None,
            email_status: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = temp_store().await;
        let record = sample_record("t1");
        store.insert_task(record.clone()).await.expect("insert");

        let got = store.get_task("t1").await.expect("get").expect("exists");
        assert_eq!(got.task_id, "t1");
        assert_eq!(got.status, TaskStatus::Submitted);
        assert_eq!(got.file_name, record.file_name);
        assert_eq!(got.to_email, record.to_email);
        assert!(got.result_files.is_none());
        assert!(got.error.is_none());
    }

    #[tokio::test]
    async fn get_unknown_task_returns_none() {
        let store = temp_store().await;
        assert!(store.get_task("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn update_applies_partial_fields_and_bumps_timestamp() {
        let store = temp_store().await;
        store.insert_task(sample_record("t2")).await.expect("insert");
        let before = store.get_task("t2").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = store
            .update_task("t2", TaskUpdate::status(TaskStatus::Transcribing))
            .await
            .expect("update");

        assert_eq!(updated.status, TaskStatus::Transcribing);
        assert!(updated.last_update_time > before.last_update_time);
        // Untouched fields survive the partial update.
        assert_eq!(updated.file_name, before.file_name);
        assert!(updated.error.is_none());
    }

    #[tokio::test]
    async fn update_persists_result_files_as_typed_map() {
        let store = temp_store().await;
        store.insert_task(sample_record("t3")).await.expect("insert");

        let mut files = ResultFiles::new();
        files.insert("docx_path".to_owned(), "/out/memo.docx".to_owned());
        files.insert("markdown_path".to_owned(), "/out/memo.md".to_owned());
        let updated = store
            .update_task(
                "t3",
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    result_files: Some(files.clone()),
                    processing_time: Some(12.5),
                    finish_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        assert_eq!(updated.result_files, Some(files));
        assert_eq!(updated.processing_time, Some(12.5));
        assert!(updated.finish_time.is_some());
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let store = temp_store().await;
        let err = store
            .update_task("missing", TaskUpdate::status(TaskStatus::Failed))
            .await
            .expect_err("should fail");
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_active_filters_terminal_and_orders_by_submit_time() {
        let store = temp_store().await;

        let mut oldest = sample_record("old");
        oldest.submit_time = Utc::now() - chrono::Duration::seconds(60);
        store.insert_task(oldest).await.expect("insert old");
        store.insert_task(sample_record("new")).await.expect("insert new");
        store.insert_task(sample_record("done")).await.expect("insert done");
        store
            .update_task("done", TaskUpdate::status(TaskStatus::Completed))
            .await
            .expect("complete");
        store.insert_task(sample_record("broken")).await.expect("insert broken");
        store
            .update_task("broken", TaskUpdate::status(TaskStatus::Failed))
            .await
            .expect("fail");

        let active = store.list_active_tasks().await.expect("list");
        let ids: Vec<&str> = active.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new"]);
    }
}
