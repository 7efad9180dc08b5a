//! The per-task state machine.
//!
//! The orchestrator owns every status transition after `submitted`. It
//! receives accepted submissions over a bounded command queue, and its
//! background dispatch loop spawns one isolated unit of execution per task,
//! so a failure inside one task's pipeline can never affect another task,
//! the dispatch loop, or the API's ability to accept new work.
//!
//! Within one task the stage sequence is strictly sequential: the status
//! naming stage N is persisted before stage N runs, and stage N+1 never
//! starts before that persist succeeded.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::db::sqlite::SqliteStore;
use crate::db::{StorageError, TaskStore};
use crate::entities::{ResultFiles, TaskStatus, TaskUpdate, truncate_error};
use crate::notifier::{NotificationRequest, Notify, Outcome};
use crate::pipeline::{StageFailure, TaskWorkspace, TranscriptionPipeline};

/// One accepted submission handed from the API to the orchestrator.
#[derive(Debug, Clone)]
pub struct TaskJob {
    pub task_id: String,
    pub project_name: String,
    pub input_file: PathBuf,
    pub model: String,
    pub to_email: String,
    pub cc_emails: Option<String>,
    pub workspace: TaskWorkspace,
}

/// Commands sent to the orchestrator's internal dispatch loop.
enum OrchestratorCommand {
    Submit {
        job: TaskJob,
        /// Resolved once the job has been accepted and its execution unit
        /// spawned.
        reply_tx: oneshot::Sender<()>,
    },
}

/// Hand-off failure; the submission record must be marked failed by the
/// caller so it is never left dangling in `submitted`.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("orchestrator queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("orchestrator is shut down")]
    Shutdown,
}

/// Cloneable handle to the dispatch loop.
#[derive(Clone)]
pub struct Orchestrator {
    submit_tx: mpsc::Sender<OrchestratorCommand>,
}

impl Orchestrator {
    /// Start the orchestrator: spawns the dispatch loop and returns a handle.
    pub fn start(
        store: Arc<SqliteStore>,
        pipeline: Arc<dyn TranscriptionPipeline>,
        notifier: Arc<dyn Notify>,
        queue_capacity: usize,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(queue_capacity);
        tokio::spawn(run_loop(submit_rx, store, pipeline, notifier));
        Self { submit_tx }
    }

    /// Hand off an accepted submission for background execution.
    ///
    /// Returns as soon as the job is queued; the caller's HTTP response does
    /// not wait on any pipeline work.
    pub async fn submit(&self, job: TaskJob) -> Result<(), SubmitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_tx
            .try_send(OrchestratorCommand::Submit { job, reply_tx })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull {
                    capacity: self.submit_tx.max_capacity(),
                },
                mpsc::error::TrySendError::Closed(_) => SubmitError::Shutdown,
            })?;
        reply_rx.await.map_err(|_| SubmitError::Shutdown)
    }
}

#[cfg(test)]
impl Orchestrator {
    /// Accepts and acknowledges every submission without executing it, so a
    /// freshly submitted record keeps its initial status.
    pub(crate) fn accepting_stub() -> Self {
        let (submit_tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(OrchestratorCommand::Submit { reply_tx, .. }) = rx.recv().await {
                let _ = reply_tx.send(());
            }
        });
        Self { submit_tx }
    }

    /// A handle with no dispatch loop behind it; every submit fails.
    pub(crate) fn disconnected() -> Self {
        let (submit_tx, rx) = mpsc::channel(1);
        drop(rx);
        Self { submit_tx }
    }
}

async fn run_loop(
    mut rx: mpsc::Receiver<OrchestratorCommand>,
    store: Arc<SqliteStore>,
    pipeline: Arc<dyn TranscriptionPipeline>,
    notifier: Arc<dyn Notify>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            OrchestratorCommand::Submit { job, reply_tx } => {
                let task_store = Arc::clone(&store);
                let task_pipeline = Arc::clone(&pipeline);
                let task_notifier = Arc::clone(&notifier);
                // One spawned unit per task is the error boundary: a failing
                // stage or store only ever takes down this unit.
                tokio::spawn(async move {
                    execute_task(job, task_store, task_pipeline, task_notifier).await;
                });
                let _ = reply_tx.send(());
            }
        }
    }
}

/// Either side of the uniform stage contract, plus the storage failures that
/// interleave with it.
enum TaskError {
    Stage(StageFailure),
    Storage(StorageError),
}

impl From<StageFailure> for TaskError {
    fn from(e: StageFailure) -> Self {
        TaskError::Stage(e)
    }
}

impl From<StorageError> for TaskError {
    fn from(e: StorageError) -> Self {
        TaskError::Storage(e)
    }
}

/// Drive a single task through all of its stages and terminal bookkeeping.
async fn execute_task(
    job: TaskJob,
    store: Arc<SqliteStore>,
    pipeline: Arc<dyn TranscriptionPipeline>,
    notifier: Arc<dyn Notify>,
) {
    let task_id = job.task_id.clone();
    let submit_time = match store.get_task(&task_id).await {
        Ok(Some(record)) => record.submit_time,
        Ok(None) => {
            error!(task_id = %task_id, "task record not found; aborting pipeline");
            return;
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "failed to load task record; aborting pipeline");
            return;
        }
    };

    match run_stages(&job, &store, pipeline.as_ref()).await {
        Ok(result_files) => {
            finalize_completed(&job, &store, notifier.as_ref(), submit_time, result_files).await;
        }
        Err(TaskError::Stage(failure)) => {
            info!(task_id = %task_id, error = %failure, "pipeline stage failed");
            finalize_failed(&job, &store, notifier.as_ref(), submit_time, &failure.to_string())
                .await;
        }
        Err(TaskError::Storage(e)) => {
            // A lost status update means the record may no longer reflect
            // reality; treat it as fatal to this task rather than running
            // further stages against a desynced record.
            error!(task_id = %task_id, error = %e, "storage error during stage transition");
            finalize_failed(
                &job,
                &store,
                notifier.as_ref(),
                submit_time,
                &format!("task state could not be persisted: {e}"),
            )
            .await;
        }
    }
}

/// The fixed stage sequence. Persists the stage-N status before invoking
/// stage N, and applies the uniform success criteria to each stage result.
async fn run_stages(
    job: &TaskJob,
    store: &SqliteStore,
    pipeline: &dyn TranscriptionPipeline,
) -> Result<ResultFiles, TaskError> {
    let ws = &job.workspace;

    store
        .update_task(&job.task_id, TaskUpdate::status(TaskStatus::ProcessingAudioSplit))
        .await?;
    let segments = pipeline.split_audio(&job.input_file, &ws.segments_dir).await?;
    if segments.is_empty() {
        return Err(StageFailure::AudioSplit("no segments were produced".to_owned()).into());
    }

    store
        .update_task(&job.task_id, TaskUpdate::status(TaskStatus::Transcribing))
        .await?;
    let summary = pipeline
        .transcribe_segments(&ws.segments_dir, &ws.transcripts_dir, &job.model)
        .await?;
    if summary.successful_count == 0 {
        return Err(StageFailure::Transcription(summary.to_string()).into());
    }

    store
        .update_task(&job.task_id, TaskUpdate::status(TaskStatus::GeneratingWordforword))
        .await?;
    let wordforword_file = ws
        .wordforword_dir
        .join(format!("{}_wordforword.txt", job.project_name));
    pipeline
        .generate_wordforword(&ws.transcripts_dir, &wordforword_file)
        .await?;

    store
        .update_task(&job.task_id, TaskUpdate::status(TaskStatus::GeneratingMemoDraft))
        .await?;
    let memo_file = ws
        .memo_draft_dir
        .join(format!("{}_memo_draft.txt", job.project_name));
    pipeline
        .generate_memo_draft(&ws.transcripts_dir, &memo_file)
        .await?;

    store
        .update_task(&job.task_id, TaskUpdate::status(TaskStatus::GeneratingDocument))
        .await?;
    let result_files = pipeline
        .assemble_document(&job.project_name, &memo_file, &wordforword_file, &ws.output_dir)
        .await?;
    if !result_files.contains_key("docx_path") {
        return Err(
            StageFailure::DocumentAssembly("stage result carried no docx_path".to_owned()).into(),
        );
    }

    Ok(result_files)
}

async fn finalize_completed(
    job: &TaskJob,
    store: &SqliteStore,
    notifier: &dyn Notify,
    submit_time: DateTime<Utc>,
    result_files: ResultFiles,
) {
    let finish_time = Utc::now();
    let attachment = result_files.get("docx_path").map(PathBuf::from);
    let update = TaskUpdate {
        status: Some(TaskStatus::Completed),
        result_files: Some(result_files),
        processing_time: Some(elapsed_seconds(submit_time, finish_time)),
        finish_time: Some(finish_time),
        ..Default::default()
    };
    // The work is done even if this persist fails; the submitter still gets
    // the notification, and the lost update is logged.
    if let Err(e) = store.update_task(&job.task_id, update).await {
        error!(task_id = %job.task_id, error = %e, "failed to persist completed status");
    }
    info!(task_id = %job.task_id, "task completed");

    let (sent, message) = notifier
        .notify(NotificationRequest {
            task_id: job.task_id.clone(),
            project_name: job.project_name.clone(),
            to_email: job.to_email.clone(),
            cc_emails: job.cc_emails.clone(),
            outcome: Outcome::Completed,
            error_message: None,
            attachment_path: attachment,
        })
        .await;
    record_email_outcome(store, &job.task_id, sent, message, "Sent").await;
}

async fn finalize_failed(
    job: &TaskJob,
    store: &SqliteStore,
    notifier: &dyn Notify,
    submit_time: DateTime<Utc>,
    error_text: &str,
) {
    let finish_time = Utc::now();
    let error_text = truncate_error(error_text);
    let update = TaskUpdate {
        status: Some(TaskStatus::Failed),
        error: Some(error_text.clone()),
        processing_time: Some(elapsed_seconds(submit_time, finish_time)),
        finish_time: Some(finish_time),
        ..Default::default()
    };
    if let Err(e) = store.update_task(&job.task_id, update).await {
        error!(task_id = %job.task_id, error = %e, "failed to persist failed status");
    }

    // No CC and no attachment on failure.
    let (sent, message) = notifier
        .notify(NotificationRequest {
            task_id: job.task_id.clone(),
            project_name: job.project_name.clone(),
            to_email: job.to_email.clone(),
            cc_emails: None,
            outcome: Outcome::Failed,
            error_message: Some(error_text),
            attachment_path: None,
        })
        .await;
    record_email_outcome(store, &job.task_id, sent, message, "Sent (failure notice)").await;
}

/// Persist the notification audit fields. A failed notification only ever
/// changes `email_status`; the terminal status stands.
async fn record_email_outcome(
    store: &SqliteStore,
    task_id: &str,
    sent: bool,
    message: String,
    sent_label: &str,
) {
    let email_status = if sent { sent_label.to_owned() } else { message };
    let update = TaskUpdate {
        email_sent: Some(Utc::now()),
        email_status: Some(email_status),
        ..Default::default()
    };
    if let Err(e) = store.update_task(task_id, update).await {
        warn!(task_id = %task_id, error = %e, "failed to record notification outcome");
    }
}

fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

// ── Tests ──────────────────────────────────────────────────────────────────────
