//! The task aggregate: one submitted audio-to-memo job and its persisted state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Typed mapping from artifact kind (e.g. `"docx_path"`) to filesystem path.
///
/// Always stored and retrieved as a JSON object; readers never need to
/// type-sniff a stored string.
pub type ResultFiles = BTreeMap<String, String>;

/// Upper bound on the persisted failure description.
pub const MAX_ERROR_LEN: usize = 2000;

/// Task lifecycle status.
///
/// The non-terminal variants form the fixed pipeline order; a task's status
/// only ever moves forward through that order. `Completed` and `Failed` are
/// terminal: no further transitions occur. `Failed` is reachable from every
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskStatus {
    Submitted,
    ProcessingAudioSplit,
    Transcribing,
    GeneratingWordforword,
    GeneratingMemoDraft,
    GeneratingDocument,
    Completed,
    Failed,
}

impl TaskStatus {
    /// The non-terminal statuses, in pipeline order. Used by the active-task
    /// listing filter.
    pub const ACTIVE: [TaskStatus; 6] = [
        TaskStatus::Submitted,
        TaskStatus::ProcessingAudioSplit,
        TaskStatus::Transcribing,
        TaskStatus::GeneratingWordforword,
        TaskStatus::GeneratingMemoDraft,
        TaskStatus::GeneratingDocument,
    ];

    /// Canonical string form, as stored in the database and returned by the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::ProcessingAudioSplit => "processing_audio_split",
            TaskStatus::Transcribing => "transcribing",
            TaskStatus::GeneratingWordforword => "generating_wordforword",
            TaskStatus::GeneratingMemoDraft => "generating_memo_draft",
            TaskStatus::GeneratingDocument => "generating_document",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse the canonical string form back into a status.
    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "submitted" => Some(TaskStatus::Submitted),
            "processing_audio_split" => Some(TaskStatus::ProcessingAudioSplit),
            "transcribing" => Some(TaskStatus::Transcribing),
            "generating_wordforword" => Some(TaskStatus::GeneratingWordforword),
            "generating_memo_draft" => Some(TaskStatus::GeneratingMemoDraft),
            "generating_document" => Some(TaskStatus::GeneratingDocument),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row in the `tasks` table.
///
/// Input descriptors are captured at submission and never mutated afterwards;
/// everything else is mutated exclusively by the orchestrator unit owning the
/// task (single writer per record).
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub submit_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    /// Set once, at the terminal transition.
    pub finish_time: Option<DateTime<Utc>>,

    // Input descriptors (immutable after submission).
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub file_type: Option<String>,
    pub model: String,
    pub output_type: Option<String>,
    pub to_email: String,
    pub cc_emails: Option<String>,
    pub submitter_ip: Option<String>,
    pub user_agent: Option<String>,

    // Outputs.
    /// Non-null iff status == completed.
    pub result_files: Option<ResultFiles>,
    /// Non-null iff status == failed; at most [`MAX_ERROR_LEN`] characters.
    pub error: Option<String>,
    /// `finish_time - submit_time` in seconds, set at the terminal transition.
    pub processing_time: Option<f64>,

    // Notification audit.
    pub email_sent: Option<DateTime<Utc>>,
    pub email_status: Option<String>,
}

/// Partial-field update applied atomically by [`crate::db::TaskStore::update_task`].
///
/// `None` fields are left untouched; `last_update_time` is bumped on every
/// update regardless of which fields are present.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub error: Option<String>,
    pub result_files: Option<ResultFiles>,
    pub processing_time: Option<f64>,
    pub finish_time: Option<DateTime<Utc>>,
    pub email_sent: Option<DateTime<Utc>>,
    pub email_status: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        TaskUpdate { status: Some(status), ..Default::default() }
    }
}

/// Truncate a failure description to the persisted bound, on a char boundary.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for s in [
            TaskStatus::Submitted,
            TaskStatus::ProcessingAudioSplit,
            TaskStatus::Transcribing,
            TaskStatus::GeneratingWordforword,
            TaskStatus::GeneratingMemoDraft,
            TaskStatus::GeneratingDocument,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn active_set_excludes_terminal_statuses() {
        assert!(!TaskStatus::ACTIVE.iter().any(|s| s.is_terminal()));
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn active_set_is_in_pipeline_order() {
        let mut sorted = TaskStatus::ACTIVE;
        sorted.sort();
        assert_eq!(sorted, TaskStatus::ACTIVE);
    }

    #[test]
    fn error_truncation_is_bounded() {
        let long = "x".repeat(MAX_ERROR_LEN + 500);
        assert_eq!(truncate_error(&long).chars().count(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }
}
