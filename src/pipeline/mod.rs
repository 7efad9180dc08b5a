//! The transcription-to-document stage pipeline.
//!
//! Stages are opaque collaborators behind [`TranscriptionPipeline`]: the
//! orchestrator only sees the uniform contract (each stage returns its
//! produced artifact descriptor or a typed [`StageFailure`]), never
//! per-stage internals. The production implementation lives in [`stages`].

pub mod stages;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::entities::ResultFiles;

/// Typed failure reason reported by a stage.
///
/// The orchestrator records `StageFailure`'s display form (truncated) on the
/// task, so the messages are written for the submitter, not for operators.
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error("Audio splitting failed. {0}")]
    AudioSplit(String),

    #[error("Audio transcription failed. {0}")]
    Transcription(String),

    #[error("Failed to generate word-for-word text: {0}")]
    Wordforword(String),

    #[error("Failed to generate memo draft: {0}")]
    MemoDraft(String),

    #[error("Failed to combine outputs into a document: {0}")]
    DocumentAssembly(String),
}

/// Per-segment success/failure counts reported by the transcription stage.
///
/// The stage is considered failed for orchestration purposes only if zero
/// segments succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranscriptionSummary {
    pub successful_count: usize,
    pub failed_count: usize,
}

impl std::fmt::Display for TranscriptionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "successful_count={} failed_count={}",
            self.successful_count, self.failed_count
        )
    }
}

/// The five opaque stage functions, all over filesystem paths.
#[async_trait]
pub trait TranscriptionPipeline: Send + Sync + 'static {
    /// Split one input file into N segment files under `segments_dir`.
    /// An empty segment list is a failure.
    async fn split_audio(
        &self,
        input_file: &Path,
        segments_dir: &Path,
    ) -> Result<Vec<PathBuf>, StageFailure>;

    /// Transcribe every segment in `segments_dir`, writing one transcript
    /// per segment into `transcripts_dir`.
    async fn transcribe_segments(
        &self,
        segments_dir: &Path,
        transcripts_dir: &Path,
        model: &str,
    ) -> Result<TranscriptionSummary, StageFailure>;

    /// Produce the word-for-word text from the transcripts directory.
    async fn generate_wordforword(
        &self,
        transcripts_dir: &Path,
        output_file: &Path,
    ) -> Result<(), StageFailure>;

    /// Produce the memo draft from the transcripts directory.
    async fn generate_memo_draft(
        &self,
        transcripts_dir: &Path,
        output_file: &Path,
    ) -> Result<(), StageFailure>;

    /// Combine the two generated texts into the final document plus
    /// companion formats. Success requires a `docx_path` entry in the map.
    async fn assemble_document(
        &self,
        project_name: &str,
        memo_file: &Path,
        wordforword_file: &Path,
        output_dir: &Path,
    ) -> Result<ResultFiles, StageFailure>;
}

/// Per-task filesystem workspace, exclusively owned by that task's pipeline
/// for its lifetime.
#[derive(Debug, Clone)]
pub struct TaskWorkspace {
    pub base_dir: PathBuf,
    pub segments_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub wordforword_dir: PathBuf,
    pub memo_draft_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl TaskWorkspace {
    /// Create the directory tree for one task under `storage_root`.
    pub fn create(storage_root: &Path, task_id: &str) -> io::Result<Self> {
        let base_dir = storage_root.join(task_id);
        let workspace = Self {
            segments_dir: base_dir.join("audio_segments"),
            transcripts_dir: base_dir.join("transcripts"),
            wordforword_dir: base_dir.join("wordforword"),
            memo_draft_dir: base_dir.join("memo_draft"),
            output_dir: base_dir.join("output_docx"),
            base_dir,
        };
        for dir in [
            &workspace.base_dir,
            &workspace.segments_dir,
            &workspace.transcripts_dir,
            &workspace.wordforword_dir,
            &workspace.memo_draft_dir,
            &workspace.output_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(workspace)
    }

    /// Best-effort removal, used when submission fails after the workspace
    /// was created.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.base_dir) {
            tracing::warn!(path = %self.base_dir.display(), error = %e, "failed to remove task workspace");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn workspace_creates_all_stage_directories() {
        let root = std::env::temp_dir().join(format!("a2m-ws-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create root");

        let ws = TaskWorkspace::create(&root, "task-1").expect("create workspace");
        for dir in [
            &ws.base_dir,
            &ws.segments_dir,
            &ws.transcripts_dir,
            &ws.wordforword_dir,
            &ws.memo_draft_dir,
            &ws.output_dir,
        ] {
            assert!(dir.is_dir(), "{} should exist", dir.display());
        }

        ws.remove();
        assert!(!ws.base_dir.exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn stage_failure_messages_name_the_stage() {
        let err = StageFailure::AudioSplit("no segments were produced".to_owned());
        assert!(err.to_string().contains("Audio splitting failed."));

        let err = StageFailure::Transcription(
            TranscriptionSummary { successful_count: 0, failed_count: 3 }.to_string(),
        );
        assert!(err.to_string().contains("failed_count=3"));
    }
}
