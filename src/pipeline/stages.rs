//! Production stage implementations over external collaborators.
//!
//! - `split_audio` shells out to `ffmpeg` (segment muxer, stream copy).
//! - `transcribe_segments` posts each segment to an OpenAI-compatible
//!   `/audio/transcriptions` endpoint.
//! - The two text transforms post prompt-rendered transcripts to
//!   `/chat/completions`.
//! - `assemble_document` writes the combined Markdown and shells out to
//!   `pandoc` for the DOCX.
//!
//! All subprocess invocations use `tokio::process::Command` so a slow tool
//! never blocks the runtime.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{StageFailure, TranscriptionPipeline, TranscriptionSummary};
use crate::config::StageConfig;
use crate::entities::ResultFiles;

const DEFAULT_WORDFORWORD_PROMPT: &str = "Rewrite the following meeting transcripts into a \
     faithful word-for-word text, fixing only transcription artifacts:\n\n{transcripts}";
const DEFAULT_MEMO_PROMPT: &str = "Summarize the following meeting transcripts into a concise \
     memo draft with decisions and action items:\n\n{transcripts}";

/// Pipeline over ffmpeg, an OpenAI-compatible API, and pandoc.
pub struct ExternalToolPipeline {
    http: reqwest::Client,
    config: StageConfig,
    wordforword_prompt: String,
    memo_prompt: String,
}

impl ExternalToolPipeline {
    /// Load prompt templates and build the shared HTTP client.
    ///
    /// A missing template file falls back to the built-in default so the
    /// server can start on a fresh deployment.
    pub fn new(config: StageConfig) -> Self {
        let wordforword_prompt =
            load_template(&config.wordforword_prompt_path, DEFAULT_WORDFORWORD_PROMPT);
        let memo_prompt = load_template(&config.memo_prompt_path, DEFAULT_MEMO_PROMPT);
        Self {
            http: reqwest::Client::new(),
            config,
            wordforword_prompt,
            memo_prompt,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Transcribe one segment file, returning the transcript text.
    async fn transcribe_one(&self, segment: &Path, model: &str) -> Result<String, String> {
        let bytes = tokio::fs::read(segment)
            .await
            .map_err(|e| format!("failed to read segment {}: {e}", segment.display()))?;
        let file_name = segment
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment".to_owned());
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name))
            .text("model", model.to_owned());

        let response = self
            .authorize(self.http.post(format!("{}/audio/transcriptions", self.config.api_base)))
            .multipart(form)
            .send()
            .await
            .map_err(|e| format!("transcription request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("transcription endpoint returned {}", response.status()));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("invalid transcription response: {e}"))?;
        let text = body["text"].as_str().unwrap_or_default().to_owned();
        if text.is_empty() {
            return Err("transcription response contained no text".to_owned());
        }
        Ok(text)
    }

    /// Run one prompt-driven transform over the concatenated transcripts and
    /// write its output file. Shared by the word-for-word and memo stages.
    async fn chat_transform(
        &self,
        template: &str,
        transcripts_dir: &Path,
        output_file: &Path,
    ) -> Result<(), String> {
        let transcripts = read_transcripts(transcripts_dir).await?;
        let prompt = render_prompt(template, &transcripts);

        let response = self
            .authorize(self.http.post(format!("{}/chat/completions", self.config.api_base)))
            .json(&serde_json::json!({
                "model": self.config.chat_model,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .await
            .map_err(|e| format!("chat request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("chat endpoint returned {}", response.status()));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("invalid chat response: {e}"))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        if content.is_empty() {
            return Err("chat response contained no content".to_owned());
        }
        tokio::fs::write(output_file, content)
            .await
            .map_err(|e| format!("failed to write {}: {e}", output_file.display()))?;
        Ok(())
    }
}

#[async_trait]
impl TranscriptionPipeline for ExternalToolPipeline {
    async fn split_audio(
        &self,
        input_file: &Path,
        segments_dir: &Path,
    ) -> Result<Vec<PathBuf>, StageFailure> {
        let extension = input_file
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wav".to_owned());
        let pattern = segments_dir.join(format!("segment_%04d.{extension}"));

        debug!(input = %input_file.display(), "starting ffmpeg segment split");
        let output = tokio::process::Command::new("ffmpeg")
            .arg("-i")
            .arg(input_file)
            .args(["-f", "segment"])
            .args(["-segment_time", &self.config.segment_seconds.to_string()])
            .args(["-reset_timestamps", "1"])
            .args(["-c", "copy"])
            .arg(&pattern)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                StageFailure::AudioSplit(format!(
                    "failed to start ffmpeg (is it installed and in PATH?): {e}"
                ))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(StageFailure::AudioSplit(format!(
                "ffmpeg exited with {}: {tail}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let segments = sorted_files(segments_dir)
            .await
            .map_err(StageFailure::AudioSplit)?;
        if segments.is_empty() {
            return Err(StageFailure::AudioSplit("no segments were produced".to_owned()));
        }
        info!(count = segments.len(), "audio split completed");
        Ok(segments)
    }

    async fn transcribe_segments(
        &self,
        segments_dir: &Path,
        transcripts_dir: &Path,
        model: &str,
    ) -> Result<TranscriptionSummary, StageFailure> {
        let segments = sorted_files(segments_dir)
            .await
            .map_err(StageFailure::Transcription)?;

        let mut summary = TranscriptionSummary::default();
        for segment in &segments {
            match self.transcribe_one(segment, model).await {
                Ok(text) => {
                    let stem = segment
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| format!("segment_{}", summary.successful_count));
                    let transcript = transcripts_dir.join(format!("{stem}.txt"));
                    tokio::fs::write(&transcript, text).await.map_err(|e| {
                        StageFailure::Transcription(format!(
                            "failed to write transcript {}: {e}",
                            transcript.display()
                        ))
                    })?;
                    summary.successful_count += 1;
                }
                Err(reason) => {
                    warn!(segment = %segment.display(), reason = %reason, "segment transcription failed");
                    summary.failed_count += 1;
                }
            }
        }
        info!(%summary, "transcription completed");
        Ok(summary)
    }

    async fn generate_wordforword(
        &self,
        transcripts_dir: &Path,
        output_file: &Path,
    ) -> Result<(), StageFailure> {
        self.chat_transform(&self.wordforword_prompt, transcripts_dir, output_file)
            .await
            .map_err(StageFailure::Wordforword)
    }

    async fn generate_memo_draft(
        &self,
        transcripts_dir: &Path,
        output_file: &Path,
    ) -> Result<(), StageFailure> {
        self.chat_transform(&self.memo_prompt, transcripts_dir, output_file)
            .await
            .map_err(StageFailure::MemoDraft)
    }

    async fn assemble_document(
        &self,
        project_name: &str,
        memo_file: &Path,
        wordforword_file: &Path,
        output_dir: &Path,
    ) -> Result<ResultFiles, StageFailure> {
        let read = |p: &Path| {
            let p = p.to_path_buf();
            async move {
                tokio::fs::read_to_string(&p)
                    .await
                    .map_err(|e| format!("failed to read {}: {e}", p.display()))
            }
        };
        let memo = read(memo_file).await.map_err(StageFailure::DocumentAssembly)?;
        let wordforword = read(wordforword_file)
            .await
            .map_err(StageFailure::DocumentAssembly)?;

        let markdown_path = output_dir.join(format!("{project_name}.md"));
        let docx_path = output_dir.join(format!("{project_name}.docx"));
        tokio::fs::write(&markdown_path, build_markdown(project_name, &memo, &wordforword))
            .await
            .map_err(|e| {
                StageFailure::DocumentAssembly(format!(
                    "failed to write {}: {e}",
                    markdown_path.display()
                ))
            })?;

        let output = tokio::process::Command::new("pandoc")
            .arg(&markdown_path)
            .arg("-o")
            .arg(&docx_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                StageFailure::DocumentAssembly(format!(
                    "failed to start pandoc (is it installed and in PATH?): {e}"
                ))
            })?;
        if !output.status.success() {
            return Err(StageFailure::DocumentAssembly(format!(
                "pandoc exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut files = ResultFiles::new();
        files.insert("docx_path".to_owned(), docx_path.to_string_lossy().into_owned());
        files.insert(
            "markdown_path".to_owned(),
            markdown_path.to_string_lossy().into_owned(),
        );
        info!(docx = %docx_path.display(), "document assembly completed");
        Ok(files)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn load_template(path: &Path, fallback: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(template) => template,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "prompt template not readable; using built-in default");
            fallback.to_owned()
        }
    }
}

fn render_prompt(template: &str, transcripts: &str) -> String {
    if template.contains("{transcripts}") {
        template.replace("{transcripts}", transcripts)
    } else {
        format!("{template}\n\n{transcripts}")
    }
}

/// Concatenate every transcript file in `dir`, in name order.
async fn read_transcripts(dir: &Path) -> Result<String, String> {
    let files = sorted_files(dir).await?;
    let mut combined = String::new();
    for file in files {
        let text = tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| format!("failed to read {}: {e}", file.display()))?;
        combined.push_str(&text);
        combined.push('\n');
    }
    if combined.trim().is_empty() {
        return Err(format!("no transcript content found in {}", dir.display()));
    }
    Ok(combined)
}

/// Regular files in `dir`, sorted by name so segment order is stable.
async fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>, String> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| format!("failed to read directory {}: {e}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| format!("failed to read directory entry: {e}"))?
    {
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn build_markdown(project_name: &str, memo: &str, wordforword: &str) -> String {
    format!(
        "# {project_name}\n\n## Memo\n\n{memo}\n\n## Word-for-word transcript\n\n{wordforword}\n"
    )
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn render_prompt_substitutes_placeholder() {
        let rendered = render_prompt("Summarize:\n{transcripts}", "hello world");
        assert_eq!(rendered, "Summarize:\nhello world");
    }

    #[test]
    fn render_prompt_appends_when_placeholder_missing() {
        let rendered = render_prompt("Summarize the following.", "hello");
        assert!(rendered.ends_with("\n\nhello"));
    }

    #[test]
    fn markdown_has_both_sections_in_order() {
        let md = build_markdown("meeting", "the memo", "the transcript");
        let memo_at = md.find("## Memo").expect("memo section");
        let wfw_at = md.find("## Word-for-word transcript").expect("transcript section");
        assert!(memo_at < wfw_at);
        assert!(md.starts_with("# meeting"));
    }

    #[tokio::test]
    async fn sorted_files_orders_by_name_and_skips_directories() {
        let dir = std::env::temp_dir().join(format!("a2m-sort-{}", Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("nested")).expect("mkdir");
        std::fs::write(dir.join("segment_0002.wav"), b"b").expect("write");
        std::fs::write(dir.join("segment_0001.wav"), b"a").expect("write");

        let files = sorted_files(&dir).await.expect("list");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["segment_0001.wav", "segment_0002.wav"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn read_transcripts_rejects_empty_directory() {
        let dir = std::env::temp_dir().join(format!("a2m-empty-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let err = read_transcripts(&dir).await.expect_err("empty dir should fail");
        assert!(err.contains("no transcript content"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
