//! Server configuration, loaded from environment variables at startup.
//!
//! The environment is read exactly once, in [`Config::from_env`]; the
//! resulting struct is passed by `Arc` into the API layer, the orchestrator,
//! the notifier, and the pipeline stages. Core logic never reads the ambient
//! environment.

use std::path::PathBuf;

/// Runtime configuration for audio2memo-server.
///
/// Every field except `storage_dir` has a sensible default so the server
/// works out-of-the-box without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite (or other) database URL (default: `"sqlite://audio2memo.db"`).
    /// Supports any sqlx-compatible connection string – swap the scheme to
    /// migrate to Postgres (`postgres://…`) or MySQL (`mysql://…`).
    pub database_url: String,

    /// Root directory under which each task gets its own workspace.
    /// Must exist and be a directory; submissions are rejected otherwise.
    pub storage_dir: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Orchestrator submission-queue capacity.
    pub queue_capacity: usize,

    /// Maximum accepted upload size, in megabytes.
    pub max_upload_size_mb: usize,

    /// Transcription model used when the submission does not name one.
    pub default_model: String,

    /// Serve Swagger UI at `/swagger-ui` (disable in production).
    pub enable_swagger: bool,

    /// Comma-separated allowed CORS origins; `None` means wildcard.
    pub cors_allowed_origins: Option<String>,

    /// SMTP notification settings.
    pub mail: MailConfig,

    /// External stage collaborator settings.
    pub stages: StageConfig,
}

/// SMTP transport settings for outcome notifications.
///
/// Username, password, and server are all required for sending; if any is
/// absent the notifier reports a permanent configuration failure instead of
/// raising.
#[derive(Debug, Clone, Default)]
pub struct MailConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub smtp_server: Option<String>,
    pub smtp_port: u16,
    pub sender_name: String,
}

/// Settings for the external tools and endpoints the pipeline stages invoke.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Base URL of the OpenAI-compatible API used for speech-to-text and the
    /// two text transforms.
    pub api_base: String,

    /// Bearer token for `api_base`; omitted when `None`.
    pub api_key: Option<String>,

    /// Chat model driving the word-for-word and memo-draft transforms.
    pub chat_model: String,

    /// Prompt template for the word-for-word transform.
    pub wordforword_prompt_path: PathBuf,

    /// Prompt template for the memo-draft transform.
    pub memo_prompt_path: PathBuf,

    /// Length of each ffmpeg audio segment, in seconds.
    pub segment_seconds: u32,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("A2M_BIND", "0.0.0.0:3000"),
            database_url: env_or("A2M_DATABASE_URL", "sqlite://audio2memo.db"),
            storage_dir: PathBuf::from(env_or("A2M_STORAGE_DIR", "./audio_tasks")),
            log_level: env_or("A2M_LOG", "info"),
            log_json: std::env::var("A2M_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            queue_capacity: parse_env("A2M_QUEUE_CAPACITY", 64),
            max_upload_size_mb: parse_env("A2M_MAX_UPLOAD_SIZE_MB", 100),
            default_model: env_or("A2M_DEFAULT_MODEL", "gpt-4o-transcribe"),
            enable_swagger: std::env::var("A2M_ENABLE_SWAGGER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            cors_allowed_origins: std::env::var("A2M_CORS_ORIGINS").ok(),
            mail: MailConfig {
                username: std::env::var("MAIL_USERNAME").ok(),
                password: std::env::var("MAIL_PASSWORD").ok(),
                smtp_server: std::env::var("MAIL_SMTP_SERVER").ok(),
                smtp_port: parse_env("MAIL_SMTP_PORT", 587),
                sender_name: env_or("MAIL_SENDER_NAME", "Audio2Memo Notification"),
            },
            stages: StageConfig {
                api_base: env_or("A2M_API_BASE", "https://api.openai.com/v1"),
                api_key: std::env::var("A2M_API_KEY").ok(),
                chat_model: env_or("A2M_CHAT_MODEL", "gpt-4o"),
                wordforword_prompt_path: PathBuf::from(env_or(
                    "A2M_WORDFORWORD_PROMPT",
                    "prompts/text_to_wordforword_prompt.txt",
                )),
                memo_prompt_path: PathBuf::from(env_or(
                    "A2M_MEMO_PROMPT",
                    "prompts/wordforword_to_memo_prompt.txt",
                )),
                segment_seconds: parse_env("A2M_SEGMENT_SECONDS", 600),
            },
        }
    }
}

impl MailConfig {
    /// `true` when every field required for an SMTP send is present.
    pub fn is_complete(&self) -> bool {
        self.username.is_some() && self.password.is_some() && self.smtp_server.is_some()
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
