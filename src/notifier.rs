//! Outcome notifications to the task submitter.
//!
//! [`Notify`] is the boundary the orchestrator talks to; it never raises.
//! Every transport, auth, or configuration problem is converted into a
//! `(false, reason)` result so the orchestrator can always record an outcome
//! on the task, and a notification failure can never change the task's
//! terminal status.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use crate::config::MailConfig;

/// Terminal outcome being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

/// Everything the notifier needs to compose one outcome email.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub task_id: String,
    pub project_name: String,
    pub to_email: String,
    /// Comma-separated CC list; honored only when `outcome == Completed`.
    pub cc_emails: Option<String>,
    pub outcome: Outcome,
    /// Included in the body when `outcome == Failed`.
    pub error_message: Option<String>,
    /// Attached only when `outcome == Completed` and the path exists at call
    /// time. A read failure degrades to sending without the attachment.
    pub attachment_path: Option<PathBuf>,
}

/// Boundary between the orchestrator and the mail transport.
#[async_trait]
pub trait Notify: Send + Sync + 'static {
    /// Send one outcome notification. Returns `(success, message)`; the
    /// message is recorded verbatim in the task's `email_status`.
    async fn notify(&self, request: NotificationRequest) -> (bool, String);
}

/// SMTP notifier over lettre with STARTTLS.
pub struct SmtpNotifier {
    mail: MailConfig,
}

impl SmtpNotifier {
    pub fn new(mail: MailConfig) -> Self {
        Self { mail }
    }

    async fn send(&self, request: &NotificationRequest) -> Result<String, String> {
        // Missing transport configuration is a permanent, non-retryable
        // failure reported as such.
        if !self.mail.is_complete() {
            return Err("Mail server configuration incomplete.".to_owned());
        }
        let username = self.mail.username.clone().unwrap_or_default();
        let password = self.mail.password.clone().unwrap_or_default();
        let server = self.mail.smtp_server.clone().unwrap_or_default();

        let from = Mailbox::new(
            Some(self.mail.sender_name.clone()),
            username
                .parse()
                .map_err(|e| format!("invalid sender address '{username}': {e}"))?,
        );
        let to: Mailbox = request
            .to_email
            .parse()
            .map_err(|e| format!("invalid recipient address '{}': {e}", request.to_email))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(subject_for(request));

        // CC recipients are notified only on success, never on failure.
        if request.outcome == Outcome::Completed {
            if let Some(cc) = &request.cc_emails {
                for mailbox in cc_mailboxes(cc) {
                    builder = builder.cc(mailbox);
                }
            }
        }

        let mut body = MultiPart::mixed().singlepart(SinglePart::html(body_for(request)));

        if request.outcome == Outcome::Completed {
            if let Some(path) = &request.attachment_path {
                if let Some(part) = attachment_part(&request.task_id, path).await {
                    body = body.singlepart(part);
                    info!(task_id = %request.task_id, path = %path.display(), "attached result file");
                }
            }
        }

        let email = builder
            .multipart(body)
            .map_err(|e| format!("failed to build email: {e}"))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&server)
            .map_err(|e| format!("SMTP configuration error: {e}"))?
            .port(self.mail.smtp_port)
            .credentials(Credentials::new(username, password))
            .build();

        mailer
            .send(email)
            .await
            .map_err(|e| format!("Failed to send email: {e}"))?;
        Ok("Email sent successfully.".to_owned())
    }
}

#[async_trait]
impl Notify for SmtpNotifier {
    async fn notify(&self, request: NotificationRequest) -> (bool, String) {
        match self.send(&request).await {
            Ok(message) => {
                info!(task_id = %request.task_id, to = %request.to_email, "notification sent");
                (true, message)
            }
            Err(reason) => {
                warn!(task_id = %request.task_id, to = %request.to_email, reason = %reason, "notification failed");
                (false, reason)
            }
        }
    }
}

fn subject_for(request: &NotificationRequest) -> String {
    match request.outcome {
        Outcome::Completed => format!(
            "Task completed: {} (ID: {}) has been processed",
            request.project_name, request.task_id
        ),
        Outcome::Failed => format!(
            "Task failed: {} (ID: {}) could not be processed",
            request.project_name, request.task_id
        ),
    }
}

fn body_for(request: &NotificationRequest) -> String {
    match request.outcome {
        Outcome::Completed => format!(
            "<html><body>\
             <p>Hello,</p>\
             <p>Your audio transcription task <b>{}</b> (task ID: {}) has completed \
             successfully.</p>\
             <p>The result is attached to this message.</p>\
             <p>Thank you for using our service.</p>\
             </body></html>",
            request.project_name, request.task_id
        ),
        Outcome::Failed => {
            let error_block = request
                .error_message
                .as_deref()
                .map(|e| format!("<p>Error details: <pre>{e}</pre></p>"))
                .unwrap_or_default();
            format!(
                "<html><body>\
                 <p>Hello,</p>\
                 <p>We are sorry, but your audio transcription task <b>{}</b> \
                 (task ID: {}) failed.</p>\
                 {error_block}\
                 <p>Please check your file or contact support.</p>\
                 </body></html>",
                request.project_name, request.task_id
            )
        }
    }
}

/// Build the attachment part for a completed task, or `None` when the file
/// is missing or unreadable. Any attachment problem degrades to sending the
/// message without it; nothing here can fail the send itself.
async fn attachment_part(task_id: &str, path: &Path) -> Option<SinglePart> {
    if !path.exists() {
        return None;
    }
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(
                task_id = %task_id,
                path = %path.display(),
                error = %e,
                "failed to read attachment; sending without it"
            );
            return None;
        }
    };
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result".to_owned());
    let content_type = match ContentType::parse("application/octet-stream") {
        Ok(content_type) => content_type,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "failed to build attachment part; sending without it");
            return None;
        }
    };
    Some(Attachment::new(filename).body(bytes, content_type))
}

/// Parse a comma-separated CC list, dropping empty entries and addresses that
/// do not parse (logged, not fatal).
fn cc_mailboxes(cc: &str) -> Vec<Mailbox> {
    cc.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<Mailbox>() {
            Ok(mailbox) => Some(mailbox),
            Err(e) => {
                warn!(address = %s, error = %e, "skipping unparseable CC address");
                None
            }
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_request() -> NotificationRequest {
        NotificationRequest {
            task_id: "t1".to_owned(),
            project_name: "meeting".to_owned(),
            to_email: "user@example.com".to_owned(),
            cc_emails: None,
            outcome: Outcome::Completed,
            error_message: None,
            attachment_path: None,
        }
    }

    #[tokio::test]
    async fn missing_mail_config_is_reported_not_raised() {
        let notifier = SmtpNotifier::new(MailConfig::default());
        let (ok, message) = notifier.notify(completed_request()).await;
        assert!(!ok);
        assert_eq!(message, "Mail server configuration incomplete.");
    }

    #[tokio::test]
    async fn invalid_recipient_is_reported_not_raised() {
        let notifier = SmtpNotifier::new(MailConfig {
            username: Some("sender@example.com".to_owned()),
            password: Some("secret".to_owned()),
            smtp_server: Some("smtp.example.com".to_owned()),
            smtp_port: 587,
            sender_name: "Audio2Memo".to_owned(),
        });
        let mut request = completed_request();
        request.to_email = "not an address".to_owned();
        let (ok, message) = notifier.notify(request).await;
        assert!(!ok);
        assert!(message.contains("invalid recipient address"), "{message}");
    }

    #[test]
    fn cc_list_parsing_skips_blank_and_invalid_entries() {
        let boxes = cc_mailboxes("a@example.com, , nonsense address ,b@example.com");
        assert_eq!(boxes.len(), 2);
    }

    #[tokio::test]
    async fn attachment_problems_never_abort_the_message_build() {
        // Missing file: no part, no error.
        let missing = std::env::temp_dir().join(format!("a2m-gone-{}.docx", uuid::Uuid::new_v4()));
        assert!(attachment_part("t1", &missing).await.is_none());

        // Unreadable path (a directory): degrades to no part.
        let dir = std::env::temp_dir().join(format!("a2m-attdir-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        assert!(attachment_part("t1", &dir).await.is_none());
        let _ = std::fs::remove_dir_all(&dir);

        // Readable file: part is built.
        let present = std::env::temp_dir().join(format!("a2m-att-{}.docx", uuid::Uuid::new_v4()));
        tokio::fs::write(&present, b"docx bytes").await.expect("write");
        assert!(attachment_part("t1", &present).await.is_some());
        let _ = tokio::fs::remove_file(&present).await;
    }

    #[test]
    fn failure_body_carries_error_details() {
        let mut request = completed_request();
        request.outcome = Outcome::Failed;
        request.error_message = Some("Audio splitting failed.".to_owned());
        let body = body_for(&request);
        assert!(body.contains("Audio splitting failed."));
        assert!(subject_for(&request).contains("Task failed"));
    }
}
