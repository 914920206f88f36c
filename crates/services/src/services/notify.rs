//! Outbound user notifications.
//!
//! The engine only enqueues; delivery transports (mail relay, chat bridge)
//! live outside it and drain the channels. E-mail bodies are askama
//! templates: every interpolation is escaped by default, and only the
//! pre-rendered HTML fields (`conflicts`, `failure_msg`) pass through
//! with `|safe`.

use askama::Template;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body_html: String,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub recipients: Vec<String>,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn enqueue_user_email(&self, recipients: &[String], body_html: &str, subject: &str);
    async fn enqueue_user_chat(&self, recipients: &[String], body: &str);
}

/// Channel-backed notifier handing messages to the delivery processes.
pub struct OutboundNotifier {
    mail_tx: mpsc::UnboundedSender<EmailMessage>,
    chat_tx: mpsc::UnboundedSender<ChatMessage>,
}

impl OutboundNotifier {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<EmailMessage>,
        mpsc::UnboundedReceiver<ChatMessage>,
    ) {
        let (mail_tx, mail_rx) = mpsc::unbounded_channel();
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        (Self { mail_tx, chat_tx }, mail_rx, chat_rx)
    }
}

#[async_trait]
impl Notifier for OutboundNotifier {
    async fn enqueue_user_email(&self, recipients: &[String], body_html: &str, subject: &str) {
        let message = EmailMessage {
            recipients: recipients.to_vec(),
            subject: subject.to_string(),
            body_html: body_html.to_string(),
        };
        if self.mail_tx.send(message).is_err() {
            warn!("mail queue closed, dropping message for {recipients:?}");
        }
    }

    async fn enqueue_user_chat(&self, recipients: &[String], body: &str) {
        let message = ChatMessage {
            recipients: recipients.to_vec(),
            body: body.to_string(),
        };
        if self.chat_tx.send(message).is_err() {
            warn!("chat queue closed, dropping message for {recipients:?}");
        }
    }
}

#[derive(Template)]
#[template(path = "verify_success.html")]
pub struct VerifySuccessEmail<'a> {
    pub user: &'a str,
    pub title: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub id: i64,
    pub revision: &'a str,
    /// Review id rendered as text; empty when the request has none.
    pub review: String,
    pub base_url: &'a str,
    pub reviewboard: &'a str,
}

#[derive(Template)]
#[template(path = "verify_failure.html")]
pub struct VerifyFailureEmail<'a> {
    pub user: &'a str,
    pub title: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub id: i64,
    pub revision: &'a str,
    pub review: String,
    pub failure_msg: &'a str,
    pub base_url: &'a str,
    pub reviewboard: &'a str,
}

#[derive(Template)]
#[template(path = "upstream_error.html")]
pub struct UpstreamErrorEmail<'a> {
    pub user: &'a str,
    pub title: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub stderr: &'a str,
}

#[derive(Template)]
#[template(path = "branch_missing.html")]
pub struct BranchMissingEmail<'a> {
    pub user: &'a str,
    pub title: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
}

#[derive(Template)]
#[template(path = "branch_moved.html")]
pub struct BranchMovedEmail<'a> {
    pub user: &'a str,
    pub title: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub old_revision: &'a str,
    pub new_revision: &'a str,
}

#[derive(Template)]
#[template(path = "conflict_email.html")]
pub struct ConflictEmail<'a> {
    pub user: &'a str,
    pub title: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub id: i64,
    pub revision: &'a str,
    pub review: String,
    pub conflicts_with: &'a str,
    /// Pre-rendered HTML assembled from escaped fragments.
    pub conflicts: String,
    pub base_url: &'a str,
    pub reviewboard: &'a str,
}

#[derive(Template)]
#[template(path = "conflict_master.html")]
pub struct MasterConflictHtml<'a> {
    pub mainline: &'a str,
    pub stdout: &'a str,
    pub stderr: &'a str,
}

#[derive(Template)]
#[template(path = "conflict_peer.html")]
pub struct PeerConflictHtml<'a> {
    pub peer_id: i64,
    pub peer_title: &'a str,
    pub stdout: &'a str,
    pub stderr: &'a str,
}

/// Review id display form: the number, or empty when unset.
pub fn review_text(reviewid: Option<i64>) -> String {
    reviewid.map(|id| id.to_string()).unwrap_or_default()
}
