//! Mailbox and filter-rule configuration

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

fn default_folder() -> String {
    "INBOX".to_string()
}

/// Configuration for one watched mailbox.
///
/// Immutable once the mailbox is running; a change means tearing the engine
/// instance down and rebuilding it through the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Numeric mailbox id
    pub id: u32,
    /// Display name
    pub name: String,

    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port
    pub imap_port: u16,
    /// Use TLS for the IMAP connection
    pub imap_tls: bool,
    /// IMAP username
    pub username: String,
    /// IMAP password
    pub password: String,
    /// Watched folder
    #[serde(default = "default_folder")]
    pub folder: String,

    /// SMTP relay hostname
    pub smtp_host: String,
    /// SMTP relay port
    pub smtp_port: u16,
    /// SMTP username
    pub smtp_username: String,
    /// SMTP password
    pub smtp_password: String,
    /// Identity used as From/Sender on forwarded mail
    pub send_as: String,
}

/// One filter rule applied to incoming and historical messages.
///
/// Rules are evaluated in list order and every matching rule executes;
/// matching is not first-match-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterRule {
    /// Rule name, for logs
    pub name: String,
    /// Case-insensitive substring the subject must contain (empty = any)
    #[serde(default)]
    pub subject_contains: String,
    /// Case-insensitive substring the sender must contain (empty = any)
    #[serde(default)]
    pub sender_contains: String,
    /// Forward matching messages
    #[serde(default)]
    pub forward: bool,
    /// Address to forward to
    #[serde(default)]
    pub forward_to: String,
    /// Folder to move matching messages to
    #[serde(default)]
    pub move_to: Option<String>,
}

/// External configuration collaborator
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All configured mailboxes
    async fn mailboxes(&self) -> EngineResult<Vec<MailboxConfig>>;
    /// Filter rules for one mailbox, in evaluation order
    async fn rules(&self, mailbox_id: u32) -> EngineResult<Vec<FilterRule>>;
}
