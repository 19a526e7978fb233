//! Rule-driven message filtering: forward and/or move on match

use std::sync::Arc;
use std::time::Duration;

use mailwatch_imap::MessageSummary;
use tracing::{debug, info, warn};

use crate::config::FilterRule;
use crate::content::extract_content;
use crate::error::EngineResult;
use crate::fetch::MessageStore;
use crate::journal::Journal;
use crate::outbound::{build_forward, OutboundMailChannel};

/// Grace period before touching a just-arrived message; some servers are
/// still writing flags and body parts right after the EXISTS announcement
pub const SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Whether a rule's predicates all hold for a message. Empty predicates
/// match everything; non-empty ones are case-insensitive substring tests.
pub fn rule_matches(rule: &FilterRule, summary: &MessageSummary) -> bool {
    if !rule.subject_contains.is_empty() {
        let needle = rule.subject_contains.to_lowercase();
        if !summary.subject().to_lowercase().contains(&needle) {
            return false;
        }
    }
    if !rule.sender_contains.is_empty() {
        let needle = rule.sender_contains.to_lowercase();
        if !summary.sender_addresses().to_lowercase().contains(&needle) {
            return false;
        }
    }
    true
}

/// Applies the configured rules to arriving messages
pub struct MessageFilterEngine {
    mailbox_name: String,
    send_as: String,
    rules: Vec<FilterRule>,
    fetcher: Arc<dyn MessageStore>,
    outbound: Arc<OutboundMailChannel>,
    journal: Arc<dyn Journal>,
}

impl MessageFilterEngine {
    pub fn new(
        mailbox_name: impl Into<String>,
        send_as: impl Into<String>,
        rules: Vec<FilterRule>,
        fetcher: Arc<dyn MessageStore>,
        outbound: Arc<OutboundMailChannel>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            mailbox_name: mailbox_name.into(),
            send_as: send_as.into(),
            rules,
            fetcher,
            outbound,
            journal,
        }
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Run every message through the rules, one at a time. Sequential on
    /// purpose: rule actions move messages, and concurrent moves against
    /// one session would interleave their UID commands.
    pub async fn filter_all(&self, messages: &[MessageSummary]) {
        for summary in messages {
            if let Err(e) = self.filter_message(summary).await {
                warn!(
                    "Mailbox '{}': filter failed for '{}': {}",
                    self.mailbox_name,
                    summary.subject(),
                    e
                );
            }
        }
    }

    /// Apply all matching rules to one message
    pub async fn filter_message(&self, summary: &MessageSummary) -> EngineResult<()> {
        if self.rules.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(SETTLE_DELAY).await;

        for rule in &self.rules {
            if !rule_matches(rule, summary) {
                continue;
            }
            info!(
                "Mailbox '{}': rule '{}' matched '{}'",
                self.mailbox_name,
                rule.name,
                summary.subject()
            );
            self.apply_rule(rule, summary).await?;
        }
        Ok(())
    }

    async fn apply_rule(&self, rule: &FilterRule, summary: &MessageSummary) -> EngineResult<()> {
        if rule.forward && !rule.forward_to.is_empty() {
            let raw = self.fetcher.get_message(summary.uid).await?;
            let content = extract_content(&raw)?;
            let forward = build_forward(
                &self.mailbox_name,
                &self.send_as,
                summary,
                &content,
                &rule.forward_to,
            );
            // A refused send is reported and does not block the move; the
            // original stays retrievable from wherever the move puts it
            let sent = self.outbound.send_mail(forward).await;
            if sent {
                self.journal
                    .log_sent(summary, &rule.forward_to, rule.move_to.is_some())
                    .await;
            } else {
                warn!(
                    "Mailbox '{}': rule '{}' forward to {} was not accepted",
                    self.mailbox_name, rule.name, rule.forward_to
                );
            }
        }

        if let Some(folder) = &rule.move_to {
            self.fetcher.move_message(summary.uid, folder).await?;
            self.journal
                .log_changed(summary, "filter", &format!("moved to {}", folder))
                .await;
            debug!(
                "Mailbox '{}': rule '{}' moved uid {} to {}",
                self.mailbox_name, rule.name, summary.uid, folder
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailboxConfig;
    use crate::journal::MemoryJournal;
    use crate::outbound::testing::ScriptedTransport;
    use async_trait::async_trait;
    use mailwatch_imap::{EmailAddress, Envelope};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    fn summary(subject: &str, from: &str) -> MessageSummary {
        MessageSummary {
            uid: 1,
            seq: 1,
            envelope: Envelope {
                message_id: Some("<x@example>".into()),
                subject: Some(subject.into()),
                from: vec![EmailAddress::new(None, from.into())],
                ..Envelope::default()
            },
        }
    }

    fn rule(subject: &str, sender: &str) -> FilterRule {
        FilterRule {
            name: "r".into(),
            subject_contains: subject.into(),
            sender_contains: sender.into(),
            forward: false,
            forward_to: String::new(),
            move_to: None,
        }
    }

    #[test]
    fn subject_match_is_case_insensitive_substring() {
        let msg = summary("Monthly INVOICE due", "billing@vendor.example");
        assert!(rule_matches(&rule("invoice", ""), &msg));
        assert!(!rule_matches(&rule("receipt", ""), &msg));
    }

    #[test]
    fn sender_match_covers_all_from_addresses() {
        let msg = summary("hi", "billing@vendor.example");
        assert!(rule_matches(&rule("", "VENDOR.example"), &msg));
        assert!(!rule_matches(&rule("", "other.example"), &msg));
    }

    #[test]
    fn both_predicates_must_hold() {
        let msg = summary("Monthly invoice", "billing@vendor.example");
        assert!(rule_matches(&rule("invoice", "vendor"), &msg));
        assert!(!rule_matches(&rule("invoice", "other"), &msg));
        assert!(!rule_matches(&rule("receipt", "vendor"), &msg));
    }

    #[test]
    fn empty_predicates_match_everything() {
        let msg = summary("anything", "anyone@example");
        assert!(rule_matches(&rule("", ""), &msg));
    }

    struct RecordingStore {
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageStore for RecordingStore {
        async fn get_message(&self, uid: u32) -> EngineResult<Vec<u8>> {
            self.log.lock().unwrap().push(format!("fetch {}", uid));
            Ok(b"Subject: Monthly Invoice\r\nContent-Type: text/plain\r\n\r\nplease pay\r\n"
                .to_vec())
        }

        async fn move_message(&self, uid: u32, destination: &str) -> EngineResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("move {} {}", uid, destination));
            Ok(())
        }
    }

    fn config() -> Arc<MailboxConfig> {
        Arc::new(MailboxConfig {
            id: 1,
            name: "ops".into(),
            imap_host: "imap.example".into(),
            imap_port: 993,
            imap_tls: true,
            username: "u".into(),
            password: "p".into(),
            folder: "INBOX".into(),
            smtp_host: "smtp.example".into(),
            smtp_port: 587,
            smtp_username: "u".into(),
            smtp_password: "p".into(),
            send_as: "watcher@corp.example".into(),
        })
    }

    fn forward_and_file_rule() -> FilterRule {
        FilterRule {
            name: "invoices".into(),
            subject_contains: "invoice".into(),
            sender_contains: String::new(),
            forward: true,
            forward_to: "accounting@corp.example".into(),
            move_to: Some("Processed".into()),
        }
    }

    fn engine_with_transport(
        transport: ScriptedTransport,
        log: Arc<StdMutex<Vec<String>>>,
        journal: Arc<MemoryJournal>,
    ) -> MessageFilterEngine {
        let (tx, _rx) = mpsc::channel(8);
        let outbound = Arc::new(OutboundMailChannel::with_transport(
            config(),
            tx,
            Box::new(transport),
        ));
        MessageFilterEngine::new(
            "ops",
            "watcher@corp.example",
            vec![forward_and_file_rule()],
            Arc::new(RecordingStore { log }),
            outbound,
            journal,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn matched_rule_forwards_then_moves() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine_with_transport(
            ScriptedTransport::new(Arc::clone(&log)),
            Arc::clone(&log),
            Arc::clone(&journal),
        );

        engine
            .filter_message(&summary("Monthly INVOICE due", "billing@vendor.example"))
            .await
            .unwrap();

        // The forward goes out before the original leaves the folder
        assert_eq!(
            *log.lock().unwrap(),
            vec!["fetch 1", "send", "move 1 Processed"]
        );
        let entries = journal.entries().await;
        assert!(entries
            .iter()
            .any(|e| e.contains("sent") && e.contains("accounting@corp.example")));
        assert!(entries.iter().any(|e| e.contains("moved to Processed")));
    }

    #[tokio::test(start_paused = true)]
    async fn move_runs_even_when_forward_is_refused() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine_with_transport(
            ScriptedTransport::refusing(1, Arc::clone(&log)),
            Arc::clone(&log),
            Arc::clone(&journal),
        );

        engine
            .filter_message(&summary("Monthly INVOICE due", "billing@vendor.example"))
            .await
            .unwrap();

        let recorded = log.lock().unwrap();
        assert!(recorded.contains(&"send refused".to_string()));
        assert_eq!(recorded.last().map(String::as_str), Some("move 1 Processed"));

        let entries = journal.entries().await;
        assert!(!entries.iter().any(|e| e.starts_with("sent")));
        assert!(entries.iter().any(|e| e.contains("moved to Processed")));
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_message_is_left_alone() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let journal = Arc::new(MemoryJournal::new());
        let engine = engine_with_transport(
            ScriptedTransport::new(Arc::clone(&log)),
            Arc::clone(&log),
            Arc::clone(&journal),
        );

        engine
            .filter_message(&summary("Weekly newsletter", "news@vendor.example"))
            .await
            .unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert!(journal.entries().await.is_empty());
    }
}
