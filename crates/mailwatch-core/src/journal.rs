//! Journal collaborator: the persistent record of received/removed/sent mail
//!
//! At-least-once semantics; implementations must be idempotent keyed by the
//! message identity string. `log_received` doubles as the idempotent "is
//! this new" probe.

use std::collections::HashSet;

use async_trait::async_trait;
use mailwatch_imap::MessageSummary;
use tokio::sync::Mutex;

#[async_trait]
pub trait Journal: Send + Sync {
    /// Record a received message. Returns false when the identity was
    /// already journaled, so callers can suppress duplicate notifications.
    async fn log_received(&self, summary: &MessageSummary) -> bool;

    /// Record a message that disappeared from the watched folder
    async fn log_removed(&self, summary: &MessageSummary);

    /// Record an action performed on a message (e.g. a move) and who did it
    async fn log_changed(&self, summary: &MessageSummary, actor: &str, action: &str);

    /// Record a message being marked seen
    async fn log_seen(&self, summary: &MessageSummary);

    /// Record an outbound send
    async fn log_sent(&self, summary: &MessageSummary, destination: &str, moved: bool);
}

#[derive(Default)]
struct MemoryJournalInner {
    seen: HashSet<String>,
    entries: Vec<String>,
}

/// In-memory journal, used in tests and as a default collaborator
#[derive(Default)]
pub struct MemoryJournal {
    inner: Mutex<MemoryJournalInner>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// All journal lines recorded so far
    pub async fn entries(&self) -> Vec<String> {
        self.inner.lock().await.entries.clone()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn log_received(&self, summary: &MessageSummary) -> bool {
        let mut inner = self.inner.lock().await;
        let fresh = inner.seen.insert(summary.identity());
        if fresh {
            let line = format!("received {}", summary.identity());
            inner.entries.push(line);
        }
        fresh
    }

    async fn log_removed(&self, summary: &MessageSummary) {
        let mut inner = self.inner.lock().await;
        let line = format!("removed {}", summary.identity());
        inner.entries.push(line);
    }

    async fn log_changed(&self, summary: &MessageSummary, actor: &str, action: &str) {
        let mut inner = self.inner.lock().await;
        let line = format!("changed {} by {}: {}", summary.identity(), actor, action);
        inner.entries.push(line);
    }

    async fn log_seen(&self, summary: &MessageSummary) {
        let mut inner = self.inner.lock().await;
        let line = format!("seen {}", summary.identity());
        inner.entries.push(line);
    }

    async fn log_sent(&self, summary: &MessageSummary, destination: &str, moved: bool) {
        let mut inner = self.inner.lock().await;
        let line = format!(
            "sent {} to {} (moved={})",
            summary.identity(),
            destination,
            moved
        );
        inner.entries.push(line);
    }
}
