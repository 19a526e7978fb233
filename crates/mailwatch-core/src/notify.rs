//! Notification sinks: best-effort fan-out of mailbox events

use async_trait::async_trait;
use mailwatch_imap::MessageSummary;
use std::sync::Arc;
use tracing::debug;

/// Kind of mailbox event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Received,
    Removed,
    Seen,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Received => write!(f, "received"),
            EventKind::Removed => write!(f, "removed"),
            EventKind::Seen => write!(f, "seen"),
        }
    }
}

/// Event delivered to notification sinks and the journal
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub summary: MessageSummary,
    pub mailbox_name: String,
}

/// A hot-attachable notification consumer.
///
/// Failures are the sink's problem: a false return is logged and otherwise
/// ignored, never propagated into the engine.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> bool;

    /// Name used in logs
    fn name(&self) -> &str {
        "sink"
    }
}

/// Deliver one event to every sink, awaiting each delivery so no dispatch
/// is silently dropped.
pub(crate) async fn dispatch(sinks: &[Arc<dyn NotificationSink>], event: &NotificationEvent) {
    for sink in sinks {
        if !sink.notify(event).await {
            debug!(
                "Sink '{}' declined {} event for '{}'",
                sink.name(),
                event.kind,
                event.summary.subject()
            );
        }
    }
}
