//! Core watch engine for mailwatch
//!
//! One engine instance per watched mailbox: a connection supervisor driving
//! the IMAP IDLE state machine, a fetch worker for commands that suspend
//! IDLE, a resilient outbound send channel, a filter engine, and the
//! orchestrator tying them together with retry/backoff and a fail-fast
//! exception budget. Mailboxes are owned by an explicit registry.

mod coalesce;
mod config;
mod content;
mod error;
mod fetch;
mod filter;
mod journal;
mod notify;
mod orchestrator;
mod outbound;
mod registry;
mod state;
mod supervisor;

pub use coalesce::BurstCoalescer;
pub use config::{ConfigStore, FilterRule, MailboxConfig};
pub use content::{extract_content, MessageContent, MessagePart};
pub use error::{EngineError, EngineResult};
pub use fetch::{FetchWorker, MessageStore};
pub use filter::{rule_matches, MessageFilterEngine};
pub use journal::{Journal, MemoryJournal};
pub use notify::{EventKind, NotificationEvent, NotificationSink};
pub use orchestrator::{Backoff, MailboxOrchestrator, MailboxStatus};
pub use outbound::{build_forward, OutboundMailChannel};
pub use registry::MailboxRegistry;
pub use state::{MailboxState, RefreshOutcome};
pub use supervisor::{ConnectionSupervisor, MailboxSignal, SupervisorState};
