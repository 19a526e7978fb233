//! IMAP protocol implementation for mailwatch
//!
//! Provides a raw tagged-command IMAP client over tokio with IDLE support,
//! designed to keep the watch engine in control of the wire at all times.

mod client;
mod error;
mod idle;
mod types;

pub use client::ImapClient;
pub use error::{ImapError, ImapResult};
pub use idle::IdleEvent;
pub use types::{EmailAddress, Envelope, Folder, MessageSummary};
