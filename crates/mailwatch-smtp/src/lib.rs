//! SMTP implementation for mailwatch
//!
//! Provides the outbound transport used by the send channel: a lettre-based
//! mailer with connect / no-op probe / send, and the outgoing message builder.

mod error;
mod mailer;
mod message;

pub use error::{SmtpError, SmtpResult};
pub use mailer::SmtpMailer;
pub use message::{build_lettre_message, OutgoingAttachment, OutgoingMessage};
