//! Engine error taxonomy
//!
//! Connectivity failures are retried with backoff by the orchestrator;
//! protocol rejections and IDLE faults are fatal to the component and force
//! a full reset; send failures surface as booleans at the channel API.

use mailwatch_imap::ImapError;
use mailwatch_smtp::SmtpError;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the watch engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Connect/authenticate failure; retried with backoff, not fatal
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Command rejected by the server; fatal to the issuing component
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure inside the background IDLE wait; always fatal
    #[error("IDLE fault: {0}")]
    Idle(String),

    /// Outbound send failure
    #[error("send failure: {0}")]
    Send(String),

    /// Bad or missing configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ImapError> for EngineError {
    fn from(e: ImapError) -> Self {
        match e {
            ImapError::ConnectionFailed(_)
            | ImapError::AuthenticationFailed(_)
            | ImapError::TlsError(_)
            | ImapError::IoError(_)
            | ImapError::NotConnected
            | ImapError::Timeout => EngineError::Connectivity(e.to_string()),
            ImapError::IdleFault(_) => EngineError::Idle(e.to_string()),
            ImapError::ServerError(_)
            | ImapError::FolderNotFound(_)
            | ImapError::MessageNotFound(_)
            | ImapError::ParseError(_) => EngineError::Protocol(e.to_string()),
        }
    }
}

impl From<SmtpError> for EngineError {
    fn from(e: SmtpError) -> Self {
        match e {
            SmtpError::ConnectionFailed(_)
            | SmtpError::AuthenticationFailed(_)
            | SmtpError::NotConnected => EngineError::Connectivity(e.to_string()),
            _ => EngineError::Send(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imap_errors_map_into_taxonomy() {
        let e: EngineError = ImapError::ConnectionFailed("refused".into()).into();
        assert!(matches!(e, EngineError::Connectivity(_)));

        let e: EngineError = ImapError::ServerError("NO rejected".into()).into();
        assert!(matches!(e, EngineError::Protocol(_)));

        let e: EngineError = ImapError::IdleFault("closed".into()).into();
        assert!(matches!(e, EngineError::Idle(_)));
    }
}
