//! Lettre-backed SMTP transport with a rebuildable session

use crate::{SmtpError, SmtpResult};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

/// SMTP mailer holding one authenticated transport.
///
/// The transport is dropped and rebuilt on failure rather than repaired; a
/// fresh STARTTLS handshake is the only reliable recovery with flaky relays.
pub struct SmtpMailer {
    host: String,
    port: u16,
    username: String,
    password: String,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpMailer {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            transport: None,
        }
    }

    /// Build the transport and verify it with an authenticated probe
    pub async fn connect(&mut self) -> SmtpResult<()> {
        info!("Connecting to SMTP relay {}:{}", self.host, self.port);

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
            .map_err(|e| SmtpError::ConnectionFailed(e.to_string()))?
            .port(self.port)
            .credentials(Credentials::new(
                self.username.clone(),
                self.password.clone(),
            ))
            .authentication(vec![Mechanism::Plain, Mechanism::Login])
            .build();

        let ok = transport
            .test_connection()
            .await
            .map_err(|e| SmtpError::ConnectionFailed(e.to_string()))?;
        if !ok {
            return Err(SmtpError::ConnectionFailed(
                "relay refused connection probe".to_string(),
            ));
        }

        self.transport = Some(transport);
        info!("SMTP transport ready");
        Ok(())
    }

    /// No-op probe used by the keepalive timer
    pub async fn noop(&self) -> SmtpResult<()> {
        let transport = self.transport.as_ref().ok_or(SmtpError::NotConnected)?;
        let ok = transport
            .test_connection()
            .await
            .map_err(|e| SmtpError::ProbeFailed(e.to_string()))?;
        if ok {
            debug!("SMTP keepalive probe ok");
            Ok(())
        } else {
            Err(SmtpError::ProbeFailed("relay refused probe".to_string()))
        }
    }

    /// Send a built message
    pub async fn send(&self, message: Message) -> SmtpResult<()> {
        let transport = self.transport.as_ref().ok_or(SmtpError::NotConnected)?;
        transport
            .send(message)
            .await
            .map_err(|e| SmtpError::SendFailed(e.to_string()))?;
        info!("Email sent successfully");
        Ok(())
    }

    /// Drop the transport
    pub fn disconnect(&mut self) {
        self.transport = None;
    }

    /// Whether a transport has been built
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }
}
