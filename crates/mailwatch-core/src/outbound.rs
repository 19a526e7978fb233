//! Outbound SMTP channel with keepalive and rebuild-on-failure
//!
//! The channel never raises a send failure to its caller. A failed send
//! reports `false`, tears the transport down, and rebuilds it so the next
//! attempt starts from a fresh handshake. A background keepalive probes
//! the relay every two minutes and asks the orchestrator for a rebuild
//! when the probe fails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailwatch_imap::MessageSummary;
use mailwatch_smtp::{build_lettre_message, OutgoingMessage, SmtpMailer};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::content::MessageContent;
use crate::error::EngineResult;
use crate::supervisor::MailboxSignal;

/// Keepalive probe period
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
/// Bound on one keepalive probe
const KEEPALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a setup call waits for a concurrent setup before yielding
const SETUP_GATE_WAIT: Duration = Duration::from_secs(5);
/// Pause between dropping a failed transport and rebuilding it
const REBUILD_PAUSE: Duration = Duration::from_secs(1);

/// What the channel needs from an SMTP transport
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    async fn connect(&mut self) -> EngineResult<()>;
    async fn probe(&self) -> EngineResult<()>;
    async fn send(&self, message: &OutgoingMessage) -> EngineResult<()>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
}

#[async_trait]
impl Transport for SmtpMailer {
    async fn connect(&mut self) -> EngineResult<()> {
        Ok(SmtpMailer::connect(self).await?)
    }

    async fn probe(&self) -> EngineResult<()> {
        Ok(self.noop().await?)
    }

    async fn send(&self, message: &OutgoingMessage) -> EngineResult<()> {
        let built = build_lettre_message(message)?;
        Ok(SmtpMailer::send(self, built).await?)
    }

    fn disconnect(&mut self) {
        SmtpMailer::disconnect(self)
    }

    fn is_connected(&self) -> bool {
        SmtpMailer::is_connected(self)
    }
}

/// Owns the SMTP transport for one mailbox
pub struct OutboundMailChannel {
    config: Arc<MailboxConfig>,
    mailer: Arc<Mutex<Box<dyn Transport>>>,
    /// Single-admission gate: a setup that finds another in flight yields
    setup_gate: Arc<Mutex<()>>,
    send_in_flight: Arc<AtomicBool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    signals: mpsc::Sender<MailboxSignal>,
    rebuilds: AtomicU64,
}

impl OutboundMailChannel {
    pub fn new(config: Arc<MailboxConfig>, signals: mpsc::Sender<MailboxSignal>) -> Self {
        let mailer = SmtpMailer::new(
            config.smtp_host.clone(),
            config.smtp_port,
            config.smtp_username.clone(),
            config.smtp_password.clone(),
        );
        Self::with_transport(config, signals, Box::new(mailer))
    }

    pub(crate) fn with_transport(
        config: Arc<MailboxConfig>,
        signals: mpsc::Sender<MailboxSignal>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            config,
            mailer: Arc::new(Mutex::new(transport)),
            setup_gate: Arc::new(Mutex::new(())),
            send_in_flight: Arc::new(AtomicBool::new(false)),
            keepalive: Mutex::new(None),
            signals,
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Connect the transport and arm the keepalive. When another setup is
    /// already in flight this waits briefly and then defers to it.
    pub async fn setup(&self) -> EngineResult<()> {
        let Ok(_gate) = tokio::time::timeout(SETUP_GATE_WAIT, self.setup_gate.lock()).await
        else {
            debug!(
                "Mailbox '{}': outbound setup already in flight",
                self.config.name
            );
            return Ok(());
        };

        self.mailer.lock().await.connect().await?;
        self.arm_keepalive().await;
        info!("Mailbox '{}': outbound channel ready", self.config.name);
        Ok(())
    }

    async fn arm_keepalive(&self) {
        let mut slot = self.keepalive.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }

        let mailer = Arc::clone(&self.mailer);
        let in_flight = Arc::clone(&self.send_in_flight);
        let signals = self.signals.clone();
        let name = self.config.name.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                // A send already exercises the transport; skip the probe
                if in_flight.load(Ordering::SeqCst) {
                    continue;
                }
                let probe = async {
                    let mailer = mailer.lock().await;
                    mailer.probe().await
                };
                match tokio::time::timeout(KEEPALIVE_PROBE_TIMEOUT, probe).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Mailbox '{}': SMTP keepalive failed: {}", name, e);
                        let _ = signals
                            .send(MailboxSignal::KeepaliveFailure {
                                error: e.to_string(),
                            })
                            .await;
                        return;
                    }
                    Err(_) => {
                        warn!("Mailbox '{}': SMTP keepalive timed out", name);
                        let _ = signals
                            .send(MailboxSignal::KeepaliveFailure {
                                error: "keepalive probe timed out".to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        }));
    }

    /// Send a message. Returns whether the relay accepted it; a refusal
    /// rebuilds the transport so the next send starts clean.
    pub async fn send_mail(&self, message: OutgoingMessage) -> bool {
        self.send_in_flight.store(true, Ordering::SeqCst);
        let outcome = self.try_send(&message).await;
        self.send_in_flight.store(false, Ordering::SeqCst);

        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Mailbox '{}': send to {:?} failed: {}",
                    self.config.name, message.to, e
                );
                self.rebuild().await;
                false
            }
        }
    }

    async fn try_send(&self, message: &OutgoingMessage) -> EngineResult<()> {
        let mailer = self.mailer.lock().await;
        mailer.send(message).await
    }

    /// Drop and reconnect the transport. Used after a failed send and by
    /// the orchestrator on a keepalive failure.
    pub async fn rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        {
            let mut mailer = self.mailer.lock().await;
            mailer.disconnect();
        }
        tokio::time::sleep(REBUILD_PAUSE).await;
        let result = {
            let mut mailer = self.mailer.lock().await;
            mailer.connect().await
        };
        match result {
            Ok(()) => {
                self.arm_keepalive().await;
                info!("Mailbox '{}': SMTP transport rebuilt", self.config.name);
            }
            Err(e) => warn!(
                "Mailbox '{}': SMTP rebuild failed, next send retries: {}",
                self.config.name, e
            ),
        }
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.mailer.lock().await.is_connected()
    }

    /// Stop the keepalive and drop the transport
    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive.lock().await.take() {
            task.abort();
        }
        self.mailer.lock().await.disconnect();
    }
}

/// Build the forward of a watched message: sent as the watcher, replying
/// back to the original correspondents, with a provenance banner ahead of
/// both bodies and the original attachments carried along.
pub fn build_forward(
    mailbox_name: &str,
    send_as: &str,
    summary: &MessageSummary,
    content: &MessageContent,
    destination: &str,
) -> OutgoingMessage {
    let envelope = &summary.envelope;

    let mut message = OutgoingMessage::new(send_as, summary.subject())
        .from_name(format!("{} watcher", mailbox_name))
        .to(destination);
    for addr in envelope.from.iter().chain(envelope.cc.iter()) {
        message = message.reply_to(addr.address.clone());
    }

    let to_line = envelope
        .to
        .iter()
        .map(|a| a.to_display_string())
        .collect::<Vec<_>>()
        .join(", ");
    let cc_line = envelope
        .cc
        .iter()
        .map(|a| a.to_display_string())
        .collect::<Vec<_>>()
        .join(", ");
    let date_line = envelope.date.clone().unwrap_or_default();

    let banner_text = format!(
        "Forwarded from mailbox '{}' by {}\n\
         From: {}\n\
         To: {}\n\
         Cc: {}\n\
         Date: {}\n\
         ----------------------------------------\n\n",
        mailbox_name,
        send_as,
        summary.from_display(),
        to_line,
        cc_line,
        date_line
    );

    if content.text.is_some() || content.html.is_none() {
        let body = content.text.clone().unwrap_or_default();
        message = message.text(format!("{}{}", banner_text, body));
    }
    if let Some(html) = &content.html {
        let banner_html = format!(
            "<div><p>Forwarded from mailbox '{}' by {}</p>\
             <p>From: {}<br>To: {}<br>Cc: {}<br>Date: {}</p><hr></div>",
            html_escape(mailbox_name),
            html_escape(send_as),
            html_escape(&summary.from_display()),
            html_escape(&to_line),
            html_escape(&cc_line),
            html_escape(&date_line)
        );
        message = message.html(format!("{}{}", banner_html, html));
    }

    for part in &content.parts {
        message = message.attachment(
            part.filename.clone(),
            part.mime_type.clone(),
            part.data.clone(),
        );
    }

    message
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Transport double that records its calls and refuses a configured
    /// number of sends
    pub(crate) struct ScriptedTransport {
        log: Arc<StdMutex<Vec<String>>>,
        refusals: AtomicUsize,
        connected: bool,
    }

    impl ScriptedTransport {
        pub(crate) fn new(log: Arc<StdMutex<Vec<String>>>) -> Self {
            Self::refusing(0, log)
        }

        pub(crate) fn refusing(count: usize, log: Arc<StdMutex<Vec<String>>>) -> Self {
            Self {
                log,
                refusals: AtomicUsize::new(count),
                connected: true,
            }
        }

        fn record(&self, entry: &str) {
            self.log.lock().unwrap().push(entry.to_string());
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&mut self) -> EngineResult<()> {
            self.connected = true;
            self.record("connect");
            Ok(())
        }

        async fn probe(&self) -> EngineResult<()> {
            Ok(())
        }

        async fn send(&self, _message: &OutgoingMessage) -> EngineResult<()> {
            let refuse = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refuse {
                self.record("send refused");
                Err(EngineError::Send("relay refused".to_string()))
            } else {
                self.record("send");
                Ok(())
            }
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use mailwatch_imap::{EmailAddress, Envelope};

    fn summary() -> MessageSummary {
        MessageSummary {
            uid: 7,
            seq: 7,
            envelope: Envelope {
                message_id: Some("<m1@vendor.example>".into()),
                subject: Some("Monthly Invoice".into()),
                from: vec![EmailAddress::new(
                    Some("Vendor Billing".into()),
                    "billing@vendor.example".into(),
                )],
                to: vec![EmailAddress::new(None, "inbox@corp.example".into())],
                cc: vec![EmailAddress::new(None, "audit@corp.example".into())],
                date: Some("Mon, 3 Feb 2025 09:15:00 +0000".into()),
            },
        }
    }

    #[test]
    fn forward_carries_banner_and_reply_to() {
        let content = MessageContent {
            text: Some("please pay".into()),
            html: None,
            parts: vec![],
        };
        let fwd = build_forward(
            "ops",
            "watcher@corp.example",
            &summary(),
            &content,
            "accounting@corp.example",
        );

        assert_eq!(fwd.from, "watcher@corp.example");
        assert_eq!(fwd.to, vec!["accounting@corp.example"]);
        assert_eq!(
            fwd.reply_to,
            vec!["billing@vendor.example", "audit@corp.example"]
        );
        assert_eq!(fwd.subject, "Monthly Invoice");

        let text = fwd.text_body.unwrap();
        assert!(text.starts_with("Forwarded from mailbox 'ops'"));
        assert!(text.contains("From: Vendor Billing <billing@vendor.example>"));
        assert!(text.contains("Date: Mon, 3 Feb 2025 09:15:00 +0000"));
        assert!(text.ends_with("please pay"));
    }

    #[test]
    fn forward_banners_html_and_keeps_attachments() {
        let content = MessageContent {
            text: Some("t".into()),
            html: Some("<p>h</p>".into()),
            parts: vec![crate::content::MessagePart {
                filename: "a.pdf".into(),
                mime_type: "application/pdf".into(),
                data: vec![1, 2, 3],
            }],
        };
        let fwd = build_forward("ops", "w@corp.example", &summary(), &content, "x@corp.example");

        let html = fwd.html_body.unwrap();
        assert!(html.contains("Forwarded from mailbox 'ops'"));
        assert!(html.ends_with("<p>h</p>"));
        assert_eq!(fwd.attachments.len(), 1);
        assert_eq!(fwd.attachments[0].filename, "a.pdf");
    }

    #[test]
    fn forward_without_text_body_still_gets_text_banner() {
        let content = MessageContent::default();
        let fwd = build_forward("ops", "w@corp.example", &summary(), &content, "x@corp.example");
        assert!(fwd.text_body.unwrap().contains("Forwarded from mailbox"));
        assert!(fwd.html_body.is_none());
    }

    fn channel_config() -> Arc<MailboxConfig> {
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

    #[tokio::test(start_paused = true)]
    async fn refused_send_rebuilds_transport_exactly_once() {
        let (tx, _rx) = mpsc::channel(8);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let channel = OutboundMailChannel::with_transport(
            channel_config(),
            tx,
            Box::new(ScriptedTransport::refusing(1, Arc::clone(&log))),
        );

        let message =
            OutgoingMessage::new("watcher@corp.example", "report").to("ops@corp.example");

        assert!(!channel.send_mail(message.clone()).await);
        assert_eq!(channel.rebuild_count(), 1);
        assert!(channel.is_connected().await);

        // A clean send afterwards does not rebuild again
        assert!(channel.send_mail(message).await);
        assert_eq!(channel.rebuild_count(), 1);

        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["send refused", "connect", "send"]);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_send_does_not_touch_the_transport() {
        let (tx, _rx) = mpsc::channel(8);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let channel = OutboundMailChannel::with_transport(
            channel_config(),
            tx,
            Box::new(ScriptedTransport::new(Arc::clone(&log))),
        );

        let message = OutgoingMessage::new("watcher@corp.example", "ok").to("a@corp.example");
        assert!(channel.send_mail(message).await);
        assert_eq!(channel.rebuild_count(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["send"]);
    }
}
