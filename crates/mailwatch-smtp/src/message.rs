//! Outgoing message model and lettre message construction

use crate::{SmtpError, SmtpResult};
use lettre::message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::Message;

/// An attachment to include in an outgoing message
#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    /// Filename to display
    pub filename: String,
    /// MIME type (e.g., "application/pdf")
    pub mime_type: String,
    /// Raw file data
    pub data: Vec<u8>,
}

/// Email message to send
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// From address
    pub from: String,
    /// From display name
    pub from_name: Option<String>,
    /// To addresses
    pub to: Vec<String>,
    /// CC addresses
    pub cc: Vec<String>,
    /// Reply-To addresses
    pub reply_to: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub text_body: Option<String>,
    /// HTML body
    pub html_body: Option<String>,
    /// File attachments
    pub attachments: Vec<OutgoingAttachment>,
}

impl OutgoingMessage {
    /// Create a new message builder
    pub fn new(from: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_name: None,
            to: Vec::new(),
            cc: Vec::new(),
            reply_to: Vec::new(),
            subject: subject.into(),
            text_body: None,
            html_body: None,
            attachments: Vec::new(),
        }
    }

    /// Set the from display name
    pub fn from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = Some(name.into());
        self
    }

    /// Add a To recipient
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    /// Add a CC recipient
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    /// Add a Reply-To address
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to.push(address.into());
        self
    }

    /// Set the plain text body
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    /// Set the HTML body
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    /// Add an attachment
    pub fn attachment(
        mut self,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.attachments.push(OutgoingAttachment {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data,
        });
        self
    }
}

fn parse_mailbox(name: Option<&str>, address: &str) -> SmtpResult<Mailbox> {
    Ok(Mailbox::new(
        name.map(|n| n.to_string()),
        address
            .parse()
            .map_err(|e| SmtpError::InvalidAddress(format!("{}: {}", address, e)))?,
    ))
}

/// Build a lettre Message from an OutgoingMessage
pub fn build_lettre_message(msg: &OutgoingMessage) -> SmtpResult<Message> {
    let from_mailbox = parse_mailbox(msg.from_name.as_deref(), &msg.from)?;

    let mut builder = Message::builder()
        .from(from_mailbox.clone())
        .sender(from_mailbox)
        .subject(&msg.subject);

    for to in &msg.to {
        builder = builder.to(parse_mailbox(None, to)?);
    }
    for cc in &msg.cc {
        builder = builder.cc(parse_mailbox(None, cc)?);
    }
    for reply_to in &msg.reply_to {
        builder = builder.reply_to(parse_mailbox(None, reply_to)?);
    }

    // Body part: text/html as multipart/alternative
    let body_part = match (&msg.text_body, &msg.html_body) {
        (Some(text), Some(html)) => MultiPart::alternative()
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(text.clone()),
            )
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(html.clone()),
            ),
        (Some(text), None) => MultiPart::alternative().singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone()),
        ),
        (None, Some(html)) => MultiPart::alternative().singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(html.clone()),
        ),
        (None, None) => MultiPart::alternative().singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(String::new()),
        ),
    };

    // With attachments, wrap in multipart/mixed
    let message = if msg.attachments.is_empty() {
        builder
            .multipart(body_part)
            .map_err(|e| SmtpError::MessageBuildError(e.to_string()))?
    } else {
        let mut mixed = MultiPart::mixed().multipart(body_part);

        for att in &msg.attachments {
            let content_type = att
                .mime_type
                .parse::<ContentType>()
                .unwrap_or(ContentType::parse("application/octet-stream").unwrap());
            let attachment =
                Attachment::new(att.filename.clone()).body(att.data.clone(), content_type);
            mixed = mixed.singlepart(attachment);
        }

        builder
            .multipart(mixed)
            .map_err(|e| SmtpError::MessageBuildError(e.to_string()))?
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_message_with_reply_to() {
        let msg = OutgoingMessage::new("watcher@corp.example", "Fwd: Monthly Invoice")
            .to("billing@x.com")
            .reply_to("original@vendor.example")
            .text("banner\n\nbody");

        let built = build_lettre_message(&msg).unwrap();
        let rendered = String::from_utf8(built.formatted()).unwrap();
        assert!(rendered.contains("From: watcher@corp.example"));
        assert!(rendered.contains("To: billing@x.com"));
        assert!(rendered.contains("Reply-To: original@vendor.example"));
        assert!(rendered.contains("Subject: Fwd: Monthly Invoice"));
    }

    #[test]
    fn builds_message_with_attachment() {
        let msg = OutgoingMessage::new("watcher@corp.example", "report")
            .to("ops@corp.example")
            .html("<p>hi</p>")
            .attachment("report.pdf", "application/pdf", vec![1, 2, 3]);

        let built = build_lettre_message(&msg).unwrap();
        let rendered = String::from_utf8(built.formatted()).unwrap();
        assert!(rendered.contains("multipart/mixed"));
        assert!(rendered.contains("report.pdf"));
    }

    #[test]
    fn rejects_invalid_address() {
        let msg = OutgoingMessage::new("not-an-address", "x");
        assert!(matches!(
            build_lettre_message(&msg),
            Err(SmtpError::InvalidAddress(_))
        ));
    }
}
