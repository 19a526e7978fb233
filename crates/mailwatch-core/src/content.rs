//! Body text/HTML and attachment extraction from raw RFC 822 messages

use mailparse::{DispositionType, ParsedMail};

use crate::error::{EngineError, EngineResult};

/// One non-text part of a message
#[derive(Debug, Clone)]
pub struct MessagePart {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Extracted message content
#[derive(Debug, Clone, Default)]
pub struct MessageContent {
    /// First text/plain body
    pub text: Option<String>,
    /// First text/html body
    pub html: Option<String>,
    /// Everything else worth carrying on a forward
    pub parts: Vec<MessagePart>,
}

/// Extract bodies and attachments from a raw message
pub fn extract_content(raw: &[u8]) -> EngineResult<MessageContent> {
    let parsed =
        mailparse::parse_mail(raw).map_err(|e| EngineError::Protocol(e.to_string()))?;
    let mut content = MessageContent::default();
    walk(&parsed, &mut content);
    Ok(content)
}

fn walk(part: &ParsedMail, content: &mut MessageContent) {
    let mime = part.ctype.mimetype.to_lowercase();

    if mime.starts_with("multipart/") {
        for sub in &part.subparts {
            walk(sub, content);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let is_attachment = disposition.disposition == DispositionType::Attachment;

    if mime == "text/plain" && !is_attachment && content.text.is_none() {
        content.text = part.get_body().ok();
    } else if mime == "text/html" && !is_attachment && content.html.is_none() {
        content.html = part.get_body().ok();
    } else if let Ok(data) = part.get_body_raw() {
        if data.is_empty() {
            return;
        }
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| part.ctype.params.get("name").cloned())
            .unwrap_or_else(|| "attachment".to_string());
        content.parts.push(MessagePart {
            filename,
            mime_type: part.ctype.mimetype.clone(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "Subject: test\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: multipart/alternative; boundary=\"b2\"\r\n\
\r\n\
--b2\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello plain\r\n\
--b2\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>hello html</p>\r\n\
--b2--\r\n\
--b1\r\n\
Content-Type: application/pdf; name=\"a.pdf\"\r\n\
Content-Disposition: attachment; filename=\"a.pdf\"\r\n\
\r\n\
PDFDATA\r\n\
--b1--\r\n";

    #[test]
    fn extracts_bodies_and_attachments() {
        let content = extract_content(RAW.as_bytes()).unwrap();
        assert_eq!(content.text.as_deref().map(str::trim), Some("hello plain"));
        assert_eq!(
            content.html.as_deref().map(str::trim),
            Some("<p>hello html</p>")
        );
        assert_eq!(content.parts.len(), 1);
        assert_eq!(content.parts[0].filename, "a.pdf");
        assert_eq!(content.parts[0].mime_type, "application/pdf");
    }

    #[test]
    fn plain_text_only_message() {
        let raw = "Subject: x\r\nContent-Type: text/plain\r\n\r\njust text\r\n";
        let content = extract_content(raw.as_bytes()).unwrap();
        assert_eq!(content.text.as_deref().map(str::trim), Some("just text"));
        assert!(content.html.is_none());
        assert!(content.parts.is_empty());
    }
}
