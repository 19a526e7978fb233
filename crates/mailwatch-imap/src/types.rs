//! IMAP message and folder types

/// Email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub address: String,
}

impl EmailAddress {
    pub fn new(name: Option<String>, address: String) -> Self {
        Self { name, address }
    }

    /// Format as "Name <address>" or just "address"
    pub fn to_display_string(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.address),
            _ => self.address.clone(),
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// Envelope data from an IMAP FETCH response
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Message-ID header
    pub message_id: Option<String>,
    /// Subject line
    pub subject: Option<String>,
    /// From addresses
    pub from: Vec<EmailAddress>,
    /// To addresses
    pub to: Vec<EmailAddress>,
    /// CC addresses
    pub cc: Vec<EmailAddress>,
    /// Date header as sent by the server
    pub date: Option<String>,
}

/// Summary of one message in the watched folder.
///
/// The UID is only stable within one session generation; cross-session
/// identity is the Message-ID string (see [`MessageSummary::identity`]).
#[derive(Debug, Clone)]
pub struct MessageSummary {
    /// Server-assigned UID, scoped to the selected folder
    pub uid: u32,
    /// Sequence number at fetch time (shifts on expunge)
    pub seq: u32,
    /// Envelope data
    pub envelope: Envelope,
}

impl MessageSummary {
    /// Stable identity key used for de-duplication.
    ///
    /// Falls back to the UID when the server reports no Message-ID; that
    /// fallback is only as stable as the session, which matches what the
    /// server gives us.
    pub fn identity(&self) -> String {
        match self.envelope.message_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("uid:{}", self.uid),
        }
    }

    /// Subject with a default for empty
    pub fn subject(&self) -> &str {
        self.envelope.subject.as_deref().unwrap_or("(No subject)")
    }

    /// Primary sender display string
    pub fn from_display(&self) -> String {
        self.envelope
            .from
            .first()
            .map(|a| a.to_display_string())
            .unwrap_or_else(|| "(Unknown sender)".to_string())
    }

    /// All sender addresses joined for predicate matching
    pub fn sender_addresses(&self) -> String {
        self.envelope
            .from
            .iter()
            .map(|a| a.to_display_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Received timestamp parsed from the Date header, if parseable.
    pub fn received_at(&self) -> Option<chrono::DateTime<chrono::FixedOffset>> {
        self.envelope.date.as_deref().and_then(parse_mail_date)
    }
}

/// Parse an RFC 2822 date, tolerating the trailing comments and doubled
/// whitespace some servers emit.
pub fn parse_mail_date(raw: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let mut s = raw.trim().to_string();
    if let Some(paren) = s.rfind('(') {
        s = s[..paren].trim().to_string();
    }
    while s.contains("  ") {
        s = s.replace("  ", " ");
    }
    s = s.replace(" ,", ",");
    chrono::DateTime::parse_from_rfc2822(&s).ok()
}

/// Represents an IMAP folder from a LIST response
#[derive(Debug, Clone)]
pub struct Folder {
    /// Display name (last hierarchy component)
    pub name: String,
    /// Full path including hierarchy delimiter
    pub full_path: String,
    /// Hierarchy delimiter (e.g., '/' for Gmail)
    pub delimiter: Option<char>,
    /// Raw attributes from the LIST response
    pub attributes: Vec<String>,
}

impl Folder {
    pub fn new(
        full_path: String,
        delimiter: Option<char>,
        attributes: Vec<String>,
    ) -> Self {
        let name = full_path
            .split(delimiter.unwrap_or('/'))
            .next_back()
            .unwrap_or(&full_path)
            .to_string();
        Self {
            name,
            full_path,
            delimiter,
            attributes,
        }
    }

    /// Check if this folder can be selected
    pub fn is_selectable(&self) -> bool {
        !self.attributes.iter().any(|a| {
            let lower = a.to_lowercase();
            lower == "\\noselect" || lower == "\\nonexistent"
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(uid: u32, message_id: Option<&str>) -> MessageSummary {
        MessageSummary {
            uid,
            seq: 0,
            envelope: Envelope {
                message_id: message_id.map(|s| s.to_string()),
                ..Envelope::default()
            },
        }
    }

    #[test]
    fn identity_prefers_message_id() {
        let s = summary(42, Some("<abc@example.com>"));
        assert_eq!(s.identity(), "<abc@example.com>");
    }

    #[test]
    fn identity_falls_back_to_uid() {
        assert_eq!(summary(42, None).identity(), "uid:42");
        assert_eq!(summary(42, Some("")).identity(), "uid:42");
    }

    #[test]
    fn parses_date_with_trailing_comment() {
        let dt = parse_mail_date("Tue, 1 Jul 2003 10:52:37 +0200 (CEST)").unwrap();
        assert_eq!(dt.timestamp(), 1057049557);
    }

    #[test]
    fn folder_name_is_last_component() {
        let f = Folder::new("INBOX/Receipts/2024".into(), Some('/'), vec![]);
        assert_eq!(f.name, "2024");
        assert!(f.is_selectable());
    }

    #[test]
    fn noselect_folder_not_selectable() {
        let f = Folder::new("[Gmail]".into(), Some('/'), vec!["\\Noselect".into()]);
        assert!(!f.is_selectable());
    }
}
