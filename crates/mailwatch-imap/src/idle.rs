//! Untagged-response parsing for the IDLE wait

/// Server-pushed events observed while the session sits in IDLE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEvent {
    /// The folder now holds `exists` messages (new mail when it grew)
    Exists(u32),
    /// Message at sequence position `seq` was expunged
    Expunged(u32),
    /// Message at sequence position `seq` had its \Seen flag set
    Seen(u32),
    /// Server is closing the connection
    Bye,
}

/// Parse one untagged line received during IDLE.
///
/// Returns `None` for untagged responses the watcher does not care about
/// (RECENT, FETCH without \Seen, capability chatter).
pub fn parse_untagged(line: &str) -> Option<IdleEvent> {
    let line = line.trim();
    let rest = line.strip_prefix("* ")?;

    if rest.starts_with("BYE") {
        return Some(IdleEvent::Bye);
    }

    let mut parts = rest.splitn(2, ' ');
    let number: u32 = parts.next()?.parse().ok()?;
    let keyword = parts.next()?;

    if keyword.starts_with("EXISTS") {
        Some(IdleEvent::Exists(number))
    } else if keyword.starts_with("EXPUNGE") {
        Some(IdleEvent::Expunged(number))
    } else if keyword.starts_with("FETCH") && keyword.contains("\\Seen") {
        Some(IdleEvent::Seen(number))
    } else {
        None
    }
}
