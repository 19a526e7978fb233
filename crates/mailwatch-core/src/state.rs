//! Authoritative in-memory view of the watched folder

use mailwatch_imap::MessageSummary;
use std::collections::HashSet;

/// Diff produced by a full refresh
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    /// Messages present now that were not tracked before
    pub received: Vec<MessageSummary>,
    /// Previously tracked messages absent from the new list
    pub removed: Vec<MessageSummary>,
}

/// Ordered list of messages currently present in the watched folder.
///
/// Invariants: no two entries share an identity; order matches the
/// server-reported order as of the last full or delta refresh.
#[derive(Debug, Default)]
pub struct MailboxState {
    emails: Vec<MessageSummary>,
}

impl MailboxState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emails(&self) -> &[MessageSummary] {
        &self.emails
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }

    /// Replace the list wholesale with a fresh server-ordered snapshot and
    /// report the diff. The swap is atomic from the caller's point of view:
    /// the state is only touched under its lock.
    pub fn apply_full_refresh(&mut self, fresh: Vec<MessageSummary>) -> RefreshOutcome {
        let mut deduped: Vec<MessageSummary> = Vec::with_capacity(fresh.len());
        let mut fresh_ids = HashSet::new();
        for summary in fresh {
            if fresh_ids.insert(summary.identity()) {
                deduped.push(summary);
            }
        }

        let old_ids: HashSet<String> = self.emails.iter().map(|m| m.identity()).collect();

        let received = deduped
            .iter()
            .filter(|m| !old_ids.contains(&m.identity()))
            .cloned()
            .collect();
        let removed = self
            .emails
            .iter()
            .filter(|m| !fresh_ids.contains(&m.identity()))
            .cloned()
            .collect();

        self.emails = deduped;
        RefreshOutcome { received, removed }
    }

    /// Merge a delta-fetch batch, skipping identities already tracked.
    /// Returns the entries that were actually new.
    pub fn merge_new(&mut self, batch: Vec<MessageSummary>) -> Vec<MessageSummary> {
        let known: HashSet<String> = self.emails.iter().map(|m| m.identity()).collect();
        let mut added = Vec::new();
        for summary in batch {
            if !known.contains(&summary.identity())
                && !added
                    .iter()
                    .any(|a: &MessageSummary| a.identity() == summary.identity())
            {
                added.push(summary);
            }
        }
        self.emails.extend(added.iter().cloned());
        added
    }

    /// Remove the entry at a 1-based folder position, if still valid
    pub fn apply_expunge(&mut self, seq: u32) -> Option<MessageSummary> {
        let index = seq.checked_sub(1)? as usize;
        if index < self.emails.len() {
            Some(self.emails.remove(index))
        } else {
            None
        }
    }

    /// Look up the entry at a 1-based folder position
    pub fn get_by_seq(&self, seq: u32) -> Option<&MessageSummary> {
        let index = seq.checked_sub(1)? as usize;
        self.emails.get(index)
    }

    /// Look up an entry by UID
    pub fn get_by_uid(&self, uid: u32) -> Option<&MessageSummary> {
        self.emails.iter().find(|m| m.uid == uid)
    }

    /// Remove an entry by UID (after a caller-driven move or delete)
    pub fn remove_by_uid(&mut self, uid: u32) -> Option<MessageSummary> {
        let index = self.emails.iter().position(|m| m.uid == uid)?;
        Some(self.emails.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailwatch_imap::Envelope;

    fn summary(uid: u32, id: &str) -> MessageSummary {
        MessageSummary {
            uid,
            seq: uid,
            envelope: Envelope {
                message_id: Some(id.to_string()),
                ..Envelope::default()
            },
        }
    }

    fn identities(state: &MailboxState) -> Vec<String> {
        state.emails().iter().map(|m| m.identity()).collect()
    }

    #[test]
    fn full_refresh_reports_received_and_removed() {
        let mut state = MailboxState::new();
        let outcome =
            state.apply_full_refresh(vec![summary(1, "<a>"), summary(2, "<b>")]);
        assert_eq!(outcome.received.len(), 2);
        assert!(outcome.removed.is_empty());

        let outcome =
            state.apply_full_refresh(vec![summary(2, "<b>"), summary(3, "<c>")]);
        assert_eq!(outcome.received.len(), 1);
        assert_eq!(outcome.received[0].identity(), "<c>");
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].identity(), "<a>");
        assert_eq!(identities(&state), vec!["<b>", "<c>"]);
    }

    #[test]
    fn no_duplicate_identities_across_refresh_and_merge() {
        let mut state = MailboxState::new();
        // Server reports the same Message-ID twice under different UIDs
        state.apply_full_refresh(vec![summary(1, "<a>"), summary(9, "<a>"), summary(2, "<b>")]);
        assert_eq!(identities(&state), vec!["<a>", "<b>"]);

        let added = state.merge_new(vec![summary(3, "<b>"), summary(4, "<c>"), summary(5, "<c>")]);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].identity(), "<c>");
        assert_eq!(identities(&state), vec!["<a>", "<b>", "<c>"]);
    }

    #[test]
    fn merge_preserves_server_order() {
        let mut state = MailboxState::new();
        state.apply_full_refresh(vec![summary(1, "<a>")]);
        state.merge_new(vec![summary(2, "<b>"), summary(3, "<c>")]);
        assert_eq!(identities(&state), vec!["<a>", "<b>", "<c>"]);
    }

    #[test]
    fn expunge_by_position() {
        let mut state = MailboxState::new();
        state.apply_full_refresh(vec![summary(1, "<a>"), summary(2, "<b>")]);

        let removed = state.apply_expunge(1).unwrap();
        assert_eq!(removed.identity(), "<a>");
        assert_eq!(identities(&state), vec!["<b>"]);

        // Stale position is ignored
        assert!(state.apply_expunge(5).is_none());
        assert!(state.apply_expunge(0).is_none());
    }

    #[test]
    fn lookup_and_remove_by_uid() {
        let mut state = MailboxState::new();
        state.apply_full_refresh(vec![summary(7, "<a>"), summary(8, "<b>")]);
        assert_eq!(state.get_by_uid(8).unwrap().identity(), "<b>");
        assert_eq!(state.remove_by_uid(7).unwrap().identity(), "<a>");
        assert!(state.get_by_uid(7).is_none());
        assert_eq!(state.len(), 1);
    }
}
