use std::collections::BTreeMap;

use crate::completion::{Completion, Outcome};
use crate::error::ErrorCode;
use crate::message::Message;

/// C3: an ordered ledger of in-flight outbound operations awaiting an
/// acknowledgement or reply. Backed by a `BTreeMap` keyed on the strictly
/// increasing sequence number, which gives FIFO iteration order for free —
/// the teacher's `RequestManager` makes the same choice (`reqs: BTreeMap<u64,
/// InFlight>`) rather than a hand-rolled linked list (spec §9 Design Notes).
pub struct RequestLedger {
    entries: BTreeMap<u64, LedgerEntry>,
}

pub struct LedgerEntry {
    pub seq: u64,
    /// The exact wire text sent for this operation, kept so resend (§4.2
    /// step 2) replays it byte-for-byte rather than re-encoding.
    pub wire_text: String,
    pub completion: Completion<Message>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a new entry. Callers must assign `seq` from the session's
    /// monotonic counter before calling this, under the session mutex, so
    /// that insertion order equals sequence order (§3 invariants).
    pub fn append(&mut self, seq: u64, wire_text: String, completion: Completion<Message>) {
        debug_assert!(
            self.entries.keys().next_back().map_or(true, |&last| seq > last),
            "ledger sequence numbers must be strictly increasing"
        );
        self.entries.insert(seq, LedgerEntry { seq, wire_text, completion });
    }

    pub fn remove(&mut self, seq: u64) -> Option<LedgerEntry> {
        self.entries.remove(&seq)
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.entries.contains_key(&seq)
    }

    /// Completes the entry for `seq` with a successful outcome, consuming it
    /// from the ledger. Used by ACK/REQUEST_REPLY/MAP_RESPONSE handling
    /// (§4.6). Returns `false` if no such entry exists (a late reply after
    /// the caller already timed out and unregistered — §4.6 edge case).
    pub fn complete_success(&mut self, seq: u64, response: Option<Message>) -> bool {
        if let Some(mut entry) = self.entries.remove(&seq) {
            entry.completion.signal(Outcome::Success(response));
            true
        } else {
            false
        }
    }

    pub fn complete_error(&mut self, seq: u64, code: ErrorCode, reason: String) -> bool {
        if let Some(mut entry) = self.entries.remove(&seq) {
            entry.completion.signal(Outcome::Error { code, reason });
            true
        } else {
            false
        }
    }

    /// Completes every entry with the same error, draining the ledger. Used
    /// when a transport loss is not going to reconnect (§4.3, §7): no caller
    /// is left blocking indefinitely.
    pub fn complete_all(&mut self, code: ErrorCode, reason: impl Into<String>) {
        let reason = reason.into();
        for (_, mut entry) in std::mem::take(&mut self.entries) {
            entry.completion.signal(Outcome::Error { code, reason: reason.clone() });
        }
    }

    /// Returns the wire text of every entry in ledger (= sequence) order, for
    /// resend after WELCOME (§4.2 step 2, §8 invariant 2).
    pub fn resend_order(&self) -> Vec<String> {
        self.entries.values().map(|e| e.wire_text.clone()).collect()
    }
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completion;

    #[test]
    fn resend_preserves_sequence_order() {
        let mut ledger = RequestLedger::new();
        for seq in [1u64, 2, 3] {
            let (c, _w) = completion();
            ledger.append(seq, format!("frame-{seq}"), c);
        }
        assert_eq!(ledger.resend_order(), vec!["frame-1", "frame-2", "frame-3"]);
    }

    #[tokio::test]
    async fn late_reply_after_timeout_removal_is_a_noop() {
        let mut ledger = RequestLedger::new();
        let (c, _w) = completion();
        ledger.append(1, "frame-1".to_string(), c);
        ledger.remove(1);
        assert!(!ledger.complete_success(1, None));
    }

    #[tokio::test]
    async fn complete_all_unblocks_every_waiter() {
        let mut ledger = RequestLedger::new();
        let (c1, w1) = completion();
        let (c2, w2) = completion();
        ledger.append(1, "a".to_string(), c1);
        ledger.append(2, "b".to_string(), c2);
        ledger.complete_all(ErrorCode::ConnectionLost, "closed");
        assert!(w1.wait().await.is_err());
        assert!(w2.wait().await.is_err());
        assert!(ledger.is_empty());
    }
}
