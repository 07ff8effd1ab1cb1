use std::collections::BTreeMap;
use std::sync::Arc;

use crate::completion::Completion;
use crate::message::Message;
use crate::options::{AckMode, DurableType, SubscriptionOptions};

pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// C2: a subscription record (§3 "Subscription record"). Keyed in memory by
/// the client-assigned numeric id; stringified only at the wire boundary
/// (spec §9 Design Notes: "keep the string id on the wire but key the
/// in-memory registry with a typed id").
pub struct SubscriptionRecord {
    pub id: u64,
    pub matcher: Option<String>,
    pub durable_name: Option<String>,
    pub durable_type: Option<DurableType>,
    pub durable_key: Option<String>,
    pub ack_mode: AckMode,
    pub last_seen_seq: u64,
    pub pending: bool,
    pub callback: MessageCallback,
    /// Signalled once, with the result of the original SUBSCRIBE (§4.1).
    pub completion: Option<Completion<()>>,
}

impl SubscriptionRecord {
    pub fn new(
        id: u64,
        matcher: Option<String>,
        opts: SubscriptionOptions,
        callback: MessageCallback,
        completion: Completion<()>,
    ) -> Self {
        Self {
            id,
            matcher,
            durable_name: opts.durable_name,
            durable_type: opts.durable_type,
            durable_key: opts.durable_key,
            ack_mode: opts.ack_mode,
            last_seen_seq: 0,
            pending: true,
            callback,
            completion: Some(completion),
        }
    }

    pub fn wire_id(&self) -> String {
        self.id.to_string()
    }
}

/// Outcome of the dedup check in §4.4/§4.5.
pub enum DispatchDecision {
    /// Deliver the message; the snapshot carries what the dispatcher needs
    /// without holding the registry lock during the user callback.
    Deliver { ack_mode: AckMode, callback: MessageCallback },
    /// Sequence regression or unknown subscription: drop silently.
    Drop,
}

/// C2: insertion-order mapping from subscription id to record. All reads and
/// mutations take place under the session mutex except callback invocation,
/// per §4.4.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: BTreeMap<u64, SubscriptionRecord>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: SubscriptionRecord) {
        self.subs.insert(record.id, record);
    }

    pub fn remove(&mut self, id: u64) -> Option<SubscriptionRecord> {
        self.subs.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&SubscriptionRecord> {
        self.subs.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut SubscriptionRecord> {
        self.subs.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.subs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// A snapshot copy of the ids currently registered, for the 'All'
    /// operations (UnsubscribeAll/CloseAllSubscriptions) to iterate without
    /// being disturbed by the per-entry removal they cause (§4.1, §8
    /// invariant 7).
    pub fn snapshot_ids(&self) -> Vec<u64> {
        self.subs.keys().copied().collect()
    }

    /// Resets every subscription's last-seen sequence to 0, as required when
    /// a WELCOME arrives without `_resume` (§4.2 "Post-welcome repair").
    pub fn reset_all_last_seen(&mut self) {
        for sub in self.subs.values_mut() {
            sub.last_seen_seq = 0;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionRecord> {
        self.subs.values()
    }

    /// The dedup + last-seen update logic of §4.4/§4.5 step 2, performed
    /// under the registry lock. Returns the decision for the dispatcher to
    /// act on after releasing the lock.
    pub fn dispatch_decision(&mut self, id: u64, seq: u64) -> DispatchDecision {
        let Some(sub) = self.subs.get_mut(&id) else { return DispatchDecision::Drop };

        if seq != 0 && seq <= sub.last_seen_seq {
            return DispatchDecision::Drop;
        }

        if sub.ack_mode == AckMode::Auto && seq != 0 {
            sub.last_seen_seq = seq;
        }

        DispatchDecision::Deliver { ack_mode: sub.ack_mode, callback: sub.callback.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completion;

    fn record(id: u64, ack_mode: AckMode) -> SubscriptionRecord {
        let (c, _w) = completion();
        SubscriptionRecord::new(
            id,
            None,
            SubscriptionOptions { ack_mode, ..Default::default() },
            Arc::new(|_| {}),
            c,
        )
    }

    #[test]
    fn dedup_drops_non_increasing_sequence_for_auto_ack() {
        let mut reg = SubscriptionRegistry::new();
        reg.insert(record(1, AckMode::Auto));

        assert!(matches!(reg.dispatch_decision(1, 5), DispatchDecision::Deliver { .. }));
        assert!(matches!(reg.dispatch_decision(1, 5), DispatchDecision::Drop));
        assert!(matches!(reg.dispatch_decision(1, 6), DispatchDecision::Deliver { .. }));
    }

    #[test]
    fn client_ack_mode_does_not_advance_last_seen() {
        let mut reg = SubscriptionRegistry::new();
        reg.insert(record(1, AckMode::Client));

        assert!(matches!(reg.dispatch_decision(1, 5), DispatchDecision::Deliver { .. }));
        // last_seen was never advanced, so the same sequence is delivered again.
        assert!(matches!(reg.dispatch_decision(1, 5), DispatchDecision::Deliver { .. }));
    }

    #[test]
    fn reset_after_non_resuming_welcome_allows_replays() {
        let mut reg = SubscriptionRegistry::new();
        reg.insert(record(1, AckMode::Auto));
        reg.dispatch_decision(1, 5);
        reg.reset_all_last_seen();
        assert!(matches!(reg.dispatch_decision(1, 5), DispatchDecision::Deliver { .. }));
    }

    #[test]
    fn snapshot_is_unaffected_by_concurrent_removal() {
        let mut reg = SubscriptionRegistry::new();
        reg.insert(record(1, AckMode::Auto));
        reg.insert(record(2, AckMode::Auto));
        let snapshot = reg.snapshot_ids();
        reg.remove(1);
        assert_eq!(snapshot.len(), 2);
    }
}
