//! C8: the public connection facade. A [`Client`] is a cheap `Clone` handle
//! around an `Arc<session::Shared>`, mirroring the teacher's `WsClient`
//! (`rpc/transports/ws/mod.rs`) being a thin handle while state and the
//! manager task live behind the `Arc`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::completion::completion;
use crate::error::EftlError;
use crate::message::Message;
use crate::options::{ClientOptions, SubscriptionOptions};
use crate::protocol::{ack_mode_wire, AckFrame, PublishFrame, RequestFrame, SubscribeFrame, UnsubscribeFrame};
use crate::registry::{MessageCallback, SubscriptionRecord};
use crate::session::{self, ConnectionState, Shared};

/// A handle to a subscription created by [`Client::subscribe`]. Cheap to
/// copy; carries only the client-assigned id used to address later
/// Unsubscribe/Close/Acknowledge calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The public handle to an eFTL session (§4.1 "Connection Facade").
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// C8 `Connect`. `error_handler` and `state_handler` are invoked from a
    /// detached task, never from the reader or dispatcher (§4.7).
    pub async fn connect(
        url_list: &str,
        options: ClientOptions,
        error_handler: Option<Arc<dyn Fn(EftlError) + Send + Sync>>,
        state_handler: Option<Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>>,
    ) -> Result<Self, EftlError> {
        let shared = session::connect_session(url_list, options, error_handler, state_handler).await?;
        Ok(Self { shared })
    }

    /// A point-in-time snapshot. Callers that need to react to transitions
    /// rather than poll should use the state-change handler passed to
    /// [`Client::connect`] instead.
    pub async fn state(&self) -> ConnectionState {
        self.shared.state.lock().await.conn
    }

    /// C8 `Publish`. The sequence is consumed even if the size check fails
    /// below, matching the source's literal "assign-then-check" order (§4.1).
    /// Allowed while RECONNECTING: the ledger entry registered below has its
    /// own resend path once WELCOME arrives, so the frame is sent now if a
    /// backend is live or simply deferred to that resend if not (§4.3).
    pub async fn publish(&self, body: Value) -> Result<(), EftlError> {
        let (waiter, text, seq) = {
            let mut st = self.shared.state.lock().await;
            if !matches!(st.conn, ConnectionState::Connected | ConnectionState::Reconnecting) {
                return Err(EftlError::NotConnected);
            }
            let seq = st.next_sequence();
            let frame = PublishFrame::new(seq, body);
            let text = serde_json::to_string(&frame)?;
            let max = st.negotiated.max_size as usize;
            if text.len() > max {
                return Err(EftlError::MessageTooBig { max, actual: text.len() });
            }
            let (entry, waiter) = completion();
            st.ledger.append(seq, text.clone(), entry);
            (waiter, text, seq)
        };

        if let Err(e) = self.shared.send_now_or_defer(text).await {
            self.shared.state.lock().await.ledger.remove(seq);
            return Err(e);
        }
        waiter.wait().await.map(|_| ())
    }

    /// C8 `SendRequest`. Requires negotiated protocol ≥ 1. Allowed while
    /// RECONNECTING for the same reason as `Publish` — the ledger entry is
    /// replayed on the next WELCOME. Eagerly removes the ledger entry on
    /// timeout or on an outright send failure so a late reply can't leak (§5
    /// "Cancellation and timeouts").
    pub async fn send_request(&self, body: Value, timeout: Duration) -> Result<Message, EftlError> {
        let (waiter, text, seq) = {
            let mut st = self.shared.state.lock().await;
            if !matches!(st.conn, ConnectionState::Connected | ConnectionState::Reconnecting) {
                return Err(EftlError::NotConnected);
            }
            if st.negotiated.protocol < 1 {
                return Err(EftlError::NotSupported);
            }
            let seq = st.next_sequence();
            let frame = RequestFrame::new(seq, body);
            let text = serde_json::to_string(&frame)?;
            let max = st.negotiated.max_size as usize;
            if text.len() > max {
                return Err(EftlError::MessageTooBig { max, actual: text.len() });
            }
            let (entry, waiter) = completion();
            st.ledger.append(seq, text.clone(), entry);
            (waiter, text, seq)
        };

        if let Err(e) = self.shared.send_now_or_defer(text).await {
            self.shared.state.lock().await.ledger.remove(seq);
            return Err(e);
        }

        match waiter.wait_timeout(timeout).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(EftlError::Server { code: crate::error::ErrorCode::InvalidType, reason: "empty reply body".to_string() }),
            Err(EftlError::Timeout) => {
                self.shared.state.lock().await.ledger.remove(seq);
                Err(EftlError::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    /// C8 `SendReply`. `request` must carry reply-to metadata captured off an
    /// inbound request-bearing message.
    pub async fn send_reply(&self, reply_body: Value, request: &Message) -> Result<(), EftlError> {
        let reply_to = request
            .reply_to
            .as_ref()
            .ok_or_else(|| EftlError::InvalidArg("message carries no reply-to address".to_string()))?;
        let reply = crate::protocol::ReplyFrame::new(reply_to.to.clone(), reply_to.req, reply_body);
        let text = serde_json::to_string(&reply)?;
        self.shared.send_text(text).await
    }

    /// C8 `Subscribe`. Releases the session mutex before parking on the
    /// completion, per §4.1's "unlocks and waits" contract. Allowed while
    /// RECONNECTING: the registry entry inserted below is resubscribed
    /// unconditionally in `apply_welcome`'s resend loop, so a subscribe
    /// issued during the reconnect window is repaired the same way a
    /// publish/request is (§3's "a subscription is in the registry iff the
    /// server is known to have been told about it" invariant, §4.3).
    pub async fn subscribe(
        &self,
        matcher: Option<String>,
        options: SubscriptionOptions,
        callback: MessageCallback,
    ) -> Result<Subscription, EftlError> {
        let (waiter, text, id) = {
            let mut st = self.shared.state.lock().await;
            if !matches!(st.conn, ConnectionState::Connected | ConnectionState::Reconnecting) {
                return Err(EftlError::NotConnected);
            }
            let id = st.next_subscription_id();
            let (entry, waiter) = completion();
            let record = SubscriptionRecord::new(id, matcher.clone(), options.clone(), callback, entry);

            let mut frame = SubscribeFrame::new(record.wire_id(), ack_mode_wire(record.ack_mode));
            frame.matcher = matcher;
            frame.durable = options.durable_name;
            frame.durable_type = options.durable_type.map(crate::protocol::durable_type_wire);
            frame.key = options.durable_key;
            let text = serde_json::to_string(&frame)?;

            st.registry.insert(record);
            (waiter, text, id)
        };

        if let Err(e) = self.shared.send_now_or_defer(text).await {
            let mut st = self.shared.state.lock().await;
            st.registry.remove(id);
            return Err(e);
        }

        waiter.wait().await?;
        Ok(Subscription { id })
    }

    async fn send_unsubscribe(&self, id: u64, del: Option<bool>) -> Result<(), EftlError> {
        let text = {
            let mut st = self.shared.state.lock().await;
            if st.registry.remove(id).is_none() {
                return Ok(());
            }
            serde_json::to_string(&UnsubscribeFrame::new(id.to_string(), del))?
        };
        self.shared.send_text(text).await
    }

    /// C8 `Unsubscribe`: removes durable state server-side as well.
    pub async fn unsubscribe(&self, sub: Subscription) -> Result<(), EftlError> {
        self.send_unsubscribe(sub.id, None).await
    }

    /// C8 `CloseSubscription`: stops delivery without removing durable state.
    pub async fn close_subscription(&self, sub: Subscription) -> Result<(), EftlError> {
        self.send_unsubscribe(sub.id, Some(false)).await
    }

    /// C8 `UnsubscribeAll`: operates on a snapshot so the per-entry removal
    /// doesn't disturb iteration (§4.1).
    pub async fn unsubscribe_all(&self) -> Result<(), EftlError> {
        let ids = self.shared.state.lock().await.registry.snapshot_ids();
        for id in ids {
            self.send_unsubscribe(id, None).await?;
        }
        Ok(())
    }

    /// C8 `CloseAllSubscriptions`.
    pub async fn close_all_subscriptions(&self) -> Result<(), EftlError> {
        let ids = self.shared.state.lock().await.registry.snapshot_ids();
        for id in ids {
            self.send_unsubscribe(id, Some(false)).await?;
        }
        Ok(())
    }

    /// C8 `Acknowledge`: acks a single message by its receipt sequence.
    pub async fn acknowledge(&self, message: &Message) -> Result<(), EftlError> {
        let Some(seq) = message.receipt.seq else { return Ok(()) };
        let text = serde_json::to_string(&AckFrame::new(seq))?;
        self.shared.send_text(text).await
    }

    /// C8 `AcknowledgeAll`: acks every outstanding message up to and
    /// including this one's sequence on its subscription.
    pub async fn acknowledge_all(&self, message: &Message) -> Result<(), EftlError> {
        let Some(seq) = message.receipt.seq else { return Ok(()) };
        let Some(sub_id) = message.receipt.subscription_id.clone() else { return Ok(()) };
        let text = serde_json::to_string(&AckFrame::for_subscription(seq, sub_id))?;
        self.shared.send_text(text).await
    }

    /// C8 `Reconnect`. Valid only in DISCONNECTED or RECONNECTING; cancels
    /// any scheduled backoff first, then iterates the URL list exactly as
    /// `Connect` does, without creating a new session (§4.1).
    pub async fn reconnect(&self) -> Result<(), EftlError> {
        let old_state;
        {
            let mut st = self.shared.state.lock().await;
            old_state = st.conn;
            match st.conn {
                ConnectionState::Reconnecting => {
                    if let Some(cancel) = st.reconnect_cancel.take() {
                        let _ = cancel.send(());
                    }
                }
                ConnectionState::Disconnected => {}
                _ => return Err(EftlError::InvalidArg("reconnect is only valid while disconnected or reconnecting".to_string())),
            }
            st.conn = ConnectionState::Connecting;
        }
        self.shared.fire_state_change(old_state, ConnectionState::Connecting);
        session::connect_through_list(&self.shared).await
    }

    /// C8 `Disconnect`.
    pub async fn disconnect(&self) {
        session::disconnect(&self.shared).await
    }

    /// C9: allocates a local handle to a named remote key-value map.
    /// `tibeftl_CreateKVMap`'s equivalent — purely local, no frame is sent
    /// until the handle's first `set`/`get`/`remove`.
    pub fn kv_map(&self, name: impl Into<String>) -> crate::kv::KvMap {
        crate::kv::KvMap::new(self.clone(), name)
    }

    /// C9 `tibeftl_RemoveKVMap`: removes the named durable map server-side.
    pub async fn remove_kv_map(&self, name: &str) -> Result<(), EftlError> {
        crate::kv::remove_kv_map(&self.shared, name).await
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}
