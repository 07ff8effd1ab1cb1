//! C9: the key-value map facade, a thin operation layer over [`Client`] for
//! named remote maps (§2, §4.1's "KV map ops" line).
//!
//! Grounded in the original SDK's `tibeftlKVMap_*` family: `Set`, `Get`, and
//! `Remove` all register a ledger entry and wait on the matching
//! MAP_RESPONSE forever (no caller-supplied timeout — there isn't one in the
//! source signatures either; `eftl.c`'s `tibeftlKVMap_Remove` registers a
//! request exactly like `Set`/`Get` and blocks on its completion, surfacing
//! any server error to the caller). Only the connection-level
//! `tibeftl_RemoveKVMap` (whole-map destroy, [`remove_kv_map`]) is
//! fire-and-forget in the source. Creating a handle is purely local: no
//! frame crosses the wire until the first `Set`/`Get`/`Remove`.

use std::sync::Arc;

use serde_json::Value;

use crate::client::Client;
use crate::completion::completion;
use crate::error::EftlError;
use crate::message::Message;
use crate::protocol::MapFrame;
use crate::protocol::MapOp;
use crate::session::{ConnectionState, Shared};

/// A handle to a named remote key-value map. Cloning it is cheap and keeps
/// the underlying session alive, per SPEC_FULL.md's resource-model addition
/// (no manual refcount — ownership is just a `Client` clone away from
/// `Arc<Shared>`).
#[derive(Clone)]
pub struct KvMap {
    client: Client,
    name: String,
}

impl KvMap {
    /// Allocates a local handle bound to `client` and `name`. Sends nothing;
    /// the map is created implicitly server-side on first `set`.
    pub fn new(client: Client, name: impl Into<String>) -> Self {
        Self { client, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `tibeftlKVMap_Set`: sets `key` to `value`, waiting indefinitely for
    /// the matching MAP_RESPONSE. Allowed while RECONNECTING, same as
    /// `Client::publish` — the ledger entry is replayed on the next WELCOME.
    pub async fn set(&self, key: impl Into<String>, value: Value) -> Result<(), EftlError> {
        let key = key.into();
        let shared = self.client.shared();
        let (waiter, text, seq) = {
            let mut st = shared.state.lock().await;
            if !matches!(st.conn, ConnectionState::Connected | ConnectionState::Reconnecting) {
                return Err(EftlError::NotConnected);
            }
            let seq = st.next_sequence();
            let frame = MapFrame::new(MapOp::Set, seq, self.name.clone(), Some(key), Some(value));
            let text = serde_json::to_string(&frame)?;
            let max = st.negotiated.max_size as usize;
            if text.len() > max {
                return Err(EftlError::MessageTooBig { max, actual: text.len() });
            }
            let (entry, waiter) = completion();
            st.ledger.append(seq, text.clone(), entry);
            (waiter, text, seq)
        };

        if let Err(e) = shared.send_now_or_defer(text).await {
            shared.state.lock().await.ledger.remove(seq);
            return Err(e);
        }
        waiter.wait().await.map(|_| ())
    }

    /// `tibeftlKVMap_Get`: returns `None` if the key has no value set.
    /// Allowed while RECONNECTING, same as `set`.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Message>, EftlError> {
        let key = key.into();
        let shared = self.client.shared();
        let (waiter, text, seq) = {
            let mut st = shared.state.lock().await;
            if !matches!(st.conn, ConnectionState::Connected | ConnectionState::Reconnecting) {
                return Err(EftlError::NotConnected);
            }
            let seq = st.next_sequence();
            let frame = MapFrame::new(MapOp::Get, seq, self.name.clone(), Some(key), None);
            let text = serde_json::to_string(&frame)?;
            let (entry, waiter) = completion();
            st.ledger.append(seq, text.clone(), entry);
            (waiter, text, seq)
        };

        if let Err(e) = shared.send_now_or_defer(text).await {
            shared.state.lock().await.ledger.remove(seq);
            return Err(e);
        }
        waiter.wait().await
    }

    /// `tibeftlKVMap_Remove`: removes `key`, waiting indefinitely for the
    /// matching MAP_RESPONSE exactly like `Set`/`Get` (`eftl.c`'s
    /// `tibeftlKVMap_Remove` registers a request and blocks on its
    /// completion) — this is distinct from the connection-level
    /// [`remove_kv_map`], which is genuinely fire-and-forget.
    pub async fn remove(&self, key: impl Into<String>) -> Result<(), EftlError> {
        let key = key.into();
        let shared = self.client.shared();
        let (waiter, text, seq) = {
            let mut st = shared.state.lock().await;
            if !matches!(st.conn, ConnectionState::Connected | ConnectionState::Reconnecting) {
                return Err(EftlError::NotConnected);
            }
            let seq = st.next_sequence();
            let frame = MapFrame::new(MapOp::Remove, seq, self.name.clone(), Some(key), None);
            let text = serde_json::to_string(&frame)?;
            let (entry, waiter) = completion();
            st.ledger.append(seq, text.clone(), entry);
            (waiter, text, seq)
        };

        if let Err(e) = shared.send_now_or_defer(text).await {
            shared.state.lock().await.ledger.remove(seq);
            return Err(e);
        }
        waiter.wait().await.map(|_| ())
    }
}

/// `tibeftl_RemoveKVMap`: removes the named durable map server-side.
/// Fire-and-forget, matching the source's `tibeftl_RemoveKVMap`, which sends
/// `OP_MAP_DESTROY` without registering a ledger entry. Operates on a map
/// name directly rather than a `KvMap` handle, mirroring the source's
/// connection-level (not handle-level) API.
pub async fn remove_kv_map(shared: &Arc<Shared>, name: &str) -> Result<(), EftlError> {
    let text = {
        let mut st = shared.state.lock().await;
        if !matches!(st.conn, ConnectionState::Connected | ConnectionState::Reconnecting) {
            return Err(EftlError::NotConnected);
        }
        let seq = st.next_sequence();
        let frame = MapFrame::new(MapOp::Destroy, seq, name.to_string(), None, None);
        serde_json::to_string(&frame)?
    };
    shared.send_text(text).await
}
