//! C7 (session state machine) + C6 (protocol handler) + the C8 entry points
//! that need direct access to connection machinery (`Connect`, `Reconnect`,
//! `Disconnect`). Per SPEC_FULL.md's task/ownership addition, the session is
//! owned by an `Arc<Shared>`; [`crate::Client`] is a thin handle around that
//! `Arc`, mirroring the teacher's `WsClient` being `Clone` while real state
//! lives behind the spawned manager task (`rpc/transports/ws/manager.rs`).

mod reconnect;

use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc::UnboundedSender;
use futures_channel::oneshot;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::backend::{self, BackendEvent, BackendHandle};
use crate::dispatch::{self, InboundDelivery, DEFAULT_INBOUND_CAPACITY};
use crate::error::{EftlError, ErrorCode, WireError};
use crate::ledger::RequestLedger;
use crate::message::Message;
use crate::options::ClientOptions;
use crate::protocol::{
    ack_mode_wire, durable_type_wire, resume_enabled, InboundFrame, LoginFrame, LoginOptions, Opcode,
    SubscribeFrame,
};
use crate::registry::SubscriptionRegistry;
use crate::url_list::{BrokerUrl, UrlList};

pub use reconnect::schedule_reconnect;

/// Session state machine states (§3 "Session state", transitions in §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Reconnecting,
}

/// Server-negotiated parameters captured from WELCOME (§3 "Session", §6).
#[derive(Debug, Clone)]
pub struct NegotiatedParams {
    pub protocol: u32,
    pub max_size: u64,
    pub heartbeat_timeout: Duration,
    pub client_id: Option<String>,
    pub reconnect_token: Option<String>,
}

impl Default for NegotiatedParams {
    fn default() -> Self {
        Self {
            protocol: 0,
            max_size: u64::MAX,
            heartbeat_timeout: Duration::from_secs(0),
            client_id: None,
            reconnect_token: None,
        }
    }
}

/// The live backend's outbound sink and shutdown handle, held across
/// reconnects inside [`SessionState`].
pub struct BackendControl {
    outbound: UnboundedSender<String>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl BackendControl {
    fn new(outbound: UnboundedSender<String>, shutdown: Option<oneshot::Sender<()>>) -> Self {
        Self { outbound, shutdown }
    }

    /// Idempotent: at most the first call actually signals the backend task.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Everything the session mutex guards (§5 "Serialization").
pub struct SessionState {
    pub conn: ConnectionState,
    pub urls: UrlList,
    pub options: ClientOptions,
    pub negotiated: NegotiatedParams,
    pub ledger: RequestLedger,
    pub registry: SubscriptionRegistry,
    pub next_seq: u64,
    pub next_sub_id: u64,
    pub reconnect_attempts: u32,
    pub backend: Option<BackendControl>,
    pub reconnect_cancel: Option<oneshot::Sender<()>>,
}

impl SessionState {
    /// Assigns and returns the next publish sequence (§3 invariants: strictly
    /// increasing, never reused).
    pub fn next_sequence(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn next_subscription_id(&mut self) -> u64 {
        self.next_sub_id += 1;
        self.next_sub_id
    }
}

type ErrorHandler = Arc<dyn Fn(EftlError) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// The shared session: state behind a mutex, plus the fan-out handlers and
/// the channel feeding the dispatcher.
pub struct Shared {
    pub state: Mutex<SessionState>,
    pub error_handler: Option<ErrorHandler>,
    pub state_handler: Option<StateHandler>,
    pub inbound_tx: tokio::sync::mpsc::Sender<InboundDelivery>,
}

impl Shared {
    /// Sends a pre-encoded text frame over whatever backend is currently
    /// live. Fails with `NotConnected` if there is none.
    pub async fn send_text(&self, text: String) -> Result<(), EftlError> {
        let state = self.state.lock().await;
        match &state.backend {
            Some(backend) => backend
                .outbound
                .unbounded_send(text)
                .map_err(|_| EftlError::ConnectionLost { reason: "backend task is gone".to_string() }),
            None => Err(EftlError::NotConnected),
        }
    }

    /// Like [`Shared::send_text`], but tolerant of the RECONNECTING window:
    /// while reconnecting there is no live backend to write to, yet a caller
    /// that already registered a ledger entry or registry record for this
    /// frame doesn't need the send to happen now — `apply_welcome` replays
    /// the ledger and resubscribes every registry entry once WELCOME arrives
    /// (§4.2 step 2, §4.3). Failing the caller here instead would strand an
    /// already-registered completion that nothing will ever signal. Only a
    /// session that is neither live nor reconnecting is genuinely
    /// `NotConnected`.
    pub async fn send_now_or_defer(&self, text: String) -> Result<(), EftlError> {
        let state = self.state.lock().await;
        match &state.backend {
            Some(backend) => backend
                .outbound
                .unbounded_send(text)
                .map_err(|_| EftlError::ConnectionLost { reason: "backend task is gone".to_string() }),
            None if state.conn == ConnectionState::Reconnecting => Ok(()),
            None => Err(EftlError::NotConnected),
        }
    }

    /// C10: fans out an asynchronous session error on a detached task, after
    /// first closing whatever transport is live (§4.7: "this lets the user's
    /// handler call Reconnect without reentering a partially-live transport").
    pub fn fire_error(self: &Arc<Self>, err: EftlError) {
        let Some(handler) = self.error_handler.clone() else { return };
        let shared = self.clone();
        tokio::spawn(async move {
            {
                let mut state = shared.state.lock().await;
                if let Some(backend) = state.backend.as_mut() {
                    backend.shutdown();
                }
            }
            handler(err);
        });
    }

    /// C10: fans out a state transition on a detached task, only on actual
    /// change (§4.2, §8 invariant 6).
    pub fn fire_state_change(self: &Arc<Self>, from: ConnectionState, to: ConnectionState) {
        if from == to {
            return;
        }
        if let Some(handler) = self.state_handler.clone() {
            tokio::spawn(async move { handler(from, to) });
        }
    }
}

/// C8 `Connect`: parses the URL list, builds the session, and attempts every
/// URL in turn with no delay between tries (§4.1).
pub async fn connect_session(
    url_list: &str,
    options: ClientOptions,
    error_handler: Option<ErrorHandler>,
    state_handler: Option<StateHandler>,
) -> Result<Arc<Shared>, EftlError> {
    let urls = UrlList::parse(url_list)?;
    let (inbound_tx, inbound_rx) = dispatch::inbound_channel(DEFAULT_INBOUND_CAPACITY);

    let state = SessionState {
        conn: ConnectionState::Initial,
        urls,
        options,
        negotiated: NegotiatedParams::default(),
        ledger: RequestLedger::new(),
        registry: SubscriptionRegistry::new(),
        next_seq: 0,
        next_sub_id: 0,
        reconnect_attempts: 0,
        backend: None,
        reconnect_cancel: None,
    };

    let shared = Arc::new(Shared { state: Mutex::new(state), error_handler, state_handler, inbound_tx });

    tokio::spawn(dispatch::run_dispatcher(shared.clone(), inbound_rx));

    {
        let mut st = shared.state.lock().await;
        st.conn = ConnectionState::Connecting;
    }
    shared.fire_state_change(ConnectionState::Initial, ConnectionState::Connecting);

    connect_through_list(&shared).await?;
    Ok(shared)
}

/// Shared by the public `Connect` and `Reconnect` operations (§4.1:
/// "[Reconnect] iterates the URL list exactly as Connect does, but without
/// creating a new session").
pub async fn connect_through_list(shared: &Arc<Shared>) -> Result<(), EftlError> {
    let attempts = shared.state.lock().await.urls.len();
    let mut last_err = None;

    for _ in 0..attempts {
        match connect_attempt(shared).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(err = %e, "connect attempt failed, trying next url");
                last_err = Some(e);
                shared.state.lock().await.urls.advance();
            }
        }
    }

    Err(EftlError::ConnectFailed { reason: last_err.map(|e| e.to_string()).unwrap_or_default() })
}

/// One end-to-end attempt against the URL the cursor currently points at:
/// opens the transport, logs in, waits for WELCOME, and on success applies
/// negotiated parameters + repair and leaves the session CONNECTED.
pub(crate) async fn connect_attempt(shared: &Arc<Shared>) -> Result<(), EftlError> {
    let (broker, timeout, login, auth) = {
        let st = shared.state.lock().await;
        let broker = st.urls.current().clone();
        (broker, st.options.connect_timeout, build_login_frame(&st, &broker), st.options.auth.clone())
    };

    let attempt = async {
        let mut backend = backend::connect(&broker, auth.as_ref()).await?;
        let text = serde_json::to_string(&login)?;
        backend
            .outbound
            .unbounded_send(text)
            .map_err(|_| EftlError::ConnectionLost { reason: "backend task is gone".to_string() })?;
        let welcome = wait_for_welcome(&mut backend).await?;
        Ok::<_, EftlError>((backend, welcome))
    };

    let (backend, welcome) = match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result?,
        Err(_) => return Err(EftlError::Timeout),
    };

    apply_welcome(shared, backend, welcome).await
}

fn build_login_frame(state: &SessionState, broker: &BrokerUrl) -> LoginFrame {
    let mut frame = LoginFrame::new();
    frame.login_options = LoginOptions::default();
    frame.user = broker.username.clone().or_else(|| state.options.username.clone());
    frame.password = broker.password.clone().or_else(|| state.options.password.clone());
    frame.client_id = broker.client_id.clone().or_else(|| state.options.client_id.clone());
    frame.id_token = state.negotiated.reconnect_token.clone();
    frame.max_pending_acks = state.options.max_pending_acks;
    frame
}

/// Reads frames until WELCOME arrives, echoing heartbeats inline and failing
/// on an ERROR frame or a transport close (§4.1, §4.6).
async fn wait_for_welcome(backend: &mut BackendHandle) -> Result<InboundFrame, EftlError> {
    loop {
        match backend.inbound.next().await {
            Some(BackendEvent::Text(text)) => {
                let frame: InboundFrame = serde_json::from_str(&text)?;
                match Opcode::from(frame.op) {
                    Opcode::Welcome => return Ok(frame),
                    Opcode::Heartbeat => {
                        let _ = backend.outbound.unbounded_send(text);
                    }
                    Opcode::Error => {
                        let wire: WireError = serde_json::from_str(&text)?;
                        return Err(wire.into_eftl_error(|code, reason| EftlError::Server { code, reason }));
                    }
                    other => debug!(?other, "unexpected frame before welcome"),
                }
            }
            Some(BackendEvent::Closed { code, reason }) => {
                return Err(EftlError::ConnectFailed {
                    reason: format!("transport closed before welcome (code={code:?}): {reason}"),
                });
            }
            None => return Err(EftlError::ConnectFailed { reason: "transport closed before welcome".to_string() }),
        }
    }
}

/// Applies a WELCOME: negotiated params, post-welcome repair (§4.2), and the
/// CONNECTED transition. Takes ownership of the now-handshaken backend and
/// spawns the task that drains it for the rest of the connection's life.
async fn apply_welcome(shared: &Arc<Shared>, mut backend: BackendHandle, welcome: InboundFrame) -> Result<(), EftlError> {
    let resume = resume_enabled(&welcome.resume);
    let mut to_send = Vec::new();
    let old_state;

    {
        let mut st = shared.state.lock().await;
        old_state = st.conn;

        if let Some(protocol) = welcome.protocol {
            st.negotiated.protocol = protocol as u32;
        }
        if let Some(max_size) = welcome.max_size {
            st.negotiated.max_size = max_size;
        }
        if let Some(timeout) = welcome.timeout {
            st.negotiated.heartbeat_timeout = Duration::from_secs(timeout);
        }
        if st.negotiated.client_id.is_none() {
            st.negotiated.client_id = welcome.client_id.clone();
        }
        if st.negotiated.reconnect_token.is_none() {
            st.negotiated.reconnect_token = welcome.id_token.clone();
        }

        if !resume {
            st.registry.reset_all_last_seen();
        }

        for sub in st.registry.iter() {
            let mut frame = SubscribeFrame::new(sub.wire_id(), ack_mode_wire(sub.ack_mode));
            frame.matcher = sub.matcher.clone();
            frame.durable = sub.durable_name.clone();
            frame.durable_type = sub.durable_type.map(durable_type_wire);
            frame.key = sub.durable_key.clone();
            to_send.push(serde_json::to_string(&frame)?);
        }
        to_send.extend(st.ledger.resend_order());

        st.urls.set_index(0);
        st.reconnect_attempts = 0;
        st.reconnect_cancel = None;
        st.backend = Some(BackendControl::new(backend.outbound.clone(), backend.take_shutdown()));
        st.conn = ConnectionState::Connected;
    }

    for text in to_send {
        let _ = backend.outbound.unbounded_send(text);
    }

    let reader_shared = shared.clone();
    tokio::spawn(async move { run_reader(reader_shared, backend.inbound).await });

    shared.fire_state_change(old_state, ConnectionState::Connected);
    Ok(())
}

/// Drains a backend's inbound events for the duration of one connection.
async fn run_reader(shared: Arc<Shared>, mut inbound: futures_channel::mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = inbound.next().await {
        match event {
            BackendEvent::Text(text) => handle_inbound_text(&shared, text).await,
            BackendEvent::Closed { code, reason } => {
                on_transport_closed(&shared, code, reason).await;
                return;
            }
        }
    }
    on_transport_closed(&shared, None, "transport channel closed".to_string()).await;
}

/// C6: the protocol handler. Interprets one decoded text frame by opcode
/// (§4.6's opcode table and edge-case policies).
async fn handle_inbound_text(shared: &Arc<Shared>, text: String) {
    let frame: InboundFrame = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(e) => {
            warn!(err = %e, "dropping unparseable inbound frame");
            return;
        }
    };

    match Opcode::from(frame.op) {
        Opcode::Heartbeat => {
            let _ = shared.send_text(text).await;
        }

        Opcode::Welcome => {
            trace!("ignoring unexpected welcome outside the handshake");
        }

        Opcode::Subscribed => {
            if let Some(id) = frame.id.as_deref().and_then(|s| s.parse::<u64>().ok()) {
                let mut st = shared.state.lock().await;
                if let Some(sub) = st.registry.get_mut(id) {
                    sub.pending = false;
                    if let Some(mut completion) = sub.completion.take() {
                        completion.signal(crate::completion::Outcome::Success(None));
                    }
                }
            }
        }

        Opcode::Unsubscribed => handle_unsubscribed(shared, &frame).await,

        Opcode::Message => handle_message(shared, frame).await,

        Opcode::Ack => {
            let Some(seq) = frame.seq else { return };
            let mut st = shared.state.lock().await;
            match frame.err {
                // Open question (spec §9): the source does not resend a
                // sequence that an ACK rejected. Preserve that behavior.
                Some(err) => {
                    let code = ErrorCode::from_i64(err).unwrap_or(ErrorCode::Other(err));
                    st.ledger.complete_error(seq, code, frame.reason.unwrap_or_default());
                }
                None => {
                    st.ledger.complete_success(seq, None);
                }
            }
        }

        Opcode::Error => {
            let code = frame.err.and_then(ErrorCode::from_i64).unwrap_or(ErrorCode::ConnectionLost);
            shared.fire_error(EftlError::Server { code, reason: frame.reason.unwrap_or_default() });
        }

        Opcode::RequestReply | Opcode::MapResponse => {
            let Some(seq) = frame.seq else { return };
            let mut st = shared.state.lock().await;
            match frame.err {
                Some(err) => {
                    let code = ErrorCode::from_i64(err).unwrap_or(ErrorCode::Other(err));
                    st.ledger.complete_error(seq, code, frame.reason.unwrap_or_default());
                }
                None => {
                    let body = frame.body.or(frame.value).map(Message::from_value);
                    st.ledger.complete_success(seq, body);
                }
            }
        }

        Opcode::Login
        | Opcode::Subscribe
        | Opcode::Unsubscribe
        | Opcode::Publish
        | Opcode::Disconnect
        | Opcode::Request
        | Opcode::Reply
        | Opcode::MapCreate
        | Opcode::MapDestroy
        | Opcode::MapSet
        | Opcode::MapGet
        | Opcode::MapRemove => {
            trace!(op = frame.op, "ignoring outbound-only opcode received from server");
        }

        Opcode::Unknown(op) => debug!(op, "ignoring unknown opcode"),
    }
}

async fn handle_unsubscribed(shared: &Arc<Shared>, frame: &InboundFrame) {
    let Some(id) = frame.id.as_deref().and_then(|s| s.parse::<u64>().ok()) else { return };
    let mut st = shared.state.lock().await;

    let Some(mut sub) = st.registry.remove(id) else { return };

    match (sub.pending, frame.err) {
        (true, Some(err)) => {
            let code = ErrorCode::from_i64(err).unwrap_or(ErrorCode::Other(err));
            if let Some(mut completion) = sub.completion.take() {
                completion.signal(crate::completion::Outcome::Error { code, reason: frame.reason.clone().unwrap_or_default() });
            }
        }
        (false, Some(err)) => {
            // Confirmed subscription terminated by the server: surfaced via
            // the error handler rather than silently dropped (§4.6 edge case).
            let code = ErrorCode::from_i64(err).unwrap_or(ErrorCode::Other(err));
            drop(st);
            shared.fire_error(EftlError::SubscriptionFailed { code, reason: frame.reason.clone().unwrap_or_default() });
            return;
        }
        (true, None) => {
            if let Some(mut completion) = sub.completion.take() {
                completion.signal(crate::completion::Outcome::Success(None));
            }
        }
        (false, None) => {}
    }
}

async fn handle_message(shared: &Arc<Shared>, frame: InboundFrame) {
    let (Some(id), Some(body)) = (frame.id.clone(), frame.body.clone()) else {
        trace!("dropping message frame without subscription id or body");
        return;
    };

    let mut message = Message::from_value(body);
    message.receipt.seq = frame.seq;
    message.receipt.subscription_id = Some(id.clone());
    message.store_id = frame.sid;
    message.delivery_count = frame.cnt;
    if let (Some(to), Some(req)) = (frame.to, frame.req) {
        message.reply_to = Some(crate::message::ReplyTo { to, req });
    }

    let delivery = InboundDelivery { subscription_id: id.parse::<u64>().ok(), message };
    if shared.inbound_tx.send(delivery).await.is_err() {
        warn!("dispatcher is gone; dropping inbound message");
    }
}

/// Runs when a backend ends, whether cleanly or not. Decides between
/// scheduling an automatic reconnect and failing the session outright
/// (§4.2 "Reconnect scheduling", §4.3, §7).
async fn on_transport_closed(shared: &Arc<Shared>, code: Option<u16>, reason: String) {
    let (should_reconnect, old_state);
    let mut cancel_rx = None;
    {
        let mut st = shared.state.lock().await;
        if matches!(st.conn, ConnectionState::Disconnecting | ConnectionState::Disconnected) {
            return;
        }
        old_state = st.conn;
        st.backend = None;

        let service_restart = code == Some(ErrorCode::ServiceRestart.code() as u16);
        let attempts_remain = match st.options.auto_reconnect_attempts {
            Some(max) => st.reconnect_attempts < max,
            None => true,
        };
        should_reconnect = attempts_remain || service_restart;

        if should_reconnect {
            st.conn = ConnectionState::Reconnecting;
            // Installed under this same lock acquisition so a concurrent
            // Disconnect() can never observe Reconnecting without a live
            // cancel handle to signal (§5 "Cancellation and timeouts").
            let (tx, rx) = oneshot::channel();
            st.reconnect_cancel = Some(tx);
            cancel_rx = Some(rx);
        } else {
            st.conn = ConnectionState::Disconnected;
            let close_code = code.and_then(|c| ErrorCode::from_i64(c as i64)).unwrap_or(ErrorCode::ConnectionLost);
            st.ledger.complete_all(close_code, reason.clone());
        }
    }

    shared.fire_state_change(old_state, if should_reconnect { ConnectionState::Reconnecting } else { ConnectionState::Disconnected });

    if let Some(cancel_rx) = cancel_rx {
        reconnect::schedule_reconnect(shared.clone(), cancel_rx);
    } else {
        shared.fire_error(EftlError::ConnectionLost { reason });
    }
}

/// C8 `Disconnect`.
pub async fn disconnect(shared: &Arc<Shared>) {
    let old_state;
    {
        let mut st = shared.state.lock().await;
        old_state = st.conn;
        match st.conn {
            ConnectionState::Connected => {
                st.conn = ConnectionState::Disconnecting;
                if let Some(backend) = st.backend.as_mut() {
                    if let Ok(text) = serde_json::to_string(&crate::protocol::DisconnectFrame::default()) {
                        let _ = backend.outbound.unbounded_send(text);
                    }
                    backend.shutdown();
                }
                st.conn = ConnectionState::Disconnected;
            }
            ConnectionState::Reconnecting => {
                if let Some(cancel) = st.reconnect_cancel.take() {
                    let _ = cancel.send(());
                }
                st.conn = ConnectionState::Disconnected;
                st.ledger.complete_all(ErrorCode::ConnectionLost, "disconnected while reconnecting".to_string());
            }
            _ => return,
        }
    }
    shared.fire_state_change(old_state, ConnectionState::Disconnected);
}
