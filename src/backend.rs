//! The transport binding (§6 "Transport collaborator"). Drives a single
//! `tokio-tungstenite` WebSocket connection: a dedicated task owns the
//! stream, echoes keepalive pings, forwards inbound text frames to the
//! session, and accepts outbound text frames to write.
//!
//! Grounded in the teacher's `WsBackend::spawn` (`rpc/transports/ws/backend.rs`):
//! the same `select!` over {keepalive timer, inbound read, outbound dispatch,
//! shutdown signal}, biased the same way so a shutdown or error is never
//! starved by a busy socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame, Message as WsMessage},
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::error::EftlError;
use crate::options::Authorization;
use crate::url_list::BrokerUrl;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// An event the backend task surfaces to the session.
pub enum BackendEvent {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

/// The session-facing handle to a running backend task.
pub struct BackendHandle {
    pub inbound: futures_channel::mpsc::UnboundedReceiver<BackendEvent>,
    pub outbound: futures_channel::mpsc::UnboundedSender<String>,
    shutdown: Option<futures_channel::oneshot::Sender<()>>,
}

impl BackendHandle {
    /// Requests a graceful shutdown of the backend task. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Hands the shutdown sender to a longer-lived owner (the session's
    /// `BackendControl`) once the handshake completes.
    pub fn take_shutdown(&mut self) -> Option<futures_channel::oneshot::Sender<()>> {
        self.shutdown.take()
    }
}

type InternalStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the TCP/TLS + WebSocket handshake for `broker` and spawns the task
/// that services it until shutdown or a transport-level close/error.
///
/// `auth`, when set, is attached to the handshake request as an
/// `Authorization` header rather than folded into the LOGIN frame — grounded
/// in the teacher's `ConnectionDetails::into_client_request`
/// (`rpc/transports/ws/types.rs`).
pub async fn connect(broker: &BrokerUrl, auth: Option<&Authorization>) -> Result<BackendHandle, EftlError> {
    let mut request = broker.url.to_string().into_client_request()?;
    if let Some(auth) = auth {
        let mut value = http::HeaderValue::from_str(&auth.to_string())
            .map_err(|_| EftlError::InvalidArg("authorization value is not a valid header".to_string()))?;
        value.set_sensitive(true);
        request.headers_mut().insert(http::header::AUTHORIZATION, value);
    }
    let (stream, _response) = connect_async(request).await?;
    Ok(spawn(stream))
}

fn spawn(stream: InternalStream) -> BackendHandle {
    let (inbound_tx, inbound_rx) = futures_channel::mpsc::unbounded();
    let (outbound_tx, mut outbound_rx) = futures_channel::mpsc::unbounded();
    let (shutdown_tx, mut shutdown_rx) = futures_channel::oneshot::channel();

    tokio::spawn(async move {
        let (mut write, mut read) = stream.split();
        let close_info = loop {
            let keepalive = tokio::time::sleep(KEEPALIVE_INTERVAL);
            tokio::pin!(keepalive);

            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    let _ = write
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        })))
                        .await;
                    break None;
                }

                _ = &mut keepalive => {
                    if let Err(e) = write.send(WsMessage::Ping(Vec::new())).await {
                        tracing::error!(err = %e, "ws keepalive ping failed");
                        break Some((None, e.to_string()));
                    }
                }

                item = read.next() => {
                    match item {
                        Some(Ok(WsMessage::Text(text))) => {
                            tracing::trace!(text = %text, "received frame");
                            if inbound_tx.unbounded_send(BackendEvent::Text(text)).is_err() {
                                break None;
                            }
                        }
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                        Some(Ok(WsMessage::Binary(_))) => {
                            break Some((None, "unexpected binary frame".to_string()));
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            break Some((code, reason));
                        }
                        Some(Err(e)) => {
                            tracing::error!(err = %e, "ws read error");
                            break Some((None, e.to_string()));
                        }
                        None => break Some((None, "server closed the stream".to_string())),
                    }
                }

                out = outbound_rx.next() => {
                    match out {
                        Some(text) => {
                            if let Err(e) = write.send(WsMessage::Text(text)).await {
                                tracing::error!(err = %e, "ws write failed");
                                break Some((None, e.to_string()));
                            }
                        }
                        None => break None,
                    }
                }
            }
        };

        if let Some((code, reason)) = close_info {
            let _ = inbound_tx.unbounded_send(BackendEvent::Closed { code, reason });
        }
    });

    BackendHandle { inbound: inbound_rx, outbound: outbound_tx, shutdown: Some(shutdown_tx) }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end in `tests/` with a real local WebSocket server;
    // the select-loop itself has no useful unit-level seams to test in
    // isolation without a live socket.
}
