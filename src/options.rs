use std::fmt;
use std::time::Duration;

use base64::Engine;

/// Basic or bearer authentication injected into the LOGIN frame, or used to
/// decorate the WebSocket handshake request. Grounded in the teacher's
/// `Authorization` helper in `transports/common.rs`.
#[derive(Clone, Debug)]
pub enum Authorization {
    Basic(String),
    Bearer(String),
}

impl Authorization {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        let secret = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username.into(), password.into()));
        Self::Basic(secret)
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorization::Basic(secret) => write!(f, "Basic {secret}"),
            Authorization::Bearer(token) => write!(f, "Bearer {token}"),
        }
    }
}

/// Acknowledgement policy for a subscription (§4.4, GLOSSARY "Ack mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    Auto,
    Client,
    None,
}

impl Default for AckMode {
    fn default() -> Self {
        AckMode::Auto
    }
}

/// The enumerated durable kinds a subscription may request (GLOSSARY
/// "Durable").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurableType {
    Shared,
    LastValue,
}

/// Per-subscription options accepted by [`crate::Client::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub durable_name: Option<String>,
    pub durable_type: Option<DurableType>,
    pub durable_key: Option<String>,
    pub ack_mode: AckMode,
}

/// Connection-wide options accepted by [`crate::Client::connect`].
///
/// Grounded in the teacher's `ConnectionDetails`, generalized to the LOGIN
/// frame's fuller field set (§6).
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    /// Attached to the WebSocket handshake request, not the LOGIN frame.
    pub auth: Option<Authorization>,
    /// Maximum number of reconnect attempts before the session gives up and
    /// fails every outstanding ledger entry. `None` means unlimited, matching
    /// the original SDK's default of retrying forever.
    pub auto_reconnect_attempts: Option<u32>,
    /// Ceiling on the computed backoff delay (§4.2).
    pub auto_reconnect_max_delay: Duration,
    pub max_pending_acks: Option<u32>,
    /// Timeout applied to the initial LOGIN/WELCOME exchange per URL.
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self {
            auto_reconnect_max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            ..Default::default()
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn auth(mut self, auth: Authorization) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn auto_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.auto_reconnect_attempts = Some(attempts);
        self
    }

    pub fn auto_reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.auto_reconnect_max_delay = delay;
        self
    }

    pub fn max_pending_acks(mut self, max: u32) -> Self {
        self.max_pending_acks = Some(max);
        self
    }
}
