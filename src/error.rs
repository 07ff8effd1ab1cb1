use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Wire-compatible error taxonomy (§6). Server-issued codes pass through
/// unchanged; an unrecognized integer is preserved via [`ErrorCode::Other`]
/// rather than discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    InvalidArg,
    NoMemory,
    Timeout,
    NotFound,
    InvalidType,
    NotSupported,
    NotConnected,
    ConnectionLost,
    ConnectFailed,
    PublishFailed,
    PublishNotAuthorized,
    SubscriptionNotAuthorized,
    SubscriptionFailed,
    SubscriptionInvalid,
    GoingAway,
    MessageTooBig,
    ServiceRestart,
    ForceClose,
    Unavailable,
    Authentication,
    /// A code the server sent that isn't in the known taxonomy. Preserved
    /// verbatim rather than dropped, per the "numeric mapping must survive
    /// unchanged" requirement in §6.
    Other(i64),
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer).map_err(de::Error::custom)?;
        Ok(ErrorCode::from_i64(code).unwrap_or(ErrorCode::Other(code)))
    }
}

impl ErrorCode {
    /// Best-effort mapping from a raw integer. Unknown codes are not an error
    /// in themselves — the server is the source of truth for this taxonomy —
    /// they just don't get a named variant.
    pub fn from_i64(code: i64) -> Option<Self> {
        use ErrorCode::*;
        Some(match code {
            0 => Ok,
            1 => InvalidArg,
            2 => NoMemory,
            3 => Timeout,
            4 => NotFound,
            5 => InvalidType,
            6 => NotSupported,
            8 => NotConnected,
            9 => ConnectionLost,
            10 => ConnectFailed,
            11 => PublishFailed,
            12 => PublishNotAuthorized,
            13 => SubscriptionNotAuthorized,
            21 => SubscriptionFailed,
            22 => SubscriptionInvalid,
            1001 => GoingAway,
            1009 => MessageTooBig,
            1012 => ServiceRestart,
            4000 => ForceClose,
            4001 => Unavailable,
            4002 => Authentication,
            _ => return None,
        })
    }

    pub fn code(self) -> i64 {
        use ErrorCode::*;
        match self {
            Ok => 0,
            InvalidArg => 1,
            NoMemory => 2,
            Timeout => 3,
            NotFound => 4,
            InvalidType => 5,
            NotSupported => 6,
            NotConnected => 8,
            ConnectionLost => 9,
            ConnectFailed => 10,
            PublishFailed => 11,
            PublishNotAuthorized => 12,
            SubscriptionNotAuthorized => 13,
            SubscriptionFailed => 21,
            SubscriptionInvalid => 22,
            GoingAway => 1001,
            MessageTooBig => 1009,
            ServiceRestart => 1012,
            ForceClose => 4000,
            Unavailable => 4001,
            Authentication => 4002,
            Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// The crate's public error surface. Every variant that originates from a
/// server-issued or close-code carries the numeric [`ErrorCode`] so callers
/// can match on the wire-compatible code as well as the Rust variant.
#[derive(Debug, thiserror::Error)]
pub enum EftlError {
    #[error("not connected")]
    NotConnected,

    #[error("operation not supported by the negotiated protocol version")]
    NotSupported,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("message exceeds negotiated maximum size of {max} bytes (was {actual})")]
    MessageTooBig { max: usize, actual: usize },

    #[error("operation timed out")]
    Timeout,

    #[error("failed to connect to any configured url: {reason}")]
    ConnectFailed { reason: String },

    #[error("publish failed: {reason}")]
    PublishFailed { code: ErrorCode, reason: String },

    #[error("subscription failed: {reason}")]
    SubscriptionFailed { code: ErrorCode, reason: String },

    #[error("server error {code}: {reason}")]
    Server { code: ErrorCode, reason: String },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

impl EftlError {
    /// The wire-compatible numeric code for this error, where one applies.
    pub fn code(&self) -> ErrorCode {
        match self {
            EftlError::NotConnected => ErrorCode::NotConnected,
            EftlError::NotSupported => ErrorCode::NotSupported,
            EftlError::InvalidArg(_) => ErrorCode::InvalidArg,
            EftlError::MessageTooBig { .. } => ErrorCode::MessageTooBig,
            EftlError::Timeout => ErrorCode::Timeout,
            EftlError::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            EftlError::PublishFailed { code, .. } => *code,
            EftlError::SubscriptionFailed { code, .. } => *code,
            EftlError::Server { code, .. } => *code,
            EftlError::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            EftlError::Cancelled => ErrorCode::ConnectionLost,
            EftlError::Json(_) => ErrorCode::InvalidType,
            EftlError::Url(_) => ErrorCode::InvalidArg,
            EftlError::Transport(_) => ErrorCode::ConnectionLost,
        }
    }
}

/// Error/reason pair as carried by ACK/UNSUBSCRIBED/REPLY/MAP_RESPONSE/ERROR
/// frames on the wire (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub err: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

impl WireError {
    pub fn into_eftl_error(self, as_variant: impl FnOnce(ErrorCode, String) -> EftlError) -> EftlError {
        let code = ErrorCode::from_i64(self.err).unwrap_or(ErrorCode::Other(self.err));
        as_variant(code, self.reason.unwrap_or_default())
    }
}
