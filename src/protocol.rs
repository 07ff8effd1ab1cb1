//! Wire frame types and opcode table (§4.6, §6).
//!
//! Outbound frames are distinct serializable structs, one per opcode,
//! grounded in the teacher's `Request<'a, T>` pattern in
//! `transports/common.rs`. Inbound frames share one flat struct carrying
//! every field any opcode might populate — the eFTL wire format has no
//! `jsonrpc`-style common envelope to discriminate on, so (unlike the
//! teacher's `PubSubItem` visitor) a tagged enum buys nothing here; opcode
//! dispatch happens once in [`crate::session`] by matching on `op`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Heartbeat,
    Login,
    Welcome,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Message,
    Publish,
    Ack,
    Error,
    Disconnect,
    Request,
    RequestReply,
    Reply,
    MapCreate,
    MapDestroy,
    MapSet,
    MapGet,
    MapRemove,
    MapResponse,
    Unknown(i64),
}

impl From<i64> for Opcode {
    fn from(op: i64) -> Self {
        match op {
            0 => Opcode::Heartbeat,
            1 => Opcode::Login,
            2 => Opcode::Welcome,
            3 => Opcode::Subscribe,
            4 => Opcode::Subscribed,
            5 => Opcode::Unsubscribe,
            6 => Opcode::Unsubscribed,
            7 => Opcode::Message,
            8 => Opcode::Publish,
            9 => Opcode::Ack,
            10 => Opcode::Error,
            11 => Opcode::Disconnect,
            13 => Opcode::Request,
            14 => Opcode::RequestReply,
            15 => Opcode::Reply,
            16 => Opcode::MapCreate,
            18 => Opcode::MapDestroy,
            20 => Opcode::MapSet,
            22 => Opcode::MapGet,
            24 => Opcode::MapRemove,
            26 => Opcode::MapResponse,
            other => Opcode::Unknown(other),
        }
    }
}

impl Opcode {
    pub fn code(self) -> i64 {
        match self {
            Opcode::Heartbeat => 0,
            Opcode::Login => 1,
            Opcode::Welcome => 2,
            Opcode::Subscribe => 3,
            Opcode::Subscribed => 4,
            Opcode::Unsubscribe => 5,
            Opcode::Unsubscribed => 6,
            Opcode::Message => 7,
            Opcode::Publish => 8,
            Opcode::Ack => 9,
            Opcode::Error => 10,
            Opcode::Disconnect => 11,
            Opcode::Request => 13,
            Opcode::RequestReply => 14,
            Opcode::Reply => 15,
            Opcode::MapCreate => 16,
            Opcode::MapDestroy => 18,
            Opcode::MapSet => 20,
            Opcode::MapGet => 22,
            Opcode::MapRemove => 24,
            Opcode::MapResponse => 26,
            Opcode::Unknown(code) => code,
        }
    }
}

/// Every field any inbound opcode (§6) might carry. Unused fields for a
/// given opcode are simply `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub op: i64,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub req: Option<u64>,
    #[serde(default)]
    pub sid: Option<u64>,
    #[serde(default)]
    pub cnt: Option<u64>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub err: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub protocol: Option<u64>,
    #[serde(default)]
    pub max_size: Option<u64>,
    #[serde(default, rename = "_resume")]
    pub resume: Option<Value>,
}

/// Returns whether a WELCOME's `_resume` field indicates resume is enabled.
/// Per spec §9 Open Questions, both boolean `true` and the string `"true"`
/// (compared case-insensitively) are accepted.
pub fn resume_enabled(resume: &Option<Value>) -> bool {
    match resume {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginOptions {
    #[serde(rename = "_qos")]
    pub qos: &'static str,
    #[serde(rename = "_resume")]
    pub resume: &'static str,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self { qos: "true", resume: "true" }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginFrame {
    pub op: i64,
    pub protocol: u32,
    pub client_type: &'static str,
    pub client_version: &'static str,
    pub login_options: LoginOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending_acks: Option<u32>,
}

pub const PROTOCOL_VERSION: u32 = 2;

impl LoginFrame {
    pub fn new() -> Self {
        Self {
            op: Opcode::Login.code(),
            protocol: PROTOCOL_VERSION,
            client_type: "rust",
            client_version: env!("CARGO_PKG_VERSION"),
            login_options: LoginOptions::default(),
            user: None,
            password: None,
            client_id: None,
            id_token: None,
            max_pending_acks: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeFrame {
    pub op: i64,
    pub id: String,
    pub ack: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub durable_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Wire token for an [`crate::options::AckMode`] (subscribe frame's `ack` field).
pub fn ack_mode_wire(mode: crate::options::AckMode) -> &'static str {
    use crate::options::AckMode;
    match mode {
        AckMode::Auto => "auto",
        AckMode::Client => "client",
        AckMode::None => "none",
    }
}

/// Wire token for a [`crate::options::DurableType`] (subscribe frame's `type` field).
pub fn durable_type_wire(kind: crate::options::DurableType) -> &'static str {
    use crate::options::DurableType;
    match kind {
        DurableType::Shared => "shared",
        DurableType::LastValue => "last-value",
    }
}

impl SubscribeFrame {
    pub fn new(id: String, ack: &'static str) -> Self {
        Self {
            op: Opcode::Subscribe.code(),
            id,
            ack,
            matcher: None,
            durable: None,
            durable_type: None,
            key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeFrame {
    pub op: i64,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<bool>,
}

impl UnsubscribeFrame {
    /// `del: Some(false)` asks the server to stop delivery without removing
    /// durable state (CloseSubscription); omitting `del` removes durable
    /// state too (Unsubscribe), per §4.1.
    pub fn new(id: String, del: Option<bool>) -> Self {
        Self { op: Opcode::Unsubscribe.code(), id, del }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishFrame {
    pub op: i64,
    pub seq: u64,
    pub body: Value,
}

impl PublishFrame {
    pub fn new(seq: u64, body: Value) -> Self {
        Self { op: Opcode::Publish.code(), seq, body }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame {
    pub op: i64,
    pub seq: u64,
    pub body: Value,
}

impl RequestFrame {
    pub fn new(seq: u64, body: Value) -> Self {
        Self { op: Opcode::Request.code(), seq, body }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyFrame {
    pub op: i64,
    pub to: String,
    pub req: u64,
    pub body: Value,
}

impl ReplyFrame {
    pub fn new(to: String, req: u64, body: Value) -> Self {
        Self { op: Opcode::Reply.code(), to, req, body }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AckFrame {
    pub op: i64,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl AckFrame {
    pub fn new(seq: u64) -> Self {
        Self { op: Opcode::Ack.code(), seq, id: None }
    }

    pub fn for_subscription(seq: u64, subscription_id: String) -> Self {
        Self { op: Opcode::Ack.code(), seq, id: Some(subscription_id) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectFrame {
    pub op: i64,
}

impl Default for DisconnectFrame {
    fn default() -> Self {
        Self { op: Opcode::Disconnect.code() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    Create,
    Destroy,
    Set,
    Get,
    Remove,
}

impl MapOp {
    fn opcode(self) -> Opcode {
        match self {
            MapOp::Create => Opcode::MapCreate,
            MapOp::Destroy => Opcode::MapDestroy,
            MapOp::Set => Opcode::MapSet,
            MapOp::Get => Opcode::MapGet,
            MapOp::Remove => Opcode::MapRemove,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MapFrame {
    pub op: i64,
    pub seq: u64,
    pub map: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl MapFrame {
    pub fn new(kind: MapOp, seq: u64, map: String, key: Option<String>, value: Option<Value>) -> Self {
        Self { op: kind.opcode().code(), seq, map, key, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_accepts_bool_and_string() {
        assert!(resume_enabled(&Some(Value::Bool(true))));
        assert!(resume_enabled(&Some(Value::String("TRUE".into()))));
        assert!(!resume_enabled(&Some(Value::String("false".into()))));
        assert!(!resume_enabled(&None));
    }

    #[test]
    fn subscribe_frame_omits_absent_fields() {
        let frame = SubscribeFrame::new("1".to_string(), "auto");
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("matcher").is_none());
        assert_eq!(json["ack"], "auto");
    }

    #[test]
    fn unsubscribe_close_variant_carries_del_false() {
        let frame = UnsubscribeFrame::new("1".to_string(), Some(false));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["del"], false);
    }

    #[test]
    fn inbound_frame_parses_minimal_ack() {
        let frame: InboundFrame = serde_json::from_str(r#"{"op":9,"seq":1}"#).unwrap();
        assert_eq!(Opcode::from(frame.op), Opcode::Ack);
        assert_eq!(frame.seq, Some(1));
    }
}
