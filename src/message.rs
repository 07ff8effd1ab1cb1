use serde_json::{Map, Value};

/// Receipt metadata attached to an inbound delivery: the sequence number and
/// subscription id needed to acknowledge it (§3 "Inbound message").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub seq: Option<u64>,
    pub subscription_id: Option<String>,
}

/// Reply-to metadata present on a request-bearing MESSAGE frame (§6: `to`,
/// `req`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyTo {
    pub to: String,
    pub req: u64,
}

/// An opaque, structured message body.
///
/// The typed field get/set API the original SDK exposes is explicitly out of
/// scope (§1); this type is the minimal stand-in the data model still needs
/// to move bodies through the ledger, registry, and dispatcher, grounded in
/// the teacher's practice of carrying payloads as an opaque `Box<RawValue>`
/// until a caller actually needs to inspect one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: Map<String, Value>,
    pub receipt: Receipt,
    pub reply_to: Option<ReplyTo>,
    pub store_id: Option<u64>,
    pub delivery_count: Option<u64>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(body: Value) -> Self {
        let fields = match body {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self { fields, ..Default::default() }
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.fields.get(key)?.as_str()
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key)?.as_i64()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key)?.as_f64()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key)?.as_bool()
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::from_value(value)
    }
}
