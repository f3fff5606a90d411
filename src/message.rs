use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Delivery guarantee for a subscription or a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {}", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.as_u8()
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Result of a wire-level subscription, as reported to every consumer sharing the filter.
///
/// Broker refusals, transport errors and locally rejected filters all map to the single
/// `Failure` code (0x80), so consumers only ever have one failure value to check for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeCode {
    Granted(QoS),
    Failure,
}

impl SubscribeCode {
    pub const FAILURE: u8 = 0x80;

    /// Numeric form: the granted QoS, or 0x80.
    pub fn code(self) -> u8 {
        match self {
            SubscribeCode::Granted(qos) => qos.as_u8(),
            SubscribeCode::Failure => Self::FAILURE,
        }
    }

    pub fn is_granted(self) -> bool {
        matches!(self, SubscribeCode::Granted(_))
    }
}

/// Metadata of an inbound PUBLISH packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketMeta {
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub pkid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub meta: PacketMeta,
}

/// Payload of an outbound message before it is encoded for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as-is.
    Binary(Vec<u8>),
    /// Key/value data, sent as compact JSON.
    Structured(Value),
    Text(String),
}

impl Payload {
    /// Encodes the payload into the bytes handed to the transport.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Binary(bytes) => bytes.clone(),
            Payload::Structured(Value::String(text)) => text.clone().into_bytes(),
            Payload::Structured(value) => value.to_string().into_bytes(),
            Payload::Text(text) => text.clone().into_bytes(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Binary(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

macro_rules! payload_from_display {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Payload {
                fn from(value: $ty) -> Self {
                    Payload::Text(value.to_string())
                }
            }
        )*
    };
}

payload_from_display!(bool, i32, i64, u32, u64, f32, f64);

/// A message handed to the publish gateway. `error` is filled in when the transport
/// reports a failure, before the message is given back to the completion handler.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Payload,
    pub qos: Option<QoS>,
    pub retain: Option<bool>,
    pub error: Option<String>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn effective_qos(&self) -> QoS {
        self.qos.unwrap_or_default()
    }

    pub fn effective_retain(&self) -> bool {
        self.retain.unwrap_or(false)
    }
}
