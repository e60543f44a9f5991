//! Wire envelope and inbound dispatch
//!
//! Every frame is `{type, payload}`. The envelope decodes into a closed set
//! of variants via the type-token match below; each variant carries its own
//! payload struct and implements the same `process` contract (see
//! `ws::process`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The outer wire shape shared by inbound and outbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame envelope")]
    InvalidEnvelope,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid payload for {0}")]
    InvalidPayload(&'static str),
}

impl FrameError {
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::InvalidEnvelope => "invalid_envelope",
            FrameError::UnknownType(_) => "unknown_message_type",
            FrameError::InvalidPayload(_) => "invalid_payload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConversationState {
    pub conversation_id: String,
    #[serde(default)]
    pub last_message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub conversations: Vec<SyncConversationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadPayload {
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReadPayload {
    pub group_id: i64,
    #[serde(default)]
    pub last_read_message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub message_id: i64,
}

/// The closed set of inbound frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Sync(SyncPayload),
    Chat(ChatPayload),
    Ack(AckPayload),
    Typing(TypingPayload),
    Read(ReadPayload),
    GroupRead(GroupReadPayload),
    Delivery(DeliveryPayload),
    Ping,
    Pong,
}

impl Inbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Sync(_) => "sync",
            Inbound::Chat(_) => "chat",
            Inbound::Ack(_) => "ack",
            Inbound::Typing(_) => "typing",
            Inbound::Read(_) => "read",
            Inbound::GroupRead(_) => "group_read",
            Inbound::Delivery(_) => "delivery",
            Inbound::Ping => "ping",
            Inbound::Pong => "pong",
        }
    }

    /// The type-token registry: one constructor per recognised type.
    pub fn from_envelope(envelope: Envelope) -> Result<Inbound, FrameError> {
        fn parse<T: serde::de::DeserializeOwned>(
            payload: Value,
            kind: &'static str,
        ) -> Result<T, FrameError> {
            serde_json::from_value(payload).map_err(|_| FrameError::InvalidPayload(kind))
        }

        match envelope.kind.as_str() {
            "sync" => Ok(Inbound::Sync(parse(envelope.payload, "sync")?)),
            "chat" => Ok(Inbound::Chat(parse(envelope.payload, "chat")?)),
            "ack" => Ok(Inbound::Ack(parse(envelope.payload, "ack")?)),
            "typing" => Ok(Inbound::Typing(parse(envelope.payload, "typing")?)),
            "read" => Ok(Inbound::Read(parse(envelope.payload, "read")?)),
            "group_read" => Ok(Inbound::GroupRead(parse(envelope.payload, "group_read")?)),
            "delivery" => Ok(Inbound::Delivery(parse(envelope.payload, "delivery")?)),
            "ping" => Ok(Inbound::Ping),
            "pong" => Ok(Inbound::Pong),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let payload = match self {
            Inbound::Sync(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            Inbound::Chat(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            Inbound::Ack(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            Inbound::Typing(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            Inbound::Read(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            Inbound::GroupRead(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            Inbound::Delivery(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            Inbound::Ping | Inbound::Pong => Value::Null,
        };
        Envelope {
            kind: self.kind().to_string(),
            payload,
        }
    }
}

pub fn decode(text: &str) -> Result<Inbound, FrameError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|_| FrameError::InvalidEnvelope)?;
    Inbound::from_envelope(envelope)
}

pub fn encode(frame: &Inbound) -> String {
    serde_json::to_string(&frame.to_envelope()).unwrap_or_default()
}

/// The flat `{type:"error", ...}` frame sent when processing fails.
pub fn error_frame(code: &str, message: &str) -> Value {
    serde_json::json!({
        "type": "error",
        "error": message,
        "code": code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_chat_frame() {
        let frame = r#"{"type":"chat","payload":{"client_id":"c-1","recipient_id":2,"content":"hi"}}"#;
        match decode(frame).unwrap() {
            Inbound::Chat(p) => {
                assert_eq!(p.client_id, "c-1");
                assert_eq!(p.recipient_id, Some(2));
                assert_eq!(p.group_id, None);
                assert_eq!(p.content, "hi");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn decode_ping_without_payload() {
        assert_eq!(decode(r#"{"type":"ping"}"#).unwrap(), Inbound::Ping);
        assert_eq!(decode(r#"{"type":"pong","payload":null}"#).unwrap(), Inbound::Pong);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode(r#"{"type":"teleport","payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), "unknown_message_type");
    }

    #[test]
    fn invalid_payload_is_rejected() {
        let err = decode(r#"{"type":"read","payload":{"message_id":"nope"}}"#).unwrap_err();
        assert_eq!(err.code(), "invalid_payload");
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(decode("{not json").unwrap_err().code(), "invalid_envelope");
    }

    #[test]
    fn round_trip_all_variants() {
        let frames = vec![
            Inbound::Sync(SyncPayload {
                conversations: vec![SyncConversationState {
                    conversation_id: "user_2".into(),
                    last_message_id: 10,
                }],
                limit: Some(50),
            }),
            Inbound::Chat(ChatPayload {
                client_id: "c-9".into(),
                recipient_id: None,
                group_id: Some(4),
                content: "hello".into(),
                message_type: Some("text".into()),
            }),
            Inbound::Ack(AckPayload { message_id: 3, status: Some("delivered".into()) }),
            Inbound::Typing(TypingPayload { recipient_id: Some(2), group_id: None, is_typing: true }),
            Inbound::Read(ReadPayload { message_id: 8 }),
            Inbound::GroupRead(GroupReadPayload { group_id: 4, last_read_message_id: 25 }),
            Inbound::Delivery(DeliveryPayload { message_id: 8 }),
            Inbound::Ping,
            Inbound::Pong,
        ];

        for frame in frames {
            let encoded = encode(&frame);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, frame, "round trip failed for {}", frame.kind());
        }
    }
}
