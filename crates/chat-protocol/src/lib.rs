//! Message envelope spoken over a chat session's duplex channel.
//!
//! Every frame is a JSON object
//! `{"type": .., "payload": {..}, "timestamp": "<RFC 3339>", "message_id": ".."}`.
//! Inbound frames may omit `timestamp` and `message_id`; outbound frames
//! always carry both.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// One table row, keys in column order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Query,
    Response,
    Status,
    Error,
    Ping,
    Pong,
    ClearSession,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Query,
        MessageKind::Response,
        MessageKind::Status,
        MessageKind::Error,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::ClearSession,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Query => "Query",
            MessageKind::Response => "Response",
            MessageKind::Status => "Status",
            MessageKind::Error => "Error",
            MessageKind::Ping => "Ping",
            MessageKind::Pong => "Pong",
            MessageKind::ClearSession => "ClearSession",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether a client may send this kind.
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            MessageKind::Query | MessageKind::Ping | MessageKind::Pong | MessageKind::ClearSession
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiResourcePayload {
    pub uri: String,
    pub mime_type: String,
    pub content: String,
    pub encoding: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub answer_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_resource: Option<UiResourcePayload>,
    /// Set when the answer only covers part of the question.
    #[serde(default, skip_serializing_if = "is_false")]
    pub partial: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query(QueryPayload),
    Response(ResponsePayload),
    Status(StatusPayload),
    Error(ErrorPayload),
    Ping,
    Pong,
    ClearSession,
}

impl Message {
    pub fn query(text: impl Into<String>) -> Self {
        Message::Query(QueryPayload {
            text: text.into(),
            session_hint: None,
        })
    }

    pub fn status(phase: impl Into<String>, detail: Option<String>) -> Self {
        Message::Status(StatusPayload {
            phase: phase.into(),
            detail,
        })
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Message::Error(ErrorPayload {
            message: message.into(),
            code: Some(code.into()),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Query(_) => MessageKind::Query,
            Message::Response(_) => MessageKind::Response,
            Message::Status(_) => MessageKind::Status,
            Message::Error(_) => MessageKind::Error,
            Message::Ping => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
            Message::ClearSession => MessageKind::ClearSession,
        }
    }

    /// Response and Error end the exchange started by a Query.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::Response(_) | Message::Error(_))
    }

    fn payload(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            Message::Query(payload) => serde_json::to_value(payload),
            Message::Response(payload) => serde_json::to_value(payload),
            Message::Status(payload) => serde_json::to_value(payload),
            Message::Error(payload) => serde_json::to_value(payload),
            Message::Ping | Message::Pong | Message::ClearSession => {
                return Ok(Value::Object(Map::new()))
            }
        };
        value.map_err(|err| ProtocolError::InvalidPayload {
            kind: self.kind(),
            detail: err.to_string(),
        })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The frame is not a JSON object.
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),
    /// `type` is missing or names no known message.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    /// The payload does not fit the declared type.
    #[error("invalid {} payload: {detail}", .kind.as_str())]
    InvalidPayload { kind: MessageKind, detail: String },
    /// A server-only message arrived from a client.
    #[error("{} messages are not accepted from clients", .0.as_str())]
    UnexpectedDirection(MessageKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
}

impl Envelope {
    /// Wraps `message` with a fresh id and the current time.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let raw = RawEnvelope {
            kind: self.kind().as_str().to_string(),
            payload: self.message.payload()?,
            timestamp: Some(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
            message_id: Some(self.message_id.clone()),
        };
        serde_json::to_string(&raw).map_err(|err| ProtocolError::InvalidPayload {
            kind: self.kind(),
            detail: err.to_string(),
        })
    }

    /// Decodes any well-formed frame regardless of direction.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidJson("expected a JSON object".into()));
        }
        let raw: RawEnvelope = serde_json::from_value(value)
            .map_err(|_| ProtocolError::UnknownType("<missing>".into()))?;
        let kind = MessageKind::parse(&raw.kind).ok_or(ProtocolError::UnknownType(raw.kind))?;

        let payload = match raw.payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let message = match kind {
            MessageKind::Query => Message::Query(typed(kind, payload)?),
            MessageKind::Response => Message::Response(typed(kind, payload)?),
            MessageKind::Status => Message::Status(typed(kind, payload)?),
            MessageKind::Error => Message::Error(typed(kind, payload)?),
            MessageKind::Ping => Message::Ping,
            MessageKind::Pong => Message::Pong,
            MessageKind::ClearSession => Message::ClearSession,
        };

        let timestamp = raw
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let message_id = raw
            .message_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            message,
            timestamp,
            message_id,
        })
    }

    /// Decodes a frame received from a client, rejecting server-only kinds.
    pub fn decode_client(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Self::decode(text)?;
        if !envelope.kind().is_client_message() {
            return Err(ProtocolError::UnexpectedDirection(envelope.kind()));
        }
        Ok(envelope)
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Envelope::new(message)
    }
}

fn typed<T: DeserializeOwned>(kind: MessageKind, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|err| ProtocolError::InvalidPayload {
        kind,
        detail: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_frames_carry_envelope_fields() {
        let mut row = Row::new();
        row.insert("region".into(), json!("EU"));
        row.insert("total".into(), json!(10));
        let envelope = Envelope::new(Message::Response(ResponsePayload {
            answer_text: "EU leads.".into(),
            data: Some(vec![row]),
            ..Default::default()
        }));

        let json: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "Response");
        assert_eq!(json["payload"]["answer_text"], "EU leads.");
        assert_eq!(json["payload"]["data"][0]["total"], 10);
        assert!(json["payload"].get("partial").is_none());
        assert!(json["payload"].get("reasoning_trace").is_none());
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(json["message_id"].as_str().unwrap().len(), 36);

        let ping: Value = serde_json::from_str(&Envelope::new(Message::Ping).to_json().unwrap()).unwrap();
        assert_eq!(ping["payload"], json!({}));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Envelope::new(Message::Pong);
        let b = Envelope::new(Message::Pong);
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn client_frames_decode_with_optional_fields() {
        let envelope = Envelope::decode_client(
            r#"{"type":"Query","payload":{"text":"total volume by region","session_hint":"abc"}}"#,
        )
        .unwrap();
        assert_eq!(
            envelope.message,
            Message::Query(QueryPayload {
                text: "total volume by region".into(),
                session_hint: Some("abc".into()),
            })
        );
        assert!(!envelope.message_id.is_empty());

        let clear = Envelope::decode_client(
            r#"{"type":"ClearSession","timestamp":"2026-01-05T10:00:00Z","message_id":"m-1"}"#,
        )
        .unwrap();
        assert_eq!(clear.message, Message::ClearSession);
        assert_eq!(clear.message_id, "m-1");
        assert_eq!(clear.timestamp.to_rfc3339(), "2026-01-05T10:00:00+00:00");
    }

    #[test]
    fn bad_frames_are_classified() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            Envelope::decode("[1,2]"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            Envelope::decode(r#"{"type":"query","payload":{"text":"x"}}"#),
            Err(ProtocolError::UnknownType("query".into()))
        );
        assert!(matches!(
            Envelope::decode(r#"{"payload":{}}"#),
            Err(ProtocolError::UnknownType(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"Query","payload":{"txt":"x"}}"#),
            Err(ProtocolError::InvalidPayload {
                kind: MessageKind::Query,
                ..
            })
        ));
        assert_eq!(
            Envelope::decode_client(r#"{"type":"Response","payload":{"answer_text":"hi"}}"#),
            Err(ProtocolError::UnexpectedDirection(MessageKind::Response))
        );
    }

    #[test]
    fn terminal_messages() {
        assert!(Message::error("boom", "internal").is_terminal());
        assert!(!Message::status("processing", None).is_terminal());
        assert!(!Message::query("hi").is_terminal());
    }
}
