use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{MessageId, ThreadId, UserId},
    error::ProtocolError,
};

pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const SUBSCRIPTION_SUCCEEDED_PUBLIC: &str = "pusher:subscription_succeeded";
    pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";

    pub const NEW_MESSAGE: &str = "new_message";
    pub const MESSAGE_READ: &str = "message_read";
    pub const USER_TYPING: &str = "user_typing";
}

/// Payload of a frame. The wire convention is a JSON document encoded as a
/// string, but some brokers inline the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameData {
    Encoded(String),
    Json(Value),
}

impl FrameData {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        match self {
            Self::Encoded(raw) => Ok(serde_json::from_str(raw)?),
            Self::Json(value) => Ok(T::deserialize(value)?),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Encoded(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            Self::Json(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<FrameData>,
}

impl PusherFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        self.data
            .as_ref()
            .ok_or_else(|| ProtocolError::MissingData {
                event: self.event.clone(),
            })?
            .decode()
    }

    /// `auth` is the JSON object returned by the authorization endpoint; it is
    /// forwarded verbatim with the channel name added.
    pub fn subscribe(channel: &str, mut auth: Map<String, Value>) -> Self {
        auth.insert("channel".to_string(), Value::String(channel.to_string()));
        Self {
            event: events::SUBSCRIBE.to_string(),
            channel: None,
            data: Some(FrameData::Json(Value::Object(auth))),
        }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        let mut data = Map::new();
        data.insert("channel".to_string(), Value::String(channel.to_string()));
        Self {
            event: events::UNSUBSCRIBE.to_string(),
            channel: None,
            data: Some(FrameData::Json(Value::Object(data))),
        }
    }

    pub fn ping() -> Self {
        Self::bare(events::PING)
    }

    pub fn pong() -> Self {
        Self::bare(events::PONG)
    }

    fn bare(event: &str) -> Self {
        Self {
            event: event.to_string(),
            channel: None,
            data: Some(FrameData::Json(Value::Object(Map::new()))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PusherErrorData {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
    #[serde(other)]
    Unknown,
}

/// A thread message as broadcast by the backend. Only `id` and the sender are
/// required; everything else the backend sends is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    pub id: MessageId,
    #[serde(default, alias = "body")]
    pub text: Option<String>,
    #[serde(alias = "sender_id")]
    pub sender_id: UserId,
    /// Raw timestamp as sent; see [`ThreadMessage::sent_at`].
    #[serde(default, alias = "created_at", alias = "createdAt")]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ThreadMessage {
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_ref().and_then(parse_timestamp)
    }
}

/// Accepts RFC 3339, `Y-m-d H:i:s` (UTC) and epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(millis) => millis.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub message: ThreadMessage,
    #[serde(default, alias = "thread_id")]
    pub thread_id: Option<ThreadId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    #[serde(alias = "message_id")]
    pub message_id: MessageId,
    #[serde(alias = "user_id")]
    pub user_id: UserId,
    #[serde(default, alias = "read_at")]
    pub read_at: Option<Value>,
}

fn typing_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    #[serde(alias = "user_id")]
    pub user_id: UserId,
    #[serde(alias = "user_name")]
    pub user_name: String,
    #[serde(default = "typing_default", alias = "is_typing")]
    pub is_typing: bool,
}
