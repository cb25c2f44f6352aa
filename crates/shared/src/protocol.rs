use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{MessageId, UserId},
    error::ApiError,
};

/// Value of `msg` in a successful send acknowledgement.
pub const SEND_ACK: &str = "Message sent";

/// Message-shaped record as it travels over HTTP and the live channel.
///
/// Every field is optional on the wire so a malformed record can be reported
/// instead of failing the whole response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        default,
        rename = "sentAt",
        alias = "createdAt",
        alias = "timestamp",
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub sent_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn new(sender: UserId, text: impl Into<String>) -> Self {
        Self {
            id: None,
            sender: Some(sender),
            text: Some(text.into()),
            sent_at: None,
        }
    }
}

impl From<SendMessageRequest> for MessageRecord {
    fn from(value: SendMessageRequest) -> Self {
        Self::new(value.sender, value.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    pub sender: UserId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// Stored copy of the message, when the server echoes it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageRecord>,
}

impl SendMessageResponse {
    pub fn acknowledged() -> Self {
        Self {
            msg: Some(SEND_ACK.to_string()),
            message: None,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.msg.as_deref() == Some(SEND_ACK)
    }
}

/// Frames exchanged over the persistent live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LiveFrame {
    Auth { token: Option<String> },
    Connected,
    Message(MessageRecord),
    Disconnect { reason: String },
    Error(ApiError),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Rfc3339(DateTime<Utc>),
        EpochMillis(i64),
    }

    match Option::<RawTimestamp>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawTimestamp::Rfc3339(at)) => Ok(Some(at)),
        Some(RawTimestamp::EpochMillis(millis)) => DateTime::<Utc>::from_timestamp_millis(millis)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {millis}"))),
    }
}
