use chrono::{DateTime, Utc};
use shared::{
    domain::{LocalId, MessageId, Origin, UserId},
    protocol::MessageRecord,
};

use crate::error::ValidationError;

/// One entry of the room log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub sender: UserId,
    pub text: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub origin: Origin,
    /// Set for messages this client sent; survives confirmation.
    pub local_id: Option<LocalId>,
}

impl Message {
    /// Placeholder shown while a local send is in flight.
    pub fn optimistic(sender: UserId, text: impl Into<String>) -> Self {
        Self {
            id: None,
            sender,
            text: text.into(),
            sent_at: None,
            origin: Origin::Optimistic,
            local_id: Some(LocalId::new()),
        }
    }

    pub fn from_record(record: MessageRecord, origin: Origin) -> Result<Self, ValidationError> {
        let sender = record
            .sender
            .filter(|sender| !sender.as_str().trim().is_empty())
            .ok_or(ValidationError::MissingSender)?;
        let text = record
            .text
            .filter(|text| !text.trim().is_empty())
            .ok_or(ValidationError::EmptyText)?;
        Ok(Self {
            id: record.id,
            sender,
            text,
            sent_at: record.sent_at,
            origin,
            local_id: None,
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sender.as_str().trim().is_empty() {
            return Err(ValidationError::MissingSender);
        }
        if self.text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.origin == Origin::Optimistic
    }

    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            id: self.id.clone(),
            sender: Some(self.sender.clone()),
            text: Some(self.text.clone()),
            sent_at: self.sent_at,
        }
    }
}
