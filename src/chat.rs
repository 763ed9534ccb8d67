use crate::entity::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: String,
    /// Always the lexicographically smaller participant.
    pub user_1: UserId,
    pub user_2: UserId,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ChatRoom {
    /// The participant that is not `user`. For a self-chat this is `user` again.
    pub fn other_participant(&self, user: &UserId) -> &UserId {
        if &self.user_1 == user {
            &self.user_2
        } else {
            &self.user_1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_room_id: String,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no recipient")]
    MissingRecipient,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    recipient_id: String,
    content: String,
}

/// A validated client → server chat frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub recipient: UserId,
    pub content: String,
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        let recipient = UserId::parse(&frame.recipient_id).ok_or(FrameError::MissingRecipient)?;
        Ok(Self {
            recipient,
            content: frame.content,
        })
    }
}

/// Server → client delivery of a persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: String,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub chat_room_id: String,
}

impl From<&ChatMessage> for OutboundMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            message_id: msg.id.clone(),
            sender_id: msg.sender_id.clone(),
            content: msg.content.clone(),
            sent_at: msg.created_at,
            chat_room_id: msg.chat_room_id.clone(),
        }
    }
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
