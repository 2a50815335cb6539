use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentId, ConversationId, Cursor, MessageId, MessageKind, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: AttachmentId,
    pub url: String,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: UserId,
}

/// Body of a message. Each variant carries only the fields valid for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<AttachmentRef>,
    },
    Image {
        attachments: Vec<AttachmentRef>,
    },
    File {
        attachments: Vec<AttachmentRef>,
    },
    System {
        content: String,
    },
    Poll {
        question: String,
        #[serde(default)]
        options: Vec<String>,
    },
}

impl MessageBody {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: Some(content.into()),
            attachments: Vec::new(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::File { .. } => MessageKind::File,
            Self::System { .. } => MessageKind::System,
            Self::Poll { .. } => MessageKind::Poll,
        }
    }

    /// Searchable text, if the variant has any.
    pub fn text_content(&self) -> Option<&str> {
        match self {
            Self::Text { content, .. } => content.as_deref(),
            Self::System { content } => Some(content),
            Self::Poll { question, .. } => Some(question),
            Self::Image { .. } | Self::File { .. } => None,
        }
    }

    pub fn attachments(&self) -> &[AttachmentRef] {
        match self {
            Self::Text { attachments, .. }
            | Self::Image { attachments }
            | Self::File { attachments } => attachments,
            Self::System { .. } | Self::Poll { .. } => &[],
        }
    }
}

/// Denormalized copy of the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sent_at: DateTime<Utc>,
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message: Option<Box<ParentMessage>>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub reactions: BTreeSet<Reaction>,
}

impl Message {
    /// Total order key within a conversation.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.sent_at, self.id.as_str())
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// One page of history, newest-first within the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTextRequest {
    pub sender_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub reader_id: UserId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub messages: Vec<Message>,
}

/// Hints pushed by the real-time channel. Consumers re-validate them against
/// local state before acting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    NewMessage {
        conversation_id: ConversationId,
        message: Message,
        is_from_self: bool,
    },
    MessagesMarkedAsRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    ParticipantJoined {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

impl RealtimeEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::NewMessage {
                conversation_id, ..
            }
            | Self::MessagesMarkedAsRead {
                conversation_id, ..
            }
            | Self::ParticipantJoined {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
