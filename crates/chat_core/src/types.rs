use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{AttachmentKind, ConversationId, Cursor, MessageId, UserId},
    protocol::{AttachmentRef, Message, MessageBody, ParentMessage},
};
use uuid::Uuid;

/// Read receipt phase. Ordered so that merging is `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadState {
    Unread,
    /// Marked by this session, confirmation not yet observed.
    Local,
    Confirmed,
}

impl ReadState {
    pub fn from_server(is_read: bool) -> Self {
        if is_read {
            Self::Confirmed
        } else {
            Self::Unread
        }
    }

    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn is_read(self) -> bool {
        self != Self::Unread
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Pending,
    Confirmed,
    Failed { reason: String },
}

impl SendStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DraftId(pub Uuid);

impl DraftId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DraftId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DraftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File bytes handed to the upload collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn kind(&self) -> AttachmentKind {
        AttachmentKind::from_mime(&self.mime_type)
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// What a local send needs to be dispatched again after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPayload {
    Text {
        content: String,
        parent_message_id: Option<MessageId>,
    },
    Attachments {
        files: Vec<UploadFile>,
        parent_message_id: Option<MessageId>,
    },
}

impl SendPayload {
    pub fn parent_message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Text {
                parent_message_id, ..
            }
            | Self::Attachments {
                parent_message_id, ..
            } => parent_message_id.as_ref(),
        }
    }
}

/// Session-originated entry bookkeeping. Present for the whole lifetime of
/// the entry, so confirmed session sends stay pinned where they were shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSend {
    pub temp_id: MessageId,
    pub draft_id: DraftId,
    pub status: SendStatus,
    /// Retry payload; dropped once the send is confirmed.
    pub payload: Option<SendPayload>,
}

/// An optimistic send waiting to be inserted at the tail of a timeline.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub message: Message,
    pub draft_id: DraftId,
    pub payload: SendPayload,
}

impl PendingSend {
    pub fn text(
        conversation_id: ConversationId,
        sender_id: UserId,
        draft_id: DraftId,
        content: impl Into<String>,
        parent: Option<ParentMessage>,
    ) -> Self {
        let content = content.into();
        let parent_message_id = parent.as_ref().map(|parent| parent.id.clone());
        Self {
            message: optimistic_message(
                conversation_id,
                sender_id,
                MessageBody::text(content.clone()),
                parent,
            ),
            draft_id,
            payload: SendPayload::Text {
                content,
                parent_message_id,
            },
        }
    }

    /// `previews` pairs each file with the local blob url used until the
    /// server returns real attachment descriptors.
    pub fn attachments(
        conversation_id: ConversationId,
        sender_id: UserId,
        draft_id: DraftId,
        previews: Vec<(UploadFile, String)>,
        parent: Option<ParentMessage>,
    ) -> Self {
        let all_images = previews
            .iter()
            .all(|(file, _)| file.kind() == AttachmentKind::Image);
        let refs = previews
            .iter()
            .map(|(file, url)| AttachmentRef {
                id: url.as_str().into(),
                url: url.clone(),
                name: file.name.clone(),
                size_bytes: file.size_bytes(),
                mime_type: file.mime_type.clone(),
            })
            .collect::<Vec<_>>();
        let body = if all_images {
            MessageBody::Image { attachments: refs }
        } else {
            MessageBody::File { attachments: refs }
        };
        let parent_message_id = parent.as_ref().map(|parent| parent.id.clone());
        Self {
            message: optimistic_message(conversation_id, sender_id, body, parent),
            draft_id,
            payload: SendPayload::Attachments {
                files: previews.into_iter().map(|(file, _)| file).collect(),
                parent_message_id,
            },
        }
    }

    pub fn temp_id(&self) -> &MessageId {
        &self.message.id
    }
}

fn optimistic_message(
    conversation_id: ConversationId,
    sender_id: UserId,
    body: MessageBody,
    parent: Option<ParentMessage>,
) -> Message {
    Message {
        id: MessageId::new_local(),
        conversation_id,
        sender_id,
        sent_at: Utc::now(),
        body,
        parent_message_id: parent.as_ref().map(|parent| parent.id.clone()),
        parent_message: parent.map(Box::new),
        is_read: true,
        reactions: Default::default(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: Message,
    pub read: ReadState,
    pub local: Option<LocalSend>,
}

impl TimelineEntry {
    pub fn remote(message: Message) -> Self {
        let read = ReadState::from_server(message.is_read);
        Self {
            message,
            read,
            local: None,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// Entries produced by this session keep their on-screen position.
    pub fn is_pinned(&self) -> bool {
        self.local.is_some()
    }

    pub fn status(&self) -> SendStatus {
        self.local
            .as_ref()
            .map_or(SendStatus::Confirmed, |local| local.status.clone())
    }

    pub(crate) fn set_read(&mut self, state: ReadState) -> bool {
        let merged = self.read.merge(state);
        if merged == self.read {
            return false;
        }
        self.read = merged;
        self.message.is_read = merged.is_read();
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub conversation_id: ConversationId,
    pub entries: Vec<TimelineEntry>,
    pub has_more: bool,
    pub next_cursor: Option<Cursor>,
    pub highlighted: Option<MessageId>,
}

impl TimelineSnapshot {
    pub fn ids(&self) -> Vec<MessageId> {
        self.entries.iter().map(|entry| entry.id().clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOlderOutcome {
    pub added: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub index: usize,
    pub message_id: MessageId,
}

/// Change notifications delivered to per-conversation subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEvent {
    Reset {
        len: usize,
    },
    Inserted {
        ids: Vec<MessageId>,
    },
    OlderLoaded {
        added: usize,
        has_more: bool,
    },
    Reconciled {
        index: usize,
        temp_id: MessageId,
        ids: Vec<MessageId>,
        status: SendStatus,
    },
    Removed {
        id: MessageId,
    },
    ReadStateChanged {
        ids: Vec<MessageId>,
        state: ReadState,
    },
    Highlighted {
        id: MessageId,
        index: usize,
    },
    HighlightCleared {
        id: MessageId,
    },
}

/// Human-readable notification for a user-actionable failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub conversation_id: ConversationId,
    pub text: String,
}

/// Outcome of one send intent. Each part is `None` when the intent did not
/// carry it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub attachments: Option<Result<Vec<MessageId>, String>>,
    pub text: Option<Result<MessageId, String>>,
}

impl SendReport {
    pub fn attachments_failed(&self) -> bool {
        matches!(self.attachments, Some(Err(_)))
    }

    pub fn text_failed(&self) -> bool {
        matches!(self.text, Some(Err(_)))
    }

    pub fn is_success(&self) -> bool {
        !self.attachments_failed() && !self.text_failed()
    }
}
