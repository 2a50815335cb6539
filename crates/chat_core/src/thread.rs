//! Reply linkage: renderable parent summaries and parent target resolution.

use shared::{
    domain::{MessageId, MessageKind, UserId},
    protocol::{Message, MessageBody, ParentMessage},
};

pub const IMAGE_LABEL: &str = "Hình ảnh";
pub const FILE_LABEL: &str = "Tệp đính kèm";
pub const POLL_LABEL: &str = "Bình chọn";
pub const EMPTY_LABEL: &str = "Tin nhắn không có nội dung";
const SNIPPET_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentSummary {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    /// Never empty.
    pub label: String,
}

pub fn resolve_parent_summary(parent: &ParentMessage) -> ParentSummary {
    let label = match &parent.body {
        MessageBody::Image { .. } => IMAGE_LABEL.to_string(),
        MessageBody::File { .. } => FILE_LABEL.to_string(),
        MessageBody::Text {
            content,
            attachments,
        } => match content.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => snippet(text),
            _ if attachments.is_empty() => EMPTY_LABEL.to_string(),
            _ if attachments
                .iter()
                .all(|attachment| attachment.mime_type.starts_with("image/")) =>
            {
                IMAGE_LABEL.to_string()
            }
            _ => FILE_LABEL.to_string(),
        },
        MessageBody::System { content } if !content.trim().is_empty() => snippet(content.trim()),
        MessageBody::System { .. } => EMPTY_LABEL.to_string(),
        MessageBody::Poll { question, .. } if !question.trim().is_empty() => {
            format!("{POLL_LABEL}: {}", snippet(question.trim()))
        }
        MessageBody::Poll { .. } => POLL_LABEL.to_string(),
    };

    ParentSummary {
        message_id: parent.id.clone(),
        sender_id: parent.sender_id.clone(),
        kind: parent.body.kind(),
        label,
    }
}

/// Summary for the message a timeline entry replies to, if any.
pub fn summary_for(message: &Message) -> Option<ParentSummary> {
    message.parent_message.as_deref().map(resolve_parent_summary)
}

/// An explicitly supplied id wins over the one embedded in a possibly stale
/// denormalized summary.
pub fn resolve_target(
    explicit_parent_id: Option<&MessageId>,
    fallback: Option<&ParentMessage>,
) -> Option<MessageId> {
    explicit_parent_id
        .or_else(|| fallback.map(|parent| &parent.id))
        .cloned()
}

fn snippet(text: &str) -> String {
    let mut chars = text.chars();
    let head = chars.by_ref().take(SNIPPET_MAX_CHARS).collect::<String>();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;
