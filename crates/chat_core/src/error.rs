use shared::domain::{AttachmentKind, ConversationId, MessageId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("conversation {0} is not mounted")]
    NotMounted(ConversationId),
    #[error("conversation {0} was unmounted while a request was in flight")]
    StaleResponse(ConversationId),
    #[error("message {0} is not loaded in the timeline")]
    NotMaterialized(MessageId),
    #[error("no local send with temporary id {0}")]
    UnknownLocalSend(MessageId),
    #[error("local send {0} has not failed")]
    NotFailed(MessageId),
    #[error("message {0} does not reply to anything")]
    NoParent(MessageId),
    #[error("backend request failed: {0}")]
    Backend(#[source] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposerError {
    #[error("text is limited to {max} characters, got {actual}")]
    TextTooLong { max: usize, actual: usize },
    #[error("nothing to send")]
    EmptyDraft,
    #[error("a send is already in progress")]
    AlreadySending,
    #[error("no send in progress")]
    NotSending,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileRejectionReason {
    #[error("file is {size_bytes} bytes, limit is {max_bytes}")]
    TooLarge { size_bytes: u64, max_bytes: u64 },
    #[error("file is empty")]
    Empty,
    #[error("at most {max} {kind:?} attachments per message")]
    KindLimit { kind: AttachmentKind, max: usize },
    #[error("at most {max} attachments per message")]
    CountLimit { max: usize },
}

/// A picked file that was not staged, reported individually.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {reason}")]
pub struct FileRejection {
    pub name: String,
    pub reason: FileRejectionReason,
}

/// Broken timeline invariant. Never expected at runtime; surfaced by
/// `ConversationTimeline::check_invariants`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("duplicate id {0}")]
    DuplicateId(MessageId),
    #[error("{later} is ordered before {earlier}")]
    OutOfOrder {
        earlier: MessageId,
        later: MessageId,
    },
    #[error("known id index out of sync with entries")]
    KnownIdsMismatch,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("conversation {0} is not mounted")]
    NotMounted(ConversationId),
    #[error(transparent)]
    Composer(#[from] ComposerError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}
