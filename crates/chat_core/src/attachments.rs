//! Attachment staging: local previews for picked files and their upload.

use std::collections::HashMap;

use anyhow::Result;
use shared::{
    domain::{AttachmentKind, ConversationId, MessageId},
    protocol::Message,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{transport::ChatBackend, types::UploadFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreviewId(pub Uuid);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewBlob {
    pub url: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAttachment {
    pub preview_id: PreviewId,
    pub preview_url: String,
    pub file: UploadFile,
}

impl StagedAttachment {
    pub fn kind(&self) -> AttachmentKind {
        self.file.kind()
    }
}

/// Owns the preview registry. Every staged file holds one live preview until
/// it is released.
#[derive(Debug, Default)]
pub struct AttachmentStager {
    previews: HashMap<PreviewId, PreviewBlob>,
}

impl AttachmentStager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, file: UploadFile) -> StagedAttachment {
        let preview_id = PreviewId(Uuid::new_v4());
        let preview_url = format!("blob:local/{}", preview_id.0);
        self.previews.insert(
            preview_id,
            PreviewBlob {
                url: preview_url.clone(),
                name: file.name.clone(),
                mime_type: file.mime_type.clone(),
                size_bytes: file.size_bytes(),
            },
        );
        debug!(preview = %preview_url, name = %file.name, "attachments: preview created");
        StagedAttachment {
            preview_id,
            preview_url,
            file,
        }
    }

    pub fn preview(&self, preview_id: &PreviewId) -> Option<&PreviewBlob> {
        self.previews.get(preview_id)
    }

    pub fn release(&mut self, preview_id: &PreviewId) -> bool {
        let released = self.previews.remove(preview_id).is_some();
        if released {
            debug!(preview_id = %preview_id.0, "attachments: preview released");
        }
        released
    }

    pub fn release_all<'a>(&mut self, staged: impl IntoIterator<Item = &'a StagedAttachment>) {
        for attachment in staged {
            self.release(&attachment.preview_id);
        }
    }

    pub fn live_previews(&self) -> usize {
        self.previews.len()
    }

    pub async fn upload(
        backend: &dyn ChatBackend,
        conversation_id: &ConversationId,
        files: &[UploadFile],
        parent_message_id: Option<&MessageId>,
    ) -> Result<Vec<Message>> {
        let messages = backend
            .upload_attachments(conversation_id, files, parent_message_id)
            .await?;
        info!(
            conversation_id = %conversation_id,
            files = files.len(),
            messages = messages.len(),
            "attachments: upload confirmed"
        );
        Ok(messages)
    }
}
