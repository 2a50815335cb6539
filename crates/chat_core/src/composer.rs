//! Draft assembly for one conversation: text, staged attachments and reply
//! target, turned into a single send intent.
//!
//! The draft and reply target are cleared as soon as an intent is taken and
//! restored part by part when the matching send fails.

use shared::{
    domain::{AttachmentKind, ConversationId},
    protocol::ParentMessage,
};
use tracing::debug;

use crate::{
    attachments::{AttachmentStager, PreviewId, StagedAttachment},
    config::ComposerLimits,
    error::{ComposerError, FileRejection, FileRejectionReason},
    types::{DraftId, SendReport, UploadFile},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerState {
    Idle,
    Drafting,
    Sending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub id: DraftId,
    pub text: String,
    pub attachments: Vec<StagedAttachment>,
    pub reply_to: Option<ParentMessage>,
}

impl Draft {
    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty() || !self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendIntent {
    pub draft_id: DraftId,
    pub text: Option<String>,
    pub attachments: Vec<StagedAttachment>,
    pub reply_to: Option<ParentMessage>,
}

#[derive(Debug)]
pub struct Composer {
    conversation_id: ConversationId,
    limits: ComposerLimits,
    stager: AttachmentStager,
    state: ComposerState,
    draft: Draft,
}

impl Composer {
    pub fn new(conversation_id: ConversationId, limits: ComposerLimits) -> Self {
        Self {
            conversation_id,
            limits,
            stager: AttachmentStager::new(),
            state: ComposerState::Idle,
            draft: Draft::default(),
        }
    }

    pub fn state(&self) -> ComposerState {
        self.state
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn stager(&self) -> &AttachmentStager {
        &self.stager
    }

    /// Replaces the draft text. Input past the cap is rejected and the text
    /// already typed stays as it was.
    pub fn set_text(&mut self, text: impl Into<String>) -> Result<(), ComposerError> {
        self.ensure_editable()?;
        let text = text.into();
        let actual = text.chars().count();
        if actual > self.limits.max_text_chars {
            return Err(ComposerError::TextTooLong {
                max: self.limits.max_text_chars,
                actual,
            });
        }
        self.draft.text = text;
        self.refresh_state();
        Ok(())
    }

    /// Stages picked files. Files breaking a constraint are skipped and
    /// reported one by one; the rest are staged.
    pub fn add_files(
        &mut self,
        files: Vec<UploadFile>,
    ) -> Result<Vec<FileRejection>, ComposerError> {
        self.ensure_editable()?;
        let mut rejections = Vec::new();
        for file in files {
            if let Err(reason) = self.check_file(&file) {
                debug!(
                    conversation_id = %self.conversation_id,
                    name = %file.name,
                    %reason,
                    "composer: file rejected"
                );
                rejections.push(FileRejection {
                    name: file.name,
                    reason,
                });
                continue;
            }
            let staged = self.stager.stage(file);
            self.draft.attachments.push(staged);
        }
        self.refresh_state();
        Ok(rejections)
    }

    fn check_file(&self, file: &UploadFile) -> Result<(), FileRejectionReason> {
        if file.bytes.is_empty() {
            return Err(FileRejectionReason::Empty);
        }
        if file.size_bytes() > self.limits.max_file_bytes {
            return Err(FileRejectionReason::TooLarge {
                size_bytes: file.size_bytes(),
                max_bytes: self.limits.max_file_bytes,
            });
        }
        if self.draft.attachments.len() >= self.limits.max_attachments {
            return Err(FileRejectionReason::CountLimit {
                max: self.limits.max_attachments,
            });
        }
        let kind = file.kind();
        let max = match kind {
            AttachmentKind::Image => self.limits.max_images,
            AttachmentKind::Video => self.limits.max_videos,
            AttachmentKind::Other => self.limits.max_other_files,
        };
        let same_kind = self
            .draft
            .attachments
            .iter()
            .filter(|staged| staged.kind() == kind)
            .count();
        if same_kind >= max {
            return Err(FileRejectionReason::KindLimit { kind, max });
        }
        Ok(())
    }

    pub fn remove_attachment(&mut self, preview_id: &PreviewId) -> bool {
        let Some(index) = self
            .draft
            .attachments
            .iter()
            .position(|staged| &staged.preview_id == preview_id)
        else {
            return false;
        };
        let removed = self.draft.attachments.remove(index);
        self.stager.release(&removed.preview_id);
        self.refresh_state();
        true
    }

    pub fn set_reply_target(&mut self, parent: ParentMessage) {
        self.draft.reply_to = Some(parent);
    }

    pub fn clear_reply_target(&mut self) {
        self.draft.reply_to = None;
    }

    /// Drops the draft and releases every preview it holds.
    pub fn clear(&mut self) {
        let draft = std::mem::take(&mut self.draft);
        self.stager.release_all(&draft.attachments);
        if self.state != ComposerState::Sending {
            self.state = ComposerState::Idle;
        }
    }

    /// Takes the draft as a send intent and clears it.
    pub fn take_intent(&mut self) -> Result<SendIntent, ComposerError> {
        self.ensure_editable()?;
        if !self.draft.has_content() {
            return Err(ComposerError::EmptyDraft);
        }
        let draft = std::mem::take(&mut self.draft);
        self.state = ComposerState::Sending;
        let text = Some(draft.text).filter(|text| !text.trim().is_empty());
        Ok(SendIntent {
            draft_id: draft.id,
            text,
            attachments: draft.attachments,
            reply_to: draft.reply_to,
        })
    }

    /// Settles a taken intent: previews of uploaded files are released, and
    /// whatever failed goes back into the draft together with the reply
    /// target.
    pub fn finish(&mut self, intent: SendIntent, report: &SendReport) -> Result<(), ComposerError> {
        if self.state != ComposerState::Sending {
            return Err(ComposerError::NotSending);
        }
        let SendIntent {
            draft_id,
            text,
            attachments,
            reply_to,
        } = intent;

        if report.attachments_failed() {
            self.draft.attachments = attachments;
        } else {
            self.stager.release_all(&attachments);
        }
        if report.text_failed() {
            self.draft.text = text.unwrap_or_default();
        }
        if !report.is_success() {
            self.draft.id = draft_id;
            self.draft.reply_to = reply_to;
        }

        self.state = ComposerState::Idle;
        self.refresh_state();
        Ok(())
    }

    fn ensure_editable(&self) -> Result<(), ComposerError> {
        if self.state == ComposerState::Sending {
            return Err(ComposerError::AlreadySending);
        }
        Ok(())
    }

    fn refresh_state(&mut self) {
        if self.state == ComposerState::Sending {
            return;
        }
        self.state = if self.draft.has_content() {
            ComposerState::Drafting
        } else {
            ComposerState::Idle
        };
    }
}

#[cfg(test)]
#[path = "tests/composer_tests.rs"]
mod tests;
