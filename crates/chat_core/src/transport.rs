//! Collaborator contracts consumed by the core, plus the HTTP implementation
//! of the chat API.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::{ConversationId, Cursor, MessageId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        HistoryPage, MarkReadRequest, Message, RealtimeEvent, SendTextRequest, UploadResponse,
    },
};
use tokio::sync::broadcast;
use url::Url;

use crate::types::UploadFile;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Newest-first page strictly older than `before`, or the newest page
    /// when `before` is `None`.
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        before: Option<&Cursor>,
        page_size: u32,
    ) -> Result<HistoryPage>;
    async fn send_text(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        parent_message_id: Option<&MessageId>,
    ) -> Result<Message>;
    /// The server may create one message per file or one for the batch.
    async fn upload_attachments(
        &self,
        conversation_id: &ConversationId,
        files: &[UploadFile],
        parent_message_id: Option<&MessageId>,
    ) -> Result<Vec<Message>>;
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<()>;
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn join(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn leave(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn set_drafting(&self, conversation_id: &ConversationId, drafting: bool) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent>;
}

/// Stand-in when no push transport is wired; polling carries delivery alone.
pub struct MissingRealtimeChannel;

#[async_trait]
impl RealtimeChannel for MissingRealtimeChannel {
    async fn join(&self, conversation_id: &ConversationId) -> Result<()> {
        Err(anyhow!(
            "realtime channel unavailable for conversation {conversation_id}"
        ))
    }

    async fn leave(&self, conversation_id: &ConversationId) -> Result<()> {
        Err(anyhow!(
            "realtime channel unavailable for conversation {conversation_id}"
        ))
    }

    async fn set_drafting(&self, conversation_id: &ConversationId, _drafting: bool) -> Result<()> {
        Err(anyhow!(
            "realtime channel unavailable for conversation {conversation_id}"
        ))
    }

    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        let (_, rx) = broadcast::channel(1);
        rx
    }
}

pub struct HttpChatBackend {
    http: Client,
    base_url: Url,
    user_id: UserId,
}

impl HttpChatBackend {
    pub fn new(server_url: &str, user_id: UserId) -> Result<Self> {
        let mut base_url =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            user_id,
        })
    }

    fn conversation_url(&self, conversation_id: &ConversationId, tail: &str) -> Result<Url> {
        self.base_url
            .join(&format!("conversations/{conversation_id}/{tail}"))
            .with_context(|| format!("failed to build url for conversation {conversation_id}"))
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(body) => Err(ApiException::from(body).into()),
        Err(_) => Err(anyhow!("chat api request failed with status {status}")),
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        before: Option<&Cursor>,
        page_size: u32,
    ) -> Result<HistoryPage> {
        let mut query = vec![
            ("user_id", self.user_id.to_string()),
            ("limit", page_size.to_string()),
        ];
        if let Some(cursor) = before {
            query.push(("before", cursor.to_string()));
        }
        let response = self
            .http
            .get(self.conversation_url(conversation_id, "messages")?)
            .query(&query)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn send_text(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        parent_message_id: Option<&MessageId>,
    ) -> Result<Message> {
        let response = self
            .http
            .post(self.conversation_url(conversation_id, "messages")?)
            .json(&SendTextRequest {
                sender_id: self.user_id.clone(),
                content: content.to_string(),
                parent_message_id: parent_message_id.cloned(),
            })
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn upload_attachments(
        &self,
        conversation_id: &ConversationId,
        files: &[UploadFile],
        parent_message_id: Option<&MessageId>,
    ) -> Result<Vec<Message>> {
        let url = self.conversation_url(conversation_id, "attachments")?;
        let mut messages = Vec::new();
        for file in files {
            let mut query = vec![
                ("user_id", self.user_id.to_string()),
                ("filename", file.name.clone()),
                ("mime_type", file.mime_type.clone()),
            ];
            if let Some(parent) = parent_message_id {
                query.push(("parent_message_id", parent.to_string()));
            }
            let response = self
                .http
                .post(url.clone())
                .query(&query)
                .body(file.bytes.clone())
                .send()
                .await?;
            let uploaded: UploadResponse = ensure_success(response).await?.json().await?;
            messages.extend(uploaded.messages);
        }
        Ok(messages)
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<()> {
        let response = self
            .http
            .post(self.conversation_url(conversation_id, "read")?)
            .json(&MarkReadRequest {
                reader_id: self.user_id.clone(),
                message_ids: message_ids.to_vec(),
            })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
