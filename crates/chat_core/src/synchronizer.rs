//! Single entry point for every mutation of a mounted conversation's
//! timeline. Network calls run outside the state lock; their results are
//! merged afterwards only if the conversation is still mounted under the
//! same generation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::Message,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    attachments::AttachmentStager,
    config::ClientSettings,
    error::SyncError,
    read_receipts::{confirm_remote, ReadReceiptTracker},
    thread::{resolve_target, summary_for, ParentSummary},
    timeline::ConversationTimeline,
    transport::ChatBackend,
    types::{
        LoadOlderOutcome, PendingSend, ReadState, SearchHit, SendPayload, SendStatus,
        TimelineEvent, TimelineSnapshot,
    },
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub page_size: u32,
    pub read_confirm_delay: Duration,
    pub highlight_duration: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for SyncSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            page_size: settings.page_size,
            read_confirm_delay: settings.read_confirm_delay(),
            highlight_duration: settings.highlight_duration(),
        }
    }
}

struct MountedConversation {
    generation: u64,
    timeline: ConversationTimeline,
    events: broadcast::Sender<TimelineEvent>,
    loading_older: bool,
    active: bool,
}

impl MountedConversation {
    fn emit(&self, event: TimelineEvent) {
        let _ = self.events.send(event);
    }
}

struct SyncState {
    conversations: HashMap<ConversationId, MountedConversation>,
    next_generation: u64,
    receipts: ReadReceiptTracker,
}

pub struct TimelineSynchronizer {
    backend: Arc<dyn ChatBackend>,
    settings: SyncSettings,
    inner: Mutex<SyncState>,
}

fn current<'a>(
    conversations: &'a mut HashMap<ConversationId, MountedConversation>,
    conversation_id: &ConversationId,
    generation: u64,
) -> Result<&'a mut MountedConversation, SyncError> {
    match conversations.get_mut(conversation_id) {
        Some(mounted) if mounted.generation == generation => Ok(mounted),
        _ => {
            debug!(
                conversation_id = %conversation_id,
                generation,
                "timeline: discarding response for unmounted conversation"
            );
            Err(SyncError::StaleResponse(conversation_id.clone()))
        }
    }
}

fn mounted<'a>(
    conversations: &'a mut HashMap<ConversationId, MountedConversation>,
    conversation_id: &ConversationId,
) -> Result<&'a mut MountedConversation, SyncError> {
    conversations
        .get_mut(conversation_id)
        .ok_or_else(|| SyncError::NotMounted(conversation_id.clone()))
}

impl TimelineSynchronizer {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        self_id: UserId,
        settings: SyncSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            settings,
            inner: Mutex::new(SyncState {
                conversations: HashMap::new(),
                next_generation: 1,
                receipts: ReadReceiptTracker::new(self_id),
            }),
        })
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn settings(&self) -> SyncSettings {
        self.settings
    }

    /// Creates an empty timeline for the conversation and returns a
    /// subscription to its events. Mounting an already mounted conversation
    /// only adds a subscriber.
    pub async fn mount(
        &self,
        conversation_id: &ConversationId,
    ) -> broadcast::Receiver<TimelineEvent> {
        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard.conversations.get(conversation_id) {
            return existing.events.subscribe();
        }
        let generation = guard.next_generation;
        guard.next_generation += 1;
        let (events, rx) = broadcast::channel(EVENT_CAPACITY);
        guard.conversations.insert(
            conversation_id.clone(),
            MountedConversation {
                generation,
                timeline: ConversationTimeline::new(conversation_id.clone()),
                events,
                loading_older: false,
                active: false,
            },
        );
        info!(conversation_id = %conversation_id, generation, "timeline: mounted");
        rx
    }

    /// Drops the timeline and closes every subscription to it. Responses
    /// still in flight are discarded when they land.
    pub async fn unmount(&self, conversation_id: &ConversationId) -> bool {
        let removed = self
            .inner
            .lock()
            .await
            .conversations
            .remove(conversation_id);
        if let Some(removed) = &removed {
            info!(
                conversation_id = %conversation_id,
                generation = removed.generation,
                "timeline: unmounted"
            );
        }
        removed.is_some()
    }

    pub async fn is_mounted(&self, conversation_id: &ConversationId) -> bool {
        self.inner
            .lock()
            .await
            .conversations
            .contains_key(conversation_id)
    }

    pub async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<broadcast::Receiver<TimelineEvent>, SyncError> {
        let mut guard = self.inner.lock().await;
        Ok(mounted(&mut guard.conversations, conversation_id)?
            .events
            .subscribe())
    }

    async fn generation(&self, conversation_id: &ConversationId) -> Result<u64, SyncError> {
        let mut guard = self.inner.lock().await;
        Ok(mounted(&mut guard.conversations, conversation_id)?.generation)
    }

    /// Marks the conversation as the visible one, which enables read
    /// receipts for it, and runs a read pass right away.
    pub async fn set_active(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        active: bool,
    ) -> Result<(), SyncError> {
        let mut guard = self.inner.lock().await;
        mounted(&mut guard.conversations, conversation_id)?.active = active;
        if active {
            self.read_pass(&mut guard, conversation_id);
        }
        Ok(())
    }

    pub async fn get_timeline(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<TimelineSnapshot, SyncError> {
        let mut guard = self.inner.lock().await;
        Ok(mounted(&mut guard.conversations, conversation_id)?
            .timeline
            .snapshot())
    }

    pub async fn load_initial(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<TimelineSnapshot, SyncError> {
        let generation = self.generation(conversation_id).await?;
        let page = self
            .backend
            .fetch_history(conversation_id, None, self.settings.page_size)
            .await
            .map_err(SyncError::Backend)?;

        let mut guard = self.inner.lock().await;
        let conversation = current(&mut guard.conversations, conversation_id, generation)?;
        let len = conversation.timeline.replace_with_page(page);
        conversation.emit(TimelineEvent::Reset { len });
        info!(
            conversation_id = %conversation_id,
            len,
            has_more = conversation.timeline.has_more(),
            "timeline: initial page loaded"
        );
        self.read_pass(&mut guard, conversation_id);
        mounted(&mut guard.conversations, conversation_id)
            .map(|conversation| conversation.timeline.snapshot())
    }

    /// Fetches the page older than the cursor. Single-flight per
    /// conversation; a failure leaves the timeline and `has_more` untouched.
    pub async fn load_older(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<LoadOlderOutcome, SyncError> {
        let (generation, cursor) = {
            let mut guard = self.inner.lock().await;
            let conversation = mounted(&mut guard.conversations, conversation_id)?;
            let cursor = match conversation.timeline.next_cursor() {
                Some(cursor) if !conversation.loading_older => cursor.clone(),
                _ => {
                    return Ok(LoadOlderOutcome {
                        added: 0,
                        has_more: false,
                    })
                }
            };
            conversation.loading_older = true;
            (conversation.generation, cursor)
        };

        let result = self
            .backend
            .fetch_history(conversation_id, Some(&cursor), self.settings.page_size)
            .await;

        let mut guard = self.inner.lock().await;
        let conversation = current(&mut guard.conversations, conversation_id, generation)?;
        conversation.loading_older = false;
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    cursor = %cursor,
                    "timeline: older page fetch failed: {err}"
                );
                return Err(SyncError::Backend(err));
            }
        };
        let added = conversation.timeline.prepend_older(page);
        let has_more = conversation.timeline.has_more();
        conversation.emit(TimelineEvent::OlderLoaded { added, has_more });
        debug!(conversation_id = %conversation_id, added, has_more, "timeline: older page merged");
        self.read_pass(&mut guard, conversation_id);
        Ok(LoadOlderOutcome { added, has_more })
    }

    /// One poll cycle. Failures count as "nothing new" and are retried by
    /// the next tick.
    pub async fn poll_tick(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageId>, SyncError> {
        let generation = self.generation(conversation_id).await?;
        let page = match self
            .backend
            .fetch_history(conversation_id, None, self.settings.page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                debug!(conversation_id = %conversation_id, "timeline: poll skipped: {err}");
                return Ok(Vec::new());
            }
        };
        match self
            .merge_messages(conversation_id, generation, page.messages)
            .await
        {
            Err(SyncError::StaleResponse(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Idempotent merge shared by polling and push delivery.
    pub async fn merge_poll(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
    ) -> Result<Vec<MessageId>, SyncError> {
        let generation = self.generation(conversation_id).await?;
        self.merge_messages(conversation_id, generation, messages)
            .await
    }

    async fn merge_messages(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        generation: u64,
        messages: Vec<Message>,
    ) -> Result<Vec<MessageId>, SyncError> {
        let messages = messages
            .into_iter()
            .filter(|message| &message.conversation_id == conversation_id)
            .collect::<Vec<_>>();

        let mut guard = self.inner.lock().await;
        let conversation = current(&mut guard.conversations, conversation_id, generation)?;
        let inserted = conversation.timeline.merge(messages);
        if inserted.is_empty() {
            return Ok(inserted);
        }
        conversation.emit(TimelineEvent::Inserted {
            ids: inserted.clone(),
        });
        debug!(
            conversation_id = %conversation_id,
            inserted = inserted.len(),
            "timeline: merged new messages"
        );
        self.read_pass(&mut guard, conversation_id);
        Ok(inserted)
    }

    /// Appends an optimistic entry at the tail before any network call.
    pub async fn insert_optimistic(
        &self,
        conversation_id: &ConversationId,
        pending: PendingSend,
    ) -> Result<usize, SyncError> {
        let mut guard = self.inner.lock().await;
        let conversation = mounted(&mut guard.conversations, conversation_id)?;
        let temp_id = pending.temp_id().clone();
        let index = conversation.timeline.insert_optimistic(pending);
        conversation.emit(TimelineEvent::Inserted {
            ids: vec![temp_id.clone()],
        });
        debug!(conversation_id = %conversation_id, temp_id = %temp_id, index, "timeline: optimistic entry");
        Ok(index)
    }

    /// Resolves a pending entry in place: the confirmed message(s) on
    /// success, a Failed marker otherwise.
    pub async fn reconcile(
        &self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
        result: Result<Vec<Message>, String>,
    ) -> Result<usize, SyncError> {
        let generation = self.generation(conversation_id).await?;
        self.reconcile_in(conversation_id, generation, temp_id, result)
            .await
            .map(|(index, _)| index)
    }

    async fn reconcile_in(
        &self,
        conversation_id: &ConversationId,
        generation: u64,
        temp_id: &MessageId,
        result: Result<Vec<Message>, String>,
    ) -> Result<(usize, SendStatus), SyncError> {
        let mut guard = self.inner.lock().await;
        let conversation = current(&mut guard.conversations, conversation_id, generation)?;
        let (index, ids) = match result {
            Ok(messages) => conversation.timeline.reconcile_success(temp_id, messages)?,
            Err(reason) => (
                conversation.timeline.reconcile_failure(temp_id, reason)?,
                Vec::new(),
            ),
        };
        let status = conversation.timeline.entries()[index].status();
        conversation.emit(TimelineEvent::Reconciled {
            index,
            temp_id: temp_id.clone(),
            ids,
            status: status.clone(),
        });
        Ok((index, status))
    }

    /// Performs the network call for a pending entry and reconciles it.
    /// Returns the confirmed ids; a failed call leaves the entry Failed and
    /// returns the collaborator error.
    pub async fn deliver(
        &self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
        payload: &SendPayload,
    ) -> Result<Vec<MessageId>, SyncError> {
        let generation = self.generation(conversation_id).await?;
        let result = match payload {
            SendPayload::Text {
                content,
                parent_message_id,
            } => self
                .backend
                .send_text(conversation_id, content, parent_message_id.as_ref())
                .await
                .map(|message| vec![message]),
            SendPayload::Attachments {
                files,
                parent_message_id,
            } => {
                AttachmentStager::upload(
                    self.backend.as_ref(),
                    conversation_id,
                    files,
                    parent_message_id.as_ref(),
                )
                .await
            }
        };

        match result {
            Ok(messages) => {
                let ids = messages
                    .iter()
                    .map(|message| message.id.clone())
                    .collect::<Vec<_>>();
                let (_, status) = self
                    .reconcile_in(conversation_id, generation, temp_id, Ok(messages))
                    .await?;
                if let SendStatus::Failed { reason } = status {
                    return Err(SyncError::Backend(anyhow::anyhow!(reason)));
                }
                info!(conversation_id = %conversation_id, temp_id = %temp_id, "timeline: send confirmed");
                Ok(ids)
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, temp_id = %temp_id, "timeline: send failed: {err}");
                self.reconcile_in(conversation_id, generation, temp_id, Err(err.to_string()))
                    .await?;
                Err(SyncError::Backend(err))
            }
        }
    }

    /// Re-dispatches a Failed entry from the same position.
    pub async fn retry_failed(
        &self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> Result<Vec<MessageId>, SyncError> {
        let payload = {
            let mut guard = self.inner.lock().await;
            let conversation = mounted(&mut guard.conversations, conversation_id)?;
            let (index, _, payload) = conversation.timeline.begin_retry(temp_id)?;
            conversation.emit(TimelineEvent::Reconciled {
                index,
                temp_id: temp_id.clone(),
                ids: Vec::new(),
                status: SendStatus::Pending,
            });
            payload
        };
        self.deliver(conversation_id, temp_id, &payload).await
    }

    pub async fn discard_failed(
        &self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> Result<(), SyncError> {
        let mut guard = self.inner.lock().await;
        let conversation = mounted(&mut guard.conversations, conversation_id)?;
        conversation.timeline.remove_failed(temp_id)?;
        conversation.emit(TimelineEvent::Removed {
            id: temp_id.clone(),
        });
        Ok(())
    }

    /// Server-side read confirmation. Only ids present in the timeline are
    /// touched and read state never moves backwards.
    pub async fn confirm_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageId>, SyncError> {
        let mut guard = self.inner.lock().await;
        let conversation = mounted(&mut guard.conversations, conversation_id)?;
        let changed = confirm_remote(&mut conversation.timeline, message_ids);
        if !changed.is_empty() {
            conversation.emit(TimelineEvent::ReadStateChanged {
                ids: changed.clone(),
                state: ReadState::Confirmed,
            });
        }
        Ok(changed)
    }

    /// Another participant showed up: re-run the read pass over the backlog.
    pub async fn participant_joined(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), SyncError> {
        let mut guard = self.inner.lock().await;
        mounted(&mut guard.conversations, conversation_id)?;
        if guard.receipts.self_id() == user_id {
            return Ok(());
        }
        self.read_pass(&mut guard, conversation_id);
        Ok(())
    }

    /// Marks unread messages from others locally when the conversation is
    /// active, and schedules their batched remote confirmation.
    fn read_pass(self: &Arc<Self>, state: &mut SyncState, conversation_id: &ConversationId) {
        let SyncState {
            conversations,
            receipts,
            ..
        } = state;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return;
        };
        if !conversation.active {
            return;
        }
        let (marked, schedule) = receipts.mark_unread(&mut conversation.timeline);
        if marked.is_empty() {
            return;
        }
        debug!(conversation_id = %conversation_id, marked = marked.len(), "receipts: marked locally");
        conversation.emit(TimelineEvent::ReadStateChanged {
            ids: marked,
            state: ReadState::Local,
        });
        if schedule {
            self.schedule_read_flush(conversation_id.clone());
        }
    }

    fn schedule_read_flush(self: &Arc<Self>, conversation_id: ConversationId) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(sync.settings.read_confirm_delay).await;
            sync.flush_read_confirmations(&conversation_id).await;
        });
    }

    /// Sends the queued batch once. Failures are logged and dropped; the
    /// local mark stays.
    pub async fn flush_read_confirmations(&self, conversation_id: &ConversationId) -> usize {
        let batch = self.inner.lock().await.receipts.take_batch(conversation_id);
        if batch.is_empty() {
            return 0;
        }
        if let Err(err) = self.backend.mark_read(conversation_id, &batch).await {
            warn!(
                conversation_id = %conversation_id,
                ids = batch.len(),
                "receipts: remote confirmation failed: {err}"
            );
            return 0;
        }
        match self.confirm_read(conversation_id, &batch).await {
            Ok(changed) => changed.len(),
            Err(_) => 0,
        }
    }

    /// Addresses a materialized message and highlights it for the configured
    /// duration.
    pub async fn scroll_to(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<usize, SyncError> {
        let (generation, index, token) = {
            let mut guard = self.inner.lock().await;
            let conversation = mounted(&mut guard.conversations, conversation_id)?;
            let (index, token) = conversation.timeline.set_highlight(message_id)?;
            conversation.emit(TimelineEvent::Highlighted {
                id: message_id.clone(),
                index,
            });
            (conversation.generation, index, token)
        };

        let sync = Arc::clone(self);
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(sync.settings.highlight_duration).await;
            let mut guard = sync.inner.lock().await;
            let Ok(conversation) = current(&mut guard.conversations, &conversation_id, generation)
            else {
                return;
            };
            if let Some(id) = conversation.timeline.clear_highlight(token) {
                conversation.emit(TimelineEvent::HighlightCleared { id });
            }
        });

        Ok(index)
    }

    /// Scrolls to the message `message_id` replies to. The live parent id
    /// wins over the one in the denormalized summary.
    pub async fn navigate_to_parent(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<usize, SyncError> {
        let target = {
            let mut guard = self.inner.lock().await;
            let conversation = mounted(&mut guard.conversations, conversation_id)?;
            let entry = conversation
                .timeline
                .get(message_id)
                .ok_or_else(|| SyncError::NotMaterialized(message_id.clone()))?;
            resolve_target(
                entry.message.parent_message_id.as_ref(),
                entry.message.parent_message.as_deref(),
            )
            .ok_or_else(|| SyncError::NoParent(message_id.clone()))?
        };
        self.scroll_to(conversation_id, &target).await
    }

    pub async fn parent_summary(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Option<ParentSummary>, SyncError> {
        let mut guard = self.inner.lock().await;
        let conversation = mounted(&mut guard.conversations, conversation_id)?;
        let entry = conversation
            .timeline
            .get(message_id)
            .ok_or_else(|| SyncError::NotMaterialized(message_id.clone()))?;
        Ok(summary_for(&entry.message))
    }

    pub async fn search(
        &self,
        conversation_id: &ConversationId,
        query: &str,
    ) -> Result<Vec<SearchHit>, SyncError> {
        let mut guard = self.inner.lock().await;
        Ok(mounted(&mut guard.conversations, conversation_id)?
            .timeline
            .search(query))
    }
}

#[cfg(test)]
#[path = "tests/synchronizer_tests.rs"]
mod tests;
