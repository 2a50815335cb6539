//! Per-conversation screen lifecycle: mount/unmount, poll timer, realtime
//! routing, composer wiring and send orchestration.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use futures::StreamExt;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ParentMessage, RealtimeEvent},
};
use tokio::{
    sync::{broadcast, Mutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::{
    attachments::PreviewId,
    composer::{Composer, ComposerState, Draft, SendIntent},
    config::ClientSettings,
    error::{FileRejection, HostError, SyncError},
    synchronizer::{SyncSettings, TimelineSynchronizer},
    thread::ParentSummary,
    transport::{ChatBackend, RealtimeChannel},
    types::{
        LoadOlderOutcome, Notice, PendingSend, SearchHit, SendPayload, SendReport, TimelineEvent,
        TimelineSnapshot, UploadFile,
    },
};

const NOTICE_CAPACITY: usize = 64;

struct Session {
    composer: Composer,
    poll_task: JoinHandle<()>,
    drafting: bool,
    drafting_seq: u64,
}

#[derive(Default)]
struct HostState {
    sessions: HashMap<ConversationId, Session>,
    realtime_pump: Option<JoinHandle<()>>,
}

pub struct ConversationHost {
    sync: Arc<TimelineSynchronizer>,
    realtime: Arc<dyn RealtimeChannel>,
    settings: ClientSettings,
    self_id: UserId,
    inner: Mutex<HostState>,
    /// Serializes mount and unmount per conversation.
    gates: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
    notices: broadcast::Sender<Notice>,
}

impl ConversationHost {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        realtime: Arc<dyn RealtimeChannel>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let self_id = UserId::new(settings.user_id.clone());
        let sync = TimelineSynchronizer::new(backend, self_id.clone(), SyncSettings::from(&settings));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Arc::new(Self {
            sync,
            realtime,
            settings,
            self_id,
            inner: Mutex::new(HostState::default()),
            gates: Mutex::new(HashMap::new()),
            notices,
        })
    }

    pub fn synchronizer(&self) -> &Arc<TimelineSynchronizer> {
        &self.sync
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    fn notify(&self, conversation_id: &ConversationId, text: impl Into<String>) {
        let _ = self.notices.send(Notice {
            conversation_id: conversation_id.clone(),
            text: text.into(),
        });
    }

    /// Mounts a conversation: joins the realtime channel, loads the first
    /// page and starts polling. A failed first load unmounts it again.
    pub async fn mount(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<broadcast::Receiver<TimelineEvent>, HostError> {
        let _gate = self.gate(conversation_id).await;
        if self.inner.lock().await.sessions.contains_key(conversation_id) {
            return Ok(self.sync.subscribe(conversation_id).await?);
        }

        let events = self.sync.mount(conversation_id).await;
        if let Err(err) = self.realtime.join(conversation_id).await {
            warn!(
                conversation_id = %conversation_id,
                "host: realtime join failed, relying on polling: {err}"
            );
        }
        self.sync.set_active(conversation_id, true).await?;

        if let Err(err) = self.sync.load_initial(conversation_id).await {
            warn!(conversation_id = %conversation_id, "host: initial load failed: {err}");
            self.teardown(conversation_id).await;
            return Err(err.into());
        }

        let poll_task = self.spawn_poller(conversation_id.clone());
        let mut guard = self.inner.lock().await;
        let replaced = guard.sessions.insert(
            conversation_id.clone(),
            Session {
                composer: Composer::new(conversation_id.clone(), self.settings.limits.clone()),
                poll_task,
                drafting: false,
                drafting_seq: 0,
            },
        );
        if let Some(stale) = replaced {
            stale.poll_task.abort();
        }
        if guard.realtime_pump.is_none() {
            guard.realtime_pump = Some(self.spawn_realtime_pump());
        }
        info!(conversation_id = %conversation_id, "host: conversation mounted");
        Ok(events)
    }

    /// Stops polling, signals leave, releases the draft's previews and drops
    /// the timeline.
    pub async fn unmount(&self, conversation_id: &ConversationId) -> bool {
        let _gate = self.gate(conversation_id).await;
        let session = self.inner.lock().await.sessions.remove(conversation_id);
        let Some(mut session) = session else {
            return false;
        };
        session.poll_task.abort();
        session.composer.clear();
        self.teardown(conversation_id).await;
        info!(conversation_id = %conversation_id, "host: conversation unmounted");
        true
    }

    async fn gate(&self, conversation_id: &ConversationId) -> OwnedMutexGuard<()> {
        let gate = Arc::clone(
            self.gates
                .lock()
                .await
                .entry(conversation_id.clone())
                .or_default(),
        );
        gate.lock_owned().await
    }

    async fn teardown(&self, conversation_id: &ConversationId) {
        if let Err(err) = self.realtime.leave(conversation_id).await {
            debug!(conversation_id = %conversation_id, "host: realtime leave failed: {err}");
        }
        self.sync.unmount(conversation_id).await;
    }

    /// Unmounts everything and stops the realtime pump.
    pub async fn shutdown(&self) {
        let ids = {
            let mut guard = self.inner.lock().await;
            if let Some(pump) = guard.realtime_pump.take() {
                pump.abort();
            }
            guard.sessions.keys().cloned().collect::<Vec<_>>()
        };
        for conversation_id in ids {
            self.unmount(&conversation_id).await;
        }
    }

    fn spawn_poller(&self, conversation_id: ConversationId) -> JoinHandle<()> {
        let sync = Arc::clone(&self.sync);
        let period = self.settings.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match sync.poll_tick(&conversation_id).await {
                    Ok(inserted) if !inserted.is_empty() => {
                        debug!(
                            conversation_id = %conversation_id,
                            inserted = inserted.len(),
                            "host: poll delivered messages"
                        );
                    }
                    Ok(_) => {}
                    Err(SyncError::NotMounted(_)) => break,
                    Err(err) => debug!(conversation_id = %conversation_id, "host: poll error: {err}"),
                }
            }
        })
    }

    fn spawn_realtime_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let host = Arc::downgrade(self);
        let mut events = BroadcastStream::new(self.realtime.subscribe());
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("host: realtime stream {err}, polling will catch up");
                        continue;
                    }
                };
                let Some(host) = Weak::upgrade(&host) else {
                    break;
                };
                host.handle_realtime(event).await;
            }
        })
    }

    /// Routes a realtime hint. Hints for conversations that are not mounted,
    /// or whose payload disagrees with the envelope, are dropped.
    pub async fn handle_realtime(self: &Arc<Self>, event: RealtimeEvent) {
        let conversation_id = event.conversation_id().clone();
        let result = match event {
            RealtimeEvent::NewMessage {
                conversation_id,
                message,
                is_from_self,
            } => {
                if message.conversation_id != conversation_id {
                    warn!(
                        conversation_id = %conversation_id,
                        message_id = %message.id,
                        "host: realtime message for another conversation ignored"
                    );
                    return;
                }
                debug!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    is_from_self,
                    "host: realtime message"
                );
                self.sync
                    .merge_poll(&conversation_id, vec![message])
                    .await
                    .map(|_| ())
            }
            RealtimeEvent::MessagesMarkedAsRead {
                conversation_id,
                message_ids,
            } => self
                .sync
                .confirm_read(&conversation_id, &message_ids)
                .await
                .map(|_| ()),
            RealtimeEvent::ParticipantJoined {
                conversation_id,
                user_id,
            } => {
                self.sync
                    .participant_joined(&conversation_id, &user_id)
                    .await
            }
        };
        if let Err(err) = result {
            debug!(conversation_id = %conversation_id, "host: realtime hint dropped: {err}");
        }
    }

    /// Visibility drives read receipts: only a visible conversation marks
    /// incoming messages as read.
    pub async fn set_visible(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        visible: bool,
    ) -> Result<(), HostError> {
        Ok(self.sync.set_active(conversation_id, visible).await?)
    }

    pub async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<broadcast::Receiver<TimelineEvent>, HostError> {
        Ok(self.sync.subscribe(conversation_id).await?)
    }

    pub async fn parent_summary(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Option<ParentSummary>, HostError> {
        Ok(self.sync.parent_summary(conversation_id, message_id).await?)
    }

    async fn with_composer<T>(
        &self,
        conversation_id: &ConversationId,
        f: impl FnOnce(&mut Composer) -> T,
    ) -> Result<T, HostError> {
        let mut guard = self.inner.lock().await;
        let session = guard
            .sessions
            .get_mut(conversation_id)
            .ok_or_else(|| HostError::NotMounted(conversation_id.clone()))?;
        Ok(f(&mut session.composer))
    }

    pub async fn draft(&self, conversation_id: &ConversationId) -> Result<Draft, HostError> {
        self.with_composer(conversation_id, |composer| composer.draft().clone())
            .await
    }

    pub async fn composer_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ComposerState, HostError> {
        self.with_composer(conversation_id, |composer| composer.state())
            .await
    }

    pub async fn live_previews(&self, conversation_id: &ConversationId) -> Result<usize, HostError> {
        self.with_composer(conversation_id, |composer| composer.stager().live_previews())
            .await
    }

    pub async fn set_text(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        text: impl Into<String>,
    ) -> Result<(), HostError> {
        let text = text.into();
        self.with_composer(conversation_id, |composer| composer.set_text(text))
            .await??;
        self.note_drafting(conversation_id).await;
        Ok(())
    }

    pub async fn add_files(
        &self,
        conversation_id: &ConversationId,
        files: Vec<UploadFile>,
    ) -> Result<Vec<FileRejection>, HostError> {
        let rejections = self
            .with_composer(conversation_id, |composer| composer.add_files(files))
            .await??;
        if !rejections.is_empty() {
            let names = rejections
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            self.notify(conversation_id, format!("Some files were not attached: {names}"));
        }
        Ok(rejections)
    }

    pub async fn remove_attachment(
        &self,
        conversation_id: &ConversationId,
        preview_id: &PreviewId,
    ) -> Result<bool, HostError> {
        self.with_composer(conversation_id, |composer| composer.remove_attachment(preview_id))
            .await
    }

    /// Sets the reply target from a message currently in the timeline.
    pub async fn reply_to(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), HostError> {
        let snapshot = self.sync.get_timeline(conversation_id).await?;
        let entry = snapshot
            .entries
            .iter()
            .find(|entry| entry.id() == message_id)
            .ok_or_else(|| SyncError::NotMaterialized(message_id.clone()))?;
        let parent = ParentMessage {
            id: entry.message.id.clone(),
            sender_id: entry.message.sender_id.clone(),
            body: entry.message.body.clone(),
        };
        self.with_composer(conversation_id, |composer| composer.set_reply_target(parent))
            .await
    }

    pub async fn clear_reply_target(&self, conversation_id: &ConversationId) -> Result<(), HostError> {
        self.with_composer(conversation_id, Composer::clear_reply_target)
            .await
    }

    pub async fn clear_draft(&self, conversation_id: &ConversationId) -> Result<(), HostError> {
        self.with_composer(conversation_id, Composer::clear).await
    }

    /// Sends the current draft. Attachments go first, then the text as a
    /// separate message; both are attempted whatever the other's outcome.
    /// Failed parts are restored into the draft and reported in one notice.
    pub async fn send(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<SendReport, HostError> {
        let intent = self
            .with_composer(conversation_id, Composer::take_intent)
            .await??;
        self.stop_drafting(conversation_id).await;

        let report = self.dispatch_intent(conversation_id, &intent).await;

        let settled = self
            .with_composer(conversation_id, |composer| composer.finish(intent, &report))
            .await;
        match settled {
            Ok(result) => result?,
            Err(HostError::NotMounted(_)) => {
                debug!(conversation_id = %conversation_id, "host: send settled after unmount");
            }
            Err(err) => return Err(err),
        }

        if !report.is_success() {
            let mut failed = Vec::new();
            if let Some(Err(reason)) = &report.attachments {
                failed.push(format!("attachments ({reason})"));
            }
            if let Some(Err(reason)) = &report.text {
                failed.push(format!("text ({reason})"));
            }
            self.notify(
                conversation_id,
                format!("Message not sent: {}", failed.join(", ")),
            );
        }
        Ok(report)
    }

    async fn dispatch_intent(
        &self,
        conversation_id: &ConversationId,
        intent: &SendIntent,
    ) -> SendReport {
        let attachments = (!intent.attachments.is_empty()).then(|| {
            PendingSend::attachments(
                conversation_id.clone(),
                self.self_id.clone(),
                intent.draft_id,
                intent
                    .attachments
                    .iter()
                    .map(|staged| (staged.file.clone(), staged.preview_url.clone()))
                    .collect(),
                intent.reply_to.clone(),
            )
        });
        let text = intent.text.as_ref().map(|content| {
            PendingSend::text(
                conversation_id.clone(),
                self.self_id.clone(),
                intent.draft_id,
                content.clone(),
                intent.reply_to.clone(),
            )
        });

        let attachments = match attachments {
            Some(pending) => Some(self.stage_pending(conversation_id, pending).await),
            None => None,
        };
        let text = match text {
            Some(pending) => Some(self.stage_pending(conversation_id, pending).await),
            None => None,
        };

        let mut report = SendReport::default();
        if let Some(staged) = attachments {
            report.attachments = Some(self.deliver_staged(conversation_id, staged).await);
        }
        if let Some(staged) = text {
            report.text = Some(
                self.deliver_staged(conversation_id, staged)
                    .await
                    .and_then(|ids| {
                        ids.into_iter()
                            .next()
                            .ok_or_else(|| "server returned no message".to_string())
                    }),
            );
        }
        report
    }

    async fn stage_pending(
        &self,
        conversation_id: &ConversationId,
        pending: PendingSend,
    ) -> Result<(MessageId, SendPayload), String> {
        let temp_id = pending.temp_id().clone();
        let payload = pending.payload.clone();
        self.sync
            .insert_optimistic(conversation_id, pending)
            .await
            .map(|_| (temp_id, payload))
            .map_err(|err| err.to_string())
    }

    async fn deliver_staged(
        &self,
        conversation_id: &ConversationId,
        staged: Result<(MessageId, SendPayload), String>,
    ) -> Result<Vec<MessageId>, String> {
        let (temp_id, payload) = staged?;
        self.sync
            .deliver(conversation_id, &temp_id, &payload)
            .await
            .map_err(|err| err.to_string())
    }

    pub async fn retry_failed(
        &self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> Result<Vec<MessageId>, HostError> {
        match self.sync.retry_failed(conversation_id, temp_id).await {
            Ok(ids) => Ok(ids),
            Err(err @ SyncError::Backend(_)) => {
                self.notify(conversation_id, format!("Message not sent: {err}"));
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn discard_failed(
        &self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> Result<(), HostError> {
        Ok(self.sync.discard_failed(conversation_id, temp_id).await?)
    }

    pub async fn get_timeline(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<TimelineSnapshot, HostError> {
        Ok(self.sync.get_timeline(conversation_id).await?)
    }

    pub async fn load_older(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<LoadOlderOutcome, HostError> {
        Ok(self.sync.load_older(conversation_id).await?)
    }

    pub async fn scroll_to(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<usize, HostError> {
        Ok(self.sync.scroll_to(conversation_id, message_id).await?)
    }

    pub async fn navigate_to_parent(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<usize, HostError> {
        Ok(self
            .sync
            .navigate_to_parent(conversation_id, message_id)
            .await?)
    }

    pub async fn search(
        &self,
        conversation_id: &ConversationId,
        query: &str,
    ) -> Result<Vec<SearchHit>, HostError> {
        Ok(self.sync.search(conversation_id, query).await?)
    }

    /// Emits `drafting = true` on the first edit and `false` once edits stop
    /// for the configured idle delay.
    async fn note_drafting(self: &Arc<Self>, conversation_id: &ConversationId) {
        let (start, seq) = {
            let mut guard = self.inner.lock().await;
            let Some(session) = guard.sessions.get_mut(conversation_id) else {
                return;
            };
            session.drafting_seq += 1;
            let start = !session.drafting;
            session.drafting = true;
            (start, session.drafting_seq)
        };
        if start {
            self.signal_drafting(conversation_id, true).await;
        }

        let host = Arc::downgrade(self);
        let idle = self.settings.drafting_idle();
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(host) = Weak::upgrade(&host) else {
                return;
            };
            let expired = {
                let mut guard = host.inner.lock().await;
                match guard.sessions.get_mut(&conversation_id) {
                    Some(session) if session.drafting && session.drafting_seq == seq => {
                        session.drafting = false;
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                host.signal_drafting(&conversation_id, false).await;
            }
        });
    }

    async fn stop_drafting(&self, conversation_id: &ConversationId) {
        let was_drafting = {
            let mut guard = self.inner.lock().await;
            let Some(session) = guard.sessions.get_mut(conversation_id) else {
                return;
            };
            session.drafting_seq += 1;
            std::mem::replace(&mut session.drafting, false)
        };
        if was_drafting {
            self.signal_drafting(conversation_id, false).await;
        }
    }

    async fn signal_drafting(&self, conversation_id: &ConversationId, drafting: bool) {
        if let Err(err) = self.realtime.set_drafting(conversation_id, drafting).await {
            debug!(conversation_id = %conversation_id, drafting, "host: drafting signal failed: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/host_tests.rs"]
mod tests;
