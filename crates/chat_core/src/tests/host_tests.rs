use super::*;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::Cursor,
    protocol::{HistoryPage, Message, MessageBody},
};

use crate::{
    composer::ComposerState,
    types::{SendStatus, UploadFile},
};

#[derive(Default)]
struct ScriptedBackend {
    store: Mutex<Vec<Message>>,
    calls: Mutex<Vec<String>>,
    fail_fetch: Mutex<bool>,
    fail_send: Mutex<bool>,
    fail_text: Mutex<bool>,
    fetches: AtomicUsize,
}

impl ScriptedBackend {
    async fn seed(&self, messages: impl IntoIterator<Item = Message>) {
        self.store.lock().await.extend(messages);
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        _before: Option<&Cursor>,
        page_size: u32,
    ) -> Result<HistoryPage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if *self.fail_fetch.lock().await {
            return Err(anyhow!("history unavailable"));
        }
        let mut messages = self
            .store
            .lock()
            .await
            .iter()
            .filter(|message| &message.conversation_id == conversation_id)
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
        messages.truncate(page_size as usize);
        Ok(HistoryPage {
            messages,
            has_more: false,
            next_cursor: None,
        })
    }

    async fn send_text(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        parent_message_id: Option<&MessageId>,
    ) -> Result<Message> {
        let parent = parent_message_id.map_or("-", MessageId::as_str);
        self.calls
            .lock()
            .await
            .push(format!("send:{content}:{parent}"));
        if *self.fail_send.lock().await || *self.fail_text.lock().await {
            return Err(anyhow!("offline"));
        }
        let mut message = remote(conversation_id.as_str(), "srv-text", "alice", 50, content);
        message.parent_message_id = parent_message_id.cloned();
        Ok(message)
    }

    async fn upload_attachments(
        &self,
        conversation_id: &ConversationId,
        files: &[UploadFile],
        parent_message_id: Option<&MessageId>,
    ) -> Result<Vec<Message>> {
        let parent = parent_message_id.map_or("-", MessageId::as_str);
        self.calls
            .lock()
            .await
            .push(format!("upload:{}:{parent}", files.len()));
        if *self.fail_send.lock().await {
            return Err(anyhow!("offline"));
        }
        let mut message = remote(conversation_id.as_str(), "srv-upload", "alice", 40, "");
        message.body = MessageBody::Image {
            attachments: Vec::new(),
        };
        Ok(vec![message])
    }

    async fn mark_read(
        &self,
        _conversation_id: &ConversationId,
        _message_ids: &[MessageId],
    ) -> Result<()> {
        Ok(())
    }
}

struct RecordingRealtime {
    events: broadcast::Sender<RealtimeEvent>,
    log: Mutex<Vec<String>>,
}

impl RecordingRealtime {
    fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            events,
            log: Mutex::new(Vec::new()),
        }
    }

    async fn log(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl RealtimeChannel for RecordingRealtime {
    async fn join(&self, conversation_id: &ConversationId) -> Result<()> {
        self.log.lock().await.push(format!("join:{conversation_id}"));
        Ok(())
    }

    async fn leave(&self, conversation_id: &ConversationId) -> Result<()> {
        self.log.lock().await.push(format!("leave:{conversation_id}"));
        Ok(())
    }

    async fn set_drafting(&self, _conversation_id: &ConversationId, drafting: bool) -> Result<()> {
        self.log.lock().await.push(format!("drafting:{drafting}"));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }
}

fn conversation() -> ConversationId {
    ConversationId::new("conv-1")
}

fn remote(conversation_id: &str, id: &str, sender: &str, seconds: i64, text: &str) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new(sender),
        sent_at: Utc
            .timestamp_opt(1_700_000_000 + seconds, 0)
            .single()
            .expect("timestamp"),
        body: MessageBody::text(text),
        parent_message_id: None,
        parent_message: None,
        is_read: false,
        reactions: Default::default(),
    }
}

fn photo() -> UploadFile {
    UploadFile {
        name: "photo.png".into(),
        mime_type: "image/png".into(),
        bytes: vec![1, 2, 3],
    }
}

fn host_with(
    backend: &Arc<ScriptedBackend>,
    realtime: &Arc<RecordingRealtime>,
) -> Arc<ConversationHost> {
    let settings = ClientSettings {
        user_id: "alice".into(),
        ..ClientSettings::default()
    };
    ConversationHost::new(
        Arc::clone(backend) as Arc<dyn ChatBackend>,
        Arc::clone(realtime) as Arc<dyn RealtimeChannel>,
        settings,
    )
}

async fn mounted_host() -> (
    Arc<ConversationHost>,
    Arc<ScriptedBackend>,
    Arc<RecordingRealtime>,
) {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .seed([
            remote("conv-1", "m1", "bob", 1, "first"),
            remote("conv-1", "m2", "bob", 2, "second"),
        ])
        .await;
    let realtime = Arc::new(RecordingRealtime::new());
    let host = host_with(&backend, &realtime);
    host.mount(&conversation()).await.expect("mount");
    (host, backend, realtime)
}

#[tokio::test]
async fn mount_loads_history_and_unmount_tears_down() {
    let (host, _backend, realtime) = mounted_host().await;

    let timeline = host.get_timeline(&conversation()).await.expect("timeline");
    assert_eq!(timeline.ids(), vec![MessageId::new("m1"), MessageId::new("m2")]);

    assert!(host.unmount(&conversation()).await);
    assert!(!host.unmount(&conversation()).await);
    assert_eq!(realtime.log().await, vec!["join:conv-1", "leave:conv-1"]);
    assert!(matches!(
        host.get_timeline(&conversation()).await,
        Err(HostError::Sync(SyncError::NotMounted(_)))
    ));
    assert!(matches!(
        host.draft(&conversation()).await,
        Err(HostError::NotMounted(_))
    ));
}

#[tokio::test]
async fn failed_initial_load_leaves_nothing_mounted() {
    let backend = Arc::new(ScriptedBackend::default());
    *backend.fail_fetch.lock().await = true;
    let realtime = Arc::new(RecordingRealtime::new());
    let host = host_with(&backend, &realtime);

    let err = host.mount(&conversation()).await.expect_err("mount fails");

    assert!(matches!(err, HostError::Sync(SyncError::Backend(_))));
    assert!(!host.synchronizer().is_mounted(&conversation()).await);
    assert_eq!(realtime.log().await, vec!["join:conv-1", "leave:conv-1"]);
}

#[tokio::test]
async fn send_uploads_attachments_before_text_as_replies() {
    let (host, backend, _realtime) = mounted_host().await;
    host.set_text(&conversation(), "look at this")
        .await
        .expect("text");
    host.add_files(&conversation(), vec![photo()])
        .await
        .expect("files");
    host.reply_to(&conversation(), &MessageId::new("m1"))
        .await
        .expect("reply");

    let report = host.send(&conversation()).await.expect("send");

    assert!(report.is_success());
    assert_eq!(
        report.attachments,
        Some(Ok(vec![MessageId::new("srv-upload")]))
    );
    assert_eq!(report.text, Some(Ok(MessageId::new("srv-text"))));
    assert_eq!(
        *backend.calls.lock().await,
        vec!["upload:1:m1", "send:look at this:m1"]
    );

    let timeline = host.get_timeline(&conversation()).await.expect("timeline");
    assert_eq!(
        timeline.ids(),
        vec![
            MessageId::new("m1"),
            MessageId::new("m2"),
            MessageId::new("srv-upload"),
            MessageId::new("srv-text"),
        ]
    );

    let draft = host.draft(&conversation()).await.expect("draft");
    assert!(!draft.has_content());
    assert_eq!(draft.reply_to, None);
    assert_eq!(host.live_previews(&conversation()).await.expect("previews"), 0);
    assert_eq!(
        host.composer_state(&conversation()).await.expect("state"),
        ComposerState::Idle
    );
}

#[tokio::test]
async fn failed_send_restores_draft_and_notifies_once() {
    let (host, backend, _realtime) = mounted_host().await;
    let mut notices = host.subscribe_notices();
    host.set_text(&conversation(), "hello").await.expect("text");
    host.add_files(&conversation(), vec![photo()])
        .await
        .expect("files");
    host.reply_to(&conversation(), &MessageId::new("m2"))
        .await
        .expect("reply");
    let draft_id = host.draft(&conversation()).await.expect("draft").id;
    *backend.fail_send.lock().await = true;

    let report = host.send(&conversation()).await.expect("send settles");

    assert!(report.attachments_failed());
    assert!(report.text_failed());
    let notice = notices.try_recv().expect("notice");
    assert!(notice.text.starts_with("Message not sent"));
    assert!(notices.try_recv().is_err());

    let draft = host.draft(&conversation()).await.expect("draft");
    assert_eq!(draft.id, draft_id);
    assert_eq!(draft.text, "hello");
    assert_eq!(draft.attachments.len(), 1);
    assert_eq!(draft.reply_to.map(|parent| parent.id), Some(MessageId::new("m2")));
    assert_eq!(host.live_previews(&conversation()).await.expect("previews"), 1);

    let timeline = host.get_timeline(&conversation()).await.expect("timeline");
    let failed = timeline
        .entries
        .iter()
        .filter(|entry| entry.status().is_failed())
        .map(|entry| entry.id().clone())
        .collect::<Vec<_>>();
    assert_eq!(failed.len(), 2);

    *backend.fail_send.lock().await = false;
    let confirmed = host
        .retry_failed(&conversation(), &failed[1])
        .await
        .expect("retry");
    assert_eq!(confirmed, vec![MessageId::new("srv-text")]);
    let timeline = host.get_timeline(&conversation()).await.expect("timeline");
    assert_eq!(timeline.entries[3].status(), SendStatus::Confirmed);
}

#[tokio::test]
async fn failed_text_keeps_uploaded_images_visible() {
    let (host, backend, _realtime) = mounted_host().await;
    host.set_text(&conversation(), "caption").await.expect("text");
    host.add_files(&conversation(), vec![photo(), photo()])
        .await
        .expect("files");
    *backend.fail_text.lock().await = true;

    let report = host.send(&conversation()).await.expect("send settles");

    assert!(!report.attachments_failed());
    assert!(report.text_failed());
    let timeline = host.get_timeline(&conversation()).await.expect("timeline");
    assert_eq!(timeline.entries[2].id(), &MessageId::new("srv-upload"));
    assert_eq!(timeline.entries[2].status(), SendStatus::Confirmed);
    assert!(timeline.entries[3].status().is_failed());

    let draft = host.draft(&conversation()).await.expect("draft");
    assert_eq!(draft.text, "caption");
    assert!(draft.attachments.is_empty());
    assert_eq!(host.live_previews(&conversation()).await.expect("previews"), 0);
    assert_eq!(
        host.composer_state(&conversation()).await.expect("state"),
        ComposerState::Drafting
    );
}

#[tokio::test]
async fn empty_draft_is_not_sent() {
    let (host, backend, _realtime) = mounted_host().await;

    let err = host.send(&conversation()).await.expect_err("empty");

    assert!(matches!(
        err,
        HostError::Composer(crate::error::ComposerError::EmptyDraft)
    ));
    assert!(backend.calls.lock().await.is_empty());
}

#[tokio::test]
async fn rejected_files_produce_a_single_notice() {
    let (host, _backend, _realtime) = mounted_host().await;
    let mut notices = host.subscribe_notices();
    let empty = UploadFile {
        name: "empty.txt".into(),
        mime_type: "text/plain".into(),
        bytes: Vec::new(),
    };

    let rejections = host
        .add_files(&conversation(), vec![photo(), empty])
        .await
        .expect("files");

    assert_eq!(rejections.len(), 1);
    let notice = notices.try_recv().expect("notice");
    assert!(notice.text.contains("empty.txt"));
    assert_eq!(host.live_previews(&conversation()).await.expect("previews"), 1);
}

#[tokio::test]
async fn realtime_hints_are_routed_and_validated() {
    let (host, _backend, _realtime) = mounted_host().await;

    host.handle_realtime(RealtimeEvent::NewMessage {
        conversation_id: conversation(),
        message: remote("conv-1", "m3", "bob", 3, "pushed"),
        is_from_self: false,
    })
    .await;
    host.handle_realtime(RealtimeEvent::NewMessage {
        conversation_id: conversation(),
        message: remote("conv-2", "x1", "bob", 4, "misrouted"),
        is_from_self: false,
    })
    .await;
    host.handle_realtime(RealtimeEvent::NewMessage {
        conversation_id: ConversationId::new("conv-9"),
        message: remote("conv-9", "y1", "bob", 5, "not mounted"),
        is_from_self: false,
    })
    .await;
    host.handle_realtime(RealtimeEvent::MessagesMarkedAsRead {
        conversation_id: conversation(),
        message_ids: vec![MessageId::new("m1")],
    })
    .await;

    let timeline = host.get_timeline(&conversation()).await.expect("timeline");
    assert_eq!(
        timeline.ids(),
        vec![
            MessageId::new("m1"),
            MessageId::new("m2"),
            MessageId::new("m3"),
        ]
    );
    assert!(timeline.entries[0].read.is_read());
}

#[tokio::test]
async fn realtime_pump_delivers_pushed_messages() {
    let (host, _backend, realtime) = mounted_host().await;

    realtime
        .events
        .send(RealtimeEvent::NewMessage {
            conversation_id: conversation(),
            message: remote("conv-1", "m3", "bob", 3, "pushed"),
            is_from_self: false,
        })
        .expect("pump subscribed");

    let mut delivered = false;
    for _ in 0..100 {
        let timeline = host.get_timeline(&conversation()).await.expect("timeline");
        if timeline.entries.len() == 3 {
            delivered = true;
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(delivered);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn drafting_signal_is_debounced() {
    let (host, _backend, realtime) = mounted_host().await;

    host.set_text(&conversation(), "h").await.expect("text");
    tokio::time::sleep(Duration::from_secs(1)).await;
    host.set_text(&conversation(), "he").await.expect("text");
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(realtime.log().await, vec!["join:conv-1", "drafting:true"]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        realtime.log().await,
        vec!["join:conv-1", "drafting:true", "drafting:false"]
    );
}

#[tokio::test(start_paused = true)]
async fn poll_timer_picks_up_new_messages() {
    let (host, backend, _realtime) = mounted_host().await;
    backend
        .seed([remote("conv-1", "m3", "bob", 3, "polled")])
        .await;

    tokio::time::sleep(Duration::from_millis(5100)).await;

    let timeline = host.get_timeline(&conversation()).await.expect("timeline");
    assert_eq!(timeline.entries.len(), 3);
    host.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_mounts_share_one_poller() {
    let backend = Arc::new(ScriptedBackend::default());
    let realtime = Arc::new(RecordingRealtime::new());
    let host = host_with(&backend, &realtime);

    let (conv_a, conv_b) = (conversation(), conversation());
    let (first, second) = tokio::join!(host.mount(&conv_a), host.mount(&conv_b));
    first.expect("first mount");
    second.expect("second mount");
    assert_eq!(realtime.log().await, vec!["join:conv-1"]);

    assert!(host.unmount(&conversation()).await);
    host.mount(&conversation()).await.expect("remount");
    assert_eq!(
        realtime.log().await,
        vec!["join:conv-1", "leave:conv-1", "join:conv-1"]
    );

    let before = backend.fetches();
    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(backend.fetches() - before, 3);

    assert!(host.unmount(&conversation()).await);
    let after_unmount = backend.fetches();
    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(backend.fetches(), after_unmount);
    host.shutdown().await;
}

#[tokio::test]
async fn confirmed_upload_releases_file_bytes() {
    let (host, _backend, _realtime) = mounted_host().await;
    let large = UploadFile {
        name: "large.png".into(),
        mime_type: "image/png".into(),
        bytes: vec![0; 1_000_000],
    };
    host.add_files(&conversation(), vec![large])
        .await
        .expect("files");

    let report = host.send(&conversation()).await.expect("send");
    assert!(report.is_success());

    let timeline = host.get_timeline(&conversation()).await.expect("timeline");
    let retained = timeline
        .entries
        .iter()
        .filter_map(|entry| entry.local.as_ref())
        .filter_map(|local| match &local.payload {
            Some(SendPayload::Attachments { files, .. }) => {
                Some(files.iter().map(|file| file.bytes.len()).sum::<usize>())
            }
            _ => None,
        })
        .sum::<usize>();
    assert_eq!(retained, 0);
    assert!(timeline.entries[2].is_pinned());
}
