use super::*;
use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use shared::{error::ErrorCode, protocol::MessageBody};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ServerState {
    history_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    sent: Arc<Mutex<Vec<SendTextRequest>>>,
    uploads: Arc<Mutex<Vec<(HashMap<String, String>, usize)>>>,
    read: Arc<Mutex<Vec<MarkReadRequest>>>,
}

fn server_message(conversation_id: &str, id: &str, body: MessageBody) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new("alice"),
        sent_at: Utc.timestamp_opt(1_700_000_000, 0).single().expect("timestamp"),
        body,
        parent_message_id: None,
        parent_message: None,
        is_read: false,
        reactions: Default::default(),
    }
}

async fn handle_history(
    State(state): State<ServerState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<HistoryPage> {
    let before = query.get("before").cloned();
    state.history_queries.lock().await.push(query);
    Json(HistoryPage {
        messages: vec![server_message(
            &conversation_id,
            "m1",
            MessageBody::text("hello"),
        )],
        has_more: before.is_none(),
        next_cursor: before.is_none().then(|| Cursor("m1".into())),
    })
}

async fn handle_send(
    State(state): State<ServerState>,
    Path(conversation_id): Path<String>,
    Json(request): Json<SendTextRequest>,
) -> Json<Message> {
    let mut message = server_message(
        &conversation_id,
        "srv-1",
        MessageBody::text(request.content.clone()),
    );
    message.parent_message_id = request.parent_message_id.clone();
    state.sent.lock().await.push(request);
    Json(message)
}

async fn handle_upload(
    State(state): State<ServerState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<UploadResponse>, (StatusCode, Json<ApiError>)> {
    if body.len() > 8 {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ApiError::new(ErrorCode::PayloadTooLarge, "file too large")),
        ));
    }
    let name = query.get("filename").cloned().unwrap_or_default();
    state.uploads.lock().await.push((query, body.len()));
    Ok(Json(UploadResponse {
        messages: vec![server_message(
            &conversation_id,
            &format!("upload-{name}"),
            MessageBody::File {
                attachments: Vec::new(),
            },
        )],
    }))
}

async fn handle_read(
    State(state): State<ServerState>,
    Json(request): Json<MarkReadRequest>,
) -> StatusCode {
    state.read.lock().await.push(request);
    StatusCode::NO_CONTENT
}

async fn spawn_chat_server() -> Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route(
            "/api/conversations/:id/messages",
            get(handle_history).post(handle_send),
        )
        .route("/api/conversations/:id/attachments", post(handle_upload))
        .route("/api/conversations/:id/read", post(handle_read))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api"), state))
}

fn upload(name: &str, size: usize) -> UploadFile {
    UploadFile {
        name: name.into(),
        mime_type: "application/pdf".into(),
        bytes: vec![1; size],
    }
}

#[tokio::test]
async fn fetch_history_sends_limit_and_cursor() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let backend = HttpChatBackend::new(&server_url, UserId::new("alice")).expect("backend");
    let conversation_id = ConversationId::new("conv-1");

    let newest = backend
        .fetch_history(&conversation_id, None, 20)
        .await
        .expect("newest page");
    let older = backend
        .fetch_history(&conversation_id, Some(&Cursor("m1".into())), 20)
        .await
        .expect("older page");

    assert!(newest.has_more);
    assert_eq!(newest.next_cursor, Some(Cursor("m1".into())));
    assert_eq!(newest.messages[0].conversation_id, conversation_id);
    assert!(!older.has_more);

    let queries = state.history_queries.lock().await;
    assert_eq!(queries[0].get("limit").map(String::as_str), Some("20"));
    assert_eq!(queries[0].get("user_id").map(String::as_str), Some("alice"));
    assert_eq!(queries[0].get("before"), None);
    assert_eq!(queries[1].get("before").map(String::as_str), Some("m1"));
}

#[tokio::test]
async fn send_text_posts_content_and_parent() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let backend = HttpChatBackend::new(&server_url, UserId::new("alice")).expect("backend");
    let parent = MessageId::new("m0");

    let message = backend
        .send_text(&ConversationId::new("conv-1"), "hi there", Some(&parent))
        .await
        .expect("send");

    assert_eq!(message.id, MessageId::new("srv-1"));
    assert_eq!(message.parent_message_id, Some(parent.clone()));
    let sent = state.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "hi there");
    assert_eq!(sent[0].sender_id, UserId::new("alice"));
    assert_eq!(sent[0].parent_message_id, Some(parent));
}

#[tokio::test]
async fn upload_sends_one_request_per_file() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let backend = HttpChatBackend::new(&server_url, UserId::new("alice")).expect("backend");

    let messages = backend
        .upload_attachments(
            &ConversationId::new("conv-1"),
            &[upload("a.pdf", 3), upload("b.pdf", 4)],
            None,
        )
        .await
        .expect("upload");

    assert_eq!(
        messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["upload-a.pdf", "upload-b.pdf"]
    );
    let uploads = state.uploads.lock().await;
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].1, 3);
    assert_eq!(
        uploads[1].0.get("mime_type").map(String::as_str),
        Some("application/pdf")
    );
}

#[tokio::test]
async fn api_error_body_is_surfaced() {
    let (server_url, _state) = spawn_chat_server().await.expect("spawn server");
    let backend = HttpChatBackend::new(&server_url, UserId::new("alice")).expect("backend");

    let err = backend
        .upload_attachments(&ConversationId::new("conv-1"), &[upload("big.pdf", 64)], None)
        .await
        .expect_err("rejected upload");

    let api = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api.code, ErrorCode::PayloadTooLarge);
    assert_eq!(api.message, "file too large");
}

#[tokio::test]
async fn mark_read_posts_reader_and_ids() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let backend = HttpChatBackend::new(&server_url, UserId::new("alice")).expect("backend");

    backend
        .mark_read(
            &ConversationId::new("conv-1"),
            &[MessageId::new("m1"), MessageId::new("m2")],
        )
        .await
        .expect("mark read");

    let read = state.read.lock().await;
    assert_eq!(read[0].reader_id, UserId::new("alice"));
    assert_eq!(read[0].message_ids.len(), 2);
}

#[tokio::test]
async fn missing_realtime_channel_refuses_joins() {
    let channel = MissingRealtimeChannel;

    assert!(channel.join(&ConversationId::new("conv-1")).await.is_err());
    assert!(channel.subscribe().try_recv().is_err());
}
