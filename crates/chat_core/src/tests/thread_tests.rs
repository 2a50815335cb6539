use super::*;
use shared::{domain::AttachmentId, protocol::AttachmentRef};

fn attachment(name: &str, mime_type: &str) -> AttachmentRef {
    AttachmentRef {
        id: AttachmentId::new(name),
        url: format!("https://cdn.example/{name}"),
        name: name.into(),
        size_bytes: 42,
        mime_type: mime_type.into(),
    }
}

fn parent(body: MessageBody) -> ParentMessage {
    ParentMessage {
        id: MessageId::new("parent"),
        sender_id: UserId::new("bob"),
        body,
    }
}

#[test]
fn image_parent_uses_image_label() {
    let summary = resolve_parent_summary(&parent(MessageBody::Image {
        attachments: vec![attachment("cat.png", "image/png")],
    }));

    assert_eq!(summary.label, IMAGE_LABEL);
    assert_eq!(summary.kind, MessageKind::Image);
    assert_eq!(summary.message_id, MessageId::new("parent"));
}

#[test]
fn file_parent_uses_file_label() {
    let summary = resolve_parent_summary(&parent(MessageBody::File {
        attachments: vec![attachment("report.pdf", "application/pdf")],
    }));

    assert_eq!(summary.label, FILE_LABEL);
}

#[test]
fn text_parent_is_trimmed() {
    let summary = resolve_parent_summary(&parent(MessageBody::text("  see you soon  ")));

    assert_eq!(summary.label, "see you soon");
}

#[test]
fn text_parent_without_content_falls_back_by_attachments() {
    let empty = resolve_parent_summary(&parent(MessageBody::Text {
        content: None,
        attachments: Vec::new(),
    }));
    let blank = resolve_parent_summary(&parent(MessageBody::Text {
        content: Some("   ".into()),
        attachments: Vec::new(),
    }));
    let images = resolve_parent_summary(&parent(MessageBody::Text {
        content: None,
        attachments: vec![attachment("a.jpg", "image/jpeg")],
    }));
    let mixed = resolve_parent_summary(&parent(MessageBody::Text {
        content: Some(String::new()),
        attachments: vec![
            attachment("a.jpg", "image/jpeg"),
            attachment("b.zip", "application/zip"),
        ],
    }));

    assert_eq!(empty.label, EMPTY_LABEL);
    assert_eq!(blank.label, EMPTY_LABEL);
    assert_eq!(images.label, IMAGE_LABEL);
    assert_eq!(mixed.label, FILE_LABEL);
}

#[test]
fn long_snippets_are_truncated_on_char_boundaries() {
    let long = "ấ".repeat(SNIPPET_MAX_CHARS + 5);

    let summary = resolve_parent_summary(&parent(MessageBody::text(long)));

    assert!(summary.label.ends_with("..."));
    assert_eq!(summary.label.chars().count(), SNIPPET_MAX_CHARS + 3);
}

#[test]
fn system_and_poll_parents_are_never_blank() {
    let system = resolve_parent_summary(&parent(MessageBody::System {
        content: " ".into(),
    }));
    let poll = resolve_parent_summary(&parent(MessageBody::Poll {
        question: "Lunch?".into(),
        options: vec!["pho".into(), "bun cha".into()],
    }));
    let untitled_poll = resolve_parent_summary(&parent(MessageBody::Poll {
        question: String::new(),
        options: Vec::new(),
    }));

    assert_eq!(system.label, EMPTY_LABEL);
    assert_eq!(poll.label, format!("{POLL_LABEL}: Lunch?"));
    assert_eq!(untitled_poll.label, POLL_LABEL);
}

#[test]
fn explicit_parent_id_wins_over_embedded_summary() {
    let stale = parent(MessageBody::text("old"));
    let explicit = MessageId::new("fresh");

    assert_eq!(
        resolve_target(Some(&explicit), Some(&stale)),
        Some(MessageId::new("fresh"))
    );
    assert_eq!(
        resolve_target(None, Some(&stale)),
        Some(MessageId::new("parent"))
    );
    assert_eq!(resolve_target(None, None), None);
}
