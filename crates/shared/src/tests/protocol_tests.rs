use super::*;

#[test]
fn decodes_tagged_realtime_event_with_nested_body() {
    let raw = r#"{
        "type": "new_message",
        "payload": {
            "conversation_id": "c1",
            "is_from_self": false,
            "message": {
                "id": "m9",
                "conversation_id": "c1",
                "sender_id": "u2",
                "sent_at": "2024-05-01T10:00:00Z",
                "body": { "type": "image", "attachments": [] }
            }
        }
    }"#;

    let event: RealtimeEvent = serde_json::from_str(raw).expect("decode event");
    let RealtimeEvent::NewMessage { message, .. } = event else {
        panic!("unexpected variant");
    };
    assert_eq!(message.kind(), MessageKind::Image);
    assert!(!message.is_read);
    assert!(message.reactions.is_empty());
}

#[test]
fn text_body_without_content_decodes_as_none() {
    let body: MessageBody = serde_json::from_str(r#"{"type":"text"}"#).expect("decode");
    assert_eq!(
        body,
        MessageBody::Text {
            content: None,
            attachments: Vec::new()
        }
    );
    assert_eq!(body.text_content(), None);
}
