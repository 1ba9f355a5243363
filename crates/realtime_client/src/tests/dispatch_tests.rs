use super::*;

use std::sync::Mutex;

use serde_json::json;
use shared::{
    domain::MessageId,
    protocol::{MessageStatus, ThreadMessage},
};

fn new_message_data() -> FrameData {
    FrameData::Encoded(
        json!({
            "message": {
                "id": 901,
                "text": "see you at six",
                "senderId": "7",
                "timestamp": "2026-03-02T18:00:00Z",
                "status": "delivered"
            },
            "threadId": "44"
        })
        .to_string(),
    )
}

#[test]
fn decodes_new_message_from_string_encoded_payload() {
    let event = decode_thread_event("new_message", Some(&new_message_data()))
        .expect("decode")
        .expect("known event");
    let ThreadEvent::NewMessage(message) = event else {
        panic!("expected a new message event");
    };
    assert_eq!(message.id, MessageId::from(901_i64));
    assert_eq!(message.text.as_deref(), Some("see you at six"));
    assert_eq!(message.sender_id.as_str(), "7");
    assert_eq!(message.status, MessageStatus::Delivered);
}

fn decode_message(message: Value) -> ThreadMessage {
    let data = FrameData::Json(json!({ "message": message }));
    match decode_thread_event("new_message", Some(&data)) {
        Ok(Some(ThreadEvent::NewMessage(message))) => message,
        other => panic!("expected a new message event, got {other:?}"),
    }
}

#[test]
fn new_message_tolerates_backend_timestamp_formats_and_missing_text() {
    let laravel = decode_message(json!({
        "id": 1,
        "text": "hi",
        "senderId": 2,
        "timestamp": "2024-05-01 10:00:00"
    }));
    assert_eq!(laravel.timestamp, Some(json!("2024-05-01 10:00:00")));
    assert_eq!(laravel.sent_at().map(|at| at.timestamp()), Some(1_714_557_600));

    let millis = decode_message(json!({
        "id": 2,
        "text": null,
        "senderId": 2,
        "timestamp": 1_714_557_600_000_i64
    }));
    assert_eq!(millis.text, None);
    assert_eq!(millis.sent_at().map(|at| at.timestamp()), Some(1_714_557_600));

    let bare = decode_message(json!({ "id": 3, "senderId": 2 }));
    assert_eq!(bare.timestamp, None);
    assert_eq!(bare.sent_at(), None);
}

#[test]
fn new_message_keeps_fields_it_does_not_model() {
    let attachments = json!([{ "url": "https://cdn.test/a.png", "kind": "image" }]);
    let message = decode_message(json!({
        "id": 4,
        "text": "photo",
        "senderId": 2,
        "senderName": "Ana",
        "attachments": attachments,
        "timestamp": "2024-05-01T10:00:00Z"
    }));
    assert_eq!(message.extra.get("senderName"), Some(&json!("Ana")));
    assert_eq!(message.extra.get("attachments"), Some(&attachments));
    assert!(!message.extra.contains_key("text"));

    let forwarded = serde_json::to_value(&message).expect("serialize");
    assert_eq!(forwarded["senderName"], "Ana");
    assert_eq!(forwarded["attachments"], attachments);
}

#[test]
fn accepts_dot_prefixed_names_and_inline_json() {
    let data = FrameData::Json(json!({
        "user_id": 3,
        "user_name": "Ana",
        "is_typing": false
    }));
    let event = decode_thread_event(".user_typing", Some(&data))
        .expect("decode")
        .expect("known event");
    assert_eq!(
        event,
        ThreadEvent::Typing(TypingIndicator {
            user_id: UserId::from(3_i64),
            user_name: "Ana".into(),
            is_typing: false,
        })
    );
}

#[test]
fn unknown_events_are_ignored_and_missing_data_is_an_error() {
    assert!(decode_thread_event("thread_archived", None)
        .expect("unknown event is not an error")
        .is_none());
    assert!(matches!(
        decode_thread_event("message_read", None),
        Err(ProtocolError::MissingData { .. })
    ));
    assert!(matches!(
        decode_thread_event("message_read", Some(&FrameData::Encoded("{oops".into()))),
        Err(ProtocolError::Malformed(_))
    ));
}

#[test]
fn dispatch_reports_whether_a_handler_ran() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callbacks = ThreadCallbacks::new().on_message_read(move |read| {
        sink.lock().expect("lock").push(read.message_id);
    });

    let read = MessageRead {
        message_id: MessageId::from("m-1"),
        user_id: UserId::from("u-2"),
        read_at: None,
    };
    assert!(callbacks.dispatch(ThreadEvent::MessageRead(read)));
    assert!(!callbacks.dispatch(ThreadEvent::Typing(TypingIndicator {
        user_id: UserId::from("u-2"),
        user_name: "Bo".into(),
        is_typing: true,
    })));
    assert_eq!(*seen.lock().expect("lock"), vec![MessageId::from("m-1")]);
    assert!(!ThreadCallbacks::default().dispatch(ThreadEvent::MessageRead(MessageRead {
        message_id: MessageId::from("m-2"),
        user_id: UserId::from("u-2"),
        read_at: None,
    })));
}

#[tokio::test]
async fn channel_callbacks_feed_the_stream() {
    let (callbacks, mut stream) = ThreadCallbacks::channel();
    let event = decode_thread_event("new_message", Some(&new_message_data()))
        .expect("decode")
        .expect("known event");
    assert!(callbacks.dispatch(event.clone()));
    drop(callbacks);

    assert_eq!(stream.recv().await, Some(event));
    assert_eq!(stream.recv().await, None);
}
