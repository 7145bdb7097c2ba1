//! Wire frames exchanged over the push connection.
//!
//! Every frame is a JSON text frame with a `type` discriminator. The server
//! pushes chat messages in their stored shape, so the tag doubles as the
//! content kind (`TEXT`, `IMAGE`, `PRODUCT_CARD`). A generic `message` tag is
//! also accepted, with the content kind carried in `messageType`.

use std::sync::atomic::{AtomicI64, Ordering};

use exchange_core::event::{ChatMessage, EventPayload, MessageKind};
use exchange_core::session::UserId;
use serde::Serialize;
use serde_json::Value;

use crate::error::FrameError;

const HEARTBEAT_ACK: &str = "HEARTBEAT_ACK";
const GENERIC_MESSAGE: &str = "message";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Ids handed to generic frames that arrive without a stored id. Counts down
/// from -1 so they never collide with server ids.
static NEXT_LOCAL_ID: AtomicI64 = AtomicI64::new(-1);

/// Connection lifecycle transitions, synthesized by the client rather than
/// received from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Opened,
    Closed { will_retry: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Chat(ChatMessage),
    HeartbeatAck,
    Lifecycle(LifecycleEvent),
    /// A well-formed frame with a tag this client does not handle.
    Ignored { tag: String },
}

impl InboundEvent {
    /// The bus payload this event fans out as, or `None` when it is swallowed.
    pub fn into_payload(self) -> Option<EventPayload> {
        match self {
            InboundEvent::Chat(message) => Some(EventPayload::Message(message)),
            InboundEvent::Lifecycle(LifecycleEvent::Opened) => Some(EventPayload::Connect),
            InboundEvent::Lifecycle(LifecycleEvent::Closed { will_retry }) => {
                Some(EventPayload::Disconnect { will_retry })
            }
            InboundEvent::HeartbeatAck | InboundEvent::Ignored { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundFrame {
    Heartbeat,
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decodes one text frame received by `me`.
///
/// Generic `message` frames may be bare notifications: a missing receiver
/// defaults to `me`, a missing timestamp to the local time of receipt, and a
/// missing id to a fresh negative id.
pub fn decode_frame(text: &str, me: UserId) -> Result<InboundEvent, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingTag)?
        .to_string();

    if tag == HEARTBEAT_ACK {
        return Ok(InboundEvent::HeartbeatAck);
    }

    if MessageKind::from_tag(&tag).is_some() {
        return parse_chat(&tag, value);
    }

    if tag == GENERIC_MESSAGE {
        let mut body = match value.get("data") {
            Some(data) if data.is_object() => data.clone(),
            _ => value,
        };
        let kind = body
            .get("messageType")
            .and_then(Value::as_str)
            .unwrap_or("TEXT")
            .to_string();
        if let Value::Object(fields) = &mut body {
            fields.insert("type".to_string(), Value::String(kind));
            fill_missing(fields, "receiverId", || Value::from(me.0));
            fill_missing(fields, "createdAt", || {
                let now = chrono::Local::now().naive_local();
                Value::String(now.format(TIMESTAMP_FORMAT).to_string())
            });
            fill_missing(fields, "id", || {
                Value::from(NEXT_LOCAL_ID.fetch_sub(1, Ordering::Relaxed))
            });
        }
        return parse_chat(&tag, body);
    }

    Ok(InboundEvent::Ignored { tag })
}

fn fill_missing(
    fields: &mut serde_json::Map<String, Value>,
    key: &str,
    default: impl FnOnce() -> Value,
) {
    if fields.get(key).is_none_or(Value::is_null) {
        fields.insert(key.to_string(), default());
    }
}

fn parse_chat(tag: &str, body: Value) -> Result<InboundEvent, FrameError> {
    serde_json::from_value(body)
        .map(InboundEvent::Chat)
        .map_err(|source| FrameError::InvalidPayload {
            tag: tag.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const ME: UserId = UserId(1);

    const PUSHED_TEXT: &str = r#"{
        "id": 11,
        "senderId": 2,
        "senderNickname": "Mei",
        "senderAvatar": "https://cdn.example.edu/a/2.png",
        "receiverId": 1,
        "receiverNickname": "Jo",
        "receiverAvatar": null,
        "content": "Is the bike still for sale?",
        "type": "TEXT",
        "read": false,
        "createdAt": "2024-03-09T18:22:05"
    }"#;

    #[test]
    fn heartbeat_encodes_as_type_tag() {
        assert_eq!(
            OutboundFrame::Heartbeat.encode().unwrap(),
            r#"{"type":"HEARTBEAT"}"#
        );
    }

    #[test]
    fn heartbeat_ack_is_recognised_and_swallowed() {
        let event = decode_frame(r#"{"type":"HEARTBEAT_ACK"}"#, ME).unwrap();
        assert_eq!(event, InboundEvent::HeartbeatAck);
        assert!(event.into_payload().is_none());
    }

    #[test]
    fn pushed_message_decodes_with_kind_from_tag() {
        let event = decode_frame(PUSHED_TEXT, ME).unwrap();
        let InboundEvent::Chat(message) = event else {
            panic!("expected chat, got {event:?}");
        };
        assert_eq!(message.id, 11);
        assert_eq!(message.sender_id, UserId(2));
        assert_eq!(message.kind, MessageKind::Text);
        assert_eq!(message.sender_nickname, "Mei");
    }

    #[test]
    fn product_card_frame_carries_product() {
        let frame = r#"{"id":3,"senderId":5,"receiverId":1,"content":"this one",
            "type":"PRODUCT_CARD","createdAt":"2024-03-09T18:22:05",
            "productId":90,"productTitle":"Calculus textbook","productImage":"p.jpg"}"#;
        let InboundEvent::Chat(message) = decode_frame(frame, ME).unwrap() else {
            panic!("expected chat");
        };
        let product = message.product().unwrap();
        assert_eq!(product.id, 90);
        assert_eq!(product.image.as_deref(), Some("p.jpg"));
    }

    #[test]
    fn generic_message_tag_reads_kind_from_message_type() {
        let frame = r#"{"type":"message","data":{"id":4,"senderId":5,"receiverId":1,
            "content":"img.png","messageType":"IMAGE","createdAt":"2024-03-09T18:22:05"}}"#;
        let InboundEvent::Chat(message) = decode_frame(frame, ME).unwrap() else {
            panic!("expected chat");
        };
        assert_eq!(message.kind, MessageKind::Image);
        assert_eq!(message.content, "img.png");
    }

    #[test]
    fn generic_message_without_kind_defaults_to_text() {
        let frame = r#"{"type":"message","id":4,"senderId":5,"receiverId":1,
            "content":"hey","createdAt":"2024-03-09T18:22:05"}"#;
        let InboundEvent::Chat(message) = decode_frame(frame, ME).unwrap() else {
            panic!("expected chat");
        };
        assert_eq!(message.kind, MessageKind::Text);
    }

    #[test]
    fn bare_generic_message_is_filled_in_for_the_receiver() {
        let frame = r#"{"type":"message","senderId":7,"content":"hi, still available?"}"#;
        let InboundEvent::Chat(first) = decode_frame(frame, ME).unwrap() else {
            panic!("expected chat");
        };
        let InboundEvent::Chat(second) = decode_frame(frame, ME).unwrap() else {
            panic!("expected chat");
        };
        assert_eq!(first.sender_id, UserId(7));
        assert_eq!(first.receiver_id, ME);
        assert_eq!(first.kind, MessageKind::Text);
        assert_eq!(first.content, "hi, still available?");
        assert!(first.id < 0);
        assert!(second.id < 0);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn null_fields_in_pushed_message_take_defaults() {
        let frame = r#"{"id":12,"senderId":2,"senderNickname":null,"receiverId":1,
            "receiverNickname":null,"content":null,"type":"TEXT","read":null,
            "createdAt":"2024-03-09T18:22:05"}"#;
        let InboundEvent::Chat(message) = decode_frame(frame, ME).unwrap() else {
            panic!("expected chat");
        };
        assert_eq!(message.sender_nickname, "");
        assert_eq!(message.content, "");
        assert!(!message.read);
    }

    #[test]
    fn unknown_tag_is_ignored() {
        assert_eq!(
            decode_frame(r#"{"type":"TYPING","userId":3}"#, ME).unwrap(),
            InboundEvent::Ignored {
                tag: "TYPING".to_string()
            }
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert_matches!(decode_frame("not json", ME), Err(FrameError::Malformed(_)));
        assert_matches!(decode_frame(r#"{"id":1}"#, ME), Err(FrameError::MissingTag));
        assert_matches!(
            decode_frame(r#"{"type":"TEXT","content":"missing ids"}"#, ME),
            Err(FrameError::InvalidPayload { .. })
        );
    }

    #[test]
    fn lifecycle_events_map_to_bus_payloads() {
        assert_eq!(
            InboundEvent::Lifecycle(LifecycleEvent::Opened).into_payload(),
            Some(EventPayload::Connect)
        );
        assert_eq!(
            InboundEvent::Lifecycle(LifecycleEvent::Closed { will_retry: true }).into_payload(),
            Some(EventPayload::Disconnect { will_retry: true })
        );
    }
}
