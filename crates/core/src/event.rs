use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::EventBusError;
use crate::session::UserId;

/// Names consumers subscribe to. Each payload variant maps to exactly one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    Message,
    Connect,
    Disconnect,
}

impl EventName {
    pub const ALL: [EventName; 3] = [
        EventName::Message,
        EventName::Connect,
        EventName::Disconnect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventName::Message => "message",
            EventName::Connect => "connect",
            EventName::Disconnect => "disconnect",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: EventSource, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            payload,
        }
    }

    pub fn name(&self) -> EventName {
        self.payload.name()
    }

    /// The chat message carried by a `message` event, if any.
    pub fn chat_message(&self) -> Option<&ChatMessage> {
        match &self.payload {
            EventPayload::Message(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    Realtime,
    System(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    Message(ChatMessage),
    Connect,
    Disconnect {
        #[serde(rename = "willRetry")]
        will_retry: bool,
    },
}

impl EventPayload {
    pub fn name(&self) -> EventName {
        match self {
            EventPayload::Message(_) => EventName::Message,
            EventPayload::Connect => EventName::Connect,
            EventPayload::Disconnect { .. } => EventName::Disconnect,
        }
    }
}

/// Content kind of a chat message, in the server's wire spelling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    ProductCard,
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "TEXT" => Some(MessageKind::Text),
            "IMAGE" => Some(MessageKind::Image),
            "PRODUCT_CARD" => Some(MessageKind::ProductCard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRef {
    pub id: i64,
    pub title: Option<String>,
    pub image: Option<String>,
}

/// Reads an explicit `null` as the type's default.
///
/// Pair with `#[serde(default)]` so an absent key is accepted too.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: UserId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sender_nickname: String,
    #[serde(default)]
    pub sender_avatar: Option<String>,
    pub receiver_id: UserId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub receiver_nickname: String,
    #[serde(default)]
    pub receiver_avatar: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: MessageKind,
    #[serde(default, deserialize_with = "null_as_default")]
    pub read: bool,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub product_title: Option<String>,
    #[serde(default)]
    pub product_image: Option<String>,
}

impl ChatMessage {
    /// Product reference, only present on product-card messages.
    pub fn product(&self) -> Option<ProductRef> {
        if self.kind != MessageKind::ProductCard {
            return None;
        }
        self.product_id.map(|id| ProductRef {
            id,
            title: self.product_title.clone(),
            image: self.product_image.clone(),
        })
    }

    /// The other participant of the conversation from `me`'s point of view.
    pub fn partner_of(&self, me: UserId) -> UserId {
        if self.sender_id == me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.sender_id == user || self.receiver_id == user
    }
}

pub type HandlerResult = std::result::Result<(), EventBusError>;

/// A subscriber callback. The `Arc` is the handler's identity for [`EventBus::off`].
pub type Handler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub invoked: usize,
    pub failed: usize,
}

pub trait EventBus: Send + Sync + 'static {
    /// Appends `handler` to the list for `name`. Duplicates are kept.
    fn on(&self, name: EventName, handler: Handler);

    /// Removes the first registration of `handler` under `name`.
    fn off(&self, name: EventName, handler: &Handler);

    /// Dispatches synchronously to every handler registered before the call.
    fn emit(&self, event: &Event) -> DispatchSummary;

    fn handler_count(&self, name: EventName) -> usize;
}

/// In-process bus. Handlers run on the emitting task in registration order;
/// the registry lock is released before any handler runs.
#[derive(Default)]
pub struct SyncEventBus {
    handlers: RwLock<HashMap<EventName, Vec<Handler>>>,
}

impl SyncEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, name: EventName) -> Vec<Handler> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(&name).cloned().unwrap_or_default()
    }
}

impl EventBus for SyncEventBus {
    fn on(&self, name: EventName, handler: Handler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(name).or_default().push(handler);
    }

    fn off(&self, name: EventName, handler: &Handler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&name) else {
            return;
        };
        if let Some(index) = list.iter().position(|h| Arc::ptr_eq(h, handler)) {
            list.remove(index);
        }
    }

    fn emit(&self, event: &Event) -> DispatchSummary {
        let name = event.name();
        let snapshot = self.snapshot(name);
        let mut summary = DispatchSummary::default();

        for handler in snapshot {
            summary.invoked += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(_) => EventBusError::HandlerPanicked(name.to_string()),
            };
            summary.failed += 1;
            warn!(event = %name, id = %event.id, error = %error, "event handler failed");
        }

        trace!(event = %name, invoked = summary.invoked, "event dispatched");
        summary
    }

    fn handler_count(&self, name: EventName) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(&name).map_or(0, Vec::len)
    }
}
