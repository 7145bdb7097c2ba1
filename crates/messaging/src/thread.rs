use std::sync::{Arc, PoisonError, RwLock};

use exchange_core::event::{ChatMessage, Event, Handler, MessageKind, handler};
use exchange_core::session::UserId;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::MessagingError;
use crate::api::{MessageApi, PageRequest, SendMessageRequest};
use crate::sync::ConversationSynchronizer;

/// The open conversation with one partner: history plus live arrivals.
pub struct ChatThread<A: MessageApi> {
    synchronizer: Arc<ConversationSynchronizer<A>>,
    partner: UserId,
    messages: RwLock<Vec<ChatMessage>>,
    partner_name: RwLock<Option<String>>,
    page: RwLock<u32>,
}

impl<A: MessageApi> ChatThread<A> {
    /// Loads the first history page and marks the conversation read. A failed
    /// mark-read is logged; the thread still opens.
    pub async fn open(
        synchronizer: Arc<ConversationSynchronizer<A>>,
        partner: UserId,
    ) -> Result<Self, MessagingError> {
        let page = PageRequest::history();
        let history = synchronizer
            .api()
            .conversation_history(partner, page)
            .await?;

        if let Err(error) = synchronizer.open_thread(partner).await {
            warn!(partner = %partner, error = %error, "failed to mark conversation read");
        }

        let partner_name = derive_partner_name(&history, partner);
        debug!(partner = %partner, messages = history.len(), "chat thread opened");
        Ok(Self {
            synchronizer,
            partner,
            messages: RwLock::new(history),
            partner_name: RwLock::new(partner_name),
            page: RwLock::new(page.page),
        })
    }

    pub fn partner(&self) -> UserId {
        self.partner
    }

    pub fn partner_name(&self) -> Option<String> {
        self.partner_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetches the next page of history and prepends the messages not
    /// already shown. Returns how many were added.
    pub async fn load_earlier(&self) -> Result<usize, MessagingError> {
        let next = *self.page.read().unwrap_or_else(PoisonError::into_inner) + 1;
        let request = PageRequest {
            page: next,
            ..PageRequest::history()
        };
        let older = self
            .synchronizer
            .api()
            .conversation_history(self.partner, request)
            .await?;

        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        let fresh: Vec<ChatMessage> = older
            .into_iter()
            .filter(|m| !messages.iter().any(|existing| existing.id == m.id))
            .collect();
        let added = fresh.len();
        if added > 0 {
            messages.splice(0..0, fresh);
            *self.page.write().unwrap_or_else(PoisonError::into_inner) = next;
        }
        Ok(added)
    }

    /// Appends `message` if it belongs to this thread and is not yet shown.
    /// A partner message seen here is also marked read on the server.
    pub fn append(&self, message: &ChatMessage) -> bool {
        if !message.involves(self.partner) {
            return false;
        }
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        if messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        messages.push(message.clone());
        drop(messages);

        if message.sender_id == self.partner {
            let mut name = self.partner_name.write().unwrap_or_else(PoisonError::into_inner);
            if name.is_none() {
                *name = Some(message.sender_nickname.clone());
            }
            drop(name);
            self.mark_read_in_background();
        }
        true
    }

    fn mark_read_in_background(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(partner = %self.partner, "no runtime to mark conversation read");
            return;
        };
        let api = Arc::clone(self.synchronizer.api());
        let partner = self.partner;
        runtime.spawn(async move {
            if let Err(error) = api.mark_read(partner).await {
                warn!(partner = %partner, error = %error, "failed to mark conversation read");
            }
        });
    }

    pub fn handle_event(&self, event: &Event) {
        if let Some(message) = event.chat_message() {
            self.append(message);
        }
    }

    pub fn handler(self: &Arc<Self>) -> Handler {
        let thread = Arc::clone(self);
        handler(move |event| {
            thread.handle_event(event);
            Ok(())
        })
    }

    pub async fn send_text(&self, content: &str) -> Result<ChatMessage, MessagingError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MessagingError::EmptyMessage);
        }
        self.submit(SendMessageRequest::text(self.partner, content))
            .await
    }

    pub async fn send_image(&self, image_url: &str) -> Result<ChatMessage, MessagingError> {
        let image_url = image_url.trim();
        if image_url.is_empty() {
            return Err(MessagingError::EmptyMessage);
        }
        self.submit(SendMessageRequest {
            receiver_id: self.partner,
            content: image_url.to_string(),
            kind: MessageKind::Image,
            product_id: None,
        })
        .await
    }

    pub async fn send_product(
        &self,
        product_id: i64,
        content: &str,
    ) -> Result<ChatMessage, MessagingError> {
        self.submit(SendMessageRequest::product_card(
            self.partner,
            product_id,
            content.trim(),
        ))
        .await
    }

    /// Sends through the REST store and appends the stored message.
    async fn submit(&self, request: SendMessageRequest) -> Result<ChatMessage, MessagingError> {
        let created = self.synchronizer.api().create_message(&request).await?;
        self.append(&created);
        self.synchronizer.apply_message(&created);
        Ok(created)
    }

    /// Leaves the thread; later messages from the partner count as unread.
    pub fn close(&self) {
        if self.synchronizer.active_thread() == Some(self.partner) {
            self.synchronizer.close_thread();
        }
    }
}

fn derive_partner_name(history: &[ChatMessage], partner: UserId) -> Option<String> {
    history
        .iter()
        .find(|m| m.sender_id == partner)
        .map(|m| m.sender_nickname.clone())
        .or_else(|| {
            history
                .iter()
                .find(|m| m.receiver_id == partner)
                .map(|m| m.receiver_nickname.clone())
        })
        .filter(|name| !name.is_empty())
}
