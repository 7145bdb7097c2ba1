use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use exchange_core::event::{ChatMessage, Event, Handler, handler};
use exchange_core::session::UserId;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tracing::{debug, warn};

use crate::api::{ApiError, Conversation, MessageApi};

#[derive(Debug, Default)]
struct SyncState {
    unread: u32,
    /// Most recent activity first.
    conversations: Vec<Conversation>,
    active: Option<UserId>,
}

/// Keeps the unread badge and conversation previews coherent with the
/// server. Live events patch state optimistically; REST fetches overwrite it.
pub struct ConversationSynchronizer<A: MessageApi> {
    api: Arc<A>,
    me: UserId,
    state: RwLock<SyncState>,
    unread_tx: watch::Sender<u32>,
}

impl<A: MessageApi> ConversationSynchronizer<A> {
    pub fn new(api: Arc<A>, me: UserId) -> Self {
        let (unread_tx, _) = watch::channel(0);
        Self {
            api,
            me,
            state: RwLock::new(SyncState::default()),
            unread_tx,
        }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    fn read(&self) -> RwLockReadGuard<'_, SyncState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SyncState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, unread: u32) {
        self.unread_tx.send_replace(unread);
    }

    /// Authoritative fetch of the unread total and the conversation list.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let (unread, conversations) =
            tokio::try_join!(self.api.unread_count(), self.api.conversations())?;
        {
            let mut state = self.write();
            state.unread = unread;
            state.conversations = conversations;
        }
        self.publish(unread);
        debug!(unread, "conversation state refreshed");
        Ok(())
    }

    /// Authoritative fetch of the unread total only.
    pub async fn refresh_unread(&self) -> Result<(), ApiError> {
        let unread = self.api.unread_count().await?;
        self.write().unread = unread;
        self.publish(unread);
        Ok(())
    }

    /// Optimistic patch for a live message.
    pub fn apply_message(&self, message: &ChatMessage) {
        let partner = message.partner_of(self.me);
        let incoming = message.sender_id != self.me;

        let unread = {
            let mut state = self.write();
            let counts = incoming && state.active != Some(partner);

            let existing = state
                .conversations
                .iter()
                .position(|c| c.partner_id == partner);
            let mut conversation = match existing {
                Some(index) => state.conversations.remove(index),
                None => new_conversation(message, partner, incoming),
            };
            conversation.last_message = Some(message.content.clone());
            conversation.last_message_type = Some(message.kind);
            conversation.last_message_time = Some(message.created_at);
            if counts {
                conversation.unread_count = conversation.unread_count.saturating_add(1);
                state.unread = state.unread.saturating_add(1);
            }
            state.conversations.insert(0, conversation);
            counts.then_some(state.unread)
        };

        if let Some(unread) = unread {
            self.publish(unread);
        }
    }

    pub fn handle_event(&self, event: &Event) {
        if let Some(message) = event.chat_message() {
            self.apply_message(message);
        }
    }

    /// Bus handler feeding `message` events into this synchronizer.
    pub fn handler(self: &Arc<Self>) -> Handler {
        let synchronizer = Arc::clone(self);
        handler(move |event| {
            synchronizer.handle_event(event);
            Ok(())
        })
    }

    /// Marks the thread with `partner` read on the server, then zeroes its
    /// local count. Repeating the call leaves state unchanged.
    pub async fn open_thread(&self, partner: UserId) -> Result<(), ApiError> {
        self.write().active = Some(partner);
        self.api.mark_read(partner).await?;

        let unread = {
            let mut state = self.write();
            let cleared = state
                .conversations
                .iter_mut()
                .find(|c| c.partner_id == partner)
                .map_or(0, |c| std::mem::take(&mut c.unread_count));
            state.unread = state.unread.saturating_sub(cleared);
            state.unread
        };
        self.publish(unread);
        Ok(())
    }

    pub fn close_thread(&self) {
        self.write().active = None;
    }

    pub fn active_thread(&self) -> Option<UserId> {
        self.read().active
    }

    pub fn unread_count(&self) -> u32 {
        self.read().unread
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.read().conversations.clone()
    }

    pub fn conversation(&self, partner: UserId) -> Option<Conversation> {
        self.read()
            .conversations
            .iter()
            .find(|c| c.partner_id == partner)
            .cloned()
    }

    pub fn subscribe_unread(&self) -> watch::Receiver<u32> {
        self.unread_tx.subscribe()
    }

    /// Re-fetches the unread total every `period`, replacing the local value.
    /// Failures are logged and retried on the next tick.
    pub async fn run_periodic_resync(self: Arc<Self>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if let Err(error) = self.refresh_unread().await {
                warn!(error = %error, "periodic unread refresh failed");
            }
        }
    }
}

fn new_conversation(message: &ChatMessage, partner: UserId, incoming: bool) -> Conversation {
    let (nickname, avatar) = if incoming {
        (&message.sender_nickname, &message.sender_avatar)
    } else {
        (&message.receiver_nickname, &message.receiver_avatar)
    };
    Conversation {
        partner_id: partner,
        partner_nickname: nickname.clone(),
        partner_avatar: avatar.clone(),
        last_message: None,
        last_message_type: None,
        last_message_time: None,
        unread_count: 0,
    }
}
