//! In-memory message store for exercising synchronizer and thread logic.

use std::sync::Mutex;

use chrono::NaiveDateTime;
use exchange_core::event::{ChatMessage, MessageKind};
use exchange_core::session::UserId;

use crate::api::{ApiError, BlockedUser, Conversation, MessageApi, PageRequest, SendMessageRequest};

pub fn chat_message(id: i64, from: UserId, to: UserId, content: &str) -> ChatMessage {
    ChatMessage {
        id,
        sender_id: from,
        sender_nickname: format!("user{}", from.0),
        sender_avatar: None,
        receiver_id: to,
        receiver_nickname: format!("user{}", to.0),
        receiver_avatar: None,
        content: content.to_string(),
        kind: MessageKind::Text,
        read: false,
        created_at: NaiveDateTime::default(),
        product_id: None,
        product_title: None,
        product_image: None,
    }
}

pub fn conversation(partner: i64, unread: u32) -> Conversation {
    Conversation {
        partner_id: UserId(partner),
        partner_nickname: format!("user{partner}"),
        partner_avatar: None,
        last_message: Some("earlier".to_string()),
        last_message_type: Some(MessageKind::Text),
        last_message_time: None,
        unread_count: unread,
    }
}

#[derive(Default)]
struct FakeState {
    unread: u32,
    conversations: Vec<Conversation>,
    history: Vec<ChatMessage>,
    blocked: Vec<UserId>,
    failure: Option<ApiError>,
    mark_read_calls: Vec<UserId>,
    created: Vec<SendMessageRequest>,
    next_id: i64,
    me: Option<UserId>,
}

/// Answers from canned state. While a failure is set every call returns it.
#[derive(Default)]
pub struct FakeMessageApi {
    state: Mutex<FakeState>,
}

impl FakeMessageApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity stamped as sender on created messages.
    pub fn with_identity(me: UserId) -> Self {
        let api = Self::default();
        api.state.lock().unwrap().me = Some(me);
        api
    }

    pub fn set_unread(&self, unread: u32) {
        self.state.lock().unwrap().unread = unread;
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().unwrap().conversations = conversations;
    }

    pub fn set_history(&self, history: Vec<ChatMessage>) {
        self.state.lock().unwrap().history = history;
    }

    pub fn fail_with(&self, error: ApiError) {
        self.state.lock().unwrap().failure = Some(error);
    }

    pub fn clear_failure(&self) {
        self.state.lock().unwrap().failure = None;
    }

    pub fn mark_read_calls(&self) -> Vec<UserId> {
        self.state.lock().unwrap().mark_read_calls.clone()
    }

    pub fn created(&self) -> Vec<SendMessageRequest> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn blocked(&self) -> Vec<UserId> {
        self.state.lock().unwrap().blocked.clone()
    }

    fn check(&self) -> Result<std::sync::MutexGuard<'_, FakeState>, ApiError> {
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.failure {
            return Err(error.clone());
        }
        Ok(state)
    }
}

impl MessageApi for FakeMessageApi {
    async fn unread_count(&self) -> Result<u32, ApiError> {
        Ok(self.check()?.unread)
    }

    async fn conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        Ok(self.check()?.conversations.clone())
    }

    async fn conversation_history(
        &self,
        partner: UserId,
        _page: PageRequest,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        Ok(self
            .check()?
            .history
            .iter()
            .filter(|m| m.involves(partner))
            .cloned()
            .collect())
    }

    async fn mark_read(&self, partner: UserId) -> Result<(), ApiError> {
        self.state.lock().unwrap().mark_read_calls.push(partner);
        let mut state = self.check()?;
        let cleared = state
            .conversations
            .iter_mut()
            .find(|c| c.partner_id == partner)
            .map_or(0, |c| std::mem::take(&mut c.unread_count));
        state.unread = state.unread.saturating_sub(cleared);
        Ok(())
    }

    async fn search_messages(
        &self,
        keyword: &str,
        _page: PageRequest,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .check()?
            .history
            .iter()
            .filter(|m| m.content.contains(keyword))
            .cloned()
            .collect())
    }

    async fn block_user(&self, user: UserId) -> Result<(), ApiError> {
        let mut state = self.check()?;
        if state.blocked.contains(&user) {
            return Err(ApiError::Rejected {
                code: 500,
                message: "already blocked".to_string(),
            });
        }
        state.blocked.push(user);
        Ok(())
    }

    async fn unblock_user(&self, user: UserId) -> Result<(), ApiError> {
        self.check()?.blocked.retain(|u| *u != user);
        Ok(())
    }

    async fn blocked_users(&self) -> Result<Vec<BlockedUser>, ApiError> {
        Ok(self
            .check()?
            .blocked
            .iter()
            .map(|id| BlockedUser {
                id: *id,
                nickname: Some(format!("user{}", id.0)),
                avatar: None,
            })
            .collect())
    }

    async fn create_message(&self, request: &SendMessageRequest) -> Result<ChatMessage, ApiError> {
        let mut state = self.check()?;
        state.next_id += 1;
        let sender = state.me.unwrap_or(UserId(0));
        let mut message = chat_message(
            1000 + state.next_id,
            sender,
            request.receiver_id,
            &request.content,
        );
        message.kind = request.kind;
        message.product_id = request.product_id;
        state.created.push(request.clone());
        state.history.push(message.clone());
        Ok(message)
    }
}
