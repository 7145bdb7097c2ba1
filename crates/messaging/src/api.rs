//! Contract of the REST message store and its HTTP implementation.
//!
//! Every endpoint answers with an envelope `{code, message, data}`. A `code`
//! other than 200 is a failure even when the HTTP status is 200.

use std::future::Future;

use chrono::NaiveDateTime;
use exchange_core::event::{ChatMessage, MessageKind, null_as_default};
use exchange_core::session::UserId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("request rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("not authenticated")]
    Unauthorized,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub partner_id: UserId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub partner_nickname: String,
    #[serde(default)]
    pub partner_avatar: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_type: Option<MessageKind>,
    #[serde(default)]
    pub last_message_time: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedUser {
    pub id: UserId,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
}

impl SendMessageRequest {
    pub fn text(receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            receiver_id,
            content: content.into(),
            kind: MessageKind::Text,
            product_id: None,
        }
    }

    pub fn product_card(receiver_id: UserId, product_id: i64, content: impl Into<String>) -> Self {
        Self {
            receiver_id,
            content: content.into(),
            kind: MessageKind::ProductCard,
            product_id: Some(product_id),
        }
    }
}

/// One-based page selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub const fn history() -> Self {
        Self { page: 1, size: 50 }
    }

    pub const fn search() -> Self {
        Self { page: 1, size: 20 }
    }
}

pub trait MessageApi: Send + Sync + 'static {
    fn unread_count(&self) -> impl Future<Output = Result<u32, ApiError>> + Send;

    fn conversations(&self) -> impl Future<Output = Result<Vec<Conversation>, ApiError>> + Send;

    /// Messages exchanged with `partner`, oldest first.
    fn conversation_history(
        &self,
        partner: UserId,
        page: PageRequest,
    ) -> impl Future<Output = Result<Vec<ChatMessage>, ApiError>> + Send;

    fn mark_read(&self, partner: UserId) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn search_messages(
        &self,
        keyword: &str,
        page: PageRequest,
    ) -> impl Future<Output = Result<Vec<ChatMessage>, ApiError>> + Send;

    fn block_user(&self, user: UserId) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn unblock_user(&self, user: UserId) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn blocked_users(&self) -> impl Future<Output = Result<Vec<BlockedUser>, ApiError>> + Send;

    fn create_message(
        &self,
        request: &SendMessageRequest,
    ) -> impl Future<Output = Result<ChatMessage, ApiError>> + Send;
}

#[cfg(feature = "native")]
mod http {
    use std::sync::Arc;
    use std::time::Duration;

    use exchange_core::config::Config;
    use exchange_core::event::ChatMessage;
    use exchange_core::session::{CredentialStore, UserId};
    use reqwest::{Method, RequestBuilder, StatusCode};
    use serde::Deserialize;
    use serde::de::DeserializeOwned;
    use tracing::{debug, warn};

    use super::{ApiError, BlockedUser, Conversation, MessageApi, PageRequest, SendMessageRequest};

    const SUCCESS: i64 = 200;

    #[derive(Debug, Deserialize)]
    struct Envelope<T> {
        code: i64,
        #[serde(default)]
        message: Option<String>,
        data: Option<T>,
    }

    /// Client for the `/messages` endpoints. The bearer token is read from the
    /// credential store on every request.
    pub struct HttpMessageApi {
        client: reqwest::Client,
        base_url: String,
        credentials: Arc<dyn CredentialStore>,
    }

    impl HttpMessageApi {
        pub fn new(
            base_url: &str,
            timeout: Duration,
            credentials: Arc<dyn CredentialStore>,
        ) -> Result<Self, ApiError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ApiError::Transport(e.to_string()))?;
            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                credentials,
            })
        }

        pub fn from_config(
            config: &Config,
            credentials: Arc<dyn CredentialStore>,
        ) -> Result<Self, ApiError> {
            Self::new(
                &config.server.api_base_url,
                config.server.request_timeout(),
                credentials,
            )
        }

        fn request(&self, method: Method, path: &str) -> RequestBuilder {
            let builder = self
                .client
                .request(method, format!("{}/messages{}", self.base_url, path));
            match self.credentials.token() {
                Some(token) => builder.bearer_auth(token),
                None => builder,
            }
        }

        async fn execute<T: DeserializeOwned>(
            &self,
            request: RequestBuilder,
        ) -> Result<Option<T>, ApiError> {
            let response = request
                .send()
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                warn!("message API rejected credentials");
                return Err(ApiError::Unauthorized);
            }
            if !status.is_success() {
                return Err(ApiError::Status(status.as_u16()));
            }

            let envelope: Envelope<T> = response
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))?;
            if envelope.code != SUCCESS {
                let message = envelope.message.unwrap_or_default();
                debug!(code = envelope.code, message = %message, "message API returned failure");
                return Err(ApiError::Rejected {
                    code: envelope.code,
                    message,
                });
            }
            Ok(envelope.data)
        }

        async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
            self.execute(request)
                .await?
                .ok_or_else(|| ApiError::Decode("response carried no data".to_string()))
        }

        async fn perform(&self, request: RequestBuilder) -> Result<(), ApiError> {
            self.execute::<serde::de::IgnoredAny>(request).await?;
            Ok(())
        }
    }

    impl MessageApi for HttpMessageApi {
        async fn unread_count(&self) -> Result<u32, ApiError> {
            self.fetch(self.request(Method::GET, "/unread-count")).await
        }

        async fn conversations(&self) -> Result<Vec<Conversation>, ApiError> {
            Ok(self
                .execute(self.request(Method::GET, "/conversations"))
                .await?
                .unwrap_or_default())
        }

        async fn conversation_history(
            &self,
            partner: UserId,
            page: PageRequest,
        ) -> Result<Vec<ChatMessage>, ApiError> {
            let request = self
                .request(Method::GET, &format!("/conversation/{partner}"))
                .query(&[("page", page.page), ("size", page.size)]);
            Ok(self.execute(request).await?.unwrap_or_default())
        }

        async fn mark_read(&self, partner: UserId) -> Result<(), ApiError> {
            self.perform(self.request(Method::PUT, &format!("/read/{partner}")))
                .await
        }

        async fn search_messages(
            &self,
            keyword: &str,
            page: PageRequest,
        ) -> Result<Vec<ChatMessage>, ApiError> {
            let keyword = keyword.trim();
            if keyword.is_empty() {
                return Ok(Vec::new());
            }
            let request = self.request(Method::GET, "/search").query(&[
                ("keyword", keyword.to_string()),
                ("page", page.page.to_string()),
                ("size", page.size.to_string()),
            ]);
            Ok(self.execute(request).await?.unwrap_or_default())
        }

        async fn block_user(&self, user: UserId) -> Result<(), ApiError> {
            self.perform(self.request(Method::POST, &format!("/block/{user}")))
                .await
        }

        async fn unblock_user(&self, user: UserId) -> Result<(), ApiError> {
            self.perform(self.request(Method::DELETE, &format!("/block/{user}")))
                .await
        }

        async fn blocked_users(&self) -> Result<Vec<BlockedUser>, ApiError> {
            Ok(self
                .execute(self.request(Method::GET, "/blocks"))
                .await?
                .unwrap_or_default())
        }

        async fn create_message(
            &self,
            request: &SendMessageRequest,
        ) -> Result<ChatMessage, ApiError> {
            self.fetch(self.request(Method::POST, "").json(request)).await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use assert_matches::assert_matches;
        use exchange_core::event::MessageKind;
        use exchange_core::session::MemoryCredentialStore;
        use serde_json::json;
        use wiremock::matchers::{body_json, header, method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn ok(data: serde_json::Value) -> ResponseTemplate {
            ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "message": "success",
                "data": data,
            }))
        }

        fn message_json(id: i64) -> serde_json::Value {
            json!({
                "id": id,
                "senderId": 1,
                "senderNickname": "Jo",
                "receiverId": 2,
                "receiverNickname": "Mei",
                "content": "deal",
                "type": "TEXT",
                "read": false,
                "createdAt": "2024-03-09T18:22:05"
            })
        }

        async fn api(server: &MockServer, token: Option<&str>) -> HttpMessageApi {
            let store = Arc::new(MemoryCredentialStore::new(token.map(str::to_string)));
            HttpMessageApi::new(
                &format!("{}/api/", server.uri()),
                Duration::from_secs(5),
                store,
            )
            .unwrap()
        }

        #[tokio::test]
        async fn unread_count_sends_bearer_token() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/messages/unread-count"))
                .and(header("authorization", "Bearer tok-9"))
                .respond_with(ok(json!(4)))
                .expect(1)
                .mount(&server)
                .await;

            let count = api(&server, Some("tok-9")).await.unread_count().await.unwrap();
            assert_eq!(count, 4);
        }

        #[tokio::test]
        async fn conversations_decode_server_shape() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/messages/conversations"))
                .respond_with(ok(json!([{
                    "partnerId": 2,
                    "partnerNickname": "Mei",
                    "partnerAvatar": null,
                    "lastMessage": "deal",
                    "lastMessageType": "TEXT",
                    "lastMessageTime": "2024-03-09T18:22:05",
                    "unreadCount": 3
                }])))
                .mount(&server)
                .await;

            let list = api(&server, None).await.conversations().await.unwrap();
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].partner_id, UserId(2));
            assert_eq!(list[0].last_message_type, Some(MessageKind::Text));
            assert_eq!(list[0].unread_count, 3);
        }

        #[tokio::test]
        async fn conversations_tolerate_null_name_and_count() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/messages/conversations"))
                .respond_with(ok(json!([{
                    "partnerId": 4,
                    "partnerNickname": null,
                    "lastMessage": null,
                    "unreadCount": null
                }])))
                .mount(&server)
                .await;

            let list = api(&server, None).await.conversations().await.unwrap();
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].partner_id, UserId(4));
            assert_eq!(list[0].partner_nickname, "");
            assert_eq!(list[0].unread_count, 0);
        }

        #[tokio::test]
        async fn history_passes_paging() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/messages/conversation/2"))
                .and(query_param("page", "1"))
                .and(query_param("size", "50"))
                .respond_with(ok(json!([message_json(1), message_json(2)])))
                .mount(&server)
                .await;

            let history = api(&server, None)
                .await
                .conversation_history(UserId(2), PageRequest::history())
                .await
                .unwrap();
            assert_eq!(history.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        }

        #[tokio::test]
        async fn non_success_code_is_a_failure_despite_http_ok() {
            let server = MockServer::start().await;
            Mock::given(method("PUT"))
                .and(path("/api/messages/read/2"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "code": 500,
                    "message": "conversation not found",
                    "data": null
                })))
                .mount(&server)
                .await;

            let err = api(&server, None).await.mark_read(UserId(2)).await.unwrap_err();
            assert_eq!(
                err,
                ApiError::Rejected {
                    code: 500,
                    message: "conversation not found".to_string()
                }
            );
        }

        #[tokio::test]
        async fn http_unauthorized_maps_to_unauthorized() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/messages/unread-count"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;

            let err = api(&server, Some("expired")).await.unread_count().await.unwrap_err();
            assert_eq!(err, ApiError::Unauthorized);
        }

        #[tokio::test]
        async fn server_error_status_is_reported() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/messages/blocks"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;

            let err = api(&server, None).await.blocked_users().await.unwrap_err();
            assert_eq!(err, ApiError::Status(503));
        }

        #[tokio::test]
        async fn create_message_posts_request_body() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/messages"))
                .and(body_json(json!({
                    "receiverId": 2,
                    "content": "see attached",
                    "type": "PRODUCT_CARD",
                    "productId": 77
                })))
                .respond_with(ok(message_json(31)))
                .expect(1)
                .mount(&server)
                .await;

            let request = SendMessageRequest::product_card(UserId(2), 77, "see attached");
            let created = api(&server, None).await.create_message(&request).await.unwrap();
            assert_eq!(created.id, 31);
        }

        #[tokio::test]
        async fn block_and_unblock_use_distinct_methods() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/messages/block/5"))
                .respond_with(ok(json!(null)))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("DELETE"))
                .and(path("/api/messages/block/5"))
                .respond_with(ok(json!(null)))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/messages/blocks"))
                .respond_with(ok(json!([{"id": 5, "nickname": "spam", "username": "s"}])))
                .mount(&server)
                .await;

            let api = api(&server, None).await;
            api.block_user(UserId(5)).await.unwrap();
            let blocked = api.blocked_users().await.unwrap();
            assert_eq!(blocked[0].id, UserId(5));
            assert_eq!(blocked[0].nickname.as_deref(), Some("spam"));
            api.unblock_user(UserId(5)).await.unwrap();
        }

        #[tokio::test]
        async fn blank_search_skips_the_request() {
            let server = MockServer::start().await;
            let results = api(&server, None)
                .await
                .search_messages("   ", PageRequest::search())
                .await
                .unwrap();
            assert!(results.is_empty());
            assert!(server.received_requests().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn search_passes_keyword() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/messages/search"))
                .and(query_param("keyword", "lamp"))
                .and(query_param("size", "20"))
                .respond_with(ok(json!([message_json(8)])))
                .mount(&server)
                .await;

            let results = api(&server, None)
                .await
                .search_messages(" lamp ", PageRequest::search())
                .await
                .unwrap();
            assert_eq!(results.len(), 1);
        }

        #[tokio::test]
        async fn missing_data_on_fetch_is_a_decode_error() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/messages/unread-count"))
                .respond_with(ok(json!(null)))
                .mount(&server)
                .await;

            let err = api(&server, None).await.unread_count().await.unwrap_err();
            assert_matches!(err, ApiError::Decode(_));
        }
    }
}

#[cfg(feature = "native")]
pub use http::HttpMessageApi;
