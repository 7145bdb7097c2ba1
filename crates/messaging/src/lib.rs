pub mod api;
pub mod sync;
pub mod thread;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use api::{
    ApiError, BlockedUser, Conversation, MessageApi, PageRequest, SendMessageRequest,
};
#[cfg(feature = "native")]
pub use api::HttpMessageApi;
pub use sync::ConversationSynchronizer;
pub use thread::ChatThread;

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("message content is empty")]
    EmptyMessage,

    #[error("message API error: {0}")]
    Api(#[from] ApiError),
}
