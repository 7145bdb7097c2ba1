#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("no credential token available")]
    MissingCredentials,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Configuration and credential problems will not heal by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::HandshakeFailed(_)
                | ConnectionError::TransportError(_)
                | ConnectionError::Closed
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingTag,

    #[error("invalid {tag} payload: {source}")]
    InvalidPayload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}
