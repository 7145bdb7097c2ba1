#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Handler panicked while handling {0}")]
    HandlerPanicked(String),
}
