pub mod connection;
pub mod error;
pub mod frame;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use connection::{ActiveTimers, ClientConfig, ConnectionClient, ConnectionState};
pub use error::{ConnectionError, FrameError};
pub use frame::{InboundEvent, LifecycleEvent, OutboundFrame, decode_frame};
pub use transport::{Connector, PushTransport};
#[cfg(feature = "native")]
pub use transport::{WebSocketConnector, WebSocketTransport};
