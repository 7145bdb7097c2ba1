use std::future::Future;

use url::Url;

use crate::error::ConnectionError;

/// Opens push transports. One connector lives for the whole client; each
/// connection attempt produces a fresh transport.
///
/// Implementations:
/// - `WebSocketConnector` (native feature): WebSocket via tokio-tungstenite
pub trait Connector: Send + Sync + 'static {
    type Transport: PushTransport;

    fn connect(
        &self,
        url: &Url,
    ) -> impl Future<Output = Result<Self::Transport, ConnectionError>> + Send;
}

/// An open, text-framed, bidirectional link.
pub trait PushTransport: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Next text frame, or `Ok(None)` once the peer has closed the link.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

#[cfg(feature = "native")]
mod native {
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::{self, Message};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
    use tracing::trace;
    use url::Url;

    use super::{Connector, PushTransport};
    use crate::error::ConnectionError;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct WebSocketConnector;

    impl Connector for WebSocketConnector {
        type Transport = WebSocketTransport;

        async fn connect(&self, url: &Url) -> Result<WebSocketTransport, ConnectionError> {
            let (stream, response) = connect_async(url.as_str())
                .await
                .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;
            trace!(status = %response.status(), "websocket upgrade complete");
            Ok(WebSocketTransport { stream })
        }
    }

    pub struct WebSocketTransport {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    fn map_error(error: tungstenite::Error) -> ConnectionError {
        match error {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                ConnectionError::Closed
            }
            other => ConnectionError::TransportError(other.to_string()),
        }
    }

    impl PushTransport for WebSocketTransport {
        async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
            self.stream
                .send(Message::Text(text.into()))
                .await
                .map_err(map_error)
        }

        async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => return Ok(Some(text)),
                        Err(_) => trace!(len = bytes.len(), "skipping non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => {}
                    Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
                    Some(Err(error)) => return Err(map_error(error)),
                }
            }
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            match self.stream.close(None).await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
                Err(error) => Err(map_error(error)),
            }
        }
    }
}

#[cfg(feature = "native")]
pub use native::{WebSocketConnector, WebSocketTransport};
