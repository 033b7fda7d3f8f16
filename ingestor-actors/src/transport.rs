use std::future::Future;
use thiserror::Error;
use tracing::{info, warn};
use workflow_websocket::client::{
    ConnectOptions, ConnectStrategy, Message, WebSocket, WebSocketConfig,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("subscription rejected: {0}")]
    Subscribe(String),
    #[error("connection closed by peer")]
    Closed,
}

/// Push side of the upstream feed: one text/binary frame at a time.
pub trait FeedTransport: Send + 'static {
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_text(&mut self, text: String)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next frame, or [`TransportError::Closed`] once the peer went away.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// WebSocket JSON-RPC endpoint. Reconnects are driven by the subscriber, the
/// socket itself only tries once per [`FeedTransport::connect`].
pub struct WsTransport {
    url: String,
    socket: Option<WebSocket>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: None,
        }
    }

    fn socket(&self) -> Result<&WebSocket, TransportError> {
        self.socket.as_ref().ok_or(TransportError::Closed)
    }
}

impl FeedTransport for WsTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let socket = WebSocket::new(Some(&self.url), Some(WebSocketConfig::default()))
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        socket
            .connect(ConnectOptions {
                block_async_connect: true,
                strategy: ConnectStrategy::Fallback,
                ..Default::default()
            })
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        info!(url = %self.url, "Feed socket connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.socket()?
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket()?;
        loop {
            match socket
                .recv()
                .await
                .map_err(|err| TransportError::Receive(err.to_string()))?
            {
                Message::Text(text) => return Ok(text.into_bytes()),
                Message::Binary(bytes) => return Ok(bytes),
                Message::Close => return Err(TransportError::Closed),
                _ => continue,
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            _ = socket
                .disconnect()
                .await
                .inspect_err(|err| warn!("Error disconnecting feed socket: {err}"));
        }
    }
}
