//! WebSocket transport.
//!
//! Alternative to the event stream for engines that serve a socket at
//! `/progress/socket`. The handshake carries the same signed query as the
//! event stream and is retried a bounded number of times on its own before
//! the channel's backoff takes over. Heartbeats travel in-band.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reelctl_core::auth::Authenticator;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ChannelError;
use crate::transport::{Endpoint, Frame, FrameStream, Transport};

pub const SOCKET_PATH: &str = "/progress/socket";

const HEARTBEAT_MESSAGE: &str = r#"{"type":"heartbeat"}"#;

pub struct SocketTransport {
    handshake_attempts: u32,
    handshake_delay: Duration,
}

impl SocketTransport {
    pub fn new(handshake_attempts: u32, handshake_delay: Duration) -> Self {
        Self {
            handshake_attempts: handshake_attempts.max(1),
            handshake_delay,
        }
    }
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: &Authenticator,
    ) -> Result<Box<dyn FrameStream>, ChannelError> {
        let url = auth.sign_authenticated_url(&format!("{}{SOCKET_PATH}", endpoint.ws_base()))?;

        let mut last_error = ChannelError::Closed;
        for attempt in 1..=self.handshake_attempts {
            match connect_async(url.as_str()).await {
                Ok((ws, _response)) => {
                    tracing::debug!(port = endpoint.port, attempt, "Progress socket connected");
                    return Ok(Box::new(SocketFrameStream { ws }));
                }
                Err(tungstenite::Error::Http(response))
                    if matches!(response.status().as_u16(), 401 | 403) =>
                {
                    return Err(ChannelError::AuthRequired);
                }
                Err(e) => {
                    tracing::debug!(port = endpoint.port, attempt, error = %e, "Socket handshake failed");
                    last_error = ChannelError::Transport(e.to_string());
                }
            }
            if attempt < self.handshake_attempts {
                tokio::time::sleep(self.handshake_delay * attempt).await;
            }
        }
        Err(last_error)
    }
}

struct SocketFrameStream {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl FrameStream for SocketFrameStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        while let Some(message) = self.ws.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(Frame::data(text))),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Progress socket closed by peer");
                    return Ok(None);
                }
                // Binary payloads are not part of the protocol.
                Ok(Message::Binary(_)) => tracing::trace!("Ignoring binary socket frame"),
                // Ping/pong are answered by tungstenite.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Err(ChannelError::Transport(e.to_string())),
            }
        }
        Ok(None)
    }

    async fn heartbeat(&mut self, _auth: &Authenticator) -> Result<(), ChannelError> {
        self.ws
            .send(Message::Text(HEARTBEAT_MESSAGE.to_string()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}
