//! Transport seam: how the channel reaches the engine's progress endpoint.

use async_trait::async_trait;
use reelctl_core::auth::Authenticator;

use crate::error::ChannelError;

/// A resolved loopback endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port`, the value handed to the engine.
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_base(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// One inbound message before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// SSE event name, if the transport has one.
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

/// Opens authenticated sessions against an endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a session. A rejected credential maps to
    /// [`ChannelError::AuthRequired`].
    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: &Authenticator,
    ) -> Result<Box<dyn FrameStream>, ChannelError>;
}

/// A live session.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame; `Ok(None)` when the peer closed the session.
    ///
    /// Must be cancel-safe: the channel polls it inside `select!`.
    async fn next_frame(&mut self) -> Result<Option<Frame>, ChannelError>;

    /// Keep-alive sent on the channel's heartbeat interval.
    async fn heartbeat(&mut self, _auth: &Authenticator) -> Result<(), ChannelError> {
        Ok(())
    }
}
