//! Event-stream (SSE) transport.
//!
//! Subscribes to `GET /progress/stream?auth=..&ts=..&sig=..` and decodes
//! the `text/event-stream` body incrementally. Heartbeats are POSTed to
//! `/heartbeat` with the bearer and signature headers.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reelctl_core::auth::Authenticator;
use reqwest::StatusCode;

use crate::error::ChannelError;
use crate::transport::{Endpoint, Frame, FrameStream, Transport};

pub const STREAM_PATH: &str = "/progress/stream";
pub const HEARTBEAT_PATH: &str = "/heartbeat";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EventStreamTransport {
    client: reqwest::Client,
}

impl EventStreamTransport {
    pub fn new() -> Self {
        // Loopback only, so never route through a proxy.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for EventStreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: &Authenticator,
    ) -> Result<Box<dyn FrameStream>, ChannelError> {
        let url = auth.sign_authenticated_url(&format!("{}{STREAM_PATH}", endpoint.http_base()))?;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.without_url().to_string()))?;

        check_status(response.status())?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(Box::new(SseFrameStream {
            body,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            client: self.client.clone(),
            heartbeat_url: format!("{}{HEARTBEAT_PATH}", endpoint.http_base()),
        }))
    }
}

fn check_status(status: StatusCode) -> Result<(), ChannelError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ChannelError::AuthRequired),
        s if !s.is_success() => Err(ChannelError::Http(s.as_u16())),
        _ => Ok(()),
    }
}

struct SseFrameStream {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<Frame>,
    client: reqwest::Client,
    heartbeat_url: String,
}

#[async_trait]
impl FrameStream for SseFrameStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.decoder.push(&chunk)),
                Some(Err(e)) => {
                    return Err(ChannelError::Transport(e.without_url().to_string()))
                }
                None => return Ok(self.decoder.finish()),
            }
        }
    }

    async fn heartbeat(&mut self, auth: &Authenticator) -> Result<(), ChannelError> {
        let headers = auth.build_auth_headers()?;
        let mut request = self
            .client
            .post(&self.heartbeat_url)
            .timeout(HEARTBEAT_TIMEOUT);
        for (name, value) in headers.to_pairs() {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.without_url().to_string()))?;
        check_status(response.status())
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Handles `event:` and multi-line `data:` fields, CRLF line endings,
/// comments and chunk boundaries anywhere (including inside a UTF-8
/// sequence). `id:` and `retry:` are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk, returning every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// End of body: dispatch a final event that lacked its blank line.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.line(line.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(Frame { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"frame\":").is_empty());
        let frames = decoder.push(b"1}\n\nevent: heartbeat\ndata:\n\n");
        assert_eq!(
            frames,
            vec![
                Frame::data(r#"{"frame":1}"#),
                Frame {
                    event: Some("heartbeat".to_string()),
                    data: String::new(),
                },
            ]
        );
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(b": keep-alive\r\ndata: a\r\ndata: b\r\nid: 7\r\n\r\n");
        assert_eq!(frames, vec![Frame::data("a\nb")]);
    }

    #[test]
    fn split_utf8_sequence_is_reassembled() {
        let mut decoder = SseDecoder::default();
        let text = "data: café\n\n".as_bytes();
        let (a, b) = text.split_at(10);
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec![Frame::data("café")]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some(Frame::data("tail")));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(ChannelError::AuthRequired)
        ));
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND),
            Err(ChannelError::Http(404))
        ));
    }
}
