//! Server-sent-events client for the realtime feed.
//!
//! `GET {base}/workspaces/{tenant}/events?token=...` streams
//! `text/event-stream` frames whose `data` is one JSON [`RealtimeEvent`].
//! The token rides in the query string because the browser-style event
//! source the backend targets cannot set headers.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use stowage_core::TenantId;
use stowage_events::RealtimeEvent;

use crate::error::RealtimeError;
use crate::realtime::{FeedStream, RealtimeConnector};

/// One dispatched event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field; `message` when absent.
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn is_keep_alive(&self) -> bool {
        matches!(self.event.as_str(), "heartbeat" | "ping") || self.data.trim().is_empty()
    }
}

/// Incremental `text/event-stream` parser.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence;
/// only complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the frames it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
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
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // `id` and `retry` are not used by this client.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Opens the realtime feed over HTTP.
#[derive(Debug, Clone)]
pub struct SseConnector {
    client: reqwest::Client,
    base_url: String,
}

impl SseConnector {
    /// `connect_timeout` bounds the handshake only; the stream itself is
    /// long-lived.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, RealtimeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, tenant_id: TenantId) -> String {
        format!("{}/workspaces/{}/events", self.base_url, tenant_id)
    }
}

type ByteStream = BoxStream<'static, Result<Vec<u8>, RealtimeError>>;

struct FeedState {
    bytes: ByteStream,
    parser: SseParser,
    ready: VecDeque<SseFrame>,
}

#[async_trait]
impl RealtimeConnector for SseConnector {
    async fn connect(&self, tenant_id: TenantId, credential: &str) -> Result<FeedStream, RealtimeError> {
        let resp = self
            .client
            .get(self.url(tenant_id))
            .query(&[("token", credential)])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RealtimeError::Unauthorized);
        }
        if !status.is_success() {
            return Err(RealtimeError::Transport(format!("feed handshake failed with {status}")));
        }
        tracing::debug!(tenant_id = %tenant_id, "event stream opened");

        let bytes: ByteStream = resp
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| RealtimeError::Transport(e.to_string()))
            })
            .boxed();

        Ok(frames_to_events(bytes))
    }
}

fn frames_to_events(bytes: ByteStream) -> FeedStream {
    let state = FeedState {
        bytes,
        parser: SseParser::new(),
        ready: VecDeque::new(),
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            if let Some(frame) = state.ready.pop_front() {
                if frame.is_keep_alive() {
                    continue;
                }
                let event = RealtimeEvent::decode(&frame.data).map_err(|e| RealtimeError::Decode(e.to_string()));
                return Some((event, Some(state)));
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.parser.push(&chunk);
                    state.ready.extend(frames);
                }
                // Surface the failure, then end the stream.
                Some(Err(e)) => return Some((Err(e), None)),
                None => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let raw = "event: item.updated\ndata: {\"a\":\ndata: 1}\n\n: keep-alive\n\ndata: x\r\n\r\n";
        let mut parser = SseParser::new();
        let mut frames = Vec::new();
        for chunk in raw.as_bytes().chunks(3) {
            frames.extend(parser.push(chunk));
        }

        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "item.updated".into(),
                    data: "{\"a\":\n1}".into(),
                },
                SseFrame {
                    event: "message".into(),
                    data: "x".into(),
                },
            ]
        );
    }

    #[test]
    fn multibyte_text_split_across_chunks() {
        let raw = "data: caf\u{e9}\n\n".as_bytes();
        let mut parser = SseParser::new();
        // Split inside the two-byte sequence.
        let mut frames = parser.push(&raw[..10]);
        frames.extend(parser.push(&raw[10..]));
        assert_eq!(frames[0].data, "caf\u{e9}");
    }

    #[tokio::test]
    async fn keep_alives_are_skipped_and_bad_frames_reported() {
        let tenant = TenantId::new();
        let event = json!({
            "type": "item.created",
            "entity_id": "srv_1",
            "entity_type": "item",
            "workspace_id": tenant,
            "timestamp": "2026-01-01T00:00:00Z",
            "data": {"name": "Drill"}
        });
        let body = format!("event: heartbeat\ndata: {{}}\n\ndata: not json\n\ndata: {event}\n\n");
        let chunks: Vec<Result<Vec<u8>, RealtimeError>> = vec![Ok(body.into_bytes())];

        let feed: Vec<_> = frames_to_events(stream::iter(chunks).boxed()).collect().await;

        assert_eq!(feed.len(), 2);
        assert!(matches!(feed[0], Err(RealtimeError::Decode(_))));
        let decoded = feed[1].as_ref().unwrap();
        assert_eq!(decoded.entity_id, "srv_1");
        assert_eq!(decoded.workspace_id, tenant);
    }
}
