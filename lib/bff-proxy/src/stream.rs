//! Server-sent event relay
//!
//! A relay session moves through `Open -> Relaying -> Closing -> Closed`:
//!
//! - `Open`: SSE headers are already on their way to the client; the backend
//!   stream is being opened.
//! - `Relaying`: backend chunks are copied to the client as they arrive.
//! - `Closing`: the gateway writes its own terminal event, if one is needed.
//! - `Closed`: both sides are released.
//!
//! Every path through `Closing` leaves the client with an event whose JSON
//! carries `"finished": true`. A client disconnect skips `Closing` entirely and
//! drops the backend stream, which cancels the read.

use crate::forwarder::UpstreamStream;
use crate::http::{BoxError, GatewayBody};
use bff_core::Result;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Pending chunks between the relay task and the client connection
pub const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Longest partial event kept while looking for an event boundary
const MAX_PENDING_EVENT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Relaying,
    Closing,
    Closed,
}

/// Why a relay session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Backend sent its own terminal event
    Completed,
    /// Backend closed without one; the gateway sent it
    Synthesized,
    UpstreamError,
    TimedOut,
    ClientDisconnected,
}

/// Encode one SSE event
pub fn sse_event(data: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", data))
}

/// Response body fed by the relay task through a bounded channel
pub fn channel_body(rx: mpsc::Receiver<Bytes>) -> GatewayBody {
    let frames = ReceiverStream::new(rx).map(|chunk| Ok::<_, BoxError>(Frame::data(chunk)));
    BodyExt::boxed(StreamBody::new(frames))
}

/// Watches relayed bytes for a terminal event without altering them
#[derive(Debug, Default)]
pub struct SseScanner {
    pending: Vec<u8>,
    saw_terminal: bool,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saw_terminal(&self) -> bool {
        self.saw_terminal
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        while let Some(end) = self.pending.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.pending.drain(..end + 2).collect();
            if Self::is_terminal(&event) {
                self.saw_terminal = true;
            }
        }

        if self.pending.len() > MAX_PENDING_EVENT_BYTES {
            debug!(bytes = self.pending.len(), "Discarding oversized partial SSE event");
            self.pending.clear();
        }
    }

    fn is_terminal(event: &[u8]) -> bool {
        let text = String::from_utf8_lossy(event);
        let data: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();
        if data.is_empty() {
            return false;
        }
        serde_json::from_str::<Value>(&data.join("\n"))
            .map(|v| v.get("finished").and_then(Value::as_bool) == Some(true))
            .unwrap_or(false)
    }
}

struct StreamSession {
    state: StreamState,
    tx: mpsc::Sender<Bytes>,
    scanner: SseScanner,
}

impl StreamSession {
    fn transition(&mut self, next: StreamState) {
        debug!(from = ?self.state, to = ?next, "Stream state change");
        self.state = next;
    }

    /// Write the gateway's terminal event and close
    async fn close_with(&mut self, payload: Value, end: StreamEnd) -> StreamEnd {
        self.transition(StreamState::Closing);
        let end = match self.tx.send(sse_event(&payload)).await {
            Ok(()) => end,
            Err(_) => StreamEnd::ClientDisconnected,
        };
        self.transition(StreamState::Closed);
        end
    }

    fn disconnected(&mut self) -> StreamEnd {
        debug!("Client disconnected, dropping backend stream");
        self.transition(StreamState::Closed);
        StreamEnd::ClientDisconnected
    }
}

pub struct StreamRelay {
    timeout: Duration,
}

impl StreamRelay {
    /// `timeout` bounds the whole session, including opening the backend stream
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn error_payload() -> Value {
        json!({"error": "Upstream stream failed", "finished": true})
    }

    fn timeout_payload() -> Value {
        json!({"error": "stream timed out", "finished": true})
    }

    fn upstream_closed_payload() -> Value {
        json!({"finished": true, "reason": "upstream_closed"})
    }

    pub async fn run<F>(&self, open: F, tx: mpsc::Sender<Bytes>) -> StreamEnd
    where
        F: Future<Output = Result<UpstreamStream>>,
    {
        let mut session = StreamSession {
            state: StreamState::Open,
            tx,
            scanner: SseScanner::new(),
        };
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        tokio::pin!(open);

        let tx = session.tx.clone();
        let mut source = tokio::select! {
            biased;
            _ = tx.closed() => return session.disconnected(),
            _ = &mut deadline => {
                warn!("Stream timed out before the backend answered");
                return session.close_with(Self::timeout_payload(), StreamEnd::TimedOut).await;
            }
            opened = &mut open => match opened {
                Ok(source) => source,
                Err(e) => {
                    warn!(error = %e, "Failed to open backend stream");
                    return session.close_with(Self::error_payload(), StreamEnd::UpstreamError).await;
                }
            },
        };

        session.transition(StreamState::Relaying);
        loop {
            tokio::select! {
                biased;
                _ = tx.closed() => return session.disconnected(),
                _ = &mut deadline => {
                    warn!(timeout_secs = self.timeout.as_secs(), "Stream timed out");
                    return session.close_with(Self::timeout_payload(), StreamEnd::TimedOut).await;
                }
                next = source.next() => match next {
                    Some(Ok(chunk)) => {
                        session.scanner.feed(&chunk);
                        if session.tx.send(chunk).await.is_err() {
                            return session.disconnected();
                        }
                        if session.scanner.saw_terminal() {
                            session.transition(StreamState::Closing);
                            session.transition(StreamState::Closed);
                            return StreamEnd::Completed;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Backend stream failed");
                        return session.close_with(Self::error_payload(), StreamEnd::UpstreamError).await;
                    }
                    None => {
                        debug!("Backend closed stream without a terminal event");
                        return session
                            .close_with(Self::upstream_closed_payload(), StreamEnd::Synthesized)
                            .await;
                    }
                },
            }
        }
    }
}
