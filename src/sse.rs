//! Server-sent-event framing shared by every streaming route.
//!
//! The pull loop in [`frame_stream`] takes one chunk from the upstream, asks the
//! protocol's [`FrameEncoder`] for the wire frames, and yields each frame as its
//! own body chunk so the transport flushes it immediately. The upstream stream
//! is owned by the loop, so it is released on every exit path: clean end,
//! terminal chunk, upstream error, or the client going away mid-stream.

use crate::canonical::Chunk;
use crate::error::Result;
use crate::upstream::ChunkStream;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use tokio_util::sync::DropGuard;

/// Terminator required by the OpenAI-style protocols.
pub const DONE: &str = "[DONE]";

/// One SSE frame: an optional `event:` line and a `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<&'static str>,
    pub data: String,
}

impl Frame {
    pub fn json<T: Serialize>(payload: &T) -> Result<Self> {
        Ok(Self {
            event: None,
            data: serde_json::to_string(payload)?,
        })
    }

    pub fn done() -> Self {
        Self {
            event: None,
            data: DONE.to_string(),
        }
    }

    pub fn with_event(mut self, event: &'static str) -> Self {
        self.event = Some(event);
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(event) = self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        out.push_str("data: ");
        out.push_str(&self.data);
        out.push_str("\n\n");
        Bytes::from(out)
    }
}

/// Per-protocol translation of canonical chunks into wire frames.
pub trait FrameEncoder: Send + 'static {
    /// Frames for a single upstream chunk.
    fn encode_chunk(&mut self, chunk: &Chunk) -> Result<Vec<Frame>>;

    /// Closing frames, written exactly once after the loop ends however it ended.
    fn finish(&mut self) -> Vec<Frame>;
}

/// Drive `chunks` through `encoder`, yielding encoded frames.
///
/// `guard` lives as long as the body does; dropping the body (client
/// disconnect) drops it and cancels the request context.
pub fn frame_stream<E: FrameEncoder>(
    chunks: ChunkStream,
    mut encoder: E,
    guard: Option<DropGuard>,
) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let _guard = guard;
        let mut chunks = chunks;
        let mut pulled = 0usize;

        while let Some(item) = chunks.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(error = %e, pulled, "Upstream stream failed mid-response");
                    break;
                }
            };
            pulled += 1;

            match encoder.encode_chunk(&chunk) {
                Ok(frames) => {
                    for frame in frames {
                        yield Ok::<Bytes, Infallible>(frame.to_bytes());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, chunk_id = %chunk.id, "Skipping chunk that failed to encode");
                }
            }

            if chunk.finished {
                break;
            }
        }

        drop(chunks);

        for frame in encoder.finish() {
            yield Ok::<Bytes, Infallible>(frame.to_bytes());
        }
        tracing::debug!(pulled, "Stream completed");
    }
}

/// Wrap a frame stream in an event-stream response.
pub fn event_stream_response<S>(frames: S) -> Response
where
    S: Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
