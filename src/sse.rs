//! SSE (Server-Sent Events) decoding for streamed completions.
//!
//! Deployments stream chunked completions as SSE, and the network is free
//! to split one event's JSON payload across several reads. Bytes are
//! therefore staged in an [`EventBuffer`] that only releases whole events
//! (a blank line, `\n\n`, ends one), and decoding happens per event. The
//! `data: [DONE]` sentinel marks the end of the stream.

use crate::errors::SwitchboardError;
use crate::models::ChatCompletionChunk;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

/// Staging area between raw network reads and whole SSE events.
///
/// Keeps a cursor over the bytes already searched so repeated polls don't
/// rescan the head of a large half-finished event.
#[derive(Default)]
struct EventBuffer {
    bytes: BytesMut,
    searched: usize,
}

impl EventBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Carve off the next complete event, terminator included.
    fn pop_event(&mut self) -> Option<Bytes> {
        // Back up one byte: the terminator may straddle the previous
        // search boundary.
        let start = self.searched.saturating_sub(1);
        for i in start..self.bytes.len().saturating_sub(1) {
            if self.bytes[i] == b'\n' && self.bytes[i + 1] == b'\n' {
                self.searched = 0;
                return Some(self.bytes.split_to(i + 2).freeze());
            }
        }
        self.searched = self.bytes.len();
        None
    }

    /// Whatever is left once the upstream closes, which may be a
    /// truncated event.
    fn take_rest(&mut self) -> Option<Bytes> {
        if self.bytes.is_empty() {
            None
        } else {
            Some(self.bytes.split().freeze())
        }
    }
}

/// Adapts a raw byte stream into a stream of whole SSE events.
pub(crate) struct SseEventStream<S> {
    upstream: S,
    events: EventBuffer,
    done: bool,
}

impl<S> SseEventStream<S> {
    pub(crate) fn new(upstream: S) -> Self {
        Self {
            upstream,
            events: EventBuffer::default(),
            done: false,
        }
    }
}

impl<S, E> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, SwitchboardError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.events.pop_event() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(this.events.take_rest().map(Ok));
            }
            match ready!(Pin::new(&mut this.upstream).poll_next(cx)) {
                Some(Ok(chunk)) => this.events.push(&chunk),
                Some(Err(e)) => {
                    return Poll::Ready(Some(Err(SwitchboardError::Stream(e.to_string()))));
                }
                None => this.done = true,
            }
        }
    }
}

/// Decode one buffered SSE event into a completion chunk.
///
/// Returns `Ok(None)` for events that carry no chunk: comments, empty
/// keep-alive lines, and the `[DONE]` terminator.
pub(crate) fn decode_event(event: &[u8]) -> Result<Option<ChatCompletionChunk>, SwitchboardError> {
    let text = std::str::from_utf8(event)
        .map_err(|e| SwitchboardError::Stream(format!("non-utf8 SSE event: {e}")))?;

    for line in text.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data.starts_with(':') {
            continue;
        }
        if data == "[DONE]" {
            return Ok(None);
        }
        let chunk = serde_json::from_str(data)
            .map_err(|e| SwitchboardError::Stream(format!("bad chunk payload: {e}")))?;
        return Ok(Some(chunk));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::convert::Infallible;

    #[test]
    fn buffer_holds_partial_events_back() {
        let mut buffer = EventBuffer::default();
        buffer.push(b"data: {\"choi");
        assert!(buffer.pop_event().is_none());

        buffer.push(b"ces\": []}\n\n");
        assert_eq!(
            buffer.pop_event().as_deref(),
            Some(b"data: {\"choices\": []}\n\n".as_slice())
        );
        assert!(buffer.pop_event().is_none());
    }

    #[test]
    fn buffer_releases_queued_events_one_at_a_time() {
        let mut buffer = EventBuffer::default();
        buffer.push(b"data: first\n\ndata: second\n\ndata: par");

        assert_eq!(buffer.pop_event().as_deref(), Some(b"data: first\n\n".as_slice()));
        assert_eq!(
            buffer.pop_event().as_deref(),
            Some(b"data: second\n\n".as_slice())
        );
        assert!(buffer.pop_event().is_none());
        assert_eq!(buffer.take_rest().as_deref(), Some(b"data: par".as_slice()));
    }

    #[test]
    fn buffer_finds_terminator_straddling_two_reads() {
        let mut buffer = EventBuffer::default();
        buffer.push(b"data: test\n");
        assert!(buffer.pop_event().is_none());

        buffer.push(b"\ndata: next\n\n");
        assert_eq!(buffer.pop_event().as_deref(), Some(b"data: test\n\n".as_slice()));
        assert_eq!(buffer.pop_event().as_deref(), Some(b"data: next\n\n".as_slice()));
    }

    fn reads(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    #[tokio::test]
    async fn stream_yields_whole_events_across_read_boundaries() {
        let stream = SseEventStream::new(reads(vec![
            b"data: a\n\ndata: b".as_slice(),
            b"cd\n\n".as_slice(),
        ]));
        let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref(), b"data: a\n\n");
        assert_eq!(events[1].as_ref(), b"data: bcd\n\n");
    }

    #[tokio::test]
    async fn stream_flushes_trailing_bytes_at_close() {
        let stream = SseEventStream::new(reads(vec![b"data: unterminated".as_slice()]));
        let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref(), b"data: unterminated");
    }

    #[tokio::test]
    async fn stream_surfaces_upstream_errors() {
        let upstream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"data: ok\n\n")),
            Err("connection reset"),
        ]);
        let events: Vec<_> = SseEventStream::new(upstream).collect().await;

        assert!(events[0].is_ok());
        assert!(matches!(&events[1], Err(SwitchboardError::Stream(m)) if m.contains("reset")));
    }

    #[test]
    fn decode_skips_done_sentinel() {
        assert!(decode_event(b"data: [DONE]\n\n").unwrap().is_none());
    }

    #[test]
    fn decode_parses_chunk_payload() {
        let event = br#"data: {"id":"c-1","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}

"#;
        let chunk = decode_event(event).unwrap().unwrap();
        assert_eq!(chunk.id.as_deref(), Some("c-1"));
        assert_eq!(
            chunk.choices[0].delta.as_ref().unwrap().content.as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(decode_event(b"data: {not json}\n\n").is_err());
    }

    #[test]
    fn decode_ignores_comments_and_blank_lines() {
        assert!(decode_event(b": keep-alive\n\n").unwrap().is_none());
        assert!(decode_event(b"\n\n").unwrap().is_none());
    }
}
