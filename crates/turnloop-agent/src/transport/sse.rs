//! Server-sent event decoding.
//!
//! The request/response service streams `event:` and `data:` lines in
//! standard SSE format.  Every `data:` payload is a JSON object carrying its
//! own `type`, so the `event:` line is informational only.  Events end at a
//! blank line; multiple `data:` lines in one event are joined with `\n`.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, BoxStream, Stream, StreamExt};

use turnloop_protocol::ServerEvent;

use crate::error::{AgentError, Result};
use crate::transport::ServerEventStream;

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so chunks may split
/// lines (and multi-byte characters) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes after the last complete line.
    buffer: Vec<u8>,
    /// `data:` lines of the event being assembled.
    data: Vec<String>,
    /// The most recently seen `event:` name.
    event_name: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ServerEvent>> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = std::str::from_utf8(&line).map_err(|e| AgentError::Transport {
                reason: format!("invalid UTF-8 in stream: {e}"),
            })?;
            if let Some(event) = self.parse_line(line)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Result<Vec<ServerEvent>> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8(rest).map_err(|e| AgentError::Transport {
                reason: format!("invalid UTF-8 in stream: {e}"),
            })?;
            if let Some(event) = self.parse_line(&line)? {
                events.push(event);
            }
        }
        if let Some(event) = self.dispatch()? {
            events.push(event);
        }
        Ok(events)
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<ServerEvent>> {
        let line = line.trim_end_matches(['\n', '\r']);

        if line.is_empty() {
            return self.dispatch();
        }

        // Comment.
        if line.starts_with(':') {
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            _ => tracing::trace!(line, "ignoring unrecognised SSE line"),
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Result<Option<ServerEvent>> {
        let event_name = self.event_name.take();
        if self.data.is_empty() {
            return Ok(None);
        }

        let data = std::mem::take(&mut self.data).join("\n");
        if data.trim() == "[DONE]" {
            return Ok(None);
        }

        let event: ServerEvent = serde_json::from_str(&data).map_err(|e| AgentError::Transport {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;
        if matches!(event, ServerEvent::Unknown) {
            tracing::trace!(event = ?event_name, "ignoring unknown server event");
        }
        Ok(Some(event))
    }
}

/// Decode a byte stream into server events.
///
/// The returned stream ends after the first error.
pub fn decode_stream<S, B, E>(bytes: S) -> ServerEventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    struct State<B, E> {
        bytes: BoxStream<'static, std::result::Result<B, E>>,
        decoder: SseDecoder,
        ready: VecDeque<ServerEvent>,
        finished: bool,
    }

    let state = State {
        bytes: bytes.boxed(),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            let decoded = match state.bytes.next().await {
                Some(Ok(chunk)) => state.decoder.feed(chunk.as_ref()),
                Some(Err(e)) => Err(AgentError::Transport {
                    reason: format!("stream read error: {e}"),
                }),
                None => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };

            match decoded {
                Ok(events) => state.ready.extend(events),
                Err(e) => {
                    state.finished = true;
                    state.ready.clear();
                    return Some((Err(e), state));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATED: &str = "event: response.created\n\
        data: {\"type\":\"response.created\",\"sequence_number\":0,\"response\":{\"id\":\"resp_1\",\"status\":\"in_progress\",\"output\":[]}}\n\n";

    #[test]
    fn decodes_complete_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(CREATED.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::ResponseCreated { response, .. } => assert_eq!(response.id, "resp_1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn split_chunks_reassemble() {
        let mut decoder = SseDecoder::new();
        let bytes = CREATED.as_bytes();
        let (a, b) = bytes.split_at(37);

        assert!(decoder.feed(a).unwrap().is_empty());
        assert_eq!(decoder.feed(b).unwrap().len(), 1);
    }

    #[test]
    fn split_multibyte_character() {
        let text = "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"m\",\"output_index\":0,\"content_index\":0,\"delta\":\"caf\u{e9}\"}\n\n";
        let bytes = text.as_bytes();
        let cut = text.find('\u{e9}').unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(&bytes[..cut]).unwrap().is_empty());
        let events = decoder.feed(&bytes[cut..]).unwrap();
        match &events[0] {
            ServerEvent::OutputTextDelta { delta, .. } => assert_eq!(delta, "caf\u{e9}"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn comments_and_done_are_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\n\ndata: [DONE]\n\n").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_types_decode_as_unknown() {
        let mut decoder = SseDecoder::new();
        let events = decoder
            .feed(b"data: {\"type\":\"response.reasoning.delta\",\"delta\":\"x\"}\n\n")
            .unwrap();
        assert!(matches!(events[0], ServerEvent::Unknown));
    }

    #[test]
    fn invalid_json_is_transport_error() {
        let mut decoder = SseDecoder::new();
        let err = decoder.feed(b"data: {oops\n\n").unwrap_err();
        assert!(matches!(err, AgentError::Transport { .. }));
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        let trimmed = CREATED.trim_end_matches('\n');
        assert!(decoder.feed(trimmed.as_bytes()).unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn decode_stream_yields_events_then_ends() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(CREATED.as_bytes()[..20].to_vec()),
            Ok(CREATED.as_bytes()[20..].to_vec()),
        ];
        let mut events = decode_stream(stream::iter(chunks));

        assert!(matches!(
            events.next().await,
            Some(Ok(ServerEvent::ResponseCreated { .. }))
        ));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn decode_stream_stops_after_read_error() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> =
            vec![Err("connection reset".into()), Ok(CREATED.as_bytes().to_vec())];
        let mut events = decode_stream(stream::iter(chunks));

        assert!(matches!(
            events.next().await,
            Some(Err(AgentError::Transport { .. }))
        ));
        assert!(events.next().await.is_none());
    }
}
