//! Frame decoding for the push stream.
//!
//! The server writes one JSON object per frame, frames separated by a blank
//! line:
//!
//! ```text
//! data: {"type":"message","content":"hi","via_channel":"#general"}
//!
//! data: {"filename":"voice_123.mp3"}
//!
//! ```
//!
//! Network reads can end anywhere, including in the middle of a multi-byte
//! UTF-8 sequence, so the decoder buffers raw bytes and only converts a frame
//! to text once its delimiter has arrived.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::{Event, Result};

/// Fields of the SSE format that carry no payload for us.
const IGNORED_FIELDS: [&str; 3] = ["event:", "id:", "retry:"];

/// Incremental frame decoder. One per connection.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Bytes before this offset are known not to start a delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            scanned: 0,
        }
    }

    /// Feed the next network read; returns every frame it completed.
    ///
    /// Frames without a payload (keep-alive comments, stray blank lines) are
    /// skipped and produce nothing.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Event>> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        while let Some((end, delimiter_len)) = find_delimiter(&self.buffer, self.scanned) {
            let frame = self.buffer.split_to(end + delimiter_len);
            self.scanned = 0;
            if let Some(result) = decode_frame(&frame[..end]) {
                decoded.push(result);
            }
        }
        // A delimiter is at most three bytes; rescan the tail next time.
        self.scanned = self.buffer.len().saturating_sub(2);
        decoded
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Result<Event>> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let frame = self.buffer.split();
        decode_frame(&frame)
    }

    /// Number of bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the first blank line at or after `from`.
///
/// Returns the offset where the frame ends and the delimiter length
/// (`\n\n` or `\n\r\n`).
fn find_delimiter(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buffer.len() {
        if buffer[i] == b'\n' {
            match (buffer.get(i + 1), buffer.get(i + 2)) {
                (Some(b'\n'), _) => return Some((i, 2)),
                (Some(b'\r'), Some(b'\n')) => return Some((i, 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn decode_frame(frame: &[u8]) -> Option<Result<Event>> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(e) => return Some(Err(e.into())),
    };
    let payload = frame_payload(text)?;
    Some(Event::from_json(&payload))
}

/// Extract the payload of one frame.
///
/// `data:` lines are unprefixed and joined; lines without a field name are
/// taken verbatim so that bare JSON frames work too.
fn frame_payload(frame: &str) -> Option<String> {
    let mut data: Vec<&str> = Vec::new();
    for line in frame.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
            continue;
        }
        if IGNORED_FIELDS.iter().any(|field| line.starts_with(field)) {
            continue;
        }
        data.push(line);
    }

    let payload = data.join("\n");
    let payload = payload.trim();
    if payload.is_empty() {
        None
    } else {
        Some(payload.to_string())
    }
}

/// Turn one connection's byte stream into an event stream.
///
/// Malformed frames are logged and skipped. A transport error is yielded as
/// the last item; the stream ends after it.
pub fn decode_stream<S, E>(byte_stream: S) -> impl Stream<Item = std::result::Result<Event, E>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, FrameDecoder::new(), VecDeque::new(), false),
        |(mut stream, mut decoder, mut ready, mut done)| async move {
            loop {
                if let Some(event) = ready.pop_front() {
                    return Some((Ok(event), (stream, decoder, ready, done)));
                }
                if done {
                    return None;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        for result in decoder.push(&chunk) {
                            collect(result, &mut ready);
                        }
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(e), (stream, decoder, ready, done)));
                    }
                    None => {
                        done = true;
                        if let Some(result) = decoder.finish() {
                            collect(result, &mut ready);
                        }
                    }
                }
            }
        },
    )
}

fn collect(result: Result<Event>, ready: &mut VecDeque<Event>) {
    match result {
        Ok(event) => {
            debug!(kind = %event.kind, id = %event.id, "decoded frame");
            ready.push_back(event);
        }
        Err(e) => warn!(error = %e, "dropping malformed frame"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, ParseError};

    const SAMPLE: &str = concat!(
        "data: {\"type\":\"message\",\"id\":\"1\",\"content\":\"h\u{e9}llo\",\"via_channel\":\"#general\",\"sent_at\":1}\n\n",
        "data: {\"type\":\"system\",\"id\":\"2\",\"content\":\"\u{1f980} crab\",\"sent_at\":2}\r\n\r\n",
        ": keep-alive\n\n",
        "data: {\"filename\":\"voice_\u{4e2d}.mp3\",\"id\":\"3\",\"sent_at\":3}\n\n",
        "data: {\"type\":\"end\",\"id\":\"4\",\"content\":\"END OF RESPONSE\",\"sent_at\":4}\n\n",
    );

    fn decode_all(chunks: &[&[u8]]) -> Vec<Event> {
        let mut decoder = FrameDecoder::new();
        let mut events: Vec<Event> = chunks
            .iter()
            .flat_map(|chunk| decoder.push(chunk))
            .map(|r| r.unwrap())
            .collect();
        events.extend(decoder.finish().map(|r| r.unwrap()));
        events
    }

    #[test]
    fn decodes_sample_in_order() {
        let events = decode_all(&[SAMPLE.as_bytes()]);
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4"]);
        assert_eq!(events[0].content(), Some("h\u{e9}llo"));
        assert_eq!(events[1].content(), Some("\u{1f980} crab"));
        assert_eq!(events[2].kind, EventKind::Audio);
        assert_eq!(events[3].kind, EventKind::End);
    }

    #[test]
    fn every_two_way_split_matches_unsplit_feed() {
        let bytes = SAMPLE.as_bytes();
        let expected = decode_all(&[bytes]);
        for at in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(at);
            assert_eq!(decode_all(&[head, tail]), expected, "split at byte {at}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_unsplit_feed() {
        let bytes = SAMPLE.as_bytes();
        let expected = decode_all(&[bytes]);
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_all(&chunks), expected);
    }

    #[test]
    fn partial_frame_waits_for_delimiter() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"user\",\"content\":\"a\"}\n").is_empty());
        assert!(decoder.buffered() > 0);
        let events = decoder.push(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn malformed_frame_does_not_stop_decoding() {
        let mut decoder = FrameDecoder::new();
        let results = decoder.push(
            b"data: {not json\n\ndata: {\"type\":\"user\",\"id\":\"ok\",\"content\":\"a\"}\n\n",
        );
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(ParseError::Json(_))));
        assert_eq!(results[1].as_ref().unwrap().id, "ok");
    }

    #[test]
    fn invalid_utf8_frame_is_an_error() {
        let mut decoder = FrameDecoder::new();
        let results = decoder.push(b"data: \xff\xfe\n\n");
        assert!(matches!(results[0], Err(ParseError::Utf8(_))));
    }

    #[test]
    fn prefix_is_optional() {
        let events = decode_all(&[b"{\"type\":\"user\",\"id\":\"x\",\"content\":\"bare\"}\n\n".as_slice()]);
        assert_eq!(events[0].content(), Some("bare"));
    }

    #[test]
    fn multi_line_data_is_joined() {
        let events = decode_all(&[
            b"event: message\ndata: {\"type\":\"user\",\ndata: \"content\":\"joined\"}\n\n".as_slice(),
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content(), Some("joined"));
    }

    #[test]
    fn trailing_frame_is_decoded_on_finish() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"end\"}").is_empty());
        let last = decoder.finish().unwrap().unwrap();
        assert_eq!(last.kind, EventKind::End);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn payload_extraction() {
        assert_eq!(frame_payload(": comment"), None);
        assert_eq!(frame_payload("data:"), None);
        assert_eq!(frame_payload("data:{\"a\":1}"), Some("{\"a\":1}".into()));
        assert_eq!(frame_payload("id: 7\nretry: 10\ndata: {}"), Some("{}".into()));
    }

    #[tokio::test]
    async fn stream_skips_bad_frames_and_keeps_order() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"user\",\"id\":\"a\",\"content\":\"1\"}\n\ndata: nope")),
            Ok(Bytes::from_static(b"\n\ndata: {\"type\":\"user\",\"id\":\"b\",\"content\":\"2\"}\n\n")),
        ];
        let events: Vec<_> = decode_stream(futures::stream::iter(chunks))
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(events, ["a", "b"]);
    }

    #[tokio::test]
    async fn stream_yields_transport_error_last() {
        let chunks: Vec<std::result::Result<Bytes, &'static str>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"user\",\"id\":\"a\",\"content\":\"1\"}\n\n")),
            Err("reset by peer"),
            Ok(Bytes::from_static(b"data: {\"type\":\"user\",\"id\":\"never\"}\n\n")),
        ];
        let items: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().id, "a");
        assert_eq!(items[1].as_ref().unwrap_err(), &"reset by peer");
    }
}
