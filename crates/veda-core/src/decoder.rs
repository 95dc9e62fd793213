//! Decoder for the `data:`-framed reply stream of `POST /chat/send-stream`.
//!
//! The body is plain text split into lines. Content lines carry a `data:`
//! prefix, blank lines separate frames, anything else is ignored, and a
//! payload of `[DONE]` ends the reply. Chunks from the network can split a
//! line, the `data:` token, or a multi-byte character anywhere, so the decoder
//! keeps both an undecoded byte tail and an unterminated line between calls.

use std::collections::VecDeque;

use futures::{Stream, StreamExt};

use crate::error::{Result, VedaError};
use crate::model::StreamEvent;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Push-style decoder. Feed it raw chunks in arrival order.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// Text after the last line feed seen so far.
    buffer: String,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been decoded. Later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode one chunk and return the events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.decode_utf8(chunk);

        let mut events = Vec::new();
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return events;
        };
        let carry = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, carry);

        for line in complete.split('\n') {
            match parse_line(line) {
                Some(StreamEvent::Done) => {
                    events.push(StreamEvent::Done);
                    self.finish_early();
                    break;
                }
                Some(event) => events.push(event),
                None => {}
            }
        }
        events
    }

    /// Signal end of input. An unterminated trailing line is dropped, not
    /// parsed: a reply that stops mid-frame is not recovered.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if !self.finished && (!self.buffer.is_empty() || !self.pending.is_empty()) {
            tracing::debug!(
                carry_len = self.buffer.len(),
                pending_bytes = self.pending.len(),
                "discarding unterminated tail of reply stream"
            );
        }
        self.buffer.clear();
        self.pending.clear();
        Vec::new()
    }

    fn finish_early(&mut self) {
        self.finished = true;
        self.buffer.clear();
        self.pending.clear();
    }

    /// Incremental UTF-8 decode into `buffer`. Invalid sequences become
    /// U+FFFD; an incomplete sequence at the end waits for the next chunk.
    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    // valid_up_to guarantees this slice is valid UTF-8
                    self.buffer.push_str(&String::from_utf8_lossy(
                        &self.pending[start..valid_end],
                    ));
                    match e.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            self.pending.drain(..valid_end);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Parse one complete line. `None` for separators and framing noise.
fn parse_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let payload = trimmed.strip_prefix(DATA_PREFIX)?;
    if payload.trim() == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }
    // One space after the colon is part of the framing, further spaces are content.
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    Some(StreamEvent::TextDelta(payload.to_string()))
}

struct DecodeState<S> {
    bytes: S,
    decoder: SseDecoder,
    queued: VecDeque<StreamEvent>,
    exhausted: bool,
}

/// Adapt a byte-chunk stream into a lazy stream of [`StreamEvent`]s.
///
/// The underlying stream is read until it ends, even after `Done`; bytes
/// past the sentinel are read and discarded. A read error is yielded once and
/// ends the sequence. Dropping the returned stream drops the byte stream.
pub fn decode_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<StreamEvent>>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<VedaError>,
{
    let state = DecodeState {
        bytes,
        decoder: SseDecoder::new(),
        queued: VecDeque::new(),
        exhausted: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.queued.pop_front() {
                return Some((Ok(event), st));
            }
            if st.exhausted {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.feed(chunk.as_ref());
                    st.queued.extend(events);
                }
                Some(Err(e)) => {
                    st.exhausted = true;
                    return Some((Err(e.into()), st));
                }
                None => {
                    st.exhausted = true;
                    let events = st.decoder.finish();
                    st.queued.extend(events);
                }
            }
        }
    })
}
