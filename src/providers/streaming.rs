use bytes::Bytes;
use futures::stream::Stream;
use once_cell::sync::Lazy;
use pin_project::pin_project;
use regex::Regex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// SSE event from an upstream response stream.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse one raw SSE event block (the text between two blank lines).
fn parse_sse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data = String::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // "id:", "retry:" and comment lines are ignored
    }

    if data.is_empty() && event.is_none() {
        None
    } else {
        Some(SseEvent { event, data })
    }
}

/// Parse every complete SSE event in `input`.
pub fn parse_sse_events(input: &str) -> Vec<SseEvent> {
    input
        .split("\n\n")
        .filter_map(parse_sse_block)
        .collect()
}

/// Stream adapter turning a raw byte stream into SSE events.
///
/// Events are only emitted once their terminating blank line has arrived;
/// partial events (and multi-byte characters split across network chunks)
/// stay buffered as bytes until complete.
#[pin_project]
pub struct SseStream<S> {
    #[pin]
    inner: S,
    buffer: Vec<u8>,
    pending: VecDeque<SseEvent>,
}

impl<S> SseStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }
    }
}

/// Find the end of the next complete event block, returning the offset
/// just past its separator. Servers terminate blocks with either LF or
/// CRLF blank lines.
fn find_block_end(buffer: &[u8]) -> Option<usize> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    type Item = Result<SseEvent, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    while let Some(end) = find_block_end(this.buffer) {
                        let block: Vec<u8> = this.buffer.drain(..end).collect();
                        let text = String::from_utf8_lossy(&block);
                        if let Some(event) = parse_sse_block(&text) {
                            this.pending.push_back(event);
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    // Flush whatever trailing event lacks its blank line.
                    if !this.buffer.is_empty() {
                        let text = String::from_utf8_lossy(this.buffer).into_owned();
                        this.buffer.clear();
                        if let Some(event) = parse_sse_block(&text) {
                            return Poll::Ready(Some(Ok(event)));
                        }
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Punctuation boundary: ASCII or CJK sentence/clause punctuation plus any
/// trailing whitespace.
static PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.,;:!?，。！？；：]\s*").expect("punctuation regex"));

/// Re-segments token-by-token deltas into punctuation-bounded chunks.
///
/// Downstream speech synthesis starts speaking a clause as soon as its
/// punctuation arrives instead of waiting for the full response, so every
/// flushed segment ends at a punctuation boundary and the concatenation of
/// all segments (plus the final remainder) reproduces the input exactly.
#[derive(Debug, Default)]
pub struct SegmentBuffer {
    buffer: String,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return any segments now complete.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut segments = Vec::new();
        let mut last = 0;
        for found in PUNCTUATION.find_iter(&self.buffer) {
            segments.push(self.buffer[last..found.end()].to_string());
            last = found.end();
        }

        if last > 0 {
            self.buffer.drain(..last);
        }
        segments
    }

    /// Drain the unflushed remainder, if any.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}
