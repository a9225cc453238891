//! Server-sent event framing used by streamable HTTP responses.

use futures_util::StreamExt;
use serde_json::Value;

#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    /// Splits off every complete line; `flush` also takes the unterminated
    /// tail. Blank and non-UTF-8 lines are dropped.
    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let end = if flush {
            self.buffer.len()
        } else {
            match self.buffer.iter().rposition(|byte| *byte == b'\n') {
                Some(last) => last + 1,
                None => return Vec::new(),
            }
        };
        let lines = self.buffer[..end]
            .split(|byte| *byte == b'\n')
            .filter_map(|raw| std::str::from_utf8(raw).ok())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        self.buffer.drain(..end);
        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Decodes one SSE line into a JSON-RPC payload, ignoring non-data lines.
pub fn decode_sse_line(line: &str) -> Option<Value> {
    let payload = sse_data_payload(line)?;
    if payload.is_empty() {
        return None;
    }
    serde_json::from_str(payload).ok()
}

/// Feeds every JSON payload of an event stream to `on_payload` until it
/// returns `true` or the stream ends. Returns whether `on_payload` stopped it.
pub async fn drain_event_stream(
    response: reqwest::Response,
    mut on_payload: impl FnMut(Value) -> bool,
) -> Result<bool, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        for line in buffer.push(&chunk) {
            if let Some(payload) = decode_sse_line(&line) {
                if on_payload(payload) {
                    return Ok(true);
                }
            }
        }
    }
    for line in buffer.finish() {
        if let Some(payload) = decode_sse_line(&line) {
            if on_payload(payload) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
