//! Streaming decoders for the two wire framings providers use:
//! server-sent events carrying `data: {json}` payloads, and newline-delimited
//! JSON objects.
//!
//! Both report text through a chunk callback: every non-empty delta as
//! `(fragment, false)`, then exactly one `("", true)` when the stream ends,
//! whether by an explicit terminal marker or by the connection closing.

use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::{ConnectorError, ConnectorResult};

/// Payload that ends an OpenAI-style event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Callback receiving `(text_fragment, is_final)`.
pub type ChunkCallback<'a> = dyn FnMut(&str, bool) + Send + 'a;

#[derive(Debug, PartialEq)]
enum Frame {
    Delta(String),
    Done,
    Skip,
    Failed(String),
}

#[derive(Default)]
struct Accumulator {
    text: String,
}

impl Accumulator {
    fn push(&mut self, fragment: &str, on_chunk: &mut ChunkCallback<'_>) {
        if fragment.is_empty() {
            return;
        }
        self.text.push_str(fragment);
        on_chunk(fragment, false);
    }

    fn finish(self, on_chunk: &mut ChunkCallback<'_>) -> String {
        on_chunk("", true);
        self.text
    }
}

/// Extracts a readable message from an error object embedded in a frame.
fn error_message(payload: &Value) -> Option<String> {
    let error = payload.get("error").filter(|e| !e.is_null())?;
    let message = match error {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    };
    Some(message)
}

/// Text at `delta_pointer`. A `/*` segment fans out over an array and joins the
/// text found under each element, in order.
fn delta_at(payload: &Value, delta_pointer: &str) -> String {
    match delta_pointer.split_once("/*") {
        Some((array, rest)) => payload
            .pointer(array)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.pointer(rest).and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default(),
        None => payload
            .pointer(delta_pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn event_frame(data: &str, delta_pointer: &str) -> Frame {
    let data = data.trim();
    if data.is_empty() {
        return Frame::Skip;
    }
    if data == DONE_SENTINEL {
        return Frame::Done;
    }
    let payload: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Skipping malformed stream frame: {} - Data: {}", e, data);
            return Frame::Skip;
        }
    };
    if let Some(message) = error_message(&payload) {
        return Frame::Failed(message);
    }
    if payload.get("type").and_then(Value::as_str) == Some("message_stop") {
        return Frame::Done;
    }
    let delta = delta_at(&payload, delta_pointer);
    if delta.is_empty() {
        Frame::Skip
    } else {
        Frame::Delta(delta)
    }
}

/// Decodes an event stream, pulling each delta from `delta_pointer`
/// (a JSON pointer such as `/choices/0/delta/content`, optionally with one
/// `/*` array segment).
///
/// Bytes the event parser cannot read at all (invalid UTF-8, broken framing)
/// fail with [`ConnectorError::Decode`]; a malformed JSON payload in an
/// otherwise readable frame is only skipped.
pub async fn decode_event_stream<S, B, E>(
    byte_stream: S,
    delta_pointer: &str,
    on_chunk: &mut ChunkCallback<'_>,
) -> ConnectorResult<String>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut events = Box::pin(byte_stream.eventsource());
    let mut acc = Accumulator::default();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| match e {
            EventStreamError::Transport(e) => ConnectorError::Transport(format!("Error reading stream event: {}", e)),
            unreadable => ConnectorError::Decode(unreadable.to_string()),
        })?;
        match event_frame(&event.data, delta_pointer) {
            Frame::Delta(text) => {
                log::debug!("Received {} byte delta", text.len());
                acc.push(&text, on_chunk);
            }
            Frame::Done => {
                log::info!("Stream finished with terminal marker");
                return Ok(acc.finish(on_chunk));
            }
            Frame::Skip => {}
            Frame::Failed(message) => {
                log::error!("Provider reported an error mid-stream: {}", message);
                return Err(ConnectorError::Transport(message));
            }
        }
    }

    log::info!("Stream closed without terminal marker");
    Ok(acc.finish(on_chunk))
}

/// Splits a byte stream into complete lines, holding back a trailing partial
/// line until the bytes that complete it arrive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Returns the unterminated remainder once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

fn json_line_frames(line: &str, delta_pointer: &str, done_field: &str) -> Vec<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let payload: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Skipping malformed JSON line: {} - Data: {}", e, line);
            return Vec::new();
        }
    };
    if let Some(message) = error_message(&payload) {
        return vec![Frame::Failed(message)];
    }
    let mut frames = Vec::new();
    let delta = delta_at(&payload, delta_pointer);
    if !delta.is_empty() {
        frames.push(Frame::Delta(delta));
    }
    if payload.get(done_field).and_then(Value::as_bool) == Some(true) {
        frames.push(Frame::Done);
    }
    frames
}

/// Feeds frames into the accumulator. Returns `Ok(true)` once a terminal frame is seen.
fn apply_frames(frames: Vec<Frame>, acc: &mut Accumulator, on_chunk: &mut ChunkCallback<'_>) -> ConnectorResult<bool> {
    for frame in frames {
        match frame {
            Frame::Delta(text) => acc.push(&text, on_chunk),
            Frame::Done => return Ok(true),
            Frame::Skip => {}
            Frame::Failed(message) => {
                log::error!("Provider reported an error mid-stream: {}", message);
                return Err(ConnectorError::Transport(message));
            }
        }
    }
    Ok(false)
}

/// Decodes newline-delimited JSON. A line whose `done_field` is `true` ends the
/// stream after its own delta is delivered.
pub async fn decode_json_lines<S, B, E>(
    byte_stream: S,
    delta_pointer: &str,
    done_field: &str,
    on_chunk: &mut ChunkCallback<'_>,
) -> ConnectorResult<String>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut byte_stream = Box::pin(byte_stream);
    let mut lines = LineBuffer::new();
    let mut acc = Accumulator::default();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| ConnectorError::Transport(format!("Error reading stream: {}", e)))?;
        for line in lines.push(chunk.as_ref()) {
            if apply_frames(json_line_frames(&line, delta_pointer, done_field), &mut acc, on_chunk)? {
                log::info!("Stream finished with done flag");
                return Ok(acc.finish(on_chunk));
            }
        }
    }

    if let Some(rest) = lines.finish() {
        apply_frames(json_line_frames(&rest, delta_pointer, done_field), &mut acc, on_chunk)?;
    }
    log::info!("Stream closed");
    Ok(acc.finish(on_chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    type Chunk = Result<&'static str, std::io::Error>;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Chunk> + Send {
        stream::iter(parts.iter().map(|p| Ok(*p)).collect::<Vec<Chunk>>())
    }

    async fn collect_events(parts: &[&'static str], pointer: &str) -> (ConnectorResult<String>, Vec<(String, bool)>) {
        let mut calls = Vec::new();
        let result = decode_event_stream(chunks(parts), pointer, &mut |text: &str, is_final: bool| {
            calls.push((text.to_string(), is_final))
        })
        .await;
        (result, calls)
    }

    #[tokio::test]
    async fn split_frame_decodes_like_whole_frame() {
        let (whole, _) = collect_events(&["data: {\"delta\":\"hi\"}\n\n"], "/delta").await;
        let (split, calls) = collect_events(&["data: {\"del", "ta\":\"hi\"}\n\n"], "/delta").await;
        assert_eq!(whole.unwrap(), "hi");
        assert_eq!(split.unwrap(), "hi");
        assert_eq!(calls, vec![("hi".to_string(), false), (String::new(), true)]);
    }

    #[tokio::test]
    async fn openai_stream_stops_at_done_sentinel() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let (result, calls) = collect_events(&[body], "/choices/0/delta/content").await;
        assert_eq!(result.unwrap(), "Hello");
        assert_eq!(calls.iter().filter(|(_, f)| *f).count(), 1);
        assert_eq!(calls.last().unwrap(), &(String::new(), true));
    }

    #[tokio::test]
    async fn anthropic_stream_ends_at_message_stop() {
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: ping\ndata: {\"type\": \"ping\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi!\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        let (result, _) = collect_events(&[body], "/delta/text").await;
        assert_eq!(result.unwrap(), "Hi!");
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let (result, calls) = collect_events(
            &["data: {not json\n\n", "data: {\"delta\":\"ok\"}\n\n"],
            "/delta",
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn natural_close_still_sends_one_final_chunk() {
        let (result, calls) = collect_events(&[], "/delta").await;
        assert_eq!(result.unwrap(), "");
        assert_eq!(calls, vec![(String::new(), true)]);
    }

    #[tokio::test]
    async fn transport_failure_propagates() {
        let parts: Vec<Chunk> = vec![
            Ok("data: {\"delta\":\"par\"}\n\n"),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut finals = 0;
        let result = decode_event_stream(stream::iter(parts), "/delta", &mut |_: &str, is_final: bool| {
            if is_final {
                finals += 1;
            }
        })
        .await;
        assert!(matches!(result, Err(ConnectorError::Transport(_))));
        assert_eq!(finals, 0);
    }

    #[tokio::test]
    async fn error_payload_fails_the_stream() {
        let (result, _) = collect_events(
            &["data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n"],
            "/delta/text",
        )
        .await;
        match result {
            Err(ConnectorError::Transport(message)) => assert_eq!(message, "Overloaded"),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wildcard_pointer_joins_every_part() {
        let (result, calls) = collect_events(
            &["data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Two \"},{\"inlineData\":{}},{\"text\":\"cats\"}]}}]}\n\n"],
            "/candidates/0/content/parts/*/text",
        )
        .await;
        assert_eq!(result.unwrap(), "Two cats");
        assert_eq!(calls[0], ("Two cats".to_string(), false));
    }

    #[tokio::test]
    async fn unreadable_bytes_fail_as_decode_error() {
        let parts: Vec<Result<&'static [u8], std::io::Error>> = vec![
            Ok(&b"data: {\"delta\":\"a\"}\n\n"[..]),
            Ok(&b"data: \xff\xfe\n\n"[..]),
        ];
        let mut finals = 0;
        let result = decode_event_stream(stream::iter(parts), "/delta", &mut |_: &str, is_final: bool| {
            if is_final {
                finals += 1;
            }
        })
        .await;
        assert!(matches!(result, Err(ConnectorError::Decode(_))), "got {:?}", result);
        assert!(result.unwrap_err().is_transport());
        assert_eq!(finals, 0);
    }

    #[test]
    fn line_buffer_holds_partial_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\r\n{\"b\""), vec!["{\"a\":1}".to_string()]);
        assert_eq!(buf.push(b":2}\n"), vec!["{\"b\":2}".to_string()]);
        assert_eq!(buf.finish(), None);

        buf.push(b"tail");
        assert_eq!(buf.finish().as_deref(), Some("tail"));
    }

    #[tokio::test]
    async fn json_lines_split_across_reads() {
        let parts = [
            "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"mess",
            "age\":{\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
        ];
        let mut calls = Vec::new();
        let result = decode_json_lines(chunks(&parts), "/message/content", "done", &mut |t: &str, f: bool| {
            calls.push((t.to_string(), f))
        })
        .await;
        assert_eq!(result.unwrap(), "Hello");
        assert_eq!(
            calls,
            vec![
                ("Hel".to_string(), false),
                ("lo".to_string(), false),
                (String::new(), true)
            ]
        );
    }

    #[tokio::test]
    async fn json_lines_without_trailing_newline_or_done() {
        let mut finals = 0;
        let result = decode_json_lines(
            chunks(&["garbage\n", "{\"message\":{\"content\":\"end\"}}"]),
            "/message/content",
            "done",
            &mut |_: &str, f: bool| {
                if f {
                    finals += 1;
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "end");
        assert_eq!(finals, 1);
    }

    #[tokio::test]
    async fn json_lines_error_object_fails() {
        let result = decode_json_lines(
            chunks(&["{\"error\":\"model 'llava' not found\"}\n"]),
            "/message/content",
            "done",
            &mut |_: &str, _: bool| {},
        )
        .await;
        assert!(matches!(result, Err(ConnectorError::Transport(m)) if m.contains("not found")));
    }
}
