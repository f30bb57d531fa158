use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use switchboard_core::errors::EngineError;
use switchboard_core::events::RawEvent;

/// Split raw SSE text into `(event, data)` pairs.
///
/// Multiple `data:` lines are joined with newlines. Comment lines (`:`) are
/// skipped. An event with no `event:` line is labelled `message`.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    let mut flush = |event: &mut String, data: &mut Vec<&str>| {
        if !data.is_empty() || !event.is_empty() {
            let label = if event.is_empty() { "message".to_string() } else { std::mem::take(event) };
            events.push((label, data.join("\n")));
            data.clear();
        }
    };

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            flush(&mut current_event, &mut data_lines);
        } else if line.starts_with(':') {
            continue;
        } else if let Some(event) = field(line, "event") {
            current_event = event.to_string();
        } else if let Some(data) = field(line, "data") {
            data_lines.push(data);
        }
    }
    flush(&mut current_event, &mut data_lines);

    events
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Turn one SSE `(event, data)` pair into a raw engine event.
///
/// JSON object payloads get the SSE label as their `event` field when they
/// don't carry one. Anything else is passed through as-is and left for the
/// translator to reject.
pub fn to_raw_event(label: &str, data: &str) -> RawEvent {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(mut map)) => {
            if !map.contains_key("event") && label != "message" {
                map.insert("event".into(), Value::String(label.to_string()));
            }
            RawEvent::new(Value::Object(map))
        }
        Ok(other) => RawEvent::new(other),
        Err(_) => RawEvent::new(Value::String(data.to_string())),
    }
}

/// End offset of the first complete event in `buf`: the position just past a
/// blank line, with or without `\r` before each `\n`.
fn event_boundary(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(i, &b)| {
        if b != b'\n' {
            return None;
        }
        let mut j = i + 1;
        if buf.get(j) == Some(&b'\r') {
            j += 1;
        }
        (buf.get(j) == Some(&b'\n')).then_some(j + 1)
    })
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// Wraps an HTTP byte stream and yields raw engine events.
/// Fails with `StreamInterrupted` if no bytes arrive within the idle timeout.
pub struct SseEventStream {
    inner: ByteStream,
    buffer: Vec<u8>,
    pending: std::collections::VecDeque<RawEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseEventStream {
    pub fn new<S, E>(byte_stream: S, idle_timeout: Duration) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Self {
            inner: Box::pin(byte_stream.map(|r| r.map_err(|e| e.to_string()))),
            buffer: Vec::new(),
            pending: std::collections::VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn drain_complete(&mut self) {
        while let Some(end) = event_boundary(&self.buffer) {
            let chunk: Vec<u8> = self.buffer.drain(..end).collect();
            self.push_events(&chunk);
        }
    }

    // Only whole events are decoded, so multi-byte characters split across
    // network chunks survive.
    fn push_events(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for (label, data) in parse_sse_lines(&text) {
            self.pending.push_back(to_raw_event(&label, &data));
        }
    }
}

impl Stream for SseEventStream {
    type Item = Result<RawEvent, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    self.buffer.extend_from_slice(&bytes);
                    self.drain_complete();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(EngineError::StreamInterrupted(e))));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    let remaining = std::mem::take(&mut self.buffer);
                    self.push_events(&remaining);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(EngineError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_lines_basic() {
        let raw = "event: RunStarted\ndata: {\"a\":1}\n\nevent: RunCompleted\ndata: {}\n\n";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ("RunStarted".to_string(), "{\"a\":1}".to_string()));
        assert_eq!(events[1].0, "RunCompleted");
    }

    #[test]
    fn parse_sse_lines_multiline_data_and_comments() {
        let raw = ": keep-alive\n\ndata: line one\ndata: line two\n\n";
        let events = parse_sse_lines(raw);
        assert_eq!(events, vec![("message".to_string(), "line one\nline two".to_string())]);
    }

    #[test]
    fn parse_sse_lines_without_space_and_trailing_event() {
        let events = parse_sse_lines("event:RunContent\ndata:{\"content\":\"hi\"}");
        assert_eq!(events, vec![("RunContent".to_string(), "{\"content\":\"hi\"}".to_string())]);
    }

    #[test]
    fn to_raw_event_fills_label() {
        let raw = to_raw_event("TeamRunStarted", r#"{"team_name":"Research Team"}"#);
        assert_eq!(raw.label(), Some("TeamRunStarted"));

        let raw = to_raw_event("message", r#"{"event":"RunContent","content":"x"}"#);
        assert_eq!(raw.label(), Some("RunContent"));
    }

    #[test]
    fn to_raw_event_keeps_garbage_unlabelled() {
        let raw = to_raw_event("RunContent", "not json");
        assert_eq!(raw.label(), None);
    }

    #[tokio::test]
    async fn stream_splits_across_chunks() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from("event: RunStarted\ndata: {\"agent_name\":\"main\"}\n")),
            Ok(Bytes::from("\nevent: RunContent\r\ndata: {\"content\":\"hel")),
            Ok(Bytes::from("lo\"}\r\n\r\n")),
        ];
        let stream = SseEventStream::new(futures::stream::iter(chunks), Duration::from_secs(5));
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        let second = events[1].as_ref().unwrap();
        assert_eq!(second.label(), Some("RunContent"));
        assert_eq!(second.str_field("content"), Some("hello"));
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"event: RunContent\ndata: {\"content\":\"\xc3")),
            Ok(Bytes::from_static(b"\xa6 og \xc3\xb8\"}\r")),
            Ok(Bytes::from_static(b"\n\r\nevent: RunCompleted\ndata: {}\n\n")),
        ];
        let stream = SseEventStream::new(futures::stream::iter(chunks), Duration::from_secs(5));
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().unwrap();
        assert_eq!(first.label(), Some("RunContent"));
        assert_eq!(first.str_field("content"), Some("æ og ø"));
        assert_eq!(events[1].as_ref().unwrap().label(), Some("RunCompleted"));
    }

    #[test]
    fn event_boundary_handles_both_line_endings() {
        assert_eq!(event_boundary(b"data: x\n\nrest"), Some(9));
        assert_eq!(event_boundary(b"data: x\r\n\r\nrest"), Some(11));
        assert_eq!(event_boundary(b"data: x\r\n"), None);
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let chunks: Vec<Result<Bytes, String>> = vec![Err("connection reset".into())];
        let mut stream = SseEventStream::new(futures::stream::iter(chunks), Duration::from_secs(5));
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(EngineError::StreamInterrupted(ref m)) if m.contains("reset")));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_when_no_data() {
        let byte_stream = futures::stream::pending::<Result<Bytes, String>>();
        let mut stream = SseEventStream::new(byte_stream, Duration::from_secs(5));

        let event = stream.next().await;
        assert!(
            matches!(&event, Some(Err(EngineError::StreamInterrupted(msg))) if msg.contains("idle timeout")),
            "expected idle timeout, got: {event:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_resets_on_data() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, String>>(16);
        let mut stream = SseEventStream::new(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        );

        tx.send(Ok(Bytes::from("event: RunContent\ndata: {}\n\n"))).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());

        tokio::time::advance(Duration::from_secs(4)).await;
        tx.send(Ok(Bytes::from("event: RunContent\ndata: {}\n\n"))).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());

        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
