//! Server-Sent Events decoding for the upstream SSE transport.
//!
//! Frames follow the standard `event: <name>\ndata: <payload>\n\n` framing;
//! comment lines (leading `:`) are heartbeats.

use bytes::BytesMut;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; empty means the default `message` event.
    pub event: String,
    /// Joined `data:` lines.
    pub data: String,
}

impl SseEvent {
    pub fn is_message(&self) -> bool {
        self.event.is_empty() || self.event == "message"
    }
}

/// Decode every complete event in a fully buffered SSE body.
pub fn decode_sse_events(buf: &str) -> Vec<SseEvent> {
    let mut out = Vec::new();
    let mut event_name = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in buf.split('\n') {
        let l = line.trim_end_matches('\r');

        if l.is_empty() {
            if !data_lines.is_empty() {
                out.push(SseEvent {
                    event: std::mem::take(&mut event_name),
                    data: data_lines.join("\n"),
                });
                data_lines.clear();
            } else {
                event_name.clear();
            }
            continue;
        }

        // Comment lines are keepalives.
        if l.starts_with(':') {
            continue;
        }

        if let Some(rest) = l.strip_prefix("event:") {
            event_name = rest.trim_start().to_string();
        } else if let Some(rest) = l.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if !data_lines.is_empty() {
        out.push(SseEvent {
            event: event_name,
            data: data_lines.join("\n"),
        });
    }

    out
}

/// Pull the first `message` payload out of a buffered SSE body. Streamable
/// HTTP servers may answer a POST with a one-event stream.
pub fn first_message_payload(body: &str) -> Option<String> {
    decode_sse_events(body)
        .into_iter()
        .find(|ev| ev.is_message())
        .map(|ev| ev.data)
}

/// Incremental decoder for a live byte stream.
///
/// Feed chunks as they arrive; complete events come out, partial frames stay
/// buffered. Heartbeat comments are surfaced through the returned flag so
/// the session can reset its liveness timer without allocating events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
}

pub struct SseChunk {
    pub events: Vec<SseEvent>,
    /// True when the chunk contained any traffic at all (data or comment);
    /// any traffic counts as liveness.
    pub saw_activity: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> SseChunk {
        let saw_activity = !chunk.is_empty();
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        // A blank line terminates a frame; drain every complete frame.
        while let Some(pos) = find_frame_end(&self.buf) {
            let frame = self.buf.split_to(pos.end);
            let text = String::from_utf8_lossy(&frame[..pos.start]);
            events.extend(decode_sse_events(&text));
        }

        SseChunk {
            events,
            saw_activity,
        }
    }
}

struct FrameEnd {
    /// Byte length of the frame body (without the terminator).
    start: usize,
    /// Byte length including the terminator.
    end: usize,
}

fn find_frame_end(buf: &[u8]) -> Option<FrameEnd> {
    // Accept both \n\n and \r\n\r\n terminators.
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some(FrameEnd {
                start: i,
                end: i + 2,
            });
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some(FrameEnd {
                start: i,
                end: i + 4,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_event() {
        let s = "event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n";
        let ev = decode_sse_events(s);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].event, "message");
        assert_eq!(ev[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn joins_multiline_data() {
        let s = "data: a\ndata: b\n\n";
        let ev = decode_sse_events(s);
        assert_eq!(ev[0].data, "a\nb");
        assert!(ev[0].is_message());
    }

    #[test]
    fn skips_comment_heartbeats() {
        let s = ": keepalive\n\ndata: x\n\n";
        let ev = decode_sse_events(s);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].data, "x");
    }

    #[test]
    fn endpoint_event_is_named() {
        let s = "event: endpoint\ndata: /messages?sessionId=42\n\n";
        let ev = decode_sse_events(s);
        assert_eq!(ev[0].event, "endpoint");
        assert!(!ev[0].is_message());
    }

    #[test]
    fn first_message_skips_other_events() {
        let s = "event: endpoint\ndata: /m\n\nevent: message\ndata: {\"a\":1}\n\n";
        assert_eq!(first_message_payload(s).as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn incremental_decoder_handles_split_frames() {
        let mut dec = SseDecoder::new();
        let first = dec.feed(b"data: {\"jso");
        assert!(first.events.is_empty());
        assert!(first.saw_activity);

        let second = dec.feed(b"nrpc\":\"2.0\"}\n\ndata: tail");
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].data, "{\"jsonrpc\":\"2.0\"}");

        let third = dec.feed(b"\n\n");
        assert_eq!(third.events.len(), 1);
        assert_eq!(third.events[0].data, "tail");
    }

    #[test]
    fn crlf_terminated_frames() {
        let mut dec = SseDecoder::new();
        let out = dec.feed(b"data: x\r\n\r\n");
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].data, "x");
    }
}
