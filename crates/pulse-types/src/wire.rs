//! Text framing for the realtime stream.
//!
//! ```text
//! retry: 2000
//!
//! : latest_event_id=41
//!
//! id: 42
//! event: task_assignment_changed
//! data: {"id":42,"name":"task_assignment_changed",...}
//!
//! ```
//!
//! The server writes frames with the `*_frame` helpers; the client feeds raw
//! bytes into [`FrameDecoder`] and gets back whole [`RawFrame`]s regardless of
//! how the transport chunked them.

use crate::event::Event;

pub const STREAM_CONTENT_TYPE: &str = "text/event-stream";

const LATEST_ID_PREFIX: &str = "latest_event_id=";

/// Reconnection-delay directive sent first on every stream.
pub fn retry_frame(retry_ms: u64) -> String {
    format!("retry: {retry_ms}\n\n")
}

/// Diagnostic comment carrying the bus counter at connect time.
pub fn latest_id_frame(latest_event_id: u64) -> String {
    format!(": {LATEST_ID_PREFIX}{latest_event_id}\n\n")
}

pub fn event_frame(event: &Event) -> serde_json::Result<String> {
    let data = serde_json::to_string(event)?;
    Ok(format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        event.id, event.name, data
    ))
}

/// One blank-line-terminated block of the stream, fields still unparsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Option<String>,
    pub retry: Option<u64>,
    pub comments: Vec<String>,
}

impl RawFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }

    /// The `latest_event_id=<n>` value if this frame carries the prelude comment.
    pub fn latest_event_id(&self) -> Option<u64> {
        self.comments
            .iter()
            .find_map(|c| c.strip_prefix(LATEST_ID_PREFIX))
            .and_then(|n| n.trim().parse().ok())
    }

    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.event.is_none()
            && self.data.is_none()
            && self.retry.is_none()
            && self.comments.is_empty()
    }
}

/// Incremental stream parser.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    /// Tail of a chunk that ended inside a multi-byte UTF-8 sequence.
    partial: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; multi-byte characters may be split across calls.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.partial.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.partial);
        match std::str::from_utf8(&bytes) {
            Ok(text) => self.push(text),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.partial = bytes[valid..].to_vec();
                // valid_up_to guarantees this prefix decodes.
                let text = String::from_utf8_lossy(&bytes[..valid]).into_owned();
                self.push(&text)
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.push(&text)
            }
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<RawFrame> {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            let frame = parse_block(&block[..end]);
            if !frame.is_empty() {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> RawFrame {
    let mut frame = RawFrame::default();
    for line in block.split('\n') {
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix(':') {
            frame.comments.push(comment.trim_start().to_string());
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => frame.id = Some(value.to_string()),
            "event" => frame.event = Some(value.to_string()),
            "data" => match frame.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => frame.data = Some(value.to_string()),
            },
            "retry" => frame.retry = value.trim().parse().ok(),
            _ => {}
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventName, Scope};
    use chrono::Utc;

    fn sample_event() -> Event {
        let mut payload = serde_json::Map::new();
        payload.insert("taskAssignmentId".into(), "ta-1".into());
        Event {
            id: 7,
            name: EventName::TaskAssignmentChanged,
            scope: Scope::Tasks,
            timestamp: Utc::now(),
            payload: Some(payload),
        }
    }

    #[test]
    fn event_frame_layout() {
        let frame = event_frame(&sample_event()).unwrap();
        assert!(frame.starts_with("id: 7\nevent: task_assignment_changed\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains(r#""taskAssignmentId":"ta-1""#));
    }

    #[test]
    fn prelude_frames() {
        assert_eq!(retry_frame(2000), "retry: 2000\n\n");
        assert_eq!(latest_id_frame(0), ": latest_event_id=0\n\n");
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let text = format!(
            "{}{}{}",
            retry_frame(2000),
            latest_id_frame(6),
            event_frame(&sample_event()).unwrap()
        );
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in text.as_bytes().chunks(5) {
            frames.extend(decoder.push_bytes(chunk));
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].retry, Some(2000));
        assert_eq!(frames[1].latest_event_id(), Some(6));
        assert_eq!(frames[2].id.as_deref(), Some("7"));
        assert_eq!(frames[2].event.as_deref(), Some("task_assignment_changed"));

        let parsed: Event = serde_json::from_str(frames[2].data.as_deref().unwrap()).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.payload_str("taskAssignmentId"), Some("ta-1"));
    }

    #[test]
    fn decoder_crlf_and_multiline_data() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push("data: one\r\ndata: two\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_deref(), Some("one\ntwo"));
    }

    #[test]
    fn decoder_keeps_incomplete_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push("id: 1\nevent: heartbeat\n").is_empty());
        let frames = decoder.push("data: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("1"));
    }

    #[test]
    fn decoder_split_utf8() {
        let mut decoder = FrameDecoder::new();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let (head, tail) = bytes.split_at(10); // inside the two-byte é
        assert!(decoder.push_bytes(head).is_empty());
        let frames = decoder.push_bytes(tail);
        assert_eq!(frames[0].data.as_deref(), Some("caf\u{e9}"));
    }
}
