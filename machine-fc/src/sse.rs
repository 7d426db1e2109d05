//! Incremental Server-Sent-Events parser for the guest `/events` stream.
//!
//! Frames arrive as arbitrary TCP chunks; the parser buffers partial lines
//! and yields a frame per blank-line boundary. `data:` lines within a frame
//! are joined with newlines per the SSE spec; comment lines and unknown
//! fields are skipped.

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field, when the frame carried one.
    pub event: Option<String>,
    /// Joined `data:` lines (empty for keepalive-style frames).
    pub data: String,
}

#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Feed a chunk of bytes, returning every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    frames.push(frame);
                }
            } else {
                self.field(line);
            }
        }
        frames
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(strip_leading_space(value).to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(strip_leading_space(value).to_string());
        }
        // id:, retry:, and unknown fields are irrelevant to this consumer.
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data_lines.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

/// The SSE spec allows exactly one optional space after the field colon.
fn strip_leading_space(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str) -> Vec<SseFrame> {
        SseParser::default().push(input.as_bytes())
    }

    #[test]
    fn single_frame() {
        let frames = parse_all("event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn data_only_frame() {
        let frames = parse_all("data: hello\n\n");
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn multiple_data_lines_joined() {
        let frames = parse_all("data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn crlf_line_endings() {
        let frames = parse_all("event: e\r\ndata: d\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("e"));
        assert_eq!(frames[0].data, "d");
    }

    #[test]
    fn comment_only_input_yields_nothing() {
        assert!(parse_all(": keepalive\n\n").is_empty());
    }

    #[test]
    fn blank_lines_without_fields_yield_nothing() {
        assert!(parse_all("\n\n\n").is_empty());
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"event: mes").is_empty());
        assert!(parser.push(b"sage\ndata: pay").is_empty());
        let frames = parser.push(b"load\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "payload");
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let frames = parse_all("data: a\n\ndata: b\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "a");
        assert_eq!(frames[1].data, "b");
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let mut parser = SseParser::default();
        let bytes = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        let cut = 8;
        assert!(parser.push(&bytes[..cut]).is_empty());
        let frames = parser.push(&bytes[cut..]);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn no_space_after_colon() {
        let frames = parse_all("data:tight\n\n");
        assert_eq!(frames[0].data, "tight");
    }

    #[test]
    fn event_without_data_is_surfaced_empty() {
        let frames = parse_all("event: ping\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("ping"));
        assert_eq!(frames[0].data, "");
    }
}
