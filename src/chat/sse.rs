//! Incremental parser for `data:` lines of an SSE chat stream.
//!
//! The chat endpoint only ever sends `data:` fields, so this keeps just the
//! line-assembly part of the protocol: feed transport chunks in, get complete
//! payload strings out. Chunks are buffered as bytes and decoded per line,
//! because the transport may split a multi-byte character across chunks and
//! replies are mostly CJK text.
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"你好"}}]}
//!
//! data: [DONE]
//! ```

/// Payload of the stream-end sentinel event.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Assembles `data:` payloads from arbitrarily-chunked SSE bytes.
#[derive(Debug, Default)]
pub struct SseDataParser {
    buffer: Vec<u8>,
}

impl SseDataParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk; returns the payloads of all `data:` lines
    /// completed by it. Other field lines and comments are skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(payload) = data_payload(line.trim_end_matches(['\n', '\r'])) {
                payloads.push(payload.to_owned());
            }
        }
        payloads
    }

    /// Flush a final unterminated line once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        data_payload(line.trim_end_matches('\r')).map(str::to_owned)
    }
}

/// Extract the payload of a `data:` line, stripping the single optional
/// space after the colon.
fn data_payload(line: &str) -> Option<&str> {
    let value = line.strip_prefix("data:")?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn single_chunk_yields_payload() {
        let mut parser = SseDataParser::new();
        let payloads = parser.feed(b"data: {\"x\":1}\n\n");
        assert_eq!(payloads, vec!["{\"x\":1}"]);
    }

    #[test]
    fn line_split_across_chunks() {
        let mut parser = SseDataParser::new();
        assert!(parser.feed(b"data: hel").is_empty());
        assert_eq!(parser.feed(b"lo\n"), vec!["hello"]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let mut parser = SseDataParser::new();
        let bytes = "data: 你好\n".as_bytes();
        // Split inside the three-byte encoding of 你.
        assert!(parser.feed(&bytes[..8]).is_empty());
        assert_eq!(parser.feed(&bytes[8..]), vec!["你好"]);
    }

    #[test]
    fn crlf_lines_are_stripped() {
        let mut parser = SseDataParser::new();
        assert_eq!(parser.feed(b"data: hi\r\n\r\n"), vec!["hi"]);
    }

    #[test]
    fn non_data_lines_are_skipped() {
        let mut parser = SseDataParser::new();
        let payloads = parser.feed(b": keepalive\nevent: delta\nretry: 500\ndata: x\n");
        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn no_space_after_colon_is_accepted() {
        let mut parser = SseDataParser::new();
        assert_eq!(parser.feed(b"data:tight\n"), vec!["tight"]);
    }

    #[test]
    fn done_sentinel_passes_through() {
        let mut parser = SseDataParser::new();
        assert_eq!(parser.feed(b"data: [DONE]\n"), vec![DONE_SENTINEL]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut parser = SseDataParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        assert_eq!(parser.finish().as_deref(), Some("tail"));
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn multiple_payloads_in_one_chunk() {
        let mut parser = SseDataParser::new();
        let payloads = parser.feed(b"data: a\n\ndata: b\n\ndata: c\n");
        assert_eq!(payloads, vec!["a", "b", "c"]);
    }
}
