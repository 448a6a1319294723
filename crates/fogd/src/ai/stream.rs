//! Stream-JSON parser for assistant output.
//!
//! The supported assistants emit newline-delimited JSON in several
//! dialects. The parser buffers partial lines until a newline arrives,
//! flushes a trailing incomplete line on close, and harmonizes the
//! dialects into plain display text. Lines that fail to parse as JSON are
//! forwarded verbatim (with a trailing newline) and do not count toward
//! extracted output.

use serde_json::{Map, Value};

/// Depth bound for the recursive continuation-ID search.
const ID_SEARCH_DEPTH: u32 = 5;
/// Depth bound for text flattening.
const TEXT_FLATTEN_DEPTH: u32 = 6;

/// Keys that may carry the assistant-side conversation token.
const CONTINUATION_KEYS: [&str; 4] =
    ["session_id", "sessionId", "conversation_id", "conversationId"];
/// Preferred text keys, probed in order.
const TEXT_KEYS: [&str; 5] = ["output_text", "text", "delta", "content", "message"];
/// Fallback container keys, probed after the text keys.
const CONTAINER_KEYS: [&str; 3] = ["result", "data", "payload"];
/// Keys probed inside nested objects while flattening.
const NESTED_TEXT_KEYS: [&str; 6] = ["output_text", "text", "delta", "content", "message", "value"];

/// Incremental parser over an assistant's stdout/stderr byte stream.
#[derive(Debug, Default)]
pub struct StreamJsonParser {
    pending: Vec<u8>,
    output: String,
    conversation_id: Option<String>,
}

impl StreamJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns display chunks to emit, in order.
    ///
    /// Chunk boundaries are preserved byte-for-byte; leading whitespace in
    /// a chunk is significant and must survive to the consumer.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.pending.extend_from_slice(chunk);
        self.consume_lines(false)
    }

    /// Flush any trailing incomplete line and return its display chunks.
    pub fn close(&mut self) -> Vec<String> {
        self.consume_lines(true)
    }

    /// Extracted output accumulated so far, trimmed.
    pub fn output(&self) -> String {
        self.output.trim().to_string()
    }

    /// First continuation ID seen in the stream, frozen once captured.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    fn consume_lines(&mut self, flush: bool) -> Vec<String> {
        let mut emitted = Vec::new();
        while let Some(idx) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if let Some(chunk) = self.process_line(&line) {
                emitted.push(chunk);
            }
        }
        if flush && !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            if let Some(chunk) = self.process_line(&line) {
                emitted.push(chunk);
            }
        }
        emitted
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let payload: Map<String, Value> = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => map,
            // Opaque text: forwarded, never extracted.
            _ => return Some(format!("{trimmed}\n")),
        };

        if self.conversation_id.is_none() {
            self.conversation_id = extract_conversation_id(&payload);
        }

        let text = extract_stream_text(&payload)?;
        if text.trim().is_empty() {
            return None;
        }
        self.output.push_str(&text);
        Some(text)
    }
}

fn extract_conversation_id(payload: &Map<String, Value>) -> Option<String> {
    let value = Value::Object(payload.clone());
    CONTINUATION_KEYS
        .iter()
        .find_map(|key| deep_find_string(&value, key, ID_SEARCH_DEPTH))
}

/// Recursively search for a string value under a case-insensitive key.
fn deep_find_string(value: &Value, target_key: &str, depth: u32) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key.eq_ignore_ascii_case(target_key) {
                    if let Value::String(s) = child {
                        let s = s.trim();
                        if !s.is_empty() {
                            return Some(s.to_string());
                        }
                    }
                }
            }
            if depth == 0 {
                return None;
            }
            map.values()
                .find_map(|child| deep_find_string(child, target_key, depth - 1))
        }
        Value::Array(items) => {
            if depth == 0 {
                return None;
            }
            items
                .iter()
                .find_map(|child| deep_find_string(child, target_key, depth - 1))
        }
        _ => None,
    }
}

fn extract_stream_text(payload: &Map<String, Value>) -> Option<String> {
    let event_type = first_string(payload, &["type", "event_type", "event"])
        .unwrap_or_default()
        .to_ascii_lowercase();
    let role = first_string(payload, &["role", "speaker"])
        .unwrap_or_default()
        .to_ascii_lowercase();
    // Echoed user turns are noise, not assistant output.
    if role == "user" || event_type.contains("user") {
        return None;
    }

    for key in TEXT_KEYS {
        if let Some(text) = payload.get(key).and_then(|v| flatten_text(v, TEXT_FLATTEN_DEPTH)) {
            return Some(text);
        }
    }
    for key in CONTAINER_KEYS {
        if let Some(text) = payload.get(key).and_then(|v| flatten_text(v, TEXT_FLATTEN_DEPTH)) {
            return Some(text);
        }
    }
    None
}

fn first_string(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(s)) = payload.get(*key) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Flatten a JSON value to display text.
///
/// Strings pass through untouched; arrays concatenate their flattened
/// children; objects are probed by preferred key, then `parts`, then any
/// child, bounded by `depth`.
fn flatten_text(value: &Value, depth: u32) -> Option<String> {
    match value {
        Value::String(s) => {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        }
        Value::Array(items) => {
            if depth == 0 {
                return None;
            }
            let mut out = String::new();
            for item in items {
                if let Some(text) = flatten_text(item, depth - 1) {
                    out.push_str(&text);
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        Value::Object(map) => {
            if depth == 0 {
                return None;
            }
            for key in NESTED_TEXT_KEYS {
                if let Some(text) = map.get(key).and_then(|v| flatten_text(v, depth - 1)) {
                    return Some(text);
                }
            }
            if let Some(text) = map.get("parts").and_then(|v| flatten_text(v, depth - 1)) {
                return Some(text);
            }
            map.values().find_map(|child| flatten_text(child, depth - 1))
        }
        _ => None,
    }
}

/// Detect an "unknown flag" complaint in tool output.
///
/// Used to decide whether to retry once without the stream-JSON flag.
pub fn looks_like_unsupported_flag(output: &str) -> bool {
    let value = output.trim().to_ascii_lowercase();
    if value.is_empty() {
        return false;
    }
    value.contains("unknown flag") || value.contains("flag provided but not defined")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut StreamJsonParser, lines: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        for line in lines {
            chunks.extend(parser.feed(line.as_bytes()));
        }
        chunks.extend(parser.close());
        chunks
    }

    #[test]
    fn extracts_text_and_preserves_chunk_boundaries() {
        let mut parser = StreamJsonParser::new();
        let chunks = feed_all(
            &mut parser,
            &[
                "{\"type\":\"assistant\",\"text\":\"Hello\"}\n",
                "{\"role\":\"user\",\"text\":\"nope\"}\n",
                "{\"type\":\"assistant\",\"text\":\" world\"}\n",
            ],
        );

        assert_eq!(parser.output(), "Hello world");
        assert_eq!(chunks, vec!["Hello".to_string(), " world".to_string()]);
    }

    #[test]
    fn captures_and_freezes_conversation_id() {
        let mut parser = StreamJsonParser::new();
        feed_all(
            &mut parser,
            &[
                "{\"type\":\"result\",\"session_id\":\"sess-123\"}\n",
                "{\"type\":\"result\",\"session_id\":\"sess-456\"}\n",
            ],
        );
        assert_eq!(parser.conversation_id(), Some("sess-123"));
    }

    #[test]
    fn finds_nested_conversation_id() {
        let mut parser = StreamJsonParser::new();
        feed_all(
            &mut parser,
            &["{\"meta\":{\"inner\":{\"conversationId\":\"c-9\"}}}\n"],
        );
        assert_eq!(parser.conversation_id(), Some("c-9"));
    }

    #[test]
    fn ignores_user_role_and_user_event_types() {
        let mut parser = StreamJsonParser::new();
        feed_all(
            &mut parser,
            &[
                "{\"role\":\"user\",\"text\":\"ignore this\"}\n",
                "{\"type\":\"user_message\",\"text\":\"ignore too\"}\n",
                "{\"speaker\":\"user\",\"text\":\"and this\"}\n",
                "{\"role\":\"assistant\",\"text\":\"keep this\"}\n",
            ],
        );
        assert_eq!(parser.output(), "keep this");
    }

    #[test]
    fn buffers_partial_lines_across_feeds() {
        let mut parser = StreamJsonParser::new();
        let mut chunks = parser.feed(b"{\"type\":\"assist");
        assert!(chunks.is_empty());
        chunks.extend(parser.feed(b"ant\",\"text\":\"split\"}\n"));
        chunks.extend(parser.close());

        assert_eq!(chunks, vec!["split".to_string()]);
        assert_eq!(parser.output(), "split");
    }

    #[test]
    fn close_flushes_trailing_line_without_newline() {
        let mut parser = StreamJsonParser::new();
        parser.feed(b"{\"type\":\"assistant\",\"text\":\"tail\"}");
        let chunks = parser.close();
        assert_eq!(chunks, vec!["tail".to_string()]);
        assert_eq!(parser.output(), "tail");
    }

    #[test]
    fn non_json_lines_pass_through_verbatim() {
        let mut parser = StreamJsonParser::new();
        let chunks = feed_all(&mut parser, &["plain progress line\n"]);
        assert_eq!(chunks, vec!["plain progress line\n".to_string()]);
        // Opaque lines do not count toward extracted output.
        assert_eq!(parser.output(), "");
    }

    #[test]
    fn flattens_claude_style_content_arrays() {
        let mut parser = StreamJsonParser::new();
        feed_all(
            &mut parser,
            &[r#"{"type":"assistant","message":{"content":[{"type":"text","text":"part one"},{"type":"text","text":" part two"}]}}"#],
        );
        assert_eq!(parser.output(), "part one part two");
    }

    #[test]
    fn probes_result_container_after_text_keys() {
        let mut parser = StreamJsonParser::new();
        feed_all(
            &mut parser,
            &["{\"type\":\"result\",\"result\":\"final answer\"}\n"],
        );
        assert_eq!(parser.output(), "final answer");
    }

    #[test]
    fn gemini_style_parts_flatten() {
        let mut parser = StreamJsonParser::new();
        feed_all(
            &mut parser,
            &[r#"{"type":"response","data":{"parts":["alpha"," beta"]}}"#],
        );
        assert_eq!(parser.output(), "alpha beta");
    }

    #[test]
    fn whitespace_only_text_is_dropped() {
        let mut parser = StreamJsonParser::new();
        let chunks = feed_all(&mut parser, &["{\"type\":\"assistant\",\"text\":\"  \"}\n"]);
        assert!(chunks.is_empty());
        assert_eq!(parser.output(), "");
    }

    #[test]
    fn unsupported_flag_detection() {
        assert!(looks_like_unsupported_flag("Error: unknown flag: --output-format"));
        assert!(looks_like_unsupported_flag(
            "flag provided but not defined: -output-format"
        ));
        assert!(!looks_like_unsupported_flag(""));
        assert!(!looks_like_unsupported_flag("all good"));
    }
}
