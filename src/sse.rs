//! Server-Sent Events framing.
//!
//! Encodes the proofreading wire events and decodes any SSE byte stream
//! (our own server, or an OpenAI-compatible provider) into frames. Decoding
//! is tolerant: comment lines are liveness signals, and data lines that are
//! not JSON are skipped rather than treated as stream corruption.

use crate::outcome::CheckMeta;
use crate::types::ErrorItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event on the `/api/check` stream, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireEvent {
    Chunk {
        agent: String,
        errors: Vec<ErrorItem>,
        #[serde(rename = "runIndex", default, skip_serializing_if = "Option::is_none")]
        run_index: Option<u32>,
    },
    Final {
        errors: Vec<ErrorItem>,
        meta: CheckMeta,
        #[serde(rename = "patchedText", default, skip_serializing_if = "Option::is_none")]
        patched_text: Option<String>,
    },
    Warning {
        agent: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
    },
}

/// Wire codes carried by [`WireEvent::Error`].
pub mod codes {
    pub const TIMEOUT: &str = "timeout";
    pub const UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
    pub const OVERLOADED: &str = "overloaded";
    pub const INTERNAL: &str = "internal";
    pub const ABORTED: &str = "aborted";
}

/// Frame a JSON payload as `data: <json>\n\n`.
pub fn encode_data<T: Serialize>(value: &T) -> serde_json::Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(value)?))
}

/// Frame a comment as `:<text>\n\n`.
pub fn encode_comment(text: &str) -> String {
    format!(":{text}\n\n")
}

/// A decoded SSE line of interest.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// `:<text>`; heartbeat or ready marker.
    Comment(String),
    /// `data: <json>`.
    Data(Value),
}

/// Incremental SSE decoder.
///
/// Buffers across chunk boundaries, including UTF-8 sequences split
/// between chunks.
///
/// # Example
///
/// ```
/// use proofread_pipeline::sse::{SseDecoder, SseFrame};
///
/// let mut decoder = SseDecoder::new();
/// let frames = decoder.decode(b":ready\n\ndata: {\"type\":\"warning\"}\n\ndata: [DONE]\n\n");
/// assert_eq!(frames.len(), 2);
/// assert!(matches!(frames[0], SseFrame::Comment(ref c) if c == "ready"));
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every complete frame.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever is left once the byte stream ends.
    pub fn flush(&mut self) -> Vec<SseFrame> {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest)
            .lines()
            .filter_map(parse_line)
            .collect()
    }

    /// Convenience for callers that only care about JSON payloads.
    pub fn decode_data(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.decode(chunk).into_iter().filter_map(into_data).collect()
    }

    pub fn flush_data(&mut self) -> Vec<Value> {
        self.flush().into_iter().filter_map(into_data).collect()
    }
}

fn into_data(frame: SseFrame) -> Option<Value> {
    match frame {
        SseFrame::Data(v) => Some(v),
        SseFrame::Comment(_) => None,
    }
}

fn parse_line(line: &str) -> Option<SseFrame> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    if let Some(comment) = line.strip_prefix(':') {
        return Some(SseFrame::Comment(comment.trim().to_string()));
    }
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return None;
    }
    serde_json::from_str(data).ok().map(SseFrame::Data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorType;

    #[test]
    fn test_encode_frames() {
        assert_eq!(encode_comment("ping"), ":ping\n\n");
        let ev = WireEvent::Warning {
            agent: "reviewer".into(),
            message: "failed".into(),
        };
        assert_eq!(
            encode_data(&ev).unwrap(),
            "data: {\"type\":\"warning\",\"agent\":\"reviewer\",\"message\":\"failed\"}\n\n"
        );
    }

    #[test]
    fn test_chunk_wire_shape() {
        let item = ErrorItem::new(4, 6, "高行", "高兴", ErrorType::Spelling);
        let ev = WireEvent::Chunk {
            agent: "basic".into(),
            errors: vec![item],
            run_index: Some(1),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "chunk");
        assert_eq!(v["runIndex"], 1);
        assert_eq!(v["errors"][0]["suggestion"], "高兴");

        let back: WireEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_decode_skips_malformed_and_done() {
        let mut d = SseDecoder::new();
        let frames = d.decode(b"data: not json\n\nevent: x\ndata: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames, vec![SseFrame::Data(serde_json::json!({"a": 1}))]);
    }

    #[test]
    fn test_decode_split_across_chunks() {
        let mut d = SseDecoder::new();
        let bytes = "data: {\"msg\":\"高兴\"}\n\n".as_bytes();
        // split inside a multi-byte character
        let cut = bytes.iter().position(|b| *b >= 0x80).unwrap() + 1;
        assert!(d.decode(&bytes[..cut]).is_empty());
        let frames = d.decode(&bytes[cut..]);
        assert_eq!(frames, vec![SseFrame::Data(serde_json::json!({"msg": "高兴"}))]);
    }

    #[test]
    fn test_flush_handles_missing_trailing_newline() {
        let mut d = SseDecoder::new();
        assert!(d.decode(b":ping\n\ndata: {\"x\":2}").len() == 1);
        assert_eq!(d.flush_data(), vec![serde_json::json!({"x": 2})]);
    }

    #[test]
    fn test_crlf_lines() {
        let mut d = SseDecoder::new();
        let frames = d.decode(b":ready\r\n\r\ndata: {\"x\":3}\r\n\r\n");
        assert_eq!(frames.len(), 2);
    }
}
