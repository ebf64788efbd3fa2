//! Server-sent event decoding for the Kobold stream endpoint.
//!
//! Chunks from `bytes_stream()` can split lines anywhere, including inside a
//! multi-byte character, so bytes are buffered and only complete lines are
//! decoded.

use serde::Deserialize;

use super::traits::StreamingToken;

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    finish_reason: Option<serde_json::Value>,
}

/// Incremental `data: {...}` line decoder
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect the tokens from every complete line
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<StreamingToken> {
        self.buffer.extend_from_slice(chunk);
        let mut tokens = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(token) = decode_line(&line) {
                tokens.push(token);
            }
        }
        tokens
    }

    /// Decode whatever is left once the stream has ended
    pub(crate) fn finish(&mut self) -> Option<StreamingToken> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<StreamingToken> {
    let line = String::from_utf8_lossy(line);
    let payload = line.trim().strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str::<EventData>(payload) {
        Ok(data) => Some(StreamingToken::Fragment {
            text: data.token.unwrap_or_default(),
            is_final: is_finished(data.finish_reason.as_ref()),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed stream event");
            None
        }
    }
}

fn is_finished(reason: Option<&serde_json::Value>) -> bool {
    match reason {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::String(s)) => s != "null",
        Some(_) => true,
    }
}
