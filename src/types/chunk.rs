//! Streaming output chunks
//!
//! One chunk is produced per decode step; the chunk carrying a finish reason
//! closes the stream.

use serde::{Deserialize, Serialize};

/// Why a generation stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The max-token budget was reached
    Length,
    /// An end-of-generation token or stop string was produced
    Stop,
    /// Generation failed
    Error,
}

/// A piece of streamed generation output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    /// Generated text segment (may be empty while a UTF-8 sequence is incomplete)
    pub text: String,
    /// Whether this is the last chunk of the stream
    pub is_finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True if the token was proposed by the draft model and accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_draft: Option<bool>,
    /// Number of new tokens in this chunk (usually 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    /// The generated token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<u32>,
    /// Number of tokens in the resolved prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<usize>,
    /// Cumulative number of generated tokens in this stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_tokens: Option<usize>,
    /// Running generation throughput in tokens per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_tps: Option<f64>,
}

impl TokenChunk {
    /// A terminal chunk reporting a failure
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_finished: true,
            finish_reason: Some(FinishReason::Error),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// A terminal chunk with no text, used when the stream ends without the
    /// backend reporting a reason itself
    pub fn finished(reason: FinishReason) -> Self {
        Self {
            is_finished: true,
            finish_reason: Some(reason),
            ..Default::default()
        }
    }

    /// Returns true if an error ended the stream
    pub fn is_error(&self) -> bool {
        self.finish_reason == Some(FinishReason::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chunk_is_terminal() {
        let chunk = TokenChunk::error("No model loaded.");
        assert!(chunk.is_finished);
        assert!(chunk.is_error());
        assert_eq!(chunk.error.as_deref(), Some("No model loaded."));
        assert!(chunk.text.is_empty());
    }

    #[test]
    fn test_chunk_wire_format() {
        let chunk = TokenChunk::finished(FinishReason::Length);
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["finish_reason"], "length");
        assert_eq!(json["is_finished"], true);
        assert!(json.get("error").is_none());
    }
}
