//! Generation request schema and validation

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::types::message::ChatMessage;

/// Upper bound for `max_tokens` on a single request
pub const MAX_TOKENS_LIMIT: u32 = 16384;

/// Request validation failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RequestError {
    #[error("Invalid request payload: {0}")]
    Malformed(String),

    #[error("Either 'prompt' or 'messages' must be provided.")]
    MissingPrompt,

    #[error("Field '{field}' out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },

    #[error("Invalid logit_bias: '{key}': '{value}'.")]
    InvalidLogitBias { key: String, value: String },
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidRequest
    }
}

/// Optional decode-cache quantization settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvCacheOptions {
    /// Bit width for cache quantization; `None` or 0 disables it
    #[serde(default)]
    pub bits: Option<u8>,
    #[serde(default)]
    pub group_size: Option<u32>,
    /// Token position at which quantization starts
    #[serde(default)]
    pub quantized_kv_start: Option<u32>,
    /// Max tokens held by a rotating cache
    #[serde(default)]
    pub max_size: Option<u32>,
}

/// Default group size when quantization is requested without one
pub const DEFAULT_KV_GROUP_SIZE: u32 = 64;
/// Default token offset at which cache quantization begins
pub const DEFAULT_QUANTIZED_KV_START: u32 = 5000;

impl KvCacheOptions {
    fn validate(&self) -> Result<(), RequestError> {
        if let Some(bits) = self.bits {
            if bits > 8 {
                return Err(out_of_range("kv_cache_options.bits", bits, "0..=8"));
            }
        }
        if self.group_size == Some(0) {
            return Err(out_of_range("kv_cache_options.group_size", 0, ">= 1"));
        }
        if self.max_size == Some(0) {
            return Err(out_of_range("kv_cache_options.max_size", 0, ">= 1"));
        }
        Ok(())
    }
}

/// A single streaming generation request.
///
/// Numeric sampling fields are optional; absent values fall back to the
/// process-wide generation defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationRequest {
    /// Raw prompt text, used when `messages` is absent or templating is off
    #[serde(default)]
    pub prompt: Option<String>,
    /// Chat messages; take precedence over `prompt` when a template applies
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub min_p: Option<f32>,
    #[serde(default)]
    pub min_tokens_to_keep: Option<u32>,

    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub repetition_context_size: Option<u32>,

    #[serde(default)]
    pub xtc_probability: Option<f32>,
    #[serde(default)]
    pub xtc_threshold: Option<f32>,

    /// Extra stop strings; generation ends with `stop` once output ends with one
    #[serde(default)]
    pub extra_eos_tokens: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub ignore_chat_template: bool,

    #[serde(default)]
    pub use_speculative: bool,
    #[serde(default)]
    pub draft_model_identifier: Option<String>,
    #[serde(default)]
    pub num_draft_tokens: Option<u32>,

    #[serde(default)]
    pub kv_cache_options: Option<KvCacheOptions>,
    /// Token id (as a string key) to additive bias
    #[serde(default)]
    pub logit_bias: Option<BTreeMap<String, Value>>,
}

/// Default number of draft tokens proposed per speculative step
pub const DEFAULT_NUM_DRAFT_TOKENS: u32 = 3;

/// Where the prompt text comes from once a request has been validated
#[derive(Debug, Clone, PartialEq)]
pub enum PromptSource<'a> {
    /// Structured messages, to be rendered through the chat template
    Messages(&'a [ChatMessage]),
    /// Raw text, tokenized as is
    Text(Cow<'a, str>),
}

impl GenerationRequest {
    /// Parse and validate a request payload
    pub fn from_json(payload: &str) -> Result<Self, RequestError> {
        let request: GenerationRequest =
            serde_json::from_str(payload).map_err(|e| RequestError::Malformed(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// Check presence and ranges of every field
    pub fn validate(&self) -> Result<(), RequestError> {
        let has_prompt = self.prompt.as_deref().is_some_and(|p| !p.is_empty());
        let has_messages = self.messages.as_deref().is_some_and(|m| !m.is_empty());
        if !has_prompt && !has_messages {
            return Err(RequestError::MissingPrompt);
        }

        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 || max_tokens > MAX_TOKENS_LIMIT {
                return Err(out_of_range("max_tokens", max_tokens, "1..=16384"));
            }
        }
        check_unit("temperature", self.temperature, 0.0, 5.0)?;
        check_unit("top_p", self.top_p, 0.0, 1.0)?;
        check_unit("min_p", self.min_p, 0.0, 1.0)?;
        check_unit("xtc_probability", self.xtc_probability, 0.0, 1.0)?;
        check_unit("xtc_threshold", self.xtc_threshold, 0.0, 0.5)?;
        if let Some(penalty) = self.repetition_penalty {
            if !penalty.is_finite() || penalty < 0.0 {
                return Err(out_of_range("repetition_penalty", penalty, ">= 0"));
            }
        }
        if self.min_tokens_to_keep == Some(0) {
            return Err(out_of_range("min_tokens_to_keep", 0, ">= 1"));
        }
        if self.num_draft_tokens == Some(0) {
            return Err(out_of_range("num_draft_tokens", 0, ">= 1"));
        }
        if let Some(options) = &self.kv_cache_options {
            options.validate()?;
        }
        if let Some(bias) = &self.logit_bias {
            for (key, value) in bias {
                if bias_value(value).is_none() {
                    return Err(RequestError::InvalidLogitBias {
                        key: key.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Select the prompt source: messages win unless templating is
    /// suppressed or no template is available.
    pub fn prompt_source(&self, template_available: bool) -> Result<PromptSource<'_>, RequestError> {
        let messages = self.messages.as_deref().filter(|m| !m.is_empty());
        let prompt = self.prompt.as_deref().filter(|p| !p.is_empty());

        match (messages, prompt) {
            (Some(messages), _) if template_available && !self.ignore_chat_template => {
                Ok(PromptSource::Messages(messages))
            }
            (_, Some(text)) => Ok(PromptSource::Text(Cow::Borrowed(text))),
            (Some(messages), None) => {
                // No usable template and no raw prompt: feed the contents as plain text
                tracing::debug!("Chat template unavailable or suppressed, joining message contents");
                let joined = messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(PromptSource::Text(Cow::Owned(joined)))
            }
            (None, None) => Err(RequestError::MissingPrompt),
        }
    }

    /// Number of draft tokens per speculative step
    pub fn draft_token_count(&self) -> u32 {
        self.num_draft_tokens.unwrap_or(DEFAULT_NUM_DRAFT_TOKENS)
    }

    /// Draft identifier when speculative decoding is both requested and configured
    pub fn speculative_draft(&self) -> Option<&str> {
        if self.use_speculative {
            self.draft_model_identifier.as_deref().filter(|id| !id.is_empty())
        } else {
            None
        }
    }
}

/// Accepts JSON numbers and numeric strings, as the wire schema allows both
pub(crate) fn bias_value(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn check_unit(field: &'static str, value: Option<f32>, min: f32, max: f32) -> Result<(), RequestError> {
    match value {
        Some(v) if !(v.is_finite() && v >= min && v <= max) => {
            Err(out_of_range(field, v, &format!("{min}..={max}")))
        }
        _ => Ok(()),
    }
}

fn out_of_range(field: &'static str, value: impl std::fmt::Display, range: &str) -> RequestError {
    RequestError::OutOfRange {
        field,
        detail: format!("{value} not in {range}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::Role;

    fn prompt_request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: Some(prompt.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_prompt_and_messages() {
        let result = GenerationRequest::from_json(r#"{"max_tokens": 10}"#);
        assert_eq!(result, Err(RequestError::MissingPrompt));
        assert_eq!(RequestError::MissingPrompt.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_empty_prompt_counts_as_missing() {
        let request = GenerationRequest {
            prompt: Some(String::new()),
            messages: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(request.validate(), Err(RequestError::MissingPrompt));
    }

    #[test]
    fn test_parse_full_request() {
        let request = GenerationRequest::from_json(
            r#"{
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 32,
                "temperature": 0.2,
                "use_speculative": true,
                "draft_model_identifier": "/models/draft.gguf",
                "kv_cache_options": {"bits": 4, "max_size": 1024},
                "logit_bias": {"42": 1.5, "7": "-2"}
            }"#,
        )
        .unwrap();
        assert_eq!(request.max_tokens, Some(32));
        assert_eq!(request.speculative_draft(), Some("/models/draft.gguf"));
        assert_eq!(request.draft_token_count(), DEFAULT_NUM_DRAFT_TOKENS);
        assert_eq!(request.kv_cache_options.unwrap().bits, Some(4));
    }

    #[test]
    fn test_out_of_range_fields() {
        let mut request = prompt_request("hello");
        request.temperature = Some(7.0);
        assert!(matches!(
            request.validate(),
            Err(RequestError::OutOfRange { field: "temperature", .. })
        ));

        let mut request = prompt_request("hello");
        request.max_tokens = Some(0);
        assert!(request.validate().is_err());

        let mut request = prompt_request("hello");
        request.xtc_threshold = Some(0.75);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_non_numeric_logit_bias_rejected() {
        let result = GenerationRequest::from_json(r#"{"prompt": "x", "logit_bias": {"1": "abc"}}"#);
        assert!(matches!(result, Err(RequestError::InvalidLogitBias { .. })));
    }

    #[test]
    fn test_unknown_field_is_malformed() {
        let result = GenerationRequest::from_json(r#"{"prompt": "x", "temprature": 1.0}"#);
        assert!(matches!(result, Err(RequestError::Malformed(_))));
    }

    #[test]
    fn test_prompt_source_precedence() {
        let request = GenerationRequest {
            prompt: Some("raw".to_string()),
            messages: Some(vec![ChatMessage::new(Role::User, "chat")]),
            ..Default::default()
        };
        assert!(matches!(request.prompt_source(true), Ok(PromptSource::Messages(_))));
        assert_eq!(request.prompt_source(false), Ok(PromptSource::Text("raw".into())));

        let suppressed = GenerationRequest {
            ignore_chat_template: true,
            ..request
        };
        assert_eq!(suppressed.prompt_source(true), Ok(PromptSource::Text("raw".into())));
    }

    #[test]
    fn test_messages_without_template_join_contents() {
        let request = GenerationRequest {
            messages: Some(vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "hi"),
            ]),
            ..Default::default()
        };
        assert_eq!(
            request.prompt_source(false),
            Ok(PromptSource::Text("be brief\nhi".into()))
        );
    }

    #[test]
    fn test_speculative_requires_toggle() {
        let request = GenerationRequest {
            draft_model_identifier: Some("draft".to_string()),
            ..prompt_request("x")
        };
        assert_eq!(request.speculative_draft(), None);
    }
}
