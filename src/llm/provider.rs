//! Provider abstraction for structured (JSON) completions.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;

/// Token accounting for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build usage from provider counts. A missing total is the sum of the parts.
    pub fn new(input: u64, output: u64, thinking: u64, total: Option<u64>) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            thinking_tokens: thinking,
            total_tokens: total.unwrap_or(input + output + thinking),
        }
    }

    /// Element-wise sum.
    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            thinking_tokens: self.thinking_tokens + other.thinking_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

/// A request for a JSON-only completion.
#[derive(Debug, Clone)]
pub struct JsonRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl JsonRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            temperature: 0.3,
            top_p: 0.9,
            max_output_tokens: 1000,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_max_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }
}

/// A parsed JSON completion.
#[derive(Debug, Clone)]
pub struct JsonCompletion {
    pub payload: Value,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// LLM backend able to answer with a JSON document.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider label used in logs and errors.
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn complete_json(&self, request: JsonRequest) -> Result<JsonCompletion, LlmError>;

    /// Cheap reachability probe.
    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Decode a payload into `T`, reporting the first absent `required` field
/// as [`LlmError::MissingField`].
pub fn decode_payload<T: DeserializeOwned>(payload: &Value, required: &[&str]) -> Result<T, LlmError> {
    let object = payload.as_object().ok_or_else(|| LlmError::InvalidField {
        field: "$".to_string(),
        reason: "expected a JSON object".to_string(),
    })?;

    if let Some(missing) = required
        .iter()
        .find(|field| object.get(**field).is_none_or(Value::is_null))
    {
        return Err(LlmError::MissingField {
            field: missing.to_string(),
        });
    }

    serde_json::from_value(payload.clone()).map_err(|e| LlmError::InvalidField {
        field: "$".to_string(),
        reason: e.to_string(),
    })
}

/// Extract a JSON object from model text that may include prose or code fences.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}
