//! Gemini `generateContent` client over plain REST.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::provider::{JsonCompletion, JsonRequest, LlmProvider, TokenUsage, extract_json_object};
use crate::config::GeminiConfig;
use crate::error::LlmError;

const PROVIDER: &str = "gemini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Gemini client returning JSON-mode completions.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(config: &GeminiConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn request_body(request: &JsonRequest) -> Value {
        json!({
            "systemInstruction": {
                "parts": [{ "text": request.system_prompt }]
            },
            "contents": [{
                "role": "user",
                "parts": [{ "text": request.user_prompt }]
            }],
            "generationConfig": {
                "temperature": request.temperature,
                "topP": request.top_p,
                "maxOutputTokens": request.max_output_tokens,
                "responseMimeType": "application/json"
            }
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    thoughts_token_count: u64,
    #[serde(default)]
    total_token_count: Option<u64>,
}

impl From<UsageMetadata> for TokenUsage {
    fn from(m: UsageMetadata) -> Self {
        TokenUsage::new(
            m.prompt_token_count,
            m.candidates_token_count,
            m.thoughts_token_count,
            m.total_token_count,
        )
    }
}

/// Turn a decoded response into a completion, classifying failure modes.
fn interpret(response: GenerateResponse, max_output_tokens: u32) -> Result<JsonCompletion, LlmError> {
    let usage: TokenUsage = response.usage_metadata.unwrap_or_default().into();
    let candidate = response.candidates.into_iter().next();
    let finish_reason = candidate.as_ref().and_then(|c| c.finish_reason.clone());
    let truncated = finish_reason.as_deref() == Some("MAX_TOKENS");

    let text: String = candidate
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter(|p| !p.thought)
                .filter_map(|p| p.text)
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        if truncated {
            return Err(LlmError::Truncated {
                provider: PROVIDER.to_string(),
                max_output_tokens,
            });
        }
        return Err(LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!(
                "no text in response (finish reason: {})",
                finish_reason.as_deref().unwrap_or("unknown")
            ),
        });
    }

    let payload = match serde_json::from_str::<Value>(&text) {
        Ok(value) => value,
        Err(direct_err) => {
            let salvaged = extract_json_object(&text).and_then(|s| serde_json::from_str(s).ok());
            match salvaged {
                Some(value) => value,
                None if truncated => {
                    return Err(LlmError::Truncated {
                        provider: PROVIDER.to_string(),
                        max_output_tokens,
                    });
                }
                None => {
                    return Err(LlmError::MalformedJson {
                        provider: PROVIDER.to_string(),
                        reason: direct_err.to_string(),
                    });
                }
            }
        }
    };

    Ok(JsonCompletion {
        payload,
        usage,
        finish_reason,
    })
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete_json(&self, request: JsonRequest) -> Result<JsonCompletion, LlmError> {
        let body = Self::request_body(&request);
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(response.headers());
            warn!(model = %self.model, ?retry_after, "Gemini rate limited");
            return Err(LlmError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after,
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {status}: {}", text.chars().take(300).collect::<String>()),
            });
        }

        let decoded: GenerateResponse =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let completion = interpret(decoded, request.max_output_tokens)?;
        debug!(
            model = %self.model,
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            thinking_tokens = completion.usage.thinking_tokens,
            "Gemini completion"
        );
        Ok(completion)
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let url = format!("{}/models/{}", self.base_url, self.model);
        let response = self
            .client
            .get(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            }),
            s => Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {s}"),
            }),
        }
    }
}
