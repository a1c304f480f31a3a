//! LLM classification of inbound emails.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use super::prompts::{PromptKind, PromptLibrary};
use super::types::{EmailClassification, EmailInput};
use crate::config::GeminiConfig;
use crate::error::LlmError;
use crate::llm::{JsonRequest, LlmProvider, TokenUsage, decode_payload};

const REQUIRED_FIELDS: &[&str] = &["is_support", "is_tracking", "urgency", "email_type", "confidence"];

/// Sampling parameters for classification calls.
#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            max_output_tokens: 1000,
        }
    }
}

impl From<&GeminiConfig> for GenerationSettings {
    fn from(config: &GeminiConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            max_output_tokens: config.max_output_tokens,
        }
    }
}

/// A classification plus the tokens it cost.
#[derive(Debug, Clone)]
pub struct Classified {
    pub classification: EmailClassification,
    pub usage: TokenUsage,
}

pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    prompts: Arc<PromptLibrary>,
    settings: GenerationSettings,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>, prompts: Arc<PromptLibrary>, settings: GenerationSettings) -> Self {
        Self {
            llm,
            prompts,
            settings,
        }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Classify an email. `custom_prompt` replaces the system prompt.
    pub async fn classify(
        &self,
        email: &EmailInput,
        custom_prompt: Option<&str>,
    ) -> Result<Classified, LlmError> {
        let system_prompt = match custom_prompt.filter(|p| !p.trim().is_empty()) {
            Some(prompt) => prompt.to_string(),
            None => self.prompts.get(PromptKind::Classification).to_string(),
        };

        let request = JsonRequest::new(system_prompt, render_email(email))
            .with_temperature(self.settings.temperature)
            .with_top_p(self.settings.top_p)
            .with_max_tokens(self.settings.max_output_tokens);

        let completion = self.llm.complete_json(request).await?;
        let mut classification: EmailClassification =
            decode_payload(&completion.payload, REQUIRED_FIELDS)?;

        if !(0.0..=1.0).contains(&classification.confidence) {
            return Err(LlmError::InvalidField {
                field: "confidence".to_string(),
                reason: format!("{} is outside 0.0..=1.0", classification.confidence),
            });
        }

        classification.extracted_order_id = classification
            .extracted_order_id
            .filter(|id| !id.trim().is_empty());
        if classification.extracted_order_id.is_none() {
            let text = format!("{} {}", email.subject, email.body);
            classification.extracted_order_id = extract_order_id(&text);
            if let Some(ref id) = classification.extracted_order_id {
                debug!(email_id = %email.email_id, order_id = %id, "Order id recovered from text");
            }
        }

        info!(
            email_id = %email.email_id,
            is_support = classification.is_support,
            is_tracking = classification.is_tracking,
            urgency = classification.urgency.as_str(),
            confidence = classification.confidence,
            tokens = completion.usage.total_tokens,
            "Email classified"
        );

        Ok(Classified {
            classification,
            usage: completion.usage,
        })
    }
}

/// The user prompt sent with every classification.
pub fn render_email(email: &EmailInput) -> String {
    let mut prompt = format!(
        "From: {}\nTo: {}\nSubject: {}\nReceived at: {}\n",
        email.from_address,
        email.to_address,
        email.subject,
        email.received_at.to_rfc3339(),
    );
    if let Some(ref thread) = email.thread_id {
        prompt.push_str(&format!("Thread ID: {thread}\n"));
    }
    prompt.push_str(&format!(
        "Priority: {}\n",
        serde_json::to_value(email.metadata.priority)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    ));
    if !email.metadata.labels.is_empty() {
        prompt.push_str(&format!("Labels: {}\n", email.metadata.labels.join(", ")));
    }
    prompt.push_str(&format!("\nBody:\n{}", email.body));
    prompt
}

// ── Order-id fallback ───────────────────────────────────────────────

/// Tried in order. The last one matches upper-case codes only.
const ORDER_ID_PATTERNS: &[&str] = &[
    r"(?i)pedido\s*#?\s*(\d{5,})",
    r"(?i)order\s*#?\s*(\d{5,})",
    r"(?i)c[óo]digo\s*:\s*(\w{8,})",
    r"(?i)rastreamento\s*:\s*(\w{8,})",
    r"\b(\d{8,12})\b",
    r"\b([A-Z0-9]{8,15})\b",
];

static ORDER_ID_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ORDER_ID_PATTERNS
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern, error = %e, "Invalid order id pattern");
                None
            }
        })
        .collect()
});

/// First order-id-looking token in `text`, upper-cased.
pub fn extract_order_id(text: &str) -> Option<String> {
    ORDER_ID_REGEXES
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_uppercase())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::pipeline::test_support::{ScriptedLlm, sample_email};
    use crate::pipeline::types::{EmailType, Urgency};

    fn classifier(llm: ScriptedLlm) -> Classifier {
        Classifier::new(
            Arc::new(llm),
            Arc::new(PromptLibrary::builtin()),
            GenerationSettings::default(),
        )
    }

    #[test]
    fn order_id_patterns_in_priority_order() {
        assert_eq!(extract_order_id("Meu pedido #123456 atrasou").as_deref(), Some("123456"));
        assert_eq!(extract_order_id("ORDER 98765 missing").as_deref(), Some("98765"));
        assert_eq!(
            extract_order_id("Código: br12345678br").as_deref(),
            Some("BR12345678BR")
        );
        assert_eq!(extract_order_id("nota 38495799 emitida").as_deref(), Some("38495799"));
        assert_eq!(extract_order_id("code QX81K2P9Z").as_deref(), Some("QX81K2P9Z"));
        assert_eq!(extract_order_id("nothing to see here"), None);
    }

    #[test]
    fn prompt_contains_email_fields() {
        let prompt = render_email(&sample_email("m1"));
        assert!(prompt.contains("From: cliente@example.com"));
        assert!(prompt.contains("Subject: Onde está meu pedido?"));
        assert!(prompt.contains("Priority: normal"));
        assert!(prompt.ends_with("Meu pedido 123456 ainda não chegou."));
    }

    #[tokio::test]
    async fn typed_classification_with_fallback_order_id() {
        let llm = ScriptedLlm::json(json!({
            "is_support": true,
            "is_tracking": true,
            "urgency": "high",
            "email_type": "question",
            "confidence": 0.92,
            "extracted_order_id": null
        }));
        let result = classifier(llm).classify(&sample_email("m1"), None).await.unwrap();
        let c = result.classification;
        assert!(c.is_tracking);
        assert_eq!(c.urgency, Urgency::High);
        assert_eq!(c.email_type, EmailType::Question);
        assert_eq!(c.extracted_order_id.as_deref(), Some("123456"));
        assert_eq!(result.usage.total_tokens, 150);
    }

    #[tokio::test]
    async fn missing_required_field_is_a_distinct_error() {
        let llm = ScriptedLlm::json(json!({
            "is_support": true,
            "urgency": "low",
            "email_type": "question",
            "confidence": 0.5
        }));
        let err = classifier(llm).classify(&sample_email("m1"), None).await.unwrap_err();
        assert!(matches!(err, LlmError::MissingField { ref field } if field == "is_tracking"));
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_rejected() {
        let llm = ScriptedLlm::json(json!({
            "is_support": true,
            "is_tracking": false,
            "urgency": "low",
            "email_type": "question",
            "confidence": 1.7
        }));
        let err = classifier(llm).classify(&sample_email("m1"), None).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidField { ref field, .. } if field == "confidence"));
    }

    #[tokio::test]
    async fn custom_prompt_replaces_system_prompt() {
        let llm = ScriptedLlm::json(json!({
            "is_support": false,
            "is_tracking": false,
            "urgency": "low",
            "email_type": "spam",
            "confidence": 0.99
        }));
        let seen = llm.seen_prompts();
        let seen_user = llm.seen_user_prompts();
        let email = sample_email("m1");
        classifier(llm)
            .classify(&email, Some("Only flag spam"))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap()[0], "Only flag spam");
        assert_eq!(seen_user.lock().unwrap()[0], render_email(&email));
    }
}
