//! System prompts for classification and reply generation.
//!
//! Each prompt is read from `<prompts_dir>/<kind>.txt` on first use and
//! cached. A missing or empty file falls back to the built-in text.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Classification,
    Support,
    Combined,
}

impl PromptKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Classification => "classification_prompt.txt",
            Self::Support => "support_response_prompt.txt",
            Self::Combined => "combined_response_prompt.txt",
        }
    }

    pub fn default_text(&self) -> &'static str {
        match self {
            Self::Classification => DEFAULT_CLASSIFICATION_PROMPT,
            Self::Support => DEFAULT_SUPPORT_PROMPT,
            Self::Combined => DEFAULT_COMBINED_PROMPT,
        }
    }
}

pub struct PromptLibrary {
    dir: PathBuf,
    cache: RwLock<HashMap<PromptKind, Arc<str>>>,
}

impl PromptLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Only the built-in prompts.
    pub fn builtin() -> Self {
        Self::new(PathBuf::new())
    }

    pub fn get(&self, kind: PromptKind) -> Arc<str> {
        if let Some(text) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
        {
            return Arc::clone(text);
        }

        let text: Arc<str> = self.load(kind).into();
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::clone(&text));
        text
    }

    fn load(&self, kind: PromptKind) -> String {
        if self.dir.as_os_str().is_empty() {
            return kind.default_text().to_string();
        }
        let path = self.dir.join(kind.file_name());
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => {
                info!(path = %path.display(), "Prompt loaded");
                content.trim().to_string()
            }
            Ok(_) => {
                warn!(path = %path.display(), "Prompt file is empty, using built-in prompt");
                kind.default_text().to_string()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Prompt file unavailable, using built-in prompt");
                kind.default_text().to_string()
            }
        }
    }
}

const DEFAULT_CLASSIFICATION_PROMPT: &str = r#"You are an email classification assistant for customer support.

Analyse the email and determine:

1. is_support: whether it is a customer support request (true/false)
2. is_tracking: whether the customer asks about shipment or order status (true/false)
3. urgency: low, medium or high
4. email_type: question, complaint, request, spam, newsletter, auto_reply or other
5. confidence: your confidence in the classification (0.0 to 1.0)
6. extracted_order_id: the order number if one is mentioned, otherwise null
7. product_name: the product the email is about, otherwise null

Emails asking "where is my order", about delivery status, tracking or
"rastreamento" are tracking requests. Questions about products, problems and
complaints are support requests. An email can be both.

Answer ONLY with valid JSON:
{
    "is_support": boolean,
    "is_tracking": boolean,
    "urgency": "low|medium|high",
    "email_type": "question|complaint|request|spam|newsletter|auto_reply|other",
    "confidence": 0.0-1.0,
    "extracted_order_id": "string or null",
    "product_name": "string or null"
}"#;

const DEFAULT_SUPPORT_PROMPT: &str = r#"You write replies to customer support emails for an online store.

Reply in the customer's language. Be courteous, concrete and brief. Never
invent order data, prices or deadlines you were not given.

Answer ONLY with valid JSON:
{
    "subject": "reply subject",
    "body": "reply body",
    "tone": "professional|friendly|empathetic|formal|informative",
    "addresses_support": boolean,
    "addresses_tracking": boolean,
    "priority_actions": ["action for the customer"],
    "requires_followup": boolean,
    "internal_notes": "notes for the support team or null"
}"#;

const DEFAULT_COMBINED_PROMPT: &str = r#"You write replies to customer emails that contain both a support request
and a question about an order shipment.

Reply in the customer's language. Address the support issue first, then give
the shipment status using only the tracking data provided: carrier, tracking
code, current status, last location and the expected delivery date when
known. Never invent tracking data.

Answer ONLY with valid JSON:
{
    "subject": "reply subject",
    "body": "reply body",
    "tone": "professional|friendly|empathetic|formal|informative",
    "addresses_support": boolean,
    "addresses_tracking": boolean,
    "tracking_included": {"code": "...", "status": "...", "estimated_delivery": "..."},
    "priority_actions": ["action for the customer"],
    "requires_followup": boolean,
    "internal_notes": "notes for the support team or null"
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_builtin_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("support_response_prompt.txt");
        std::fs::write(&path, "  Custom support prompt\n").unwrap();

        let library = PromptLibrary::new(dir.path());
        assert_eq!(&*library.get(PromptKind::Support), "Custom support prompt");

        std::fs::write(&path, "Changed on disk").unwrap();
        assert_eq!(&*library.get(PromptKind::Support), "Custom support prompt");
    }

    #[test]
    fn missing_or_empty_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("combined_response_prompt.txt"), "   ").unwrap();

        let library = PromptLibrary::new(dir.path());
        assert_eq!(
            &*library.get(PromptKind::Classification),
            DEFAULT_CLASSIFICATION_PROMPT
        );
        assert_eq!(&*library.get(PromptKind::Combined), DEFAULT_COMBINED_PROMPT);
    }
}
