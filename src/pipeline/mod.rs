//! Email processing pipeline.
//!
//! An email flows through:
//! 1. `Classifier::classify()`: LLM classification plus order-id recovery
//! 2. Tracking search for tracking requests (libSQL, retried)
//! 3. Cost accounting and best-effort persistence
//!
//! `Responder` drafts replies from a classification and optional tracking
//! data. Both batch entry points run on the chunked orchestrator in
//! `crate::batch`.

pub mod classifier;
pub mod processor;
pub mod prompts;
pub mod responder;
pub mod types;

pub use classifier::{Classified, Classifier, GenerationSettings};
pub use processor::EmailProcessor;
pub use prompts::{PromptKind, PromptLibrary};
pub use responder::{GeneratedResponse, ReplyRequest, Responder};
pub use types::{EmailClassification, EmailInput, ProcessingReport, TrackingResult};

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted LLM and fixtures shared by the pipeline tests.

    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::Value;

    use super::types::EmailInput;
    use crate::error::LlmError;
    use crate::llm::{JsonCompletion, JsonRequest, LlmProvider, TokenUsage};

    type Handler = Box<dyn Fn(&JsonRequest) -> Result<Value, LlmError> + Send + Sync>;

    /// Answers every request through `handler` and records the prompts.
    pub struct ScriptedLlm {
        handler: Handler,
        seen: Arc<Mutex<Vec<String>>>,
        seen_user: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedLlm {
        pub fn with(handler: impl Fn(&JsonRequest) -> Result<Value, LlmError> + Send + Sync + 'static) -> Self {
            Self {
                handler: Box::new(handler),
                seen: Arc::default(),
                seen_user: Arc::default(),
            }
        }

        pub fn json(payload: Value) -> Self {
            Self::with(move |_| Ok(payload.clone()))
        }

        /// System prompts of every request, in call order.
        pub fn seen_prompts(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.seen)
        }

        pub fn seen_user_prompts(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.seen_user)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "gemini-2.5-flash"
        }

        async fn complete_json(&self, request: JsonRequest) -> Result<JsonCompletion, LlmError> {
            self.seen.lock().unwrap().push(request.system_prompt.clone());
            self.seen_user.lock().unwrap().push(request.user_prompt.clone());
            let payload = (self.handler)(&request)?;
            Ok(JsonCompletion {
                payload,
                usage: TokenUsage::new(100, 40, 10, None),
                finish_reason: Some("STOP".to_string()),
            })
        }
    }

    pub fn sample_email(id: &str) -> EmailInput {
        serde_json::from_value(serde_json::json!({
            "email_id": id,
            "from": "cliente@example.com",
            "to": "suporte@loja.com",
            "subject": "Onde está meu pedido?",
            "body": "Meu pedido 123456 ainda não chegou."
        }))
        .unwrap()
    }
}
