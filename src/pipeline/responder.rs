//! Reply drafting.
//!
//! The combined prompt is used when the email is both a support and a
//! tracking request and tracking data is available. Every other request
//! gets the support prompt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::prompts::{PromptKind, PromptLibrary};
use crate::batch::{self, BatchConfig, BatchOutcome};
use crate::error::PipelineError;
use crate::llm::{JsonRequest, LlmProvider, TokenUsage, decode_payload};
use crate::store::results::collections;
use crate::store::{OrderRecord, ResultStore, save_best_effort};

const REPLY_TEMPERATURE: f32 = 0.7;
const REPLY_TOP_P: f32 = 0.95;
const REPLY_MAX_TOKENS: u32 = 1500;

/// Replies are slower and costlier than classification, so batches stay small.
const BATCH_CHUNK_SIZE: usize = 3;
const BATCH_CHUNK_DELAY: Duration = Duration::from_secs(1);

/// Fixed confidence attached to generated replies.
const REPLY_CONFIDENCE: f64 = 0.95;

const HISTORY_ENTRIES: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseTone {
    #[default]
    Professional,
    Friendly,
    Empathetic,
    Formal,
    Informative,
}

impl ResponseTone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Professional => "professional",
            Self::Friendly => "friendly",
            Self::Empathetic => "empathetic",
            Self::Formal => "formal",
            Self::Informative => "informative",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "professional" => Some(Self::Professional),
            "friendly" => Some(Self::Friendly),
            "empathetic" => Some(Self::Empathetic),
            "formal" => Some(Self::Formal),
            "informative" => Some(Self::Informative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Support,
    Combined,
}

/// Email fields the reply is based on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailContent {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: String,
}

/// Classification flags as supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationSummary {
    #[serde(default)]
    pub is_support: bool,
    #[serde(default)]
    pub is_tracking: bool,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub email_type: Option<String>,
}

/// Input for one reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub email_id: String,
    pub email_content: EmailContent,
    pub classification: ClassificationSummary,
    #[serde(default)]
    pub tracking_data: Option<OrderRecord>,
    #[serde(default)]
    pub custom_tone: Option<ResponseTone>,
    #[serde(default = "default_true")]
    pub include_signature: bool,
    #[serde(default)]
    pub priority_message: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ReplyRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.email_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("email_id must not be empty".into()));
        }
        if self.email_content.body.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "email_content.body must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn response_type(&self) -> ResponseType {
        let c = &self.classification;
        if c.is_support && c.is_tracking && self.tracking_data.is_some() {
            ResponseType::Combined
        } else {
            ResponseType::Support
        }
    }
}

/// Shape the model must answer with.
#[derive(Debug, Deserialize)]
struct ReplyPayload {
    subject: String,
    body: String,
    #[serde(default)]
    tone: Option<String>,
    #[serde(default)]
    addresses_support: Option<bool>,
    #[serde(default)]
    addresses_tracking: Option<bool>,
    #[serde(default)]
    tracking_included: Option<Value>,
    #[serde(default)]
    priority_actions: Vec<String>,
    #[serde(default)]
    requires_followup: bool,
    #[serde(default)]
    internal_notes: Option<String>,
}

/// A drafted reply.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedResponse {
    pub email_id: String,
    pub suggested_subject: String,
    pub suggested_body: String,
    pub tone: ResponseTone,
    pub addresses_support: bool,
    pub addresses_tracking: bool,
    pub tracking_included: Option<Value>,
    pub priority_actions: Vec<String>,
    pub requires_followup: bool,
    pub internal_notes: Option<String>,
    pub response_type: ResponseType,
    pub confidence: f64,
    pub processing_time_ms: u64,
    pub tokens: TokenUsage,
    pub saved_to_db: bool,
}

pub struct Responder {
    llm: Arc<dyn LlmProvider>,
    prompts: Arc<PromptLibrary>,
    results: Arc<dyn ResultStore>,
    batch: BatchConfig,
}

impl Responder {
    pub fn new(llm: Arc<dyn LlmProvider>, prompts: Arc<PromptLibrary>, results: Arc<dyn ResultStore>) -> Self {
        Self {
            llm,
            prompts,
            results,
            batch: BatchConfig::new(BATCH_CHUNK_SIZE).with_delay(BATCH_CHUNK_DELAY),
        }
    }

    /// Draft a reply. With `save`, it is upserted into `llm_responses`;
    /// `saved_to_db` reports whether that worked.
    pub async fn generate(&self, request: &ReplyRequest, save: bool) -> Result<GeneratedResponse, PipelineError> {
        request.validate()?;
        let start = Instant::now();
        let response_type = request.response_type();
        let system_prompt = match response_type {
            ResponseType::Combined => self.prompts.get(PromptKind::Combined),
            ResponseType::Support => self.prompts.get(PromptKind::Support),
        };

        let llm_request = JsonRequest::new(system_prompt.to_string(), render_request(request, response_type))
            .with_temperature(REPLY_TEMPERATURE)
            .with_top_p(REPLY_TOP_P)
            .with_max_tokens(REPLY_MAX_TOKENS);

        let completion = self.llm.complete_json(llm_request).await?;
        let payload: ReplyPayload = decode_payload(&completion.payload, &["subject", "body"])?;

        let tone = payload
            .tone
            .as_deref()
            .and_then(ResponseTone::parse)
            .or(request.custom_tone)
            .unwrap_or_default();

        let mut generated = GeneratedResponse {
            email_id: request.email_id.clone(),
            suggested_subject: payload.subject,
            suggested_body: payload.body,
            tone,
            addresses_support: payload
                .addresses_support
                .unwrap_or(request.classification.is_support),
            addresses_tracking: payload
                .addresses_tracking
                .unwrap_or(request.classification.is_tracking),
            tracking_included: payload.tracking_included,
            priority_actions: payload.priority_actions,
            requires_followup: payload.requires_followup,
            internal_notes: payload.internal_notes,
            response_type,
            confidence: REPLY_CONFIDENCE,
            processing_time_ms: start.elapsed().as_millis() as u64,
            tokens: completion.usage,
            saved_to_db: false,
        };

        if save {
            generated.saved_to_db = save_best_effort(
                self.results.as_ref(),
                collections::LLM_RESPONSES,
                response_record(&generated),
                Some("email_id"),
            )
            .await;
        }

        info!(
            email_id = %generated.email_id,
            response_type = ?generated.response_type,
            elapsed_ms = generated.processing_time_ms,
            saved = generated.saved_to_db,
            "Reply generated"
        );
        Ok(generated)
    }

    /// Draft without saving.
    pub async fn preview(&self, request: &ReplyRequest) -> Result<GeneratedResponse, PipelineError> {
        self.generate(request, false).await
    }

    pub async fn generate_batch(
        &self,
        requests: Vec<ReplyRequest>,
        save: bool,
    ) -> BatchOutcome<GeneratedResponse> {
        info!(count = requests.len(), "Generating reply batch");
        batch::run_batch(
            requests,
            |request: ReplyRequest| async move { self.generate(&request, save).await },
            &self.batch,
        )
        .await
    }
}

fn response_record(generated: &GeneratedResponse) -> Value {
    json!({
        "email_id": generated.email_id,
        "response_type": generated.response_type,
        "suggested_subject": generated.suggested_subject,
        "suggested_body": generated.suggested_body,
        "tone": generated.tone.as_str(),
        "tracking_data": generated.tracking_included,
        "approved": false,
        "sent": false,
        "confidence": generated.confidence,
        "reason": generated.internal_notes,
    })
}

/// The user prompt for a reply.
fn render_request(request: &ReplyRequest, response_type: ResponseType) -> String {
    let email = &request.email_content;
    let c = &request.classification;
    let mut prompt = format!(
        "EMAIL:\nFrom: {}\nTo: {}\nSubject: {}\n\nBody:\n{}\n\nCLASSIFICATION:\n\
         - Support: {}\n- Tracking: {}\n- Urgency: {}\n- Type: {}\n",
        email.from.as_deref().unwrap_or("unknown"),
        email.to.as_deref().unwrap_or("unknown"),
        email.subject.as_deref().unwrap_or("(no subject)"),
        email.body,
        c.is_support,
        c.is_tracking,
        c.urgency.as_deref().unwrap_or("normal"),
        c.email_type.as_deref().unwrap_or("other"),
    );

    match (&request.tracking_data, response_type) {
        (Some(order), ResponseType::Combined) => prompt.push_str(&render_tracking(order)),
        (None, _) if c.is_tracking => prompt.push_str(
            "\nNOTE: the customer asked about an order but no tracking data was found. \
             Say we are checking and ask for the order number or invoice.\n",
        ),
        _ => {}
    }

    if let Some(ref message) = request.priority_message {
        prompt.push_str(&format!("\nPRIORITY MESSAGE TO INCLUDE: {message}\n"));
    }
    if let Some(tone) = request.custom_tone {
        prompt.push_str(&format!("\nREQUESTED TONE: {}\n", tone.as_str()));
    }
    if !request.include_signature {
        prompt.push_str("\nDo not add a signature.\n");
    }
    prompt.push_str("\nWrite an appropriate reply following the instructions.");
    prompt
}

fn render_tracking(order: &OrderRecord) -> String {
    let mut block = format!(
        "\nTRACKING DATA:\n- Order: {}\n- Code: {}\n- Carrier: {}\n- Status: {}\n\
         - Last location: {}\n- Last update: {}\n",
        order.order_id,
        order.tracking_code,
        order.carrier.as_str(),
        order.status.as_str(),
        order.last_location.as_deref().unwrap_or("not available"),
        order.last_update.format("%d/%m/%Y %H:%M"),
    );
    if let Some(eta) = order.estimated_delivery {
        block.push_str(&format!("- Estimated delivery: {}\n", eta.format("%d/%m/%Y")));
    }
    if !order.history.is_empty() {
        block.push_str("- Recent movements:\n");
        let skip = order.history.len().saturating_sub(HISTORY_ENTRIES);
        for event in order.history.iter().skip(skip) {
            block.push_str(&format!("  • {}: {}", event.date.format("%d/%m %H:%M"), event.status));
            if let Some(ref location) = event.location {
                block.push_str(&format!(" - {location}"));
            }
            block.push('\n');
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::error::LlmError;
    use crate::pipeline::test_support::ScriptedLlm;
    use crate::store::MemoryResultStore;
    use crate::store::tracking::TrackingEvent;

    fn request(is_tracking: bool, with_tracking: bool) -> ReplyRequest {
        let mut value = json!({
            "email_id": "msg_1",
            "email_content": {
                "from": "cliente@example.com",
                "to": "suporte@loja.com",
                "subject": "Produto com defeito",
                "body": "Meu produto veio com defeito, e a devolução?"
            },
            "classification": {"is_support": true, "is_tracking": is_tracking, "urgency": "high"}
        });
        if with_tracking {
            value["tracking_data"] = json!({
                "order_id": "PED-2025-001",
                "tracking_code": "BR123456789BR",
                "status": "EM_TRANSITO",
                "carrier": "Correios"
            });
        }
        serde_json::from_value(value).unwrap()
    }

    fn reply_payload() -> Value {
        json!({
            "subject": "Re: Produto com defeito",
            "body": "Olá! Lamentamos o ocorrido.",
            "tone": "empathetic",
            "priority_actions": ["Enviar fotos do defeito"],
            "requires_followup": true
        })
    }

    fn responder(llm: ScriptedLlm, results: Arc<MemoryResultStore>) -> Responder {
        Responder::new(Arc::new(llm), Arc::new(PromptLibrary::builtin()), results)
    }

    #[test]
    fn combined_only_with_tracking_data() {
        assert_eq!(request(true, true).response_type(), ResponseType::Combined);
        assert_eq!(request(true, false).response_type(), ResponseType::Support);
        assert_eq!(request(false, true).response_type(), ResponseType::Support);
    }

    #[test]
    fn tracking_block_shows_last_three_movements() {
        let mut order: OrderRecord = serde_json::from_value(json!({"order_id": "1"})).unwrap();
        order.history = (1..=5)
            .map(|day| TrackingEvent {
                date: Utc.with_ymd_and_hms(2025, 1, day, 9, 0, 0).unwrap(),
                status: format!("step {day}"),
                location: None,
                description: None,
            })
            .collect();
        let block = render_tracking(&order);
        assert!(!block.contains("step 2"));
        assert!(block.contains("step 3"));
        assert!(block.contains("step 5"));
    }

    #[test]
    fn tracking_request_without_data_asks_for_details() {
        let prompt = render_request(&request(true, false), ResponseType::Support);
        assert!(prompt.contains("no tracking data was found"));
        let prompt = render_request(&request(true, true), ResponseType::Combined);
        assert!(prompt.contains("BR123456789BR"));
    }

    #[tokio::test]
    async fn generate_uses_combined_prompt_and_saves() {
        let llm = ScriptedLlm::json(reply_payload());
        let seen = llm.seen_prompts();
        let results = Arc::new(MemoryResultStore::new());
        let responder = responder(llm, Arc::clone(&results));

        let reply = responder.generate(&request(true, true), true).await.unwrap();
        assert_eq!(reply.response_type, ResponseType::Combined);
        assert_eq!(reply.tone, ResponseTone::Empathetic);
        assert!(reply.addresses_tracking);
        assert!(reply.saved_to_db);
        assert_eq!(&*seen.lock().unwrap()[0], PromptKind::Combined.default_text());

        let saved = results.records(collections::LLM_RESPONSES).await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0]["response_type"], "combined");
        assert_eq!(saved[0]["approved"], false);
    }

    #[tokio::test]
    async fn preview_never_saves() {
        let results = Arc::new(MemoryResultStore::new());
        let responder = responder(ScriptedLlm::json(reply_payload()), Arc::clone(&results));
        let reply = responder.preview(&request(false, false)).await.unwrap();
        assert!(!reply.saved_to_db);
        assert!(results.records(collections::LLM_RESPONSES).await.is_empty());
    }

    #[tokio::test]
    async fn missing_body_is_a_parse_failure() {
        let responder = responder(
            ScriptedLlm::json(json!({"subject": "Re: oi"})),
            Arc::new(MemoryResultStore::new()),
        );
        let err = responder.generate(&request(false, false), false).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Llm(LlmError::MissingField { ref field }) if field == "body"
        ));
    }

    #[tokio::test]
    async fn batch_runs_in_small_chunks() {
        let responder = responder(
            ScriptedLlm::with(|req| {
                if req.user_prompt.contains("msg_bad") {
                    Ok(json!({"subject": "x"}))
                } else {
                    Ok(reply_payload())
                }
            }),
            Arc::new(MemoryResultStore::new()),
        );
        let mut requests: Vec<ReplyRequest> = (0..4).map(|_| request(false, false)).collect();
        requests[1].email_content.body = "msg_bad".into();

        let outcome = responder.generate_batch(requests, false).await;
        assert_eq!(outcome.total, 4);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.results[1].failure().is_some());
        assert!(outcome.elapsed >= BATCH_CHUNK_DELAY);
    }
}
