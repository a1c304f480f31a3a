//! Email processor: classification, tracking search, costs, persistence.
//!
//! Flow for one email:
//! 1. Validate the input
//! 2. LLM classification (`Classifier`)
//! 3. Tracking requests → order search in the tracking store
//! 4. Cost breakdown from token usage
//! 5. Best-effort writes to `processed_emails` and `tracking_requests`
//!
//! Persistence never fails the email. A failed order search is reported in
//! the tracking result instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, info};

use super::classifier::Classifier;
use super::types::{EmailClassification, EmailInput, ProcessingReport, TrackingInfo, TrackingResult};
use crate::batch::{self, BatchConfig, BatchOutcome};
use crate::error::PipelineError;
use crate::llm::{CostBreakdown, CostCalculator, TokenUsage};
use crate::store::results::collections;
use crate::store::{ResultStore, TrackingStore, save_best_effort};

/// Orders returned when the email names no specific order.
const RECENT_ORDER_LIMIT: u32 = 5;

/// Pause between batch chunks.
const BATCH_CHUNK_DELAY: Duration = Duration::from_millis(500);

pub struct EmailProcessor {
    classifier: Classifier,
    tracking: Arc<TrackingStore>,
    costs: Arc<CostCalculator>,
    results: Arc<dyn ResultStore>,
    batch: BatchConfig,
}

impl EmailProcessor {
    /// `max_concurrent` emails run per batch chunk, each bounded by
    /// `item_timeout`.
    pub fn new(
        classifier: Classifier,
        tracking: Arc<TrackingStore>,
        costs: Arc<CostCalculator>,
        results: Arc<dyn ResultStore>,
        max_concurrent: usize,
        item_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            tracking,
            costs,
            results,
            batch: BatchConfig::new(max_concurrent)
                .with_delay(BATCH_CHUNK_DELAY)
                .with_item_timeout(item_timeout),
        }
    }

    pub fn batch_config(&self) -> &BatchConfig {
        &self.batch
    }

    /// Process one email end to end.
    pub async fn process_email(
        &self,
        email: &EmailInput,
        custom_prompt: Option<&str>,
    ) -> Result<ProcessingReport, PipelineError> {
        email.validate()?;
        let start = Instant::now();
        info!(
            email_id = %email.email_id,
            from = %email.from_address,
            "Processing email"
        );

        let classified = self.classifier.classify(email, custom_prompt).await?;
        let classification = classified.classification;

        let tracking_data = if classification.is_tracking {
            info!(email_id = %email.email_id, "Tracking request, searching orders");
            Some(
                self.search_tracking(&email.from_address, classification.extracted_order_id.as_deref())
                    .await,
            )
        } else {
            None
        };

        let costs = self
            .costs
            .calculate(&classified.usage, self.classifier.model_name())
            .await;
        let processing_time = start.elapsed();

        self.persist(email, &classification, tracking_data.as_ref(), &classified.usage, &costs, processing_time)
            .await;

        if let Some(ref tracking) = tracking_data {
            info!(
                email_id = %email.email_id,
                found = tracking.found,
                orders = tracking.orders.len(),
                "Tracking search complete"
            );
        }

        Ok(ProcessingReport {
            email_id: email.email_id.clone(),
            classification,
            tracking_data,
            tokens: classified.usage,
            costs,
            processing_time: processing_time.as_secs_f64(),
            processed_at: Utc::now(),
        })
    }

    /// Process emails in chunks. Each email succeeds or fails on its own.
    pub async fn process_batch(
        &self,
        emails: Vec<EmailInput>,
        custom_prompt: Option<&str>,
    ) -> BatchOutcome<ProcessingReport> {
        info!(count = emails.len(), "Processing email batch");
        batch::run_batch(
            emails,
            |email: EmailInput| async move { self.process_email(&email, custom_prompt).await },
            &self.batch,
        )
        .await
    }

    /// A specific order when the id is known, else the most recent ones.
    async fn search_tracking(&self, sender: &str, order_id: Option<&str>) -> TrackingResult {
        let start = Instant::now();
        let lookup = match order_id {
            Some(id) => self
                .tracking
                .find_by_customer(sender, Some(id))
                .await
                .map(|order| order.into_iter().collect::<Vec<_>>()),
            None => self.tracking.find_all_by_customer(sender, RECENT_ORDER_LIMIT).await,
        };
        let query_time_ms = start.elapsed().as_millis() as u64;

        match lookup {
            Ok(orders) => TrackingResult {
                found: !orders.is_empty(),
                orders: orders.iter().map(TrackingInfo::from).collect(),
                query_time_ms,
                error: None,
            },
            Err(e) => {
                error!(sender, error = %e, "Tracking search failed");
                TrackingResult {
                    found: false,
                    orders: Vec::new(),
                    query_time_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn persist(
        &self,
        email: &EmailInput,
        classification: &EmailClassification,
        tracking: Option<&TrackingResult>,
        usage: &TokenUsage,
        costs: &CostBreakdown,
        processing_time: Duration,
    ) {
        let record = processed_email_record(email, classification, usage, costs, processing_time);
        save_best_effort(
            self.results.as_ref(),
            collections::PROCESSED_EMAILS,
            record,
            Some("email_id"),
        )
        .await;

        if let Some(tracking) = tracking {
            let record = tracking_request_record(email, classification, tracking);
            save_best_effort(self.results.as_ref(), collections::TRACKING_REQUESTS, record, None).await;
        }
    }
}

fn processed_email_record(
    email: &EmailInput,
    classification: &EmailClassification,
    usage: &TokenUsage,
    costs: &CostBreakdown,
    processing_time: Duration,
) -> Value {
    json!({
        "email_id": email.email_id,
        "from_address": email.from_address,
        "to_address": email.to_address,
        "subject": email.subject,
        "body": email.body,
        "thread_id": email.thread_id,
        "received_at": email.received_at.to_rfc3339(),
        "is_support": classification.is_support,
        "is_tracking": classification.is_tracking,
        "classification_confidence": classification.confidence,
        "email_type": classification.email_type.as_str(),
        "urgency": classification.urgency.as_str(),
        "processing_time_ms": processing_time.as_millis() as u64,
        "prompt_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
        "thought_tokens": usage.thinking_tokens,
        "total_tokens": usage.total_tokens,
        "cost_input_usd": costs.cost_input_usd,
        "cost_output_usd": costs.cost_output_usd,
        "cost_thinking_usd": costs.cost_thinking_usd,
        "cost_total_usd": costs.cost_total_usd,
        "cost_input_brl": costs.cost_input_brl,
        "cost_output_brl": costs.cost_output_brl,
        "cost_thinking_brl": costs.cost_thinking_brl,
        "cost_total_brl": costs.cost_total_brl,
        "exchange_rate": costs.exchange_rate,
        "status": "processed",
    })
}

fn tracking_request_record(
    email: &EmailInput,
    classification: &EmailClassification,
    tracking: &TrackingResult,
) -> Value {
    json!({
        "email_id": email.email_id,
        "sender_email": email.from_address,
        "order_id": classification.extracted_order_id,
        "queried": true,
        "query_success": tracking.error.is_none(),
        "tracking_details": {
            "found": tracking.found,
            "orders": tracking.orders,
        },
    })
}
