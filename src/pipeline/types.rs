//! Shared types for the email processing pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::llm::{CostBreakdown, TokenUsage};
use crate::store::OrderRecord;

// ── Inbound email ───────────────────────────────────────────────────

/// Sender-declared priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
    #[default]
    Normal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailMetadata {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, Value>,
}

/// An email submitted for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailInput {
    pub email_id: String,
    #[serde(rename = "from")]
    pub from_address: String,
    #[serde(rename = "to")]
    pub to_address: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub metadata: EmailMetadata,
}

impl EmailInput {
    /// Reject emails the pipeline cannot classify.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.email_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("email_id must not be empty".into()));
        }
        if self.subject.trim().is_empty() {
            return Err(PipelineError::InvalidInput("subject must not be empty".into()));
        }
        if self.body.trim().is_empty() {
            return Err(PipelineError::InvalidInput("body must not be empty".into()));
        }
        for (field, address) in [("from", &self.from_address), ("to", &self.to_address)] {
            if !address.contains('@') {
                return Err(PipelineError::InvalidInput(format!(
                    "{field} is not an email address: {address}"
                )));
            }
        }
        Ok(())
    }
}

// ── Classification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailType {
    Question,
    Complaint,
    Request,
    Spam,
    Newsletter,
    AutoReply,
    #[serde(other)]
    Other,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Complaint => "complaint",
            Self::Request => "request",
            Self::Spam => "spam",
            Self::Newsletter => "newsletter",
            Self::AutoReply => "auto_reply",
            Self::Other => "other",
        }
    }
}

/// What the model decided about an email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailClassification {
    pub is_support: bool,
    pub is_tracking: bool,
    pub urgency: Urgency,
    pub email_type: EmailType,
    pub confidence: f64,
    #[serde(default)]
    pub extracted_order_id: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
}

// ── Tracking ────────────────────────────────────────────────────────

/// Summary of one order found for a tracking request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub order_id: String,
    pub tracking_code: String,
    pub last_update: DateTime<Utc>,
    pub status: Option<String>,
}

impl From<&OrderRecord> for TrackingInfo {
    fn from(order: &OrderRecord) -> Self {
        Self {
            order_id: order.order_id.clone(),
            tracking_code: order.tracking_code.clone(),
            last_update: order.last_update,
            status: Some(order.status.as_str().to_string()),
        }
    }
}

/// Outcome of the order search for a tracking email. A failed search is
/// reported in `error`, never raised.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingResult {
    pub found: bool,
    pub orders: Vec<TrackingInfo>,
    pub query_time_ms: u64,
    pub error: Option<String>,
}

// ── Report ──────────────────────────────────────────────────────────

/// Everything produced for one processed email.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub email_id: String,
    pub classification: EmailClassification,
    pub tracking_data: Option<TrackingResult>,
    pub tokens: TokenUsage,
    pub costs: CostBreakdown,
    /// Seconds.
    pub processing_time: f64,
    pub processed_at: DateTime<Utc>,
}
