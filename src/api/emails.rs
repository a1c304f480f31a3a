use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};
use uuid::Uuid;

use super::AppState;
use crate::batch::BatchOutcome;
use crate::error::ApiError;
use crate::pipeline::{EmailInput, ProcessingReport};
use crate::store::results::collections;

const MAX_BATCH_EMAILS: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct ProcessParams {
    pub custom_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailBatch {
    pub emails: Vec<EmailInput>,
    #[serde(default)]
    pub process_async: bool,
    pub webhook_url: Option<String>,
}

pub async fn process(
    State(state): State<AppState>,
    Query(params): Query<ProcessParams>,
    body: Result<Json<EmailInput>, JsonRejection>,
) -> Result<Json<ProcessingReport>, ApiError> {
    let Json(email) = body?;
    let report = state
        .processor
        .process_email(&email, params.custom_prompt.as_deref())
        .await?;
    Ok(Json(report))
}

pub async fn process_batch(
    State(state): State<AppState>,
    body: Result<Json<EmailBatch>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(batch) = body?;
    if batch.emails.is_empty() || batch.emails.len() > MAX_BATCH_EMAILS {
        return Err(ApiError::BadRequest(format!(
            "batch must contain between 1 and {MAX_BATCH_EMAILS} emails"
        )));
    }

    let job_id = Uuid::new_v4().to_string();
    let total = batch.emails.len();

    if !batch.process_async {
        let outcome = state.processor.process_batch(batch.emails, None).await;
        return Ok(Json(json!({ "job_id": job_id, "outcome": outcome })));
    }

    info!(job_id = %job_id, total, "Queued async email batch");
    let processor = state.processor.clone();
    let webhook = state.webhook.clone();
    let job = job_id.clone();
    let EmailBatch {
        emails, webhook_url, ..
    } = batch;
    tokio::spawn(async move {
        let run = tokio::spawn(async move { processor.process_batch(emails, None).await }).await;
        let payload = match run {
            Ok(outcome) => {
                info!(
                    job_id = %job,
                    succeeded = outcome.succeeded,
                    failed = outcome.failed,
                    "Async email batch finished"
                );
                completion_payload(&job, &outcome)
            }
            Err(e) => {
                error!(job_id = %job, error = %e, "Async email batch aborted");
                json!({ "job_id": job, "status": "failed", "error": e.to_string() })
            }
        };
        if let Some(url) = webhook_url {
            webhook.notify(&url, &payload).await;
        }
    });

    Ok(Json(json!({
        "job_id": job_id,
        "total_emails": total,
        "status": "queued",
        "message": format!("Processing {total} emails in background"),
    })))
}

pub async fn status(
    State(state): State<AppState>,
    Path(email_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .results
        .fetch_one(collections::PROCESSED_EMAILS, "email_id", &email_id)
        .await?;

    Ok(Json(match record {
        Some(record) => json!({ "email_id": email_id, "status": "found", "record": record }),
        None => json!({ "email_id": email_id, "status": "not_found" }),
    }))
}

fn completion_payload(job_id: &str, outcome: &BatchOutcome<ProcessingReport>) -> Value {
    json!({
        "job_id": job_id,
        "status": "completed",
        "outcome": outcome,
    })
}
