use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use serde::Deserialize;

use super::AppState;
use crate::batch::BatchOutcome;
use crate::error::ApiError;
use crate::pipeline::{GeneratedResponse, ReplyRequest};

const MAX_BATCH_REQUESTS: usize = 10;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SaveParams {
    #[serde(default = "default_true")]
    pub save_to_db: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReplyBatch {
    pub requests: Vec<ReplyRequest>,
    #[serde(default = "default_true")]
    pub save_to_db: bool,
}

pub async fn generate(
    State(state): State<AppState>,
    Query(params): Query<SaveParams>,
    body: Result<Json<ReplyRequest>, JsonRejection>,
) -> Result<Json<GeneratedResponse>, ApiError> {
    let Json(request) = body?;
    let reply = state.responder.generate(&request, params.save_to_db).await?;
    Ok(Json(reply))
}

pub async fn preview(
    State(state): State<AppState>,
    body: Result<Json<ReplyRequest>, JsonRejection>,
) -> Result<Json<GeneratedResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(state.responder.preview(&request).await?))
}

pub async fn generate_batch(
    State(state): State<AppState>,
    body: Result<Json<ReplyBatch>, JsonRejection>,
) -> Result<Json<BatchOutcome<GeneratedResponse>>, ApiError> {
    let Json(batch) = body?;
    if batch.requests.is_empty() || batch.requests.len() > MAX_BATCH_REQUESTS {
        return Err(ApiError::BadRequest(format!(
            "batch must contain between 1 and {MAX_BATCH_REQUESTS} requests"
        )));
    }
    Ok(Json(state.responder.generate_batch(batch.requests, batch.save_to_db).await))
}
