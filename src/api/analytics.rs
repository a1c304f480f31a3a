use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::error::ApiError;
use crate::llm::costs::CostEstimate;

#[derive(Debug, Default, Deserialize)]
pub struct RateParams {
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct EstimateRequest {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub model: Option<String>,
}

pub async fn exchange_rate(
    State(state): State<AppState>,
    Query(params): Query<RateParams>,
) -> Json<Value> {
    let rate = state.rates.get_rate(params.force_refresh).await;
    Json(json!({
        "usd_to_brl": rate,
        "cache_info": state.rates.cache_info(),
        "timestamp": Utc::now(),
    }))
}

pub async fn pricing(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "pricing": state.costs.pricing(),
        "current_model": state.llm.model_name(),
    }))
}

pub async fn estimate(
    State(state): State<AppState>,
    body: Result<Json<EstimateRequest>, JsonRejection>,
) -> Result<Json<CostEstimate>, ApiError> {
    let Json(request) = body?;
    let model = request
        .model
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.llm.model_name());
    let estimate = state
        .costs
        .estimate(request.input_tokens, request.output_tokens, model)
        .await;
    Ok(Json(estimate))
}
