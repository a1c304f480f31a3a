use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::batch::{self, BatchConfig, BatchOutcome};
use crate::error::ApiError;
use crate::store::TrackingQueryResult;

const QUERY_BATCH_CHUNK: usize = 10;
const MAX_BATCH_QUERIES: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingQuery {
    pub email_id: String,
    pub sender_email: String,
    #[serde(default)]
    pub order_id: Option<String>,
}

impl TrackingQuery {
    fn validate(&self) -> Result<(), ApiError> {
        if self.email_id.trim().is_empty() {
            return Err(ApiError::BadRequest("email_id must not be empty".into()));
        }
        if !self.sender_email.contains('@') {
            return Err(ApiError::BadRequest("sender_email must be an email address".into()));
        }
        Ok(())
    }
}

pub async fn query(
    State(state): State<AppState>,
    body: Result<Json<TrackingQuery>, JsonRejection>,
) -> Result<Json<TrackingQueryResult>, ApiError> {
    let Json(query) = body?;
    query.validate()?;
    let result = state
        .tracking
        .query_tracking(&query.email_id, &query.sender_email, query.order_id.as_deref())
        .await;
    Ok(Json(result))
}

pub async fn query_batch(
    State(state): State<AppState>,
    body: Result<Json<Vec<TrackingQuery>>, JsonRejection>,
) -> Result<Json<BatchOutcome<TrackingQueryResult>>, ApiError> {
    let Json(queries) = body?;
    if queries.is_empty() || queries.len() > MAX_BATCH_QUERIES {
        return Err(ApiError::BadRequest(format!(
            "batch must contain between 1 and {MAX_BATCH_QUERIES} queries"
        )));
    }
    for query in &queries {
        query.validate()?;
    }

    let tracking = &state.tracking;
    let outcome = batch::run_batch(
        queries,
        |query: TrackingQuery| async move {
            Ok::<_, Infallible>(
                tracking
                    .query_tracking(&query.email_id, &query.sender_email, query.order_id.as_deref())
                    .await,
            )
        },
        &BatchConfig::new(QUERY_BATCH_CHUNK),
    )
    .await;
    Ok(Json(outcome))
}

pub async fn test_connection(State(state): State<AppState>) -> Json<Value> {
    let connected = state.tracking.test_connection().await;
    Json(json!({
        "connected": connected,
        "reconnects": state.tracking.pool().reconnect_count(),
    }))
}
