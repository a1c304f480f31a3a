use axum::Json;
use axum::extract::State;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

use super::AppState;

const SERVICE_NAME: &str = "mail-triage";

pub async fn root() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/api/v1/health",
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": Utc::now(),
    }))
}

/// Probe the LLM and the tracking database. Either failing marks the
/// service degraded; the response itself is always 200.
pub async fn detailed(State(state): State<AppState>) -> Json<Value> {
    let (llm, tracking) = tokio::join!(state.llm.health_check(), state.tracking.test_connection());

    let llm_status = match &llm {
        Ok(()) => json!({ "status": "healthy", "model": state.llm.model_name() }),
        Err(e) => {
            warn!(error = %e, "LLM health check failed");
            json!({ "status": "unhealthy", "model": state.llm.model_name(), "error": e.to_string() })
        }
    };
    let healthy = llm.is_ok() && tracking;
    let status = if healthy { "healthy" } else { "degraded" };
    let tracking_status = if tracking { "healthy" } else { "unhealthy" };
    let tracked_clients = state.limiter.tracked_keys().await;

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": Utc::now(),
        "services": {
            "llm": llm_status,
            "tracking_db": {
                "status": tracking_status,
                "reconnects": state.tracking.pool().reconnect_count(),
            },
            "result_store": { "backend": state.results.name() },
            "exchange_rate": state.rates.cache_info(),
            "rate_limiter": { "tracked_clients": tracked_clients },
        },
    }))
}

pub async fn ready() -> Json<Value> {
    Json(json!({ "status": "ready" }))
}
