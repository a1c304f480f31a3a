//! HTTP API.
//!
//! Public routes: `/`, `/api/v1/health*`, `/api/v1/ready`. Everything else
//! under `/api/v1` requires the bearer API key and passes per-client rate
//! admission.

pub mod analytics;
pub mod auth;
pub mod emails;
pub mod health;
pub mod responses;
pub mod tracking;
pub mod webhook;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::http::{HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use secrecy::SecretString;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::config::RateLimitConfig;
use crate::currency::ExchangeRateCache;
use crate::llm::{CostCalculator, LlmProvider};
use crate::pipeline::{EmailProcessor, Responder};
use crate::resilience::RateWindowLimiter;
use crate::store::{ResultStore, TrackingStore};

pub use webhook::WebhookClient;

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<EmailProcessor>,
    pub responder: Arc<Responder>,
    pub tracking: Arc<TrackingStore>,
    pub costs: Arc<CostCalculator>,
    pub rates: Arc<ExchangeRateCache>,
    pub llm: Arc<dyn LlmProvider>,
    pub results: Arc<dyn ResultStore>,
    pub limiter: Arc<RateWindowLimiter>,
    pub rate_limit: RateLimitConfig,
    pub api_key: SecretString,
    pub webhook: WebhookClient,
    pub started_at: Instant,
}

/// Build the full router. An empty `cors_origins` allows any origin.
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let public = Router::new()
        .route("/", get(health::root))
        .route("/api/v1/health", get(health::health))
        .route("/api/v1/health/detailed", get(health::detailed))
        .route("/api/v1/ready", get(health::ready));

    let protected = Router::new()
        .route("/api/v1/emails/process", post(emails::process))
        .route("/api/v1/emails/process-batch", post(emails::process_batch))
        .route("/api/v1/emails/{email_id}/status", get(emails::status))
        .route("/api/v1/response/generate", post(responses::generate))
        .route("/api/v1/response/preview", post(responses::preview))
        .route("/api/v1/response/generate-batch", post(responses::generate_batch))
        .route("/api/v1/tracking/query", post(tracking::query))
        .route("/api/v1/tracking/query-batch", post(tracking::query_batch))
        .route("/api/v1/tracking/test-connection", get(tracking::test_connection))
        .route("/api/v1/analytics/exchange-rate", get(analytics::exchange_rate))
        .route("/api/v1/analytics/pricing", get(analytics::pricing))
        .route("/api/v1/analytics/estimate", post(analytics::estimate))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(state.clone(), auth::rate_limit))
                .layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key)),
        );

    public.merge(protected).with_state(state).layer(
        ServiceBuilder::new()
            .layer(cors_layer(cors_origins))
            .layer(middleware::from_fn(log_requests)),
    )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

/// Log method, path, status and latency of every request.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "HTTP request"
    );
    response
}
