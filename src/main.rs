use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_triage::api::{self, AppState, WebhookClient};
use mail_triage::config::{self, AppConfig};
use mail_triage::currency::ExchangeRateCache;
use mail_triage::llm::{CostCalculator, PricingTable, create_provider};
use mail_triage::pipeline::{Classifier, EmailProcessor, GenerationSettings, PromptLibrary, Responder};
use mail_triage::resilience::{RateWindowLimiter, RetryPolicy, spawn_sweep_task};
use mail_triage::store::{
    MemoryResultStore, PoolTarget, PooledResource, RestResultStore, ResultStore, TrackingStore,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = config::log_dir_from_env();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "app.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("📬 Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.gemini.model);
    eprintln!("   Tracking DB: {}", config.tracking_db.location);
    eprintln!("   API: http://{}:{}/api/v1", config.server.host, config.server.port);
    eprintln!("   Logs: {}", config.log_dir.display());

    // ── Tracking database ────────────────────────────────────────────────
    let pool = Arc::new(PooledResource::new(
        PoolTarget::from_location(&config.tracking_db.location, config.tracking_db.auth_token.clone()),
        RetryPolicy::default(),
    ));
    if let Err(e) = pool.init().await {
        tracing::error!(error = %e, "Tracking database unavailable at startup, will reconnect on demand");
    }
    let tracking = Arc::new(TrackingStore::new(Arc::clone(&pool)));

    // ── Costs and LLM ────────────────────────────────────────────────────
    let rates = Arc::new(ExchangeRateCache::new());
    let costs = Arc::new(CostCalculator::new(
        PricingTable::load(&config.pricing_path),
        Arc::clone(&rates),
    ));
    let llm = create_provider(&config.gemini).context("failed to create LLM provider")?;
    let prompts = Arc::new(PromptLibrary::new(&config.prompts_dir));

    // ── Result store ─────────────────────────────────────────────────────
    let results: Arc<dyn ResultStore> = match &config.persistence {
        Some(persistence) => Arc::new(
            RestResultStore::new(persistence).context("failed to create result store client")?,
        ),
        None => {
            tracing::warn!("SUPABASE_URL/SUPABASE_KEY not set, results are kept in memory only");
            Arc::new(MemoryResultStore::new())
        }
    };

    let classifier = Classifier::new(
        Arc::clone(&llm),
        Arc::clone(&prompts),
        GenerationSettings::from(&config.gemini),
    );
    let processor = Arc::new(EmailProcessor::new(
        classifier,
        Arc::clone(&tracking),
        Arc::clone(&costs),
        Arc::clone(&results),
        config.processing.max_concurrent,
        config.processing.item_timeout,
    ));
    let responder = Arc::new(Responder::new(
        Arc::clone(&llm),
        Arc::clone(&prompts),
        Arc::clone(&results),
    ));

    // ── Admission ────────────────────────────────────────────────────────
    let limiter = Arc::new(RateWindowLimiter::new());
    let sweep = spawn_sweep_task(Arc::clone(&limiter), SWEEP_INTERVAL);

    let state = AppState {
        processor,
        responder,
        tracking,
        costs,
        rates,
        llm,
        results,
        limiter,
        rate_limit: config.rate_limit,
        api_key: config.api_key.clone(),
        webhook: WebhookClient::new(),
        started_at: Instant::now(),
    };
    let app = api::router(state, &config.server.cors_origins);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "HTTP server started");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweep.abort();
    pool.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
