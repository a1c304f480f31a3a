//! Configuration types.
//!
//! Everything is read from the environment once at startup. Missing
//! credentials are fatal; everything else falls back to a default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Gemini REST endpoint.
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Bearer token every `/api/v1` request must present.
    pub api_key: SecretString,
    pub gemini: GeminiConfig,
    /// `None` disables result persistence.
    pub persistence: Option<PersistenceConfig>,
    pub tracking_db: TrackingDbConfig,
    pub rate_limit: RateLimitConfig,
    pub processing: ProcessingConfig,
    pub pricing_path: PathBuf,
    pub prompts_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty means any origin.
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

/// PostgREST-compatible managed datastore.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub url: String,
    pub key: SecretString,
}

#[derive(Debug, Clone)]
pub struct TrackingDbConfig {
    /// A `libsql://`/`https://` URL for a remote database, or a local file path.
    pub location: String,
    pub auth_token: Option<SecretString>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessingConfig {
    /// Chunk size for email batches.
    pub max_concurrent: usize,
    /// Upper bound for a single item inside a batch.
    pub item_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            item_timeout: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let api_key = SecretString::from(required("API_KEY")?);
        let gemini_key = SecretString::from(required("GEMINI_API_KEY")?);

        let server = ServerConfig {
            host: get("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("API_PORT", get("API_PORT"), 8001)?,
            cors_origins: get("CORS_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty() && o != "*")
                        .collect()
                })
                .unwrap_or_default(),
        };

        let gemini = GeminiConfig {
            api_key: gemini_key,
            model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.5-flash".to_string()),
            base_url: get("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            temperature: parse_or("GEMINI_TEMPERATURE", get("GEMINI_TEMPERATURE"), 0.3)?,
            top_p: parse_or("GEMINI_TOP_P", get("GEMINI_TOP_P"), 0.9)?,
            max_output_tokens: parse_or(
                "GEMINI_MAX_OUTPUT_TOKENS",
                get("GEMINI_MAX_OUTPUT_TOKENS"),
                1000,
            )?,
        };

        let persistence = match (get("SUPABASE_URL"), get("SUPABASE_KEY")) {
            (Some(url), Some(key)) => Some(PersistenceConfig {
                url: url.trim_end_matches('/').to_string(),
                key: SecretString::from(key),
            }),
            _ => None,
        };

        let tracking_db = TrackingDbConfig {
            location: get("TRACKING_DB_URL").unwrap_or_else(|| "./data/tracking.db".to_string()),
            auth_token: get("TRACKING_DB_TOKEN").map(SecretString::from),
        };

        let defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            max_requests: parse_or(
                "RATE_LIMIT_REQUESTS",
                get("RATE_LIMIT_REQUESTS"),
                defaults.max_requests,
            )?,
            window: Duration::from_secs(parse_or(
                "RATE_LIMIT_PERIOD",
                get("RATE_LIMIT_PERIOD"),
                defaults.window.as_secs(),
            )?),
        };

        let defaults = ProcessingConfig::default();
        let processing = ProcessingConfig {
            max_concurrent: parse_or(
                "MAX_CONCURRENT_REQUESTS",
                get("MAX_CONCURRENT_REQUESTS"),
                defaults.max_concurrent,
            )?
            .max(1),
            item_timeout: Duration::from_secs(parse_or(
                "PROCESSING_TIMEOUT",
                get("PROCESSING_TIMEOUT"),
                defaults.item_timeout.as_secs(),
            )?),
        };

        Ok(Self {
            server,
            api_key,
            gemini,
            persistence,
            tracking_db,
            rate_limit,
            processing,
            pricing_path: get("PRICING_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/llm_pricing.json")),
            prompts_dir: get("PROMPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("prompts")),
            log_dir: log_dir_from(get("LOG_DIR")),
        })
    }
}

/// Log directory from `LOG_DIR`. Read before the rest of the configuration
/// so that configuration errors are logged.
pub fn log_dir_from_env() -> PathBuf {
    log_dir_from(std::env::var("LOG_DIR").ok().filter(|v| !v.trim().is_empty()))
}

fn log_dir_from(raw: Option<String>) -> PathBuf {
    raw.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("logs"))
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{v:?}: {e}"),
        }),
    }
}
