//! USD→BRL exchange rate with a TTL cache and ordered provider fallback.
//!
//! A valid cached rate is served without I/O. On a miss (or forced refresh)
//! providers are tried in order and the first positive rate wins. If none
//! answers, a fixed fallback rate is cached instead. Callers never see a
//! provider error.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Rate used when every provider fails.
pub const FALLBACK_RATE: Decimal = dec!(5.50);

/// Source label for the fallback rate.
pub const FALLBACK_SOURCE: &str = "fallback";

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Extracts a rate from a provider's JSON body.
pub type RateParser = fn(&Value) -> Option<f64>;

/// One upstream exchange-rate API.
#[derive(Debug, Clone)]
pub struct RateProvider {
    pub name: String,
    pub url: String,
    pub parse: RateParser,
}

impl RateProvider {
    pub fn new(name: impl Into<String>, url: impl Into<String>, parse: RateParser) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            parse,
        }
    }
}

/// Reads `rates.BRL`.
pub fn parse_rates_brl(body: &Value) -> Option<f64> {
    body.get("rates")?.get("BRL")?.as_f64()
}

/// Reads `data.BRL.value`.
pub fn parse_data_brl_value(body: &Value) -> Option<f64> {
    body.get("data")?.get("BRL")?.get("value")?.as_f64()
}

/// The production provider list, in priority order.
pub fn default_providers() -> Vec<RateProvider> {
    vec![
        RateProvider::new(
            "exchangerate-api",
            "https://api.exchangerate-api.com/v4/latest/USD",
            parse_rates_brl,
        ),
        RateProvider::new(
            "fixer.io (free tier)",
            "https://api.fixer.io/latest?base=USD&symbols=BRL",
            parse_rates_brl,
        ),
        RateProvider::new(
            "currencyapi",
            "https://api.currencyapi.com/v3/latest?base_currency=USD&currencies=BRL",
            parse_data_brl_value,
        ),
    ]
}

#[derive(Debug, Clone)]
struct RateCacheEntry {
    value: Decimal,
    fetched_at: Instant,
    fetched_at_utc: DateTime<Utc>,
    source: String,
}

/// Snapshot of the cache slot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub rate: Option<Decimal>,
    pub source: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub cache_valid: bool,
    pub ttl_seconds: u64,
}

/// A USD amount converted at the current rate.
#[derive(Debug, Clone, Serialize)]
pub struct Conversion {
    pub usd: Decimal,
    pub brl: Decimal,
    pub exchange_rate: Decimal,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// TTL-cached exchange rate service.
pub struct ExchangeRateCache {
    client: reqwest::Client,
    providers: Vec<RateProvider>,
    ttl: Duration,
    entry: RwLock<Option<RateCacheEntry>>,
}

impl ExchangeRateCache {
    /// Cache backed by the production providers.
    pub fn new() -> Self {
        Self::with_providers(default_providers(), DEFAULT_TTL)
    }

    pub fn with_providers(providers: Vec<RateProvider>, ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            providers,
            ttl,
            entry: RwLock::new(None),
        }
    }

    /// Current USD→BRL rate.
    pub async fn get_rate(&self, force_refresh: bool) -> Decimal {
        if !force_refresh {
            if let Some(entry) = self.valid_entry() {
                debug!(rate = %entry.value, source = %entry.source, "Exchange rate cache hit");
                return entry.value;
            }
        }

        for provider in &self.providers {
            match self.fetch(provider).await {
                Ok(rate) if rate > Decimal::ZERO => {
                    info!(rate = %rate, source = %provider.name, "Exchange rate refreshed");
                    self.store(rate, &provider.name);
                    return rate;
                }
                Ok(rate) => {
                    warn!(source = %provider.name, rate = %rate, "Provider returned non-positive rate");
                }
                Err(reason) => {
                    warn!(source = %provider.name, error = %reason, "Exchange rate provider failed");
                }
            }
        }

        warn!(rate = %FALLBACK_RATE, "All exchange rate providers failed, using fallback");
        self.store(FALLBACK_RATE, FALLBACK_SOURCE);
        FALLBACK_RATE
    }

    async fn fetch(&self, provider: &RateProvider) -> Result<Decimal, String> {
        let response = self
            .client
            .get(&provider.url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("invalid JSON: {e}"))?;

        let raw = (provider.parse)(&body).ok_or_else(|| "rate missing from response".to_string())?;
        Decimal::from_f64(raw).ok_or_else(|| format!("rate {raw} is not representable"))
    }

    fn valid_entry(&self) -> Option<RateCacheEntry> {
        let guard = self.entry.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|e| e.fetched_at.elapsed() < self.ttl)
            .cloned()
    }

    fn store(&self, value: Decimal, source: &str) {
        let mut guard = self.entry.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(RateCacheEntry {
            value,
            fetched_at: Instant::now(),
            fetched_at_utc: Utc::now(),
            source: source.to_string(),
        });
    }

    /// Cached rate, if any, regardless of age. Performs no I/O.
    pub fn cached_rate(&self) -> Option<Decimal> {
        let guard = self.entry.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(|e| e.value)
    }

    /// Describe the cache slot. Performs no I/O.
    pub fn cache_info(&self) -> CacheInfo {
        let guard = self.entry.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(e) => CacheInfo {
                rate: Some(e.value),
                source: Some(e.source.clone()),
                last_update: Some(e.fetched_at_utc),
                cache_valid: e.fetched_at.elapsed() < self.ttl,
                ttl_seconds: self.ttl.as_secs(),
            },
            None => CacheInfo {
                rate: None,
                source: None,
                last_update: None,
                cache_valid: false,
                ttl_seconds: self.ttl.as_secs(),
            },
        }
    }

    /// Convert USD to BRL, fetching the rate unless one is supplied.
    pub async fn convert_usd_to_brl(&self, usd: Decimal, rate: Option<Decimal>) -> Decimal {
        let rate = match rate {
            Some(r) => r,
            None => self.get_rate(false).await,
        };
        (usd * rate).round_dp(6)
    }

    /// Convert USD to BRL at the current rate and report where it came from.
    pub async fn convert_with_current_rate(&self, usd: Decimal) -> Conversion {
        let rate = self.get_rate(false).await;
        let source = self
            .cache_info()
            .source
            .unwrap_or_else(|| FALLBACK_SOURCE.to_string());
        Conversion {
            usd,
            brl: (usd * rate).round_dp(6),
            exchange_rate: rate,
            source,
            timestamp: Utc::now(),
        }
    }
}

impl Default for ExchangeRateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use mockito::Server;
    use serde_json::json;

    use super::*;

    fn providers_at(base: &str) -> Vec<RateProvider> {
        vec![
            RateProvider::new("first", format!("{base}/first"), parse_rates_brl),
            RateProvider::new("second", format!("{base}/second"), parse_data_brl_value),
        ]
    }

    #[test]
    fn parsers_read_provider_shapes() {
        assert_eq!(parse_rates_brl(&json!({"rates": {"BRL": 5.1}})), Some(5.1));
        assert_eq!(parse_data_brl_value(&json!({"data": {"BRL": {"value": 4.9}}})), Some(4.9));
        assert_eq!(parse_rates_brl(&json!({"rates": {"EUR": 0.9}})), None);
    }

    #[tokio::test]
    async fn all_providers_failing_yields_cached_fallback() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/first")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/second")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let cache = ExchangeRateCache::with_providers(providers_at(&server.url()), DEFAULT_TTL);

        assert_eq!(cache.get_rate(false).await, FALLBACK_RATE);
        // Served from cache: no further provider calls.
        assert_eq!(cache.get_rate(false).await, FALLBACK_RATE);

        first.assert_async().await;
        second.assert_async().await;
        let info = cache.cache_info();
        assert_eq!(info.source.as_deref(), Some(FALLBACK_SOURCE));
        assert!(info.cache_valid);
    }

    #[tokio::test]
    async fn first_positive_provider_wins() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/first")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"rates": {"BRL": 5.25}}"#)
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/second")
            .expect(0)
            .create_async()
            .await;

        let cache = ExchangeRateCache::with_providers(providers_at(&server.url()), DEFAULT_TTL);
        assert_eq!(cache.get_rate(false).await, dec!(5.25));

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(cache.cache_info().source.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn non_positive_rate_falls_through_to_next_provider() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/first")
            .with_status(200)
            .with_body(r#"{"rates": {"BRL": 0}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/second")
            .with_status(200)
            .with_body(r#"{"data": {"BRL": {"value": 4.75}}}"#)
            .create_async()
            .await;

        let cache = ExchangeRateCache::with_providers(providers_at(&server.url()), DEFAULT_TTL);
        assert_eq!(cache.get_rate(false).await, dec!(4.75));
        assert_eq!(cache.cache_info().source.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn force_refresh_bypasses_valid_entry() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/first")
            .with_status(200)
            .with_body(r#"{"rates": {"BRL": 5.0}}"#)
            .expect(2)
            .create_async()
            .await;

        let cache = ExchangeRateCache::with_providers(providers_at(&server.url()), DEFAULT_TTL);
        cache.get_rate(false).await;
        cache.get_rate(true).await;
        first.assert_async().await;
    }

    #[tokio::test]
    async fn expired_entry_triggers_refetch() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/first")
            .with_status(200)
            .with_body(r#"{"rates": {"BRL": 5.0}}"#)
            .expect(2)
            .create_async()
            .await;

        let cache =
            ExchangeRateCache::with_providers(providers_at(&server.url()), Duration::from_millis(20));
        cache.get_rate(false).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.cache_info().cache_valid);
        cache.get_rate(false).await;
        first.assert_async().await;
    }

    #[tokio::test]
    async fn accessors_do_no_io_before_first_fetch() {
        let cache = ExchangeRateCache::with_providers(Vec::new(), DEFAULT_TTL);
        assert!(cache.cached_rate().is_none());
        let info = cache.cache_info();
        assert!(!info.cache_valid);
        assert_eq!(info.ttl_seconds, 3600);
    }

    #[tokio::test]
    async fn conversion_uses_supplied_or_cached_rate() {
        let cache = ExchangeRateCache::with_providers(Vec::new(), DEFAULT_TTL);
        assert_eq!(cache.convert_usd_to_brl(dec!(2), Some(dec!(5))).await, dec!(10));

        let conversion = cache.convert_with_current_rate(dec!(1)).await;
        assert_eq!(conversion.exchange_rate, FALLBACK_RATE);
        assert_eq!(conversion.brl, dec!(5.50));
        assert_eq!(conversion.source, FALLBACK_SOURCE);
    }
}
