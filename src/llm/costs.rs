//! Per-model token pricing and USD/BRL cost calculation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::provider::TokenUsage;
use crate::currency::ExchangeRateCache;

/// Model used when a caller does not name one.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const COST_DECIMALS: u32 = 6;

/// USD prices per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
    /// Falls back to the output price when absent.
    #[serde(default)]
    pub thinking_per_million: Option<Decimal>,
}

impl ModelPricing {
    const DEFAULT: ModelPricing = ModelPricing {
        input_per_million: dec!(0.30),
        output_per_million: dec!(2.50),
        thinking_per_million: Some(dec!(2.50)),
    };

    fn resolved(mut self) -> Self {
        if self.thinking_per_million.is_none() {
            self.thinking_per_million = Some(self.output_per_million);
        }
        self
    }

    pub fn thinking(&self) -> Decimal {
        self.thinking_per_million.unwrap_or(self.output_per_million)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub costs_usd: ModelPricing,
}

/// Pricing table as stored in `llm_pricing.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    pub models: HashMap<String, ModelEntry>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            DEFAULT_MODEL.to_string(),
            ModelEntry {
                provider: Some("Google".to_string()),
                name: Some("Gemini 2.5 Flash".to_string()),
                costs_usd: ModelPricing::DEFAULT,
            },
        );
        Self { models }
    }
}

impl PricingTable {
    /// Load from a JSON file, falling back to the built-in table.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Pricing config not readable, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str::<PricingTable>(&raw) {
            Ok(table) => {
                info!(path = %path.display(), models = table.models.len(), "Pricing config loaded");
                table
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Pricing config invalid, using defaults");
                Self::default()
            }
        }
    }

    /// Prices for `model`, resolving known aliases. Unknown models get the default.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        let key = normalize_model_name(model);
        match self.models.get(&key) {
            Some(entry) => entry.costs_usd.resolved(),
            None => {
                warn!(model, "Model not in pricing config, using default prices");
                ModelPricing::DEFAULT
            }
        }
    }
}

/// Lowercase, `_`→`-`, and fold known variants onto their canonical name.
pub fn normalize_model_name(model: &str) -> String {
    let key = model.trim().to_lowercase().replace('_', "-");
    match key.as_str() {
        "gemini-2-5-flash" | "gemini-2.5-flash-001" | "gemini-2.5-flash-002" | "gemini-2.0-flash" => {
            DEFAULT_MODEL.to_string()
        }
        _ => key,
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub thinking: u64,
    pub total: u64,
}

impl From<TokenUsage> for TokenCounts {
    fn from(u: TokenUsage) -> Self {
        Self {
            input: u.input_tokens,
            output: u.output_tokens,
            thinking: u.thinking_tokens,
            total: u.total_tokens,
        }
    }
}

/// Costs for one call or an aggregate, in USD and BRL.
#[derive(Debug, Clone, Serialize)]
pub struct CostBreakdown {
    pub cost_input_usd: Decimal,
    pub cost_output_usd: Decimal,
    pub cost_thinking_usd: Decimal,
    pub cost_total_usd: Decimal,
    pub cost_input_brl: Decimal,
    pub cost_output_brl: Decimal,
    pub cost_thinking_brl: Decimal,
    pub cost_total_brl: Decimal,
    pub exchange_rate: Decimal,
    pub model: String,
    pub tokens: TokenCounts,
    pub pricing_usd_per_million: ModelPricing,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AverageTokens {
    pub input: Decimal,
    pub output: Decimal,
    pub thinking: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct AverageCost {
    pub usd: Decimal,
    pub brl: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchCost {
    #[serde(flatten)]
    pub costs: CostBreakdown,
    pub batch_size: usize,
    pub avg_tokens_per_request: AverageTokens,
    pub avg_cost_per_request: AverageCost,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    #[serde(flatten)]
    pub costs: CostBreakdown,
    pub is_estimate: bool,
    pub note: &'static str,
}

/// Computes call costs from a pricing table and the live exchange rate.
pub struct CostCalculator {
    pricing: PricingTable,
    rates: Arc<ExchangeRateCache>,
}

impl CostCalculator {
    pub fn new(pricing: PricingTable, rates: Arc<ExchangeRateCache>) -> Self {
        Self { pricing, rates }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Full breakdown for one usage record.
    pub async fn calculate(&self, usage: &TokenUsage, model: &str) -> CostBreakdown {
        let rate = self.rates.get_rate(false).await;
        compute(usage, model, self.pricing.pricing_for(model), rate)
    }

    /// Aggregate costs for several usage records plus per-request averages.
    pub async fn calculate_batch(&self, usages: &[TokenUsage], model: &str) -> BatchCost {
        let input: u64 = usages.iter().map(|u| u.input_tokens).sum();
        let output: u64 = usages.iter().map(|u| u.output_tokens).sum();
        let thinking: u64 = usages.iter().map(|u| u.thinking_tokens).sum();
        let aggregated = TokenUsage::new(input, output, thinking, None);

        let costs = self.calculate(&aggregated, model).await;
        let n = Decimal::from(usages.len());
        let avg = |value: Decimal| {
            if usages.is_empty() {
                Decimal::ZERO
            } else {
                (value / n).round_dp(COST_DECIMALS)
            }
        };

        BatchCost {
            batch_size: usages.len(),
            avg_tokens_per_request: AverageTokens {
                input: avg(Decimal::from(input)),
                output: avg(Decimal::from(output)),
                thinking: avg(Decimal::from(thinking)),
            },
            avg_cost_per_request: AverageCost {
                usd: avg(costs.cost_total_usd),
                brl: avg(costs.cost_total_brl),
            },
            costs,
        }
    }

    /// Cost estimate for a future call. Thinking tokens are not estimated.
    pub async fn estimate(&self, input_tokens: u64, output_tokens: u64, model: &str) -> CostEstimate {
        let usage = TokenUsage::new(input_tokens, output_tokens, 0, None);
        CostEstimate {
            costs: self.calculate(&usage, model).await,
            is_estimate: true,
            note: "Thinking tokens not included in estimate",
        }
    }
}

fn per_million(tokens: u64, price: Decimal) -> Decimal {
    Decimal::from(tokens) / dec!(1000000) * price
}

fn compute(usage: &TokenUsage, model: &str, pricing: ModelPricing, rate: Decimal) -> CostBreakdown {
    let input_usd = per_million(usage.input_tokens, pricing.input_per_million);
    let output_usd = per_million(usage.output_tokens, pricing.output_per_million);
    let thinking_usd = per_million(usage.thinking_tokens, pricing.thinking());
    let total_usd = input_usd + output_usd + thinking_usd;
    let round = |d: Decimal| d.round_dp(COST_DECIMALS);

    CostBreakdown {
        cost_input_usd: round(input_usd),
        cost_output_usd: round(output_usd),
        cost_thinking_usd: round(thinking_usd),
        cost_total_usd: round(total_usd),
        cost_input_brl: round(input_usd * rate),
        cost_output_brl: round(output_usd * rate),
        cost_thinking_brl: round(thinking_usd * rate),
        cost_total_brl: round(total_usd * rate),
        exchange_rate: rate,
        model: model.to_string(),
        tokens: (*usage).into(),
        pricing_usd_per_million: pricing,
        calculated_at: Utc::now(),
    }
}
