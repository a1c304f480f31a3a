//! LLM integration.
//!
//! Gemini is reached through its REST `generateContent` endpoint in JSON
//! mode. Token usage from every call feeds the cost calculator, which prices
//! it in USD and converts to BRL at the cached exchange rate.

pub mod costs;
pub mod gemini;
pub mod provider;

pub use costs::{CostBreakdown, CostCalculator, PricingTable};
pub use gemini::GeminiProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::GeminiConfig;
use crate::error::LlmError;

/// Create the configured LLM provider.
pub fn create_provider(config: &GeminiConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = GeminiProvider::new(config)?;
    tracing::info!("Using Gemini (model: {})", config.model);
    Ok(Arc::new(provider))
}
