//! Token pricing for budget accounting.

use crate::{ToolResponse, ToolUsage};
use vigil_core::{ModelPrice, PricingConfig, Usd};

const TOKENS_PER_MILLION: u128 = 1_000_000;

/// Computes the cost of a call from its usage.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    config: PricingConfig,
}

impl PricingTable {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.config
            .models
            .get(model)
            .copied()
            .unwrap_or(self.config.default)
    }

    /// Cost of `usage` on `model`, rounded up to the next micro-dollar so
    /// accounting never under-charges.
    pub fn cost(&self, model: &str, usage: &ToolUsage) -> Usd {
        let price = self.price_for(model);
        let input = scaled(usage.input_tokens, price.input_per_million);
        let output = scaled(usage.output_tokens, price.output_per_million);
        input + output
    }

    /// The tool-reported cost when present, otherwise the priced usage.
    pub fn cost_of(&self, model: &str, response: &ToolResponse) -> Usd {
        response
            .cost
            .unwrap_or_else(|| self.cost(model, &response.usage))
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(PricingConfig::default())
    }
}

fn scaled(tokens: u64, per_million: Usd) -> Usd {
    let micros = per_million.micros().max(0) as u128;
    let total = (tokens as u128 * micros).div_ceil(TOKENS_PER_MILLION);
    Usd::from_micros(total.min(i64::MAX as u128) as i64)
}
