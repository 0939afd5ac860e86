//! Cost estimation for LLM calls.
//!
//! We can't see the provider's tokenizer before a call is made, so token counts are
//! estimated from character counts and priced against a per-model table.
//!
//! # Token heuristic
//!
//! `ceil(chars / 4)`, with a minimum of one token for non-empty text and zero for
//! empty text. This is an approximation for English prose, **not** a
//! tokenizer-accurate count. Reconcile against provider usage where available
//! (see [`CostEstimator::actual_cost`]).
//!
//! # Example
//!
//! ```rust
//! use llmpanel::cost::CostEstimator;
//!
//! let estimator = CostEstimator::new();
//! let estimate = estimator.estimate("gpt-4o", "Scale our API", 1_000).unwrap();
//! assert_eq!(estimate.input_tokens, 4);
//! assert_eq!(estimate.currency, "USD");
//! ```

use crate::client_wrapper::TokenUsage;
use crate::models::normalize_model;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Characters per estimated token.
const CHARS_PER_TOKEN: usize = 4;

/// Price table denominator: prices are quoted per one million tokens.
const TOKENS_PER_PRICE_UNIT: f64 = 1_000_000.0;

/// How a model is billed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Pricing {
    /// Input and output priced independently, in dollars per 1M tokens.
    PerToken {
        input_per_million: f64,
        output_per_million: f64,
    },
    /// A fixed price per call regardless of tokens (image generation models).
    PerCall { price: f64 },
}

impl Pricing {
    pub fn per_token(input_per_million: f64, output_per_million: f64) -> Self {
        Pricing::PerToken {
            input_per_million,
            output_per_million,
        }
    }

    /// Dollar cost of a call with the given token counts.
    pub fn cost(&self, input_tokens: usize, output_tokens: usize) -> f64 {
        match *self {
            Pricing::PerToken {
                input_per_million,
                output_per_million,
            } => {
                (input_tokens as f64 / TOKENS_PER_PRICE_UNIT) * input_per_million
                    + (output_tokens as f64 / TOKENS_PER_PRICE_UNIT) * output_per_million
            }
            Pricing::PerCall { price } => price,
        }
    }
}

/// The normalized model has no entry in the price table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown model '{model}' (normalized: '{normalized}')")]
pub struct UnknownModelError {
    /// Model name as supplied by the caller.
    pub model: String,
    /// Key that was looked up.
    pub normalized: String,
}

/// Projected token counts and dollar cost of a single call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
    pub currency: String,
}

/// Estimate the number of tokens in `text` (see the module docs for the heuristic).
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        chars.div_ceil(CHARS_PER_TOKEN).max(1)
    }
}

/// Default price table, dollars per 1M tokens unless noted.
fn default_price_table() -> HashMap<String, Pricing> {
    let entries: &[(&str, Pricing)] = &[
        ("gpt-4o", Pricing::per_token(2.50, 10.00)),
        ("gpt-4o-mini", Pricing::per_token(0.15, 0.60)),
        ("gpt-4.1", Pricing::per_token(2.00, 8.00)),
        ("gpt-4.1-mini", Pricing::per_token(0.40, 1.60)),
        ("gpt-4.1-nano", Pricing::per_token(0.10, 0.40)),
        ("o1", Pricing::per_token(15.00, 60.00)),
        ("o3-mini", Pricing::per_token(1.10, 4.40)),
        ("claude-opus-4", Pricing::per_token(15.00, 75.00)),
        ("claude-sonnet-4", Pricing::per_token(3.00, 15.00)),
        ("claude-3-5-sonnet", Pricing::per_token(3.00, 15.00)),
        ("claude-3-5-haiku", Pricing::per_token(0.80, 4.00)),
        ("gemini-1.5-pro", Pricing::per_token(1.25, 5.00)),
        ("gemini-1.5-flash", Pricing::per_token(0.075, 0.30)),
        ("gemini-2.0-flash", Pricing::per_token(0.10, 0.40)),
        ("grok-2", Pricing::per_token(2.00, 10.00)),
        // Flat per-image prices.
        ("dall-e-3", Pricing::PerCall { price: 0.040 }),
        ("dall-e-2", Pricing::PerCall { price: 0.020 }),
        ("gpt-image-1", Pricing::PerCall { price: 0.042 }),
    ];
    entries
        .iter()
        .map(|(model, pricing)| (model.to_string(), *pricing))
        .collect()
}

/// Prices calls against a per-model table. Pure and deterministic.
#[derive(Clone, Debug)]
pub struct CostEstimator {
    prices: HashMap<String, Pricing>,
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self {
            prices: default_price_table(),
        }
    }
}

impl CostEstimator {
    /// Create an estimator with the built-in price table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an estimator with no prices at all.
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    /// Add or replace the price for a model (builder pattern).
    pub fn with_price(mut self, model: &str, pricing: Pricing) -> Self {
        self.prices.insert(normalize_model(model), pricing);
        self
    }

    /// Look up the pricing for `model` after normalization.
    pub fn price_for(&self, model: &str) -> Option<Pricing> {
        self.prices.get(&normalize_model(model)).copied()
    }

    /// Estimate token counts and cost for a call.
    ///
    /// Fails with [`UnknownModelError`] when the model is not priced; the caller
    /// decides whether that means zero cost or an aborted call.
    pub fn estimate(
        &self,
        model: &str,
        input_text: &str,
        estimated_output_tokens: usize,
    ) -> Result<CostEstimate, UnknownModelError> {
        let pricing = self.lookup(model)?;
        let input_tokens = estimate_tokens(input_text);
        Ok(CostEstimate {
            input_tokens,
            output_tokens: estimated_output_tokens,
            cost: pricing.cost(input_tokens, estimated_output_tokens),
            currency: "USD".to_string(),
        })
    }

    /// Price provider-reported usage, used to backfill `actual_cost` on the ledger.
    pub fn actual_cost(&self, model: &str, usage: &TokenUsage) -> Result<f64, UnknownModelError> {
        let pricing = self.lookup(model)?;
        Ok(pricing.cost(usage.input_tokens, usage.output_tokens))
    }

    fn lookup(&self, model: &str) -> Result<Pricing, UnknownModelError> {
        let normalized = normalize_model(model);
        self.prices
            .get(&normalized)
            .copied()
            .ok_or_else(|| UnknownModelError {
                model: model.to_string(),
                normalized,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_heuristic() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("Scale our API"), 4);
    }

    #[test]
    fn test_per_token_pricing() {
        let pricing = Pricing::per_token(3.0, 15.0);
        let cost = pricing.cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_pricing_ignores_tokens() {
        let estimator = CostEstimator::new();
        let small = estimator.estimate("dall-e-3", "a cat", 0).unwrap();
        let large = estimator.estimate("DALL-E 3", &"x".repeat(10_000), 4_000).unwrap();
        assert_eq!(small.cost, 0.040);
        assert_eq!(large.cost, 0.040);
    }

    #[test]
    fn test_unknown_model_is_an_error() {
        let estimator = CostEstimator::new();
        let err = estimator.estimate("Mystery Model", "hello", 10).unwrap_err();
        assert_eq!(err.normalized, "mystery-model");
    }

    #[test]
    fn test_custom_price_is_normalized() {
        let estimator = CostEstimator::empty().with_price("My_Model", Pricing::per_token(1.0, 2.0));
        assert!(estimator.price_for("my model").is_some());
    }
}
