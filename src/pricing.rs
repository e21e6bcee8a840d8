//! Request cost computation.
//!
//! Prices come from `pricing.json` as USD per 1,000 tokens, keyed by model
//! glob patterns. Lookup is exact-first, then first wildcard match in file
//! order. Unknown models cost zero (with a warning) rather than failing the
//! request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::usage::TokenUsage;
use crate::wildcard;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// USD per 1,000 tokens for one model pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
    pub cache_creation: f64,
    pub cache_read: f64,
}

/// Cost of a single request, broken down per token category.
///
/// Each component is rounded to 6 decimals; the total is the rounded sum of
/// the components, so `total_cost == round6(input + output + creation + read)`
/// holds exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
}

/// Round to 6 decimal places (micro-dollar precision).
pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Pricer
// ---------------------------------------------------------------------------

/// Maps `(model, token counts)` to USD cost components.
#[derive(Clone)]
pub struct Pricer {
    config: Arc<Config>,
}

impl Pricer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Find the pricing entry for a model: exact pattern first, then the
    /// first matching wildcard in file order.
    pub fn price_for(&self, model: &str) -> Option<&ModelPrice> {
        if let Some((_, price)) = self
            .config
            .pricing
            .iter()
            .find(|(pattern, _)| !pattern.contains('*') && pattern.eq_ignore_ascii_case(model))
        {
            return Some(price);
        }
        self.config
            .pricing
            .iter()
            .find(|(pattern, _)| wildcard::matches(pattern, model))
            .map(|(_, price)| price)
    }

    /// Price a request. Unknown models cost zero.
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> CostBreakdown {
        let Some(price) = self.price_for(model) else {
            warn!(model = %model, "No pricing entry matches model; recording zero cost");
            return CostBreakdown::default();
        };

        let input_cost = round6(usage.input_tokens as f64 / 1000.0 * price.input);
        let output_cost = round6(usage.output_tokens as f64 / 1000.0 * price.output);
        let cache_creation_cost =
            round6(usage.cache_creation_input_tokens as f64 / 1000.0 * price.cache_creation);
        let cache_read_cost =
            round6(usage.cache_read_input_tokens as f64 / 1000.0 * price.cache_read);
        let total_cost = round6(input_cost + output_cost + cache_creation_cost + cache_read_cost);

        debug!(
            model = %model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_cost,
            "Priced request"
        );

        CostBreakdown {
            input_cost,
            output_cost,
            cache_creation_cost,
            cache_read_cost,
            total_cost,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            pricing: vec![
                (
                    "claude-3-5-haiku-20241022".to_string(),
                    ModelPrice {
                        input: 0.0008,
                        output: 0.004,
                        cache_creation: 0.001,
                        cache_read: 0.00008,
                    },
                ),
                (
                    "*sonnet*".to_string(),
                    ModelPrice {
                        input: 0.003,
                        output: 0.015,
                        cache_creation: 0.00375,
                        cache_read: 0.0003,
                    },
                ),
            ],
            ..Config::default()
        })
    }

    #[test]
    fn test_exact_match_cost() {
        let pricer = Pricer::new(test_config());
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            ..TokenUsage::default()
        };

        let cost = pricer.cost("claude-3-5-haiku-20241022", &usage);
        // 100/1000 * 0.0008 = 0.00008; 50/1000 * 0.004 = 0.0002
        assert_eq!(cost.input_cost, 0.00008);
        assert_eq!(cost.output_cost, 0.0002);
        assert_eq!(cost.total_cost, 0.00028);
    }

    #[test]
    fn test_wildcard_match_cost() {
        let pricer = Pricer::new(test_config());
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 1000,
            ..TokenUsage::default()
        };

        let cost = pricer.cost("claude-sonnet-4-20250514", &usage);
        assert_eq!(cost.input_cost, 0.003);
        assert_eq!(cost.output_cost, 0.015);
        assert_eq!(cost.total_cost, 0.018);
    }

    #[test]
    fn test_cache_token_costs() {
        let pricer = Pricer::new(test_config());
        let usage = TokenUsage {
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_input_tokens: 2000,
            cache_read_input_tokens: 10_000,
        };

        let cost = pricer.cost("claude-3-5-haiku-20241022", &usage);
        assert_eq!(cost.cache_creation_cost, 0.002);
        assert_eq!(cost.cache_read_cost, 0.0008);
        assert_eq!(cost.total_cost, 0.0028);
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        let pricer = Pricer::new(test_config());
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            ..TokenUsage::default()
        };

        assert_eq!(pricer.cost("gpt-4o", &usage), CostBreakdown::default());
    }

    #[test]
    fn test_exact_beats_earlier_wildcard() {
        let config = Arc::new(Config {
            pricing: vec![
                ("*".to_string(), ModelPrice {
                    input: 1.0,
                    output: 1.0,
                    cache_creation: 1.0,
                    cache_read: 1.0,
                }),
                ("claude-sonnet-4".to_string(), ModelPrice {
                    input: 0.003,
                    ..ModelPrice::default()
                }),
            ],
            ..Config::default()
        });
        let pricer = Pricer::new(config);

        let price = pricer.price_for("claude-sonnet-4").unwrap();
        assert_eq!(price.input, 0.003);
    }

    #[test]
    fn test_rounding_to_six_decimals() {
        let config = Arc::new(Config {
            pricing: vec![(
                "*".to_string(),
                ModelPrice {
                    input: 0.0000123,
                    output: 0.0000123,
                    ..ModelPrice::default()
                },
            )],
            ..Config::default()
        });
        let pricer = Pricer::new(config);
        let usage = TokenUsage {
            input_tokens: 333,
            output_tokens: 777,
            ..TokenUsage::default()
        };

        let cost = pricer.cost("anything", &usage);
        // Raw: 333/1000*0.0000123 = 0.0000040959 -> 0.000004
        assert_eq!(cost.input_cost, 0.000004);
        // Raw: 777/1000*0.0000123 = 0.0000095571 -> 0.00001
        assert_eq!(cost.output_cost, 0.00001);
        assert_eq!(cost.total_cost, round6(cost.input_cost + cost.output_cost));
    }

    #[test]
    fn test_round6() {
        assert_eq!(round6(0.1234564), 0.123456);
        assert_eq!(round6(0.1234565), 0.123457);
        assert_eq!(round6(0.0), 0.0);
        assert_eq!(round6(1.0), 1.0);
    }
}

// ---------------------------------------------------------------------------
// Property tests
// ---------------------------------------------------------------------------
