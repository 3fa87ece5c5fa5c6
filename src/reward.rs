//! Reward composition for the bandit router.
//!
//! Blends judge quality, observed latency, and token cost into a single
//! scalar in `[0, 1]` per model, with a penalty for models that were
//! attempted in the full stage and failed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::latency;
use crate::ModelId;

/// Default penalty subtracted from a model that failed a full attempt.
pub const DEFAULT_FALLBACK_PENALTY: f64 = 0.1;

/// Blend weights. Each weight lies in `[0, 1]` and their sum must not
/// exceed 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    pub quality: f64,
    pub latency: f64,
    pub cost: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            quality: 0.8,
            latency: 0.2,
            cost: 0.0,
        }
    }
}

impl RewardWeights {
    /// Validate bounds: each weight in `[0, 1]`, sum ≤ 1.
    pub fn validate(&self) -> Result<(), String> {
        for (name, w) in [
            ("quality", self.quality),
            ("latency", self.latency),
            ("cost", self.cost),
        ] {
            if !(0.0..=1.0).contains(&w) || !w.is_finite() {
                return Err(format!("reward weight {name}={w} outside [0, 1]"));
            }
        }
        let sum = self.quality + self.latency + self.cost;
        if sum > 1.0 + 1e-9 {
            return Err(format!("reward weights sum to {sum}, must be <= 1"));
        }
        Ok(())
    }
}

/// Everything the policy needs to score one model's round.
#[derive(Debug, Clone)]
pub struct RewardInputs {
    pub model: ModelId,
    /// Judge `overall` for this model's preview; `None` when unjudged.
    pub judge_overall: Option<f64>,
    /// Observed preview latency in seconds.
    pub latency_seconds: f64,
    /// Whether the preview came from cache (latency 0 is then artificial).
    pub cache_hit: bool,
    /// The model's recent p95 preview latency, used in place of the
    /// artificial 0 for cache hits.
    pub p95_latency_seconds: f64,
    /// Tokens consumed by this model this race (preview + full attempt).
    pub tokens_consumed: u64,
    /// True when the model was attempted in the full stage and failed.
    pub was_fallback: bool,
    /// Query length in characters, for reference scaling.
    pub query_len: usize,
}

/// Composes a scalar reward in `[0, 1]` from one model's round.
pub trait RewardPolicy: Send + Sync {
    fn compose(&self, inputs: &RewardInputs) -> f64;
}

/// Default policy: `w_q·quality + w_l·(1−lat_norm) + w_c·(1−cost_norm)`,
/// minus the fallback penalty, clipped to `[0, 1]`.
///
/// The latency reference widens with query length (longer queries tolerate
/// slower backends). Cost is tokens times the per-token price when a price
/// is configured, otherwise tokens themselves act as the proxy.
#[derive(Debug, Clone)]
pub struct QualityLatencyCostPolicy {
    weights: RewardWeights,
    fallback_penalty: f64,
    length_threshold: usize,
    /// USD per token by model; models absent from the table price at 1.0
    /// so raw tokens become the cost proxy.
    price_per_token: HashMap<ModelId, f64>,
    /// Token budget a "reasonable" answer is expected to use for a short
    /// query; the reference doubles by `length_threshold`.
    reference_tokens: u64,
}

impl QualityLatencyCostPolicy {
    pub fn new(weights: RewardWeights, fallback_penalty: f64, length_threshold: usize) -> Self {
        Self {
            weights,
            fallback_penalty: fallback_penalty.max(0.0),
            length_threshold: length_threshold.max(1),
            price_per_token: HashMap::new(),
            reference_tokens: 512,
        }
    }

    pub fn with_price_table(mut self, table: HashMap<ModelId, f64>) -> Self {
        self.price_per_token = table;
        self
    }

    pub fn with_reference_tokens(mut self, tokens: u64) -> Self {
        self.reference_tokens = tokens.max(1);
        self
    }

    fn price(&self, model: &ModelId) -> f64 {
        self.price_per_token.get(model).copied().unwrap_or(1.0)
    }

    fn cost_norm(&self, inputs: &RewardInputs) -> f64 {
        // Reference cost is query-scaled but model-independent: with the
        // default price of 1.0 per token it is simply a token budget.
        let norm_len =
            (inputs.query_len as f64 / self.length_threshold as f64).clamp(0.0, 1.0);
        let reference_cost = self.reference_tokens as f64 * (1.0 + norm_len);
        let cost = self.price(&inputs.model) * inputs.tokens_consumed as f64;
        (cost / reference_cost.max(1e-9)).clamp(0.0, 1.0)
    }

    fn lat_norm(&self, inputs: &RewardInputs) -> f64 {
        // A cache hit reports zero latency, which would reward the arm for
        // speed it did not demonstrate; substitute its recent p95.
        let observed = if inputs.cache_hit {
            inputs.p95_latency_seconds
        } else {
            inputs.latency_seconds
        };
        if !observed.is_finite() || observed <= 0.0 {
            return 0.0;
        }
        let reference = latency::reference_latency(inputs.query_len, self.length_threshold);
        (observed / reference).clamp(0.0, 1.0)
    }
}

impl RewardPolicy for QualityLatencyCostPolicy {
    fn compose(&self, inputs: &RewardInputs) -> f64 {
        let quality = inputs.judge_overall.unwrap_or(0.0).clamp(0.0, 1.0);
        let latency_term = 1.0 - self.lat_norm(inputs);
        let cost_term = 1.0 - self.cost_norm(inputs);

        let mut reward = self.weights.quality * quality
            + self.weights.latency * latency_term
            + self.weights.cost * cost_term;
        if inputs.was_fallback {
            reward -= self.fallback_penalty;
        }
        reward.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> RewardInputs {
        RewardInputs {
            model: ModelId::new("m"),
            judge_overall: Some(0.8),
            latency_seconds: 1.0,
            cache_hit: false,
            p95_latency_seconds: 2.0,
            tokens_consumed: 100,
            was_fallback: false,
            query_len: 500,
        }
    }

    fn policy() -> QualityLatencyCostPolicy {
        QualityLatencyCostPolicy::new(RewardWeights::default(), 0.1, 2000)
    }

    #[test]
    fn test_weights_default_sum_below_one() {
        assert!(RewardWeights::default().validate().is_ok());
    }

    #[test]
    fn test_weights_reject_out_of_range() {
        let w = RewardWeights {
            quality: 1.2,
            latency: 0.0,
            cost: 0.0,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_weights_reject_excess_sum() {
        let w = RewardWeights {
            quality: 0.6,
            latency: 0.4,
            cost: 0.3,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_reward_in_unit_interval() {
        let p = policy();
        let r = p.compose(&inputs());
        assert!((0.0..=1.0).contains(&r), "reward {r} outside [0, 1]");
    }

    #[test]
    fn test_reward_increases_with_quality() {
        let p = policy();
        let mut lo = inputs();
        lo.judge_overall = Some(0.2);
        let mut hi = inputs();
        hi.judge_overall = Some(0.9);
        assert!(p.compose(&hi) > p.compose(&lo));
    }

    #[test]
    fn test_reward_decreases_with_latency() {
        let p = policy();
        let mut fast = inputs();
        fast.latency_seconds = 0.5;
        let mut slow = inputs();
        slow.latency_seconds = 3.0;
        assert!(p.compose(&fast) > p.compose(&slow));
    }

    #[test]
    fn test_reward_decreases_with_tokens_when_cost_weighted() {
        let p = QualityLatencyCostPolicy::new(
            RewardWeights {
                quality: 0.5,
                latency: 0.2,
                cost: 0.3,
            },
            0.1,
            2000,
        );
        let mut cheap = inputs();
        cheap.tokens_consumed = 50;
        let mut expensive = inputs();
        expensive.tokens_consumed = 600;
        assert!(p.compose(&cheap) > p.compose(&expensive));
    }

    #[test]
    fn test_fallback_penalty_applied() {
        let p = policy();
        let clean = inputs();
        let mut penalised = inputs();
        penalised.was_fallback = true;
        let delta = p.compose(&clean) - p.compose(&penalised);
        assert!((delta - 0.1).abs() < 1e-9, "penalty delta was {delta}");
    }

    #[test]
    fn test_cache_hit_uses_p95_not_zero_latency() {
        let p = policy();
        let mut hit = inputs();
        hit.cache_hit = true;
        hit.latency_seconds = 0.0;
        hit.p95_latency_seconds = 3.0;
        let mut genuinely_fast = inputs();
        genuinely_fast.latency_seconds = 0.1;
        // The cache hit must not look faster than a genuinely fast model.
        assert!(p.compose(&genuinely_fast) > p.compose(&hit));
    }

    #[test]
    fn test_unjudged_model_gets_zero_quality() {
        let p = policy();
        let mut unjudged = inputs();
        unjudged.judge_overall = None;
        let judged = inputs();
        assert!(p.compose(&judged) > p.compose(&unjudged));
    }

    #[test]
    fn test_price_table_changes_cost_term() {
        let mut table = HashMap::new();
        table.insert(ModelId::new("m"), 0.0001);
        let cheap_priced = QualityLatencyCostPolicy::new(
            RewardWeights {
                quality: 0.5,
                latency: 0.2,
                cost: 0.3,
            },
            0.1,
            2000,
        )
        .with_price_table(table);
        let default_priced = QualityLatencyCostPolicy::new(
            RewardWeights {
                quality: 0.5,
                latency: 0.2,
                cost: 0.3,
            },
            0.1,
            2000,
        );
        let mut i = inputs();
        i.tokens_consumed = 600;
        // A near-zero per-token price makes the same usage much cheaper
        // against the shared reference budget.
        assert!(cheap_priced.compose(&i) > default_priced.compose(&i));
    }
}
