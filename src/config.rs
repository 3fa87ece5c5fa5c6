//! Declarative race configuration.
//!
//! Every knob in one serde struct: loadable from a TOML file, overridable
//! from `MODEL_RACE_*` environment variables, and validated before a race
//! is allowed to run. Each field has a documented default so a minimal
//! config is just the model list and the judge.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reward::RewardWeights;

// ── Default value functions ─────────────────────────────────────────────

fn default_alpha() -> f64 {
    1.5
}

fn default_ridge() -> f64 {
    1e-2
}

fn default_state_path() -> Option<String> {
    Some(".router_state.json".to_string())
}

fn default_state_remote_key() -> String {
    "router_state".to_string()
}

fn default_length_threshold() -> usize {
    2000
}

fn default_word_threshold() -> usize {
    400
}

fn default_quality_weight() -> f64 {
    0.8
}

fn default_latency_weight() -> f64 {
    0.2
}

fn default_fallback_penalty() -> f64 {
    0.1
}

fn default_latency_bias_scale() -> f64 {
    0.05
}

fn default_reference_latency_s() -> f64 {
    6.0
}

fn default_min_preview_tokens() -> u64 {
    120
}

fn default_adaptive_min_scale() -> f64 {
    0.75
}

fn default_adaptive_max_scale() -> f64 {
    1.5
}

fn default_speculative_min_query_length() -> usize {
    2000
}

fn default_preview_cache_ttl_secs() -> u64 {
    600
}

fn default_preview_timeout_s() -> f64 {
    30.0
}

fn default_full_timeout_s() -> f64 {
    120.0
}

fn default_judge_timeout_s() -> f64 {
    45.0
}

fn default_preview_retry_limit() -> usize {
    2
}

fn default_judge_retry_limit() -> usize {
    3
}

fn default_max_parallel_previews() -> usize {
    8
}

fn default_decay_factor() -> f64 {
    0.98
}

fn default_cache_max_entries() -> usize {
    1024
}

// ── Strategy ────────────────────────────────────────────────────────────

/// Candidate-ordering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Fixed operator-supplied order; no learning.
    #[default]
    Baseline,
    /// LinUCB contextual bandit ordering with persisted state.
    Bandit,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(Self::Baseline),
            "bandit" => Ok(Self::Bandit),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

// ── Config ──────────────────────────────────────────────────────────────

/// Root configuration for the race orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RaceConfig {
    /// Ordered list of model ids to race.
    #[serde(default)]
    pub candidate_models: Vec<String>,

    /// Model id used by the judge.
    #[serde(default)]
    pub judge_model: String,

    /// `baseline` or `bandit`.
    #[serde(default)]
    pub strategy: Strategy,

    /// LinUCB exploration coefficient α.
    #[serde(default = "default_alpha")]
    pub bandit_alpha: f64,

    /// LinUCB ridge regularization λ.
    #[serde(default = "default_ridge")]
    pub bandit_ridge: f64,

    /// Local path for the persisted router state; `None` disables local
    /// persistence.
    #[serde(default = "default_state_path")]
    pub bandit_state: Option<String>,

    /// Remote key name for router state (suffixed with the dimension).
    #[serde(default = "default_state_remote_key")]
    pub state_remote_key: String,

    /// Redis URL for the remote cache/state backends. `None` keeps both
    /// process-local.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Character threshold for length normalization.
    #[serde(default = "default_length_threshold")]
    pub length_threshold: usize,

    /// Word-count threshold for the word feature slot.
    #[serde(default = "default_word_threshold")]
    pub word_threshold: usize,

    /// Embedding slots appended to the context vector; 0 disables
    /// embeddings entirely.
    #[serde(default)]
    pub embedding_dim: usize,

    /// Reward weight for judge quality.
    #[serde(default = "default_quality_weight")]
    pub w_q: f64,

    /// Reward weight for latency.
    #[serde(default = "default_latency_weight")]
    pub w_l: f64,

    /// Reward weight for cost.
    #[serde(default)]
    pub w_c: f64,

    /// Reward deduction for a model that failed a full attempt.
    #[serde(default = "default_fallback_penalty")]
    pub fallback_penalty: f64,

    /// β in the selection ranking.
    #[serde(default = "default_latency_bias_scale")]
    pub latency_bias_scale: f64,

    /// p95 latency considered "fully slow" during selection, seconds.
    #[serde(default = "default_reference_latency_s")]
    pub reference_latency_s: f64,

    /// Base preview token cap before adaptive scaling.
    #[serde(default = "default_min_preview_tokens")]
    pub min_preview_tokens: u64,

    /// Lower bound of the adaptive preview-cap multiplier.
    #[serde(default = "default_adaptive_min_scale")]
    pub adaptive_min_scale: f64,

    /// Upper bound of the adaptive preview-cap multiplier.
    #[serde(default = "default_adaptive_max_scale")]
    pub adaptive_max_scale: f64,

    /// Queries at least this long (chars) run the full stage as
    /// speculative top-2.
    #[serde(default = "default_speculative_min_query_length")]
    pub speculative_min_query_length: usize,

    /// Preview cache TTL, seconds.
    #[serde(default = "default_preview_cache_ttl_secs")]
    pub preview_cache_ttl_secs: u64,

    /// Ceiling on full-stage tokens across all attempts; `None` is
    /// unlimited.
    #[serde(default)]
    pub max_total_full_tokens: Option<u64>,

    /// Ceiling on estimated full-stage cost in USD; `None` is unlimited.
    #[serde(default)]
    pub max_total_cost_usd: Option<f64>,

    /// Per-candidate preview timeout, seconds.
    #[serde(default = "default_preview_timeout_s")]
    pub preview_timeout_s: f64,

    /// Per-attempt full-answer timeout, seconds.
    #[serde(default = "default_full_timeout_s")]
    pub full_timeout_s: f64,

    /// Judge phase timeout, seconds.
    #[serde(default = "default_judge_timeout_s")]
    pub judge_timeout_s: f64,

    /// Whole-race timeout, seconds; `None` relies on the per-phase
    /// timeouts alone.
    #[serde(default)]
    pub race_timeout_s: Option<f64>,

    /// Failed-preview retries per candidate.
    #[serde(default = "default_preview_retry_limit")]
    pub preview_retry_limit: usize,

    /// Judge attempts before the race fails.
    #[serde(default = "default_judge_retry_limit")]
    pub judge_retry_limit: usize,

    /// Concurrent preview streams.
    #[serde(default = "default_max_parallel_previews")]
    pub max_parallel_previews: usize,

    /// Apply decay after every N races; 0 disables decay.
    #[serde(default)]
    pub decay_every_races: u64,

    /// Decay factor applied when the cadence fires.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,

    /// USD per token by model id; models absent here price at 1.0 so
    /// tokens act as the cost proxy.
    #[serde(default)]
    pub price_per_token: HashMap<String, f64>,

    /// In-memory preview cache capacity.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Default for RaceConfig {
    fn default() -> Self {
        // An empty TOML document exercises every serde default.
        toml::from_str("").unwrap_or_else(|_| unreachable!("defaults always parse"))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error for {file}: {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },

    #[error("config parse error for {file}: {source}")]
    Parse {
        file: String,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl RaceConfig {
    /// Load from a TOML file and validate.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            file: path.display().to_string(),
            source: e,
        })?;
        Self::load_from_str(&content, &path.display().to_string())
    }

    /// Load from a TOML string and validate.
    pub fn load_from_str(content: &str, source_name: &str) -> Result<Self, ConfigError> {
        let config: RaceConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            file: source_name.to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `MODEL_RACE_*` environment variables onto this config.
    /// Unset variables leave fields untouched; unparsable values are
    /// validation errors.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = std::env::var("MODEL_RACE_MODELS") {
            self.candidate_models = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(raw) = std::env::var("MODEL_RACE_JUDGE_MODEL") {
            self.judge_model = raw;
        }
        if let Ok(raw) = std::env::var("MODEL_RACE_STRATEGY") {
            self.strategy = raw.parse().map_err(ConfigError::Validation)?;
        }
        env_parse("MODEL_RACE_ALPHA", &mut self.bandit_alpha)?;
        env_parse("MODEL_RACE_RIDGE", &mut self.bandit_ridge)?;
        if let Ok(raw) = std::env::var("MODEL_RACE_STATE_PATH") {
            self.bandit_state = if raw.is_empty() { None } else { Some(raw) };
        }
        if let Ok(raw) = std::env::var("MODEL_RACE_REDIS_URL") {
            self.redis_url = if raw.is_empty() { None } else { Some(raw) };
        }
        env_parse("MODEL_RACE_LENGTH_THRESHOLD", &mut self.length_threshold)?;
        env_parse("MODEL_RACE_W_Q", &mut self.w_q)?;
        env_parse("MODEL_RACE_W_L", &mut self.w_l)?;
        env_parse("MODEL_RACE_W_C", &mut self.w_c)?;
        env_parse("MODEL_RACE_FALLBACK_PENALTY", &mut self.fallback_penalty)?;
        env_parse("MODEL_RACE_MIN_PREVIEW_TOKENS", &mut self.min_preview_tokens)?;
        env_parse(
            "MODEL_RACE_SPECULATIVE_MIN_QUERY_LENGTH",
            &mut self.speculative_min_query_length,
        )?;
        env_parse("MODEL_RACE_PREVIEW_CACHE_TTL", &mut self.preview_cache_ttl_secs)?;
        env_parse_opt("MODEL_RACE_MAX_TOTAL_FULL_TOKENS", &mut self.max_total_full_tokens)?;
        env_parse_opt("MODEL_RACE_MAX_TOTAL_COST_USD", &mut self.max_total_cost_usd)?;
        env_parse("MODEL_RACE_PREVIEW_TIMEOUT_S", &mut self.preview_timeout_s)?;
        env_parse("MODEL_RACE_FULL_TIMEOUT_S", &mut self.full_timeout_s)?;
        env_parse("MODEL_RACE_JUDGE_TIMEOUT_S", &mut self.judge_timeout_s)?;
        Ok(())
    }

    /// Check every semantic constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidate_models.is_empty() {
            return Err(ConfigError::Validation(
                "candidate_models must list at least one model".into(),
            ));
        }
        if self.judge_model.is_empty() {
            return Err(ConfigError::Validation("judge_model must be set".into()));
        }
        self.reward_weights()
            .validate()
            .map_err(ConfigError::Validation)?;
        if !(self.bandit_alpha.is_finite() && self.bandit_alpha >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "bandit_alpha={} must be finite and >= 0",
                self.bandit_alpha
            )));
        }
        if !(self.bandit_ridge.is_finite() && self.bandit_ridge > 0.0) {
            return Err(ConfigError::Validation(format!(
                "bandit_ridge={} must be finite and > 0",
                self.bandit_ridge
            )));
        }
        if self.length_threshold == 0 || self.word_threshold == 0 {
            return Err(ConfigError::Validation(
                "length_threshold and word_threshold must be positive".into(),
            ));
        }
        if self.adaptive_min_scale <= 0.0 || self.adaptive_max_scale < self.adaptive_min_scale {
            return Err(ConfigError::Validation(format!(
                "adaptive scales ({}, {}) must satisfy 0 < min <= max",
                self.adaptive_min_scale, self.adaptive_max_scale
            )));
        }
        if self.min_preview_tokens == 0 {
            return Err(ConfigError::Validation(
                "min_preview_tokens must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.decay_factor) || self.decay_factor == 0.0 {
            return Err(ConfigError::Validation(format!(
                "decay_factor={} must be in (0, 1]",
                self.decay_factor
            )));
        }
        let mut timeouts = vec![
            self.preview_timeout_s,
            self.full_timeout_s,
            self.judge_timeout_s,
        ];
        timeouts.extend(self.race_timeout_s);
        for t in timeouts {
            if !t.is_finite() || t <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "timeouts must be finite and positive, got {t}"
                )));
            }
        }
        Ok(())
    }

    /// Context dimension implied by this config.
    pub fn context_dim(&self) -> usize {
        3 + self.embedding_dim
    }

    pub fn reward_weights(&self) -> RewardWeights {
        RewardWeights {
            quality: self.w_q,
            latency: self.w_l,
            cost: self.w_c,
        }
    }

    pub fn preview_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.preview_timeout_s)
    }

    pub fn full_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.full_timeout_s)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.judge_timeout_s)
    }

    pub fn race_timeout(&self) -> Option<Duration> {
        self.race_timeout_s.map(Duration::from_secs_f64)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *slot = raw
            .parse()
            .map_err(|e| ConfigError::Validation(format!("{key}={raw}: {e}")))?;
    }
    Ok(())
}

fn env_parse_opt<T: std::str::FromStr>(key: &str, slot: &mut Option<T>) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        if raw.is_empty() {
            *slot = None;
        } else {
            *slot = Some(
                raw.parse()
                    .map_err(|e| ConfigError::Validation(format!("{key}={raw}: {e}")))?,
            );
        }
    }
    Ok(())
}

/// Export the JSON Schema for [`RaceConfig`], for IDE completion when
/// editing TOML files.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RaceConfig);
    serde_json::to_string_pretty(&schema)
}
