//! # tokio-model-race
//!
//! Race a pool of LLM backends against one another for a single query,
//! pick a winner via a judge, and stream a final answer — while a
//! contextual bandit learns which backends to favour from observed
//! quality, latency, and cost.
//!
//! ## Architecture
//!
//! ```text
//! Query → Features → Router.select → ‖ previews ‖ → Judge.rank → full answer
//!            ▲                          (cache, latency p95)          │
//!            └────────── Router.bulk_update ◀── RewardPolicy ◀────────┘
//! ```
//!
//! The orchestrator ([`race::RaceOrchestrator`]) fans previews out in
//! parallel, gates the full-answer stage on a judge ranking, and executes
//! the winner either as an ordered fallback cascade or speculatively
//! (top-2 concurrent, loser cancelled).

use thiserror::Error;

pub mod cache;
pub mod client;
pub mod config;
pub mod features;
pub mod judge;
pub mod latency;
pub mod metrics;
pub mod race;
pub mod retry;
pub mod reward;
pub mod routing;

// Re-exports
pub use client::{ClientError, ModelClient, ScriptedClient};
pub use config::RaceConfig;
pub use judge::{Judge, JudgeVerdict};
pub use race::{RaceOrchestrator, RaceResult, RaceSummary};
pub use routing::{BaselineRouter, LinUcbRouter, Router};

/// Opaque, stable identifier for one configured LLM backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Immutable user request.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    /// Optional user identifier for affinity / telemetry.
    pub user_id: Option<String>,
    /// Optional routing hints supplied by the caller.
    pub hints: QueryHints,
}

/// Caller-supplied hints; the router may ignore them.
#[derive(Debug, Clone, Default)]
pub struct QueryHints {
    pub intent: Option<String>,
    pub risk: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: None,
            hints: QueryHints::default(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user_id = Some(user.into());
        self
    }

    /// Query length in characters.
    pub fn len_chars(&self) -> usize {
        self.text.chars().count()
    }

    /// Whitespace-delimited word count.
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Outcome of one preview stream for one candidate model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PreviewOutcome {
    pub model: ModelId,
    pub text: String,
    pub tokens_consumed: u64,
    pub latency_seconds: f64,
    /// True when the preview was served from the preview cache.
    pub cache_hit: bool,
    /// Populated when every attempt for this candidate failed.
    pub error: Option<String>,
}

impl PreviewOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Terminal status of one full-answer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullStatus {
    Ok,
    Error,
    Cancelled,
    BudgetExceeded,
}

/// Outcome of one full-answer attempt for one model.
#[derive(Debug, Clone)]
pub struct FullOutcome {
    pub model: ModelId,
    pub text: String,
    pub tokens_consumed: u64,
    pub latency_seconds: f64,
    pub status: FullStatus,
}

/// Race phases, used in telemetry and failure reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RacePhase {
    Init,
    Select,
    Preview,
    Judge,
    Full,
    Reward,
    Done,
}

impl RacePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Select => "select",
            Self::Preview => "preview",
            Self::Judge => "judge",
            Self::Full => "full",
            Self::Reward => "reward",
            Self::Done => "done",
        }
    }
}

/// Race-level failures surfaced to the caller.
///
/// Everything recoverable (per-model retries, fallback to the next ranked
/// model) is handled inside the orchestrator; these variants are what is
/// left when no model can produce an answer or a hard limit is breached.
#[derive(Error, Debug)]
pub enum RaceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no candidates available for selection")]
    NoCandidates,

    #[error("all previews failed")]
    AllPreviewsFailed,

    #[error("judge failed after retries: {0}")]
    JudgeFailed(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("all full-answer attempts failed")]
    AllFullAttemptsFailed,

    #[error("race timed out in {phase:?}")]
    Timeout { phase: RacePhase },
}

impl RaceError {
    /// Phase in which the race failed.
    pub fn phase(&self) -> RacePhase {
        match self {
            Self::Config(_) => RacePhase::Init,
            Self::NoCandidates => RacePhase::Select,
            Self::AllPreviewsFailed => RacePhase::Preview,
            Self::JudgeFailed(_) => RacePhase::Judge,
            Self::BudgetExceeded(_) | Self::AllFullAttemptsFailed => RacePhase::Full,
            Self::Timeout { phase } => *phase,
        }
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::NoCandidates | Self::AllPreviewsFailed => 3,
            Self::JudgeFailed(_) => 4,
            Self::BudgetExceeded(_) => 5,
            Self::AllFullAttemptsFailed => 6,
            Self::Timeout { phase } => match phase {
                RacePhase::Preview => 3,
                RacePhase::Judge => 4,
                _ => 6,
            },
        }
    }
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_display_matches_inner() {
        let id = ModelId::new("gpt-a");
        assert_eq!(id.to_string(), "gpt-a");
        assert_eq!(id.as_str(), "gpt-a");
    }

    #[test]
    fn test_query_counts() {
        let q = Query::new("one two  three");
        assert_eq!(q.word_count(), 3);
        assert_eq!(q.len_chars(), 14);
    }

    #[test]
    fn test_race_error_exit_codes() {
        assert_eq!(RaceError::Config("x".into()).exit_code(), 2);
        assert_eq!(RaceError::AllPreviewsFailed.exit_code(), 3);
        assert_eq!(RaceError::JudgeFailed("x".into()).exit_code(), 4);
        assert_eq!(RaceError::BudgetExceeded("x".into()).exit_code(), 5);
        assert_eq!(RaceError::AllFullAttemptsFailed.exit_code(), 6);
    }

    #[test]
    fn test_race_error_phase_mapping() {
        assert_eq!(RaceError::AllPreviewsFailed.phase(), RacePhase::Preview);
        assert_eq!(
            RaceError::BudgetExceeded("tokens".into()).phase(),
            RacePhase::Full
        );
    }
}
