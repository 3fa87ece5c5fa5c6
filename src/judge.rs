//! Preview judging.
//!
//! The judge scores each successful preview across several dimensions and
//! produces a total ranking that decides the order of full-answer
//! attempts. The LLM-backed judge streams a JSON verdict from a
//! [`ModelClient`] and retries transiently up to its retry limit; after
//! that, the failure is fatal to the race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{collect_stream, ModelClient};
use crate::retry::{retry_transient, Backoff};
use crate::{ModelId, PreviewOutcome, Query};

/// Default number of attempts before a judge failure becomes fatal.
pub const DEFAULT_JUDGE_RETRY_LIMIT: usize = 3;

/// Per-preview scores, each in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeScores {
    pub model: ModelId,
    pub relevance: f64,
    pub coverage: f64,
    pub faithfulness: f64,
    /// Holistic preview quality; drives the ranking. Not an average of
    /// the other dimensions.
    pub overall: f64,
}

/// Judge output: per-model scores plus helpers for deriving the ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub scores: Vec<JudgeScores>,
}

impl JudgeVerdict {
    pub fn overall(&self, model: &ModelId) -> Option<f64> {
        self.scores.iter().find(|s| &s.model == model).map(|s| s.overall)
    }

    /// Total order over the judged models, best first.
    ///
    /// Ties on `overall` break on lower p95 latency, then lexicographic
    /// model id, so the order is deterministic.
    pub fn ranking(&self, p95_of: impl Fn(&ModelId) -> f64) -> Vec<ModelId> {
        let mut ranked: Vec<&JudgeScores> = self.scores.iter().collect();
        ranked.sort_by(|a, b| {
            b.overall
                .partial_cmp(&a.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    p95_of(&a.model)
                        .partial_cmp(&p95_of(&b.model))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.model.cmp(&b.model))
        });
        ranked.into_iter().map(|s| s.model.clone()).collect()
    }

    /// The judge's top-ranked model, if any previews were judged.
    pub fn top(&self, p95_of: impl Fn(&ModelId) -> f64) -> Option<ModelId> {
        self.ranking(p95_of).into_iter().next()
    }

    fn validate(&self) -> Result<(), JudgeError> {
        for s in &self.scores {
            for (name, v) in [
                ("relevance", s.relevance),
                ("coverage", s.coverage),
                ("faithfulness", s.faithfulness),
                ("overall", s.overall),
            ] {
                if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                    return Err(JudgeError::Malformed(format!(
                        "score {name}={v} for {} outside [0, 1]",
                        s.model
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("judge backend error: {0}")]
    Backend(String),

    #[error("judge produced malformed verdict: {0}")]
    Malformed(String),
}

impl JudgeError {
    fn is_transient(&self) -> bool {
        // Malformed output is retried too: a fresh sample usually parses.
        true
    }
}

/// Ranks previews for one query.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn rank(
        &self,
        query: &Query,
        previews: &[PreviewOutcome],
    ) -> Result<JudgeVerdict, JudgeError>;
}

// ── LLM-backed judge ────────────────────────────────────────────────────

#[derive(Serialize)]
struct JudgePayload<'a> {
    query: &'a str,
    candidates: Vec<JudgeCandidate<'a>>,
}

#[derive(Serialize)]
struct JudgeCandidate<'a> {
    index: usize,
    preview: &'a str,
}

#[derive(Deserialize)]
struct WireVerdict {
    scores: Vec<WireScores>,
}

#[derive(Deserialize)]
struct WireScores {
    index: usize,
    relevance: f64,
    coverage: f64,
    faithfulness: f64,
    overall: f64,
}

/// Judge that asks an LLM backend to score the previews and returns its
/// parsed JSON verdict.
pub struct LlmJudge {
    client: Arc<dyn ModelClient>,
    retry_limit: usize,
    token_cap: u64,
}

impl LlmJudge {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            retry_limit: DEFAULT_JUDGE_RETRY_LIMIT,
            token_cap: 800,
        }
    }

    pub fn with_retry_limit(mut self, limit: usize) -> Self {
        self.retry_limit = limit.max(1);
        self
    }

    pub fn with_token_cap(mut self, cap: u64) -> Self {
        self.token_cap = cap.max(1);
        self
    }

    async fn rank_once(
        &self,
        query: &Query,
        previews: &[PreviewOutcome],
    ) -> Result<JudgeVerdict, JudgeError> {
        let payload = JudgePayload {
            query: &query.text,
            candidates: previews
                .iter()
                .enumerate()
                .map(|(index, p)| JudgeCandidate {
                    index,
                    preview: &p.text,
                })
                .collect(),
        };
        let prompt = serde_json::to_string(&payload)
            .map_err(|e| JudgeError::Malformed(format!("payload encode: {e}")))?;

        let stream = self
            .client
            .stream(&prompt, Some(self.token_cap))
            .await
            .map_err(|e| JudgeError::Backend(e.to_string()))?;
        let (text, _usage) = collect_stream(stream)
            .await
            .map_err(|e| JudgeError::Backend(e.to_string()))?;

        let data = extract_json_object(&text)
            .ok_or_else(|| JudgeError::Malformed("no JSON object in judge output".into()))?;
        let wire: WireVerdict = serde_json::from_value(data)
            .map_err(|e| JudgeError::Malformed(format!("verdict decode: {e}")))?;

        let scores = wire
            .scores
            .into_iter()
            .filter_map(|s| {
                previews.get(s.index).map(|p| JudgeScores {
                    model: p.model.clone(),
                    relevance: s.relevance,
                    coverage: s.coverage,
                    faithfulness: s.faithfulness,
                    overall: s.overall,
                })
            })
            .collect();
        let verdict = JudgeVerdict { scores };
        verdict.validate()?;
        Ok(verdict)
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn rank(
        &self,
        query: &Query,
        previews: &[PreviewOutcome],
    ) -> Result<JudgeVerdict, JudgeError> {
        let backoff = Backoff::exponential(self.retry_limit, Duration::from_millis(200));
        let verdict = retry_transient(
            &backoff,
            || self.rank_once(query, previews),
            JudgeError::is_transient,
        )
        .await?;
        for s in &verdict.scores {
            info!(
                model = %s.model,
                relevance = s.relevance,
                coverage = s.coverage,
                faithfulness = s.faithfulness,
                overall = s.overall,
                "judge scored preview"
            );
        }
        Ok(verdict)
    }
}

/// Salvage a JSON object from free-form model output: try the whole text,
/// then the span between the first `{` and the last `}`.
fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let snippet = &text[start..=end];
    match serde_json::from_str(snippet) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(error = %e, "JSON salvage failed");
            None
        }
    }
}

// ── Static judge (testing / offline demo) ───────────────────────────────

/// Judge with a fixed opinion of each model. Models absent from the table
/// score 0.5 everywhere.
pub struct StaticJudge {
    overall: HashMap<ModelId, f64>,
}

impl StaticJudge {
    pub fn new(overall: HashMap<ModelId, f64>) -> Self {
        Self { overall }
    }

    /// Build from `(model, overall)` pairs.
    pub fn from_pairs(pairs: &[(&str, f64)]) -> Self {
        Self {
            overall: pairs
                .iter()
                .map(|(m, v)| (ModelId::new(*m), *v))
                .collect(),
        }
    }
}

#[async_trait]
impl Judge for StaticJudge {
    async fn rank(
        &self,
        _query: &Query,
        previews: &[PreviewOutcome],
    ) -> Result<JudgeVerdict, JudgeError> {
        let scores = previews
            .iter()
            .map(|p| {
                let overall = self.overall.get(&p.model).copied().unwrap_or(0.5);
                JudgeScores {
                    model: p.model.clone(),
                    relevance: overall,
                    coverage: overall,
                    faithfulness: overall,
                    overall,
                }
            })
            .collect();
        Ok(JudgeVerdict { scores })
    }
}
