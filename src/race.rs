//! # Stage: Race Orchestration
//!
//! ## Responsibility
//! Coordinate one race end to end: select candidates through the router,
//! fan previews out in parallel, rank them with the judge, execute the
//! full answer (ordered fallback cascade, or speculative top-2 for long
//! queries), enforce token/cost budgets, and feed observed rewards back
//! into the router.
//!
//! ## Guarantees
//! - All router updates for a race are applied atomically before the
//!   state store is written, under the router mutex.
//! - Every spawned stream carries a cancellation handle; speculative
//!   losers and timed-out streams are cancelled explicitly.
//! - The caller receives either a complete final answer or a structured
//!   failure naming the phase — never partial answer text.
//!
//! ## NOT Responsible For
//! - Talking to any backend directly (that belongs to `client` / `judge`)
//! - Scoring previews (judge) or composing rewards (reward)

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn, Instrument};

use crate::cache::{preview_key, CachedPreview, PreviewCache};
use crate::client::{CancelHandle, ClientError, ModelClient, StreamEvent};
use crate::config::{RaceConfig, Strategy};
use crate::features::{CombinedFeatures, FeatureExtractor};
use crate::judge::{Judge, JudgeVerdict};
use crate::latency::LatencyMetrics;
use crate::metrics;
use crate::retry::Backoff;
use crate::reward::{QualityLatencyCostPolicy, RewardInputs, RewardPolicy};
use crate::routing::{
    BaselineRouter, LinUcbConfig, LinUcbRouter, LocalFileStore, NullStateStore, Router,
    RouterStateStore, TieredStateStore,
};
use crate::{FullOutcome, FullStatus, ModelId, PreviewOutcome, Query, RaceError};

// ── Budget tracking ─────────────────────────────────────────────────────

enum BudgetCharge {
    Ok,
    TokensExceeded,
    CostExceeded,
}

/// Running totals for the full stage, shared across concurrent attempts.
struct BudgetTracker {
    max_tokens: Option<u64>,
    max_cost_usd: Option<f64>,
    tokens: AtomicU64,
    cost_usd: PlMutex<f64>,
    prices: HashMap<ModelId, f64>,
}

impl BudgetTracker {
    fn new(cfg: &RaceConfig) -> Self {
        Self {
            max_tokens: cfg.max_total_full_tokens,
            max_cost_usd: cfg.max_total_cost_usd,
            tokens: AtomicU64::new(0),
            cost_usd: PlMutex::new(0.0),
            prices: cfg
                .price_per_token
                .iter()
                .map(|(k, v)| (ModelId::new(k.clone()), *v))
                .collect(),
        }
    }

    /// Charge `tokens` for `model`; reports which ceiling (if any) the
    /// charge breached.
    fn charge(&self, model: &ModelId, tokens: u64) -> BudgetCharge {
        let total = self.tokens.fetch_add(tokens, Ordering::SeqCst) + tokens;
        // Unknown prices contribute nothing to the USD estimate.
        let price = self.prices.get(model).copied().unwrap_or(0.0);
        let cost = {
            let mut cost = self.cost_usd.lock();
            *cost += price * tokens as f64;
            *cost
        };
        if let Some(max) = self.max_tokens {
            if total > max {
                return BudgetCharge::TokensExceeded;
            }
        }
        if let Some(max) = self.max_cost_usd {
            if cost > max {
                return BudgetCharge::CostExceeded;
            }
        }
        BudgetCharge::Ok
    }

    fn total_tokens(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    fn total_cost_usd(&self) -> f64 {
        *self.cost_usd.lock()
    }
}

// ── Summary records ─────────────────────────────────────────────────────

/// Per-model row of the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRoundSummary {
    pub model: ModelId,
    pub selected_rank: usize,
    pub preview_latency_s: f64,
    pub preview_tokens: u64,
    pub cache_hit: bool,
    pub judge_overall: Option<f64>,
    pub full_attempted: bool,
    pub full_status: Option<FullStatus>,
    pub full_latency_s: Option<f64>,
    pub full_tokens: u64,
    pub reward: Option<f64>,
}

/// Structured record emitted at the end of every race.
#[derive(Debug, Clone, Serialize)]
pub struct RaceSummary {
    pub race_id: String,
    pub query_hash: String,
    pub strategy: Strategy,
    pub context: Vec<f64>,
    pub models: Vec<ModelRoundSummary>,
    pub total_preview_tokens: u64,
    pub total_full_tokens: u64,
    pub total_cost_usd: f64,
    pub fallbacks: u32,
    pub wall_clock_s: f64,
}

/// Successful race output.
#[derive(Debug)]
pub struct RaceResult {
    pub winner: ModelId,
    pub answer: String,
    pub summary: RaceSummary,
}

// ── Orchestrator ────────────────────────────────────────────────────────

/// Coordinates the race pipeline. One instance per process; races share
/// the router (serialized through its mutex), the latency windows, and
/// the preview cache.
pub struct RaceOrchestrator {
    cfg: RaceConfig,
    clients: HashMap<ModelId, Arc<dyn ModelClient>>,
    judge: Arc<dyn Judge>,
    router: Arc<Mutex<Box<dyn Router>>>,
    state_store: Arc<dyn RouterStateStore>,
    extractor: Arc<dyn FeatureExtractor>,
    policy: Arc<dyn RewardPolicy>,
    cache: PreviewCache,
    latency: Arc<LatencyMetrics>,
    races_completed: AtomicU64,
}

/// Builder assembling an orchestrator from a config plus its
/// collaborators; anything not supplied gets a config-derived default.
pub struct RaceOrchestratorBuilder {
    cfg: RaceConfig,
    clients: Vec<Arc<dyn ModelClient>>,
    judge: Option<Arc<dyn Judge>>,
    router: Option<Box<dyn Router>>,
    state_store: Option<Arc<dyn RouterStateStore>>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    policy: Option<Arc<dyn RewardPolicy>>,
    cache: Option<PreviewCache>,
    latency: Option<Arc<LatencyMetrics>>,
}

impl RaceOrchestrator {
    pub fn builder(cfg: RaceConfig) -> RaceOrchestratorBuilder {
        RaceOrchestratorBuilder {
            cfg,
            clients: Vec::new(),
            judge: None,
            router: None,
            state_store: None,
            extractor: None,
            policy: None,
            cache: None,
            latency: None,
        }
    }

    /// Shared latency windows (e.g. for observability snapshots).
    pub fn latency_metrics(&self) -> Arc<LatencyMetrics> {
        self.latency.clone()
    }

    /// Shared router handle (e.g. for operator-driven prune/reactivate).
    pub fn router(&self) -> Arc<Mutex<Box<dyn Router>>> {
        self.router.clone()
    }
}

impl RaceOrchestratorBuilder {
    pub fn client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.clients.push(client);
        self
    }

    pub fn judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn router(mut self, router: Box<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn RouterStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn feature_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn reward_policy(mut self, policy: Arc<dyn RewardPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn cache(mut self, cache: PreviewCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn latency(mut self, latency: Arc<LatencyMetrics>) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn build(self) -> Result<RaceOrchestrator, RaceError> {
        let cfg = self.cfg;
        cfg.validate()
            .map_err(|e| RaceError::Config(e.to_string()))?;

        let mut clients: HashMap<ModelId, Arc<dyn ModelClient>> = HashMap::new();
        for client in self.clients {
            clients.insert(client.id().clone(), client);
        }
        for name in &cfg.candidate_models {
            if !clients.contains_key(&ModelId::new(name.clone())) {
                return Err(RaceError::Config(format!(
                    "candidate model '{name}' has no registered client"
                )));
            }
        }
        let judge = self
            .judge
            .ok_or_else(|| RaceError::Config("no judge supplied".into()))?;

        let latency = self.latency.unwrap_or_default();
        let cache = self
            .cache
            .unwrap_or_else(|| PreviewCache::new_memory(cfg.cache_max_entries));
        let extractor: Arc<dyn FeatureExtractor> = match self.extractor {
            Some(e) => e,
            None => Arc::new(CombinedFeatures::length_only(
                cfg.length_threshold,
                cfg.word_threshold,
            )),
        };
        let policy: Arc<dyn RewardPolicy> = match self.policy {
            Some(p) => p,
            None => Arc::new(
                QualityLatencyCostPolicy::new(
                    cfg.reward_weights(),
                    cfg.fallback_penalty,
                    cfg.length_threshold,
                )
                .with_price_table(
                    cfg.price_per_token
                        .iter()
                        .map(|(k, v)| (ModelId::new(k.clone()), *v))
                        .collect(),
                ),
            ),
        };

        let state_store: Arc<dyn RouterStateStore> = match self.state_store {
            Some(s) => s,
            None => default_state_store(&cfg),
        };

        let router: Box<dyn Router> = match self.router {
            Some(r) => {
                if r.dim() != extractor.dim() {
                    return Err(RaceError::Config(format!(
                        "router dimension {} does not match feature dimension {}",
                        r.dim(),
                        extractor.dim()
                    )));
                }
                r
            }
            None => match cfg.strategy {
                Strategy::Baseline => Box::new(BaselineRouter::new(extractor.dim())),
                Strategy::Bandit => {
                    let lin_cfg = LinUcbConfig {
                        dim: extractor.dim(),
                        alpha: cfg.bandit_alpha,
                        ridge_lambda: cfg.bandit_ridge,
                        latency_bias_scale: cfg.latency_bias_scale,
                        reference_latency_s: cfg.reference_latency_s,
                    };
                    Box::new(
                        LinUcbRouter::from_store(lin_cfg, latency.clone(), state_store.as_ref())
                            .await,
                    )
                }
            },
        };

        Ok(RaceOrchestrator {
            cfg,
            clients,
            judge,
            router: Arc::new(Mutex::new(router)),
            state_store,
            extractor,
            policy,
            cache,
            latency,
            races_completed: AtomicU64::new(0),
        })
    }
}

fn default_state_store(cfg: &RaceConfig) -> Arc<dyn RouterStateStore> {
    let mut stores: Vec<Arc<dyn RouterStateStore>> = Vec::new();
    #[cfg(feature = "redis-backend")]
    if let Some(url) = &cfg.redis_url {
        match crate::routing::RedisStateStore::new(url, cfg.state_remote_key.clone()) {
            Ok(store) => stores.push(Arc::new(store)),
            Err(e) => warn!(error = %e, "remote state store unavailable"),
        }
    }
    if let Some(path) = &cfg.bandit_state {
        stores.push(Arc::new(LocalFileStore::new(path)));
    }
    match stores.len() {
        0 => Arc::new(NullStateStore),
        1 => stores.remove(0),
        _ => Arc::new(TieredStateStore::new(stores)),
    }
}

// ── Full-stage bookkeeping ──────────────────────────────────────────────

struct FullStage {
    winner: Option<FullOutcome>,
    attempts: Vec<FullOutcome>,
    budget_breach: Option<String>,
    fallbacks: u32,
}

impl RaceOrchestrator {
    /// Run one race to completion.
    ///
    /// Serializes with concurrent races on the router mutex only for the
    /// select and reward steps; previews and full answers from different
    /// races may interleave freely.
    pub async fn run(&self, query: &Query) -> Result<RaceResult, RaceError> {
        let race_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("race", race_id = %race_id, strategy = ?self.cfg.strategy);
        let inner = self.run_inner(query, &race_id).instrument(span);
        match self.cfg.race_timeout() {
            // Dropping the inner future aborts every in-flight child task.
            Some(limit) => match timeout(limit, inner).await {
                Ok(result) => result,
                Err(_) => {
                    metrics::inc_error("race", "timeout");
                    Err(RaceError::Timeout {
                        phase: crate::RacePhase::Full,
                    })
                }
            },
            None => inner.await,
        }
    }

    async fn run_inner(&self, query: &Query, race_id: &str) -> Result<RaceResult, RaceError> {
        let race_started = Instant::now();

        // SELECT
        metrics::inc_phase("select");
        let select_started = Instant::now();
        let context = self.extractor.compute(query).await;
        let candidates: Vec<ModelId> = self
            .cfg
            .candidate_models
            .iter()
            .map(|m| ModelId::new(m.clone()))
            .collect();
        let selected = {
            let mut router = self.router.lock().await;
            router.select(&context, &candidates, None)
        };
        metrics::record_phase_duration("select", select_started.elapsed());
        if selected.is_empty() {
            metrics::inc_error("select", "no_candidates");
            return Err(RaceError::NoCandidates);
        }
        info!(selected = ?selected.iter().map(|m| m.as_str()).collect::<Vec<_>>(), "candidates selected");

        // PREVIEW
        metrics::inc_phase("preview");
        let preview_started = Instant::now();
        let previews = self.run_previews(query, &selected).await;
        metrics::record_phase_duration("preview", preview_started.elapsed());
        let successful: Vec<PreviewOutcome> = previews
            .values()
            .filter(|p| p.is_success())
            .cloned()
            .collect();
        if successful.is_empty() {
            metrics::inc_error("preview", "all_failed");
            return Err(RaceError::AllPreviewsFailed);
        }

        // JUDGE
        metrics::inc_phase("judge");
        let judge_started = Instant::now();
        let verdict = match timeout(
            self.cfg.judge_timeout(),
            self.judge.rank(query, &successful),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                metrics::inc_error("judge", "failed");
                return Err(RaceError::JudgeFailed(e.to_string()));
            }
            Err(_) => {
                metrics::inc_error("judge", "timeout");
                return Err(RaceError::JudgeFailed("judge timed out".into()));
            }
        };
        metrics::record_phase_duration("judge", judge_started.elapsed());
        let ranking = verdict.ranking(|m| self.latency.p95(m));
        info!(ranking = ?ranking.iter().map(|m| m.as_str()).collect::<Vec<_>>(), "judge ranking");

        // FULL
        metrics::inc_phase("full");
        let full_started = Instant::now();
        let budget = Arc::new(BudgetTracker::new(&self.cfg));
        let stage = if query.len_chars() >= self.cfg.speculative_min_query_length
            && ranking.len() >= 2
        {
            self.run_speculative(query, &ranking, &budget).await
        } else {
            self.run_sequential(query, &ranking, &budget, Vec::new())
                .await
        };
        metrics::record_phase_duration("full", full_started.elapsed());

        // REWARD — runs for every model that previewed, even when the full
        // stage failed or breached a budget (the judge scores still carry
        // signal).
        metrics::inc_phase("reward");
        let reward_started = Instant::now();
        let rewards = self
            .apply_rewards(query, &context, &previews, &verdict, &stage)
            .await;
        metrics::record_phase_duration("reward", reward_started.elapsed());

        // DONE
        let summary = self.build_summary(
            race_id,
            query,
            &context,
            &selected,
            &previews,
            &verdict,
            &stage,
            &rewards,
            &budget,
            race_started.elapsed(),
        );
        match serde_json::to_string(&summary) {
            Ok(json) => info!(target: "race::summary", summary = %json, "race complete"),
            Err(e) => warn!(error = %e, "summary serialization failed"),
        }

        if let Some(reason) = stage.budget_breach {
            metrics::inc_error("full", "budget_exceeded");
            return Err(RaceError::BudgetExceeded(reason));
        }
        let Some(winner) = stage.winner else {
            metrics::inc_error("full", "all_failed");
            return Err(RaceError::AllFullAttemptsFailed);
        };
        metrics::inc_phase("done");
        Ok(RaceResult {
            winner: winner.model.clone(),
            answer: winner.text,
            summary,
        })
    }

    /// Adaptive preview cap: scale the base cap by query length, mapping
    /// `[0, length_threshold]` into `[adaptive_min_scale, adaptive_max_scale]`.
    fn preview_cap(&self, query: &Query) -> u64 {
        let norm = (query.len_chars() as f64 / self.cfg.length_threshold.max(1) as f64)
            .clamp(0.0, 1.0);
        let scale = self.cfg.adaptive_min_scale
            + (self.cfg.adaptive_max_scale - self.cfg.adaptive_min_scale) * norm;
        ((self.cfg.min_preview_tokens as f64 * scale).round() as u64).max(1)
    }

    async fn run_previews(
        &self,
        query: &Query,
        selected: &[ModelId],
    ) -> HashMap<ModelId, PreviewOutcome> {
        let cap = self.preview_cap(query);
        let semaphore = Arc::new(Semaphore::new(self.cfg.max_parallel_previews.max(1)));
        let mut tasks: JoinSet<PreviewOutcome> = JoinSet::new();

        for model in selected {
            let Some(client) = self.clients.get(model) else {
                continue;
            };
            let client = client.clone();
            let model = model.clone();
            let query_text = query.text.clone();
            let cache = self.cache.clone();
            let latency = self.latency.clone();
            let semaphore = semaphore.clone();
            let preview_timeout = self.cfg.preview_timeout();
            let retry_limit = self.cfg.preview_retry_limit;
            let ttl = self.cfg.preview_cache_ttl_secs;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_one_preview(
                    client,
                    model,
                    query_text,
                    cap,
                    preview_timeout,
                    retry_limit,
                    cache,
                    ttl,
                    latency,
                )
                .await
            });
        }

        let mut outcomes = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    metrics::add_tokens("preview", outcome.tokens_consumed);
                    outcomes.insert(outcome.model.clone(), outcome);
                }
                Err(e) => warn!(error = %e, "preview task panicked"),
            }
        }
        outcomes
    }

    async fn run_sequential(
        &self,
        query: &Query,
        ranking: &[ModelId],
        budget: &Arc<BudgetTracker>,
        mut attempts: Vec<FullOutcome>,
    ) -> FullStage {
        let already: HashSet<ModelId> = attempts.iter().map(|a| a.model.clone()).collect();
        let mut fallbacks = attempts.len() as u32;
        for model in ranking.iter().filter(|m| !already.contains(m)) {
            let Some(client) = self.clients.get(model) else {
                continue;
            };
            let outcome = full_attempt(
                client.clone(),
                model.clone(),
                query.text.clone(),
                self.cfg.full_timeout(),
                budget.clone(),
                None,
                None,
            )
            .await;
            metrics::add_tokens("full", outcome.tokens_consumed);
            match outcome.status {
                FullStatus::Ok => {
                    return FullStage {
                        winner: Some(outcome),
                        attempts,
                        budget_breach: None,
                        fallbacks,
                    };
                }
                FullStatus::BudgetExceeded => {
                    let reason = breach_reason(budget);
                    attempts.push(outcome);
                    return FullStage {
                        winner: None,
                        attempts,
                        budget_breach: Some(reason),
                        fallbacks,
                    };
                }
                FullStatus::Error | FullStatus::Cancelled => {
                    warn!(model = %model, "full attempt failed, falling back");
                    metrics::inc_fallback();
                    fallbacks += 1;
                    attempts.push(outcome);
                }
            }
        }
        FullStage {
            winner: None,
            attempts,
            budget_breach: None,
            fallbacks,
        }
    }

    /// Speculative top-2: run both leaders concurrently, commit to the
    /// first that produces a non-empty token batch, cancel the other.
    async fn run_speculative(
        &self,
        query: &Query,
        ranking: &[ModelId],
        budget: &Arc<BudgetTracker>,
    ) -> FullStage {
        let top2: Vec<ModelId> = ranking.iter().take(2).cloned().collect();
        info!(
            first = %top2[0],
            second = %top2[1],
            "speculative top-2 full stage"
        );

        let (first_batch_tx, mut first_batch_rx) = mpsc::channel::<ModelId>(2);
        // JoinSet so a dropped race (global timeout) aborts both streams.
        let mut tasks: JoinSet<FullOutcome> = JoinSet::new();
        let mut cancels: HashMap<ModelId, CancelHandle> = HashMap::new();
        for model in &top2 {
            let Some(client) = self.clients.get(model) else {
                continue;
            };
            let external = CancelHandle::new();
            cancels.insert(model.clone(), external.clone());
            tasks.spawn(full_attempt(
                client.clone(),
                model.clone(),
                query.text.clone(),
                self.cfg.full_timeout(),
                budget.clone(),
                Some(first_batch_tx.clone()),
                Some(external),
            ));
        }
        drop(first_batch_tx);

        // Winner = first model to deliver a non-empty batch. If neither
        // ever does, the channel closes when both attempts finish.
        let winner_model = first_batch_rx.recv().await;
        if let Some(winner_model) = &winner_model {
            for (model, cancel) in &cancels {
                if model != winner_model {
                    cancel.cancel();
                }
            }
        }

        let mut attempts = Vec::new();
        let mut winner: Option<FullOutcome> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "speculative task panicked");
                    continue;
                }
            };
            metrics::add_tokens("full", outcome.tokens_consumed);
            if outcome.status == FullStatus::BudgetExceeded {
                for cancel in cancels.values() {
                    cancel.cancel();
                }
                let reason = breach_reason(budget);
                attempts.push(outcome);
                return FullStage {
                    winner: None,
                    attempts,
                    budget_breach: Some(reason),
                    fallbacks: 0,
                };
            }
            if Some(&outcome.model) == winner_model.as_ref() && outcome.status == FullStatus::Ok {
                winner = Some(outcome);
            } else {
                attempts.push(outcome);
            }
        }

        if let Some(winner) = winner {
            // Cancelled losers are expected; they are not fallbacks.
            attempts.retain(|a| a.status != FullStatus::Cancelled);
            let fallbacks = attempts.len() as u32;
            for _ in 0..fallbacks {
                metrics::inc_fallback();
            }
            return FullStage {
                winner: Some(winner),
                attempts,
                budget_breach: None,
                fallbacks,
            };
        }

        // Speculative winner failed (or neither produced a batch): fall
        // back to the sequential cascade over the remaining ranking.
        warn!("speculative stage produced no winner, cascading sequentially");
        attempts.retain(|a| a.status != FullStatus::Cancelled);
        for _ in &attempts {
            metrics::inc_fallback();
        }
        self.run_sequential(query, ranking, budget, attempts).await
    }

    async fn apply_rewards(
        &self,
        query: &Query,
        context: &[f64],
        previews: &HashMap<ModelId, PreviewOutcome>,
        verdict: &JudgeVerdict,
        stage: &FullStage,
    ) -> HashMap<ModelId, f64> {
        let failed_full: HashSet<ModelId> = stage
            .attempts
            .iter()
            .filter(|a| a.status != FullStatus::Ok)
            .map(|a| a.model.clone())
            .collect();
        let full_tokens: HashMap<ModelId, u64> = stage
            .attempts
            .iter()
            .chain(stage.winner.iter())
            .map(|a| (a.model.clone(), a.tokens_consumed))
            .collect();

        let mut rewards = HashMap::new();
        for (model, preview) in previews {
            if !preview.is_success() {
                // A model that ran and produced nothing earns nothing.
                rewards.insert(model.clone(), 0.0);
                continue;
            }
            let inputs = RewardInputs {
                model: model.clone(),
                judge_overall: verdict.overall(model),
                latency_seconds: preview.latency_seconds,
                cache_hit: preview.cache_hit,
                p95_latency_seconds: self.latency.p95(model),
                tokens_consumed: preview.tokens_consumed
                    + full_tokens.get(model).copied().unwrap_or(0),
                was_fallback: failed_full.contains(model),
                query_len: query.len_chars(),
            };
            rewards.insert(model.clone(), self.policy.compose(&inputs));
        }

        let winner = verdict.top(|m| self.latency.p95(m));
        {
            // All arm updates apply atomically before the save; concurrent
            // races serialize here.
            let mut router = self.router.lock().await;
            router.bulk_update(context, &rewards, winner.as_ref());

            let completed = self.races_completed.fetch_add(1, Ordering::SeqCst) + 1;
            if self.cfg.decay_every_races > 0 && completed % self.cfg.decay_every_races == 0 {
                router.decay(self.cfg.decay_factor);
            }

            if let Some(blob) = router.state_blob() {
                if let Err(e) = self.state_store.save(&blob).await {
                    // Memory state already advanced; the next save may succeed.
                    warn!(error = %e, "router state save failed");
                    metrics::inc_error("reward", "state_save");
                }
            }
        }
        rewards
    }

    #[allow(clippy::too_many_arguments)]
    fn build_summary(
        &self,
        race_id: &str,
        query: &Query,
        context: &[f64],
        selected: &[ModelId],
        previews: &HashMap<ModelId, PreviewOutcome>,
        verdict: &JudgeVerdict,
        stage: &FullStage,
        rewards: &HashMap<ModelId, f64>,
        budget: &BudgetTracker,
        wall_clock: Duration,
    ) -> RaceSummary {
        let full_by_model: HashMap<ModelId, &FullOutcome> = stage
            .attempts
            .iter()
            .chain(stage.winner.iter())
            .map(|a| (a.model.clone(), a))
            .collect();

        let models = selected
            .iter()
            .enumerate()
            .map(|(rank, model)| {
                let preview = previews.get(model);
                let full = full_by_model.get(model);
                ModelRoundSummary {
                    model: model.clone(),
                    selected_rank: rank,
                    preview_latency_s: preview.map_or(0.0, |p| p.latency_seconds),
                    preview_tokens: preview.map_or(0, |p| p.tokens_consumed),
                    cache_hit: preview.map_or(false, |p| p.cache_hit),
                    judge_overall: verdict.overall(model),
                    full_attempted: full.is_some(),
                    full_status: full.map(|f| f.status),
                    full_latency_s: full.map(|f| f.latency_seconds),
                    full_tokens: full.map_or(0, |f| f.tokens_consumed),
                    reward: rewards.get(model).copied(),
                }
            })
            .collect();

        let total_preview_tokens = previews.values().map(|p| p.tokens_consumed).sum();
        RaceSummary {
            race_id: race_id.to_string(),
            query_hash: format!("{:x}", Sha256::digest(query.text.as_bytes())),
            strategy: self.cfg.strategy,
            context: context.to_vec(),
            models,
            total_preview_tokens,
            total_full_tokens: budget.total_tokens(),
            total_cost_usd: budget.total_cost_usd(),
            fallbacks: stage.fallbacks,
            wall_clock_s: wall_clock.as_secs_f64(),
        }
    }
}

fn breach_reason(budget: &BudgetTracker) -> String {
    format!(
        "full stage consumed {} tokens / ${:.4}",
        budget.total_tokens(),
        budget.total_cost_usd()
    )
}

// ── Preview worker ──────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn run_one_preview(
    client: Arc<dyn ModelClient>,
    model: ModelId,
    query_text: String,
    cap: u64,
    preview_timeout: Duration,
    retry_limit: usize,
    cache: PreviewCache,
    ttl: u64,
    latency: Arc<LatencyMetrics>,
) -> PreviewOutcome {
    let key = preview_key(&model, &query_text, cap);
    if let Some(hit) = cache.get(&key).await {
        latency.record_cache_hit(&model);
        metrics::inc_cache_hit(model.as_str());
        return PreviewOutcome {
            model,
            text: hit.text,
            tokens_consumed: hit.tokens,
            latency_seconds: 0.0,
            cache_hit: true,
            error: None,
        };
    }

    let backoff = Backoff::exponential(retry_limit + 1, Duration::from_millis(250));
    let mut last_error = String::new();
    let mut timeouts = 0;
    for attempt in 1..=retry_limit + 1 {
        let started = Instant::now();
        match timeout(preview_timeout, client.stream(&query_text, Some(cap))).await {
            Ok(Ok(stream)) => {
                let cancel = stream.cancel_handle();
                let remaining = preview_timeout.saturating_sub(started.elapsed());
                match timeout(remaining, crate::client::collect_stream(stream)).await {
                    Ok(Ok((text, usage))) => {
                        let elapsed = started.elapsed().as_secs_f64();
                        latency.record(&model, elapsed);
                        cache
                            .put(
                                &key,
                                &CachedPreview {
                                    text: text.clone(),
                                    tokens: usage.tokens_consumed,
                                },
                                ttl,
                            )
                            .await;
                        return PreviewOutcome {
                            model,
                            text,
                            tokens_consumed: usage.tokens_consumed,
                            latency_seconds: elapsed,
                            cache_hit: false,
                            error: None,
                        };
                    }
                    Ok(Err(ClientError::Permanent(msg))) => {
                        last_error = msg;
                        break;
                    }
                    Ok(Err(ClientError::Transient(msg))) => {
                        last_error = msg;
                    }
                    Err(_) => {
                        cancel.cancel();
                        timeouts += 1;
                        last_error = "preview timed out".to_string();
                        metrics::inc_error("preview", "timeout");
                        // A first timeout is transient; a second one is
                        // fatal for this model this race.
                        if timeouts >= 2 {
                            break;
                        }
                    }
                }
            }
            Ok(Err(ClientError::Permanent(msg))) => {
                last_error = msg;
                break;
            }
            Ok(Err(ClientError::Transient(msg))) => {
                last_error = msg;
            }
            Err(_) => {
                timeouts += 1;
                last_error = "preview connect timed out".to_string();
                metrics::inc_error("preview", "timeout");
                if timeouts >= 2 {
                    break;
                }
            }
        }
        if attempt <= retry_limit {
            tokio::time::sleep(backoff.delay_for(attempt)).await;
        }
    }

    warn!(model = %model, error = %last_error, "preview failed after retries");
    metrics::inc_error("preview", "failed");
    PreviewOutcome {
        model,
        text: String::new(),
        tokens_consumed: 0,
        latency_seconds: 0.0,
        cache_hit: false,
        error: Some(last_error),
    }
}

// ── Full-answer worker ──────────────────────────────────────────────────

/// Run one full-answer stream for `model`, charging the shared budget per
/// batch. Sends the model id on `first_batch` when the first non-empty
/// batch arrives (speculative winner milestone). `external_cancel` lets
/// the coordinator abort a speculative loser.
async fn full_attempt(
    client: Arc<dyn ModelClient>,
    model: ModelId,
    query_text: String,
    full_timeout: Duration,
    budget: Arc<BudgetTracker>,
    first_batch: Option<mpsc::Sender<ModelId>>,
    external_cancel: Option<CancelHandle>,
) -> FullOutcome {
    let started = Instant::now();
    let fail = |status: FullStatus, tokens: u64, text: String| FullOutcome {
        model: model.clone(),
        text,
        tokens_consumed: tokens,
        latency_seconds: started.elapsed().as_secs_f64(),
        status,
    };

    let mut stream = match timeout(full_timeout, client.stream(&query_text, None)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(model = %model, error = %e, "full stream failed to start");
            return fail(FullStatus::Error, 0, String::new());
        }
        Err(_) => {
            metrics::inc_error("full", "timeout");
            return fail(FullStatus::Error, 0, String::new());
        }
    };
    let cancel = stream.cancel_handle();
    let deadline = tokio::time::Instant::now() + full_timeout;

    let mut text = String::new();
    let mut tokens = 0u64;
    let mut announced = false;
    let mut first_batch = first_batch;

    loop {
        let event = tokio::select! {
            event = stream.next_event() => event,
            _ = tokio::time::sleep_until(deadline) => {
                cancel.cancel();
                metrics::inc_error("full", "timeout");
                return fail(FullStatus::Error, tokens, text);
            }
            _ = wait_cancelled(&external_cancel), if external_cancel.is_some() => {
                cancel.cancel();
                return fail(FullStatus::Cancelled, tokens, text);
            }
        };
        match event {
            Some(StreamEvent::Batch(batch)) => {
                if !announced && !batch.text.trim().is_empty() {
                    announced = true;
                    if let Some(tx) = first_batch.take() {
                        let _ = tx.send(model.clone()).await;
                    }
                }
                tokens += batch.tokens;
                text.push_str(&batch.text);
                match budget.charge(&model, batch.tokens) {
                    BudgetCharge::Ok => {}
                    BudgetCharge::TokensExceeded | BudgetCharge::CostExceeded => {
                        cancel.cancel();
                        return fail(FullStatus::BudgetExceeded, tokens, text);
                    }
                }
            }
            Some(StreamEvent::Done(usage)) => {
                return FullOutcome {
                    model: model.clone(),
                    text,
                    tokens_consumed: usage.tokens_consumed.max(tokens),
                    latency_seconds: started.elapsed().as_secs_f64(),
                    status: FullStatus::Ok,
                };
            }
            Some(StreamEvent::Failed(e)) => {
                warn!(model = %model, error = %e, "full stream failed mid-flight");
                return fail(FullStatus::Error, tokens, text);
            }
            None => {
                // Producer vanished without a usage report.
                return fail(FullStatus::Error, tokens, text);
            }
        }
    }
}

async fn wait_cancelled(handle: &Option<CancelHandle>) {
    match handle {
        Some(h) => h.cancelled().await,
        None => std::future::pending().await,
    }
}
