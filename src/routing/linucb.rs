//! LinUCB contextual bandit router.
//!
//! ## Responsibility
//! Rank candidate backends for a context vector by upper-confidence bound
//! on a per-arm linear reward model, and fold observed rewards back into
//! each arm's ridge-regression state via incremental Sherman–Morrison
//! updates.
//!
//! ## Guarantees
//! - Deterministic: identical state and context always produce the same
//!   ranking; ties break on stable arm (insertion) order.
//! - `a_inv` stays symmetric positive-definite: updates with a degenerate
//!   denominator are skipped and counted as anomalies instead of applied.
//! - Dimension-disciplined: a context of the wrong length never reaches a
//!   matrix operation; the call is rejected and logged.
//!
//! ## NOT Responsible For
//! - Computing rewards (that belongs to `reward`)
//! - Persistence I/O (that belongs to `routing::state`; this type only
//!   produces/consumes the blob)

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};

use super::state::{ArmStateBlob, RouterStateBlob, RouterStateStore, ROUTER_STATE_VERSION};
use super::Router;
use crate::latency::LatencyMetrics;
use crate::ModelId;

/// Sherman–Morrison denominators at or below this are treated as
/// numerically degenerate.
const DEGENERACY_EPS: f64 = 1e-9;

/// LinUCB tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct LinUcbConfig {
    /// Context vector dimension (must be >= 1).
    pub dim: usize,
    /// Exploration strength α.
    pub alpha: f64,
    /// Ridge regularization λ; arms initialise to `A_inv = (1/λ)·I`.
    pub ridge_lambda: f64,
    /// β: how strongly a slow p95 drags an arm's selection score down.
    pub latency_bias_scale: f64,
    /// Latency considered "fully slow" for the selection bias, seconds.
    pub reference_latency_s: f64,
}

impl Default for LinUcbConfig {
    fn default() -> Self {
        Self {
            dim: 3,
            alpha: 1.5,
            ridge_lambda: 1e-2,
            latency_bias_scale: 0.05,
            reference_latency_s: 6.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Arm {
    a_inv: Vec<f64>, // d*d, row-major
    b: Vec<f64>,     // d
    trials: u64,
    wins: u64,
    active: bool,
}

impl Arm {
    fn new(dim: usize, lambda: f64) -> Self {
        let diag = 1.0 / lambda.max(DEGENERACY_EPS);
        let mut a_inv = vec![0.0; dim * dim];
        for i in 0..dim {
            a_inv[i * dim + i] = diag;
        }
        Self {
            a_inv,
            b: vec![0.0; dim],
            trials: 0,
            wins: 0,
            active: true,
        }
    }

    fn win_rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.wins as f64 / self.trials as f64
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn mat_vec(a: &[f64], dim: usize, x: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; dim];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = dot(&a[i * dim..(i + 1) * dim], x);
    }
    out
}

/// Contextual bandit router with per-arm inverse covariance and response
/// accumulator.
pub struct LinUcbRouter {
    cfg: LinUcbConfig,
    /// Insertion order; ties in scoring resolve to the earlier arm.
    order: Vec<ModelId>,
    arms: HashMap<ModelId, Arm>,
    latency: Arc<LatencyMetrics>,
    anomalies: u64,
}

impl LinUcbRouter {
    pub fn new(cfg: LinUcbConfig, latency: Arc<LatencyMetrics>) -> Self {
        assert!(cfg.dim >= 1, "LinUCB dimension must be >= 1");
        Self {
            cfg,
            order: Vec::new(),
            arms: HashMap::new(),
            latency,
            anomalies: 0,
        }
    }

    /// Construct and restore persisted state. A missing, unreadable, or
    /// version/dimension-mismatched blob produces a cold start.
    pub async fn from_store(
        cfg: LinUcbConfig,
        latency: Arc<LatencyMetrics>,
        store: &dyn RouterStateStore,
    ) -> Self {
        let mut router = Self::new(cfg, latency);
        match store.load(cfg.dim).await {
            Ok(Some(blob)) => {
                router.restore(blob);
                debug!(arms = router.order.len(), "router state restored");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "router state load failed, starting cold"),
        }
        router
    }

    /// Replace in-memory state with a decoded blob. The blob's shape has
    /// already been gated by [`RouterStateBlob::decode_checked`].
    pub fn restore(&mut self, blob: RouterStateBlob) {
        self.order.clear();
        self.arms.clear();
        for (name, arm) in blob.arms {
            let model = ModelId::new(name);
            self.order.push(model.clone());
            self.arms.insert(
                model,
                Arm {
                    a_inv: arm.a_inv,
                    b: arm.b,
                    trials: arm.trials,
                    wins: arm.wins,
                    active: arm.active,
                },
            );
        }
    }

    /// Updates skipped because of a degenerate Sherman–Morrison
    /// denominator or a non-finite reward.
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies
    }

    fn ensure(&mut self, model: &ModelId) {
        if !self.arms.contains_key(model) {
            self.order.push(model.clone());
            self.arms
                .insert(model.clone(), Arm::new(self.cfg.dim, self.cfg.ridge_lambda));
        }
    }

    fn context_ok(&self, context: &[f64], op: &str) -> bool {
        if context.len() != self.cfg.dim {
            error!(
                got = context.len(),
                expected = self.cfg.dim,
                op,
                "context dimension mismatch, ignoring call"
            );
            return false;
        }
        if context.iter().any(|v| !v.is_finite()) {
            error!(op, "non-finite context slot, ignoring call");
            return false;
        }
        true
    }

    /// UCB score with latency bias for one arm against `context`.
    fn ucb(&self, arm: &Arm, model: &ModelId, context: &[f64]) -> f64 {
        let d = self.cfg.dim;
        let theta = mat_vec(&arm.a_inv, d, &arm.b);
        let mean = dot(&theta, context);
        let ax = mat_vec(&arm.a_inv, d, context);
        let variance = dot(context, &ax).max(0.0);
        let bonus = self.cfg.alpha * variance.sqrt();

        let p95 = self.latency.p95(model);
        let lat_norm = if p95 > 0.0 {
            (p95 / self.cfg.reference_latency_s.max(DEGENERACY_EPS)).min(1.0)
        } else {
            0.0
        };
        mean + bonus - self.cfg.latency_bias_scale * lat_norm
    }

    /// Apply one Sherman–Morrison rank-1 update to a single arm.
    fn update_arm(&mut self, model: &ModelId, context: &[f64], reward: f64, is_winner: bool) {
        if !reward.is_finite() {
            self.anomalies += 1;
            warn!(model = %model, "non-finite reward skipped");
            return;
        }
        let reward = reward.clamp(0.0, 1.0);
        self.ensure(model);
        let d = self.cfg.dim;
        let Some(arm) = self.arms.get_mut(model) else {
            return;
        };

        let v = mat_vec(&arm.a_inv, d, context);
        let denom = 1.0 + dot(context, &v);
        if denom <= DEGENERACY_EPS {
            self.anomalies += 1;
            warn!(model = %model, denom, "degenerate Sherman–Morrison denominator, update skipped");
            return;
        }
        // A_inv ← A_inv − (v vᵀ) / denom
        for i in 0..d {
            for j in 0..d {
                arm.a_inv[i * d + j] -= v[i] * v[j] / denom;
            }
        }
        for (bi, &xi) in arm.b.iter_mut().zip(context.iter()) {
            *bi += reward * xi;
        }
        arm.trials += 1;
        if is_winner {
            arm.wins += 1;
        }
    }
}

impl Router for LinUcbRouter {
    fn dim(&self) -> usize {
        self.cfg.dim
    }

    fn select(
        &mut self,
        context: &[f64],
        candidates: &[ModelId],
        top_k: Option<usize>,
    ) -> Vec<ModelId> {
        if !self.context_ok(context, "select") {
            return Vec::new();
        }
        for model in candidates {
            self.ensure(model);
        }
        let mut scored: Vec<(ModelId, f64)> = candidates
            .iter()
            .filter(|m| self.arms.get(m).map_or(false, |a| a.active))
            .map(|m| {
                let arm = &self.arms[m];
                (m.clone(), self.ucb(arm, m, context))
            })
            .collect();
        // Stable sort keeps the supplied (insertion) order on exact ties.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut ranked: Vec<ModelId> = scored.into_iter().map(|(m, _)| m).collect();
        if let Some(k) = top_k {
            ranked.truncate(k.max(1));
        }
        ranked
    }

    fn bulk_update(
        &mut self,
        context: &[f64],
        rewards: &HashMap<ModelId, f64>,
        winner: Option<&ModelId>,
    ) {
        if !self.context_ok(context, "bulk_update") {
            return;
        }
        // Deterministic update order: known arms first in insertion order,
        // then any previously unseen arms sorted by id.
        let mut models: Vec<ModelId> = self
            .order
            .iter()
            .filter(|m| rewards.contains_key(m))
            .cloned()
            .collect();
        let mut fresh: Vec<ModelId> = rewards
            .keys()
            .filter(|m| !self.arms.contains_key(m))
            .cloned()
            .collect();
        fresh.sort();
        models.extend(fresh);

        for model in models {
            if let Some(&reward) = rewards.get(&model) {
                self.update_arm(&model, context, reward, winner == Some(&model));
            }
        }
    }

    fn decay(&mut self, factor: f64) {
        if !(factor > 0.0 && factor <= 1.0) || !factor.is_finite() {
            warn!(factor, "invalid decay factor ignored");
            return;
        }
        if (factor - 1.0).abs() < f64::EPSILON {
            return;
        }
        // Forget old evidence: inflate uncertainty, shrink the response.
        for arm in self.arms.values_mut() {
            for v in &mut arm.a_inv {
                *v /= factor;
            }
            for v in &mut arm.b {
                *v *= factor;
            }
        }
        debug!(factor, "router state decayed");
    }

    fn prune(&mut self, min_trials: u64, min_win_rate: f64) {
        for (model, arm) in &mut self.arms {
            if arm.active && arm.trials >= min_trials && arm.win_rate() < min_win_rate {
                arm.active = false;
                warn!(
                    model = %model,
                    trials = arm.trials,
                    win_rate = arm.win_rate(),
                    "arm deactivated by prune"
                );
            }
        }
    }

    fn reactivate(&mut self, model: &ModelId) -> bool {
        match self.arms.get_mut(model) {
            Some(arm) if !arm.active => {
                arm.active = true;
                true
            }
            _ => false,
        }
    }

    fn state_blob(&self) -> Option<RouterStateBlob> {
        let arms = self
            .order
            .iter()
            .filter_map(|m| {
                self.arms.get(m).map(|arm| {
                    (
                        m.as_str().to_string(),
                        ArmStateBlob {
                            a_inv: arm.a_inv.clone(),
                            b: arm.b.clone(),
                            trials: arm.trials,
                            wins: arm.wins,
                            active: arm.active,
                        },
                    )
                })
            })
            .collect();
        Some(RouterStateBlob {
            version: ROUTER_STATE_VERSION,
            d: self.cfg.dim,
            arms,
            updated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(dim: usize) -> LinUcbRouter {
        LinUcbRouter::new(
            LinUcbConfig {
                dim,
                ..LinUcbConfig::default()
            },
            Arc::new(LatencyMetrics::default()),
        )
    }

    fn models(names: &[&str]) -> Vec<ModelId> {
        names.iter().map(|n| ModelId::new(*n)).collect()
    }

    fn rewards(pairs: &[(&str, f64)]) -> HashMap<ModelId, f64> {
        pairs.iter().map(|(m, r)| (ModelId::new(*m), *r)).collect()
    }

    #[test]
    fn test_select_returns_all_candidates_ranked() {
        let mut r = router(3);
        let ranked = r.select(&[1.0, 0.5, 0.2], &models(&["a", "b", "c"]), None);
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn test_select_top_k_truncates() {
        let mut r = router(3);
        let ranked = r.select(&[1.0, 0.5, 0.2], &models(&["a", "b", "c"]), Some(2));
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_select_rejects_wrong_dimension() {
        let mut r = router(3);
        let ranked = r.select(&[1.0, 0.5], &models(&["a"]), None);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_fresh_arms_tie_in_insertion_order() {
        let mut r = router(3);
        let ranked = r.select(&[1.0, 0.5, 0.2], &models(&["zeta", "alpha"]), None);
        // Identical fresh state ⇒ identical scores ⇒ supplied order wins.
        assert_eq!(ranked[0].as_str(), "zeta");
    }

    #[test]
    fn test_single_update_moves_estimate_toward_reward() {
        let mut r = router(3);
        let x = vec![1.0, 0.0, 0.0];
        r.bulk_update(&x, &rewards(&[("a", 0.5)]), None);
        let blob = r.state_blob().expect("blob");
        let arm = &blob.arms["a"];
        // theta = A_inv·b; with lambda=1e-2 and one update at x=e_0,
        // theta·x = (1/(lambda+1))·0.5 ≈ 0.495.
        let d = 3;
        let theta0: f64 = (0..d).map(|j| arm.a_inv[j] * arm.b[j]).sum();
        assert!(
            (theta0 - 0.5).abs() < 0.01,
            "theta·x should be ≈ 0.5, got {theta0}"
        );
    }

    #[test]
    fn test_updates_increment_trials_and_wins() {
        let mut r = router(3);
        let x = vec![1.0, 0.2, 0.1];
        let winner = ModelId::new("a");
        r.bulk_update(&x, &rewards(&[("a", 0.9), ("b", 0.1)]), Some(&winner));
        let blob = r.state_blob().expect("blob");
        assert_eq!(blob.arms["a"].trials, 1);
        assert_eq!(blob.arms["a"].wins, 1);
        assert_eq!(blob.arms["b"].trials, 1);
        assert_eq!(blob.arms["b"].wins, 0);
    }

    #[test]
    fn test_rewards_clamped_to_unit_interval() {
        let mut r = router(2);
        let x = vec![1.0, 0.0];
        r.bulk_update(&x, &rewards(&[("a", 7.0)]), None);
        let blob = r.state_blob().expect("blob");
        // b = clamp(7.0)·x = 1.0·x
        assert!((blob.arms["a"].b[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_reward_is_anomaly() {
        let mut r = router(2);
        r.bulk_update(&[1.0, 0.0], &rewards(&[("a", f64::NAN)]), None);
        assert_eq!(r.anomaly_count(), 1);
        // Arm untouched (not even initialised by the skipped update).
        let blob = r.state_blob().expect("blob");
        assert!(!blob.arms.contains_key("a"));
    }

    #[test]
    fn test_learning_separates_arms_by_context() {
        let mut r = router(3);
        let long = vec![1.0, 2.0, 1.0];
        let short = vec![1.0, 0.2, 0.2];
        for _ in 0..50 {
            r.bulk_update(&long, &rewards(&[("a", 1.0), ("b", 0.0)]), None);
            r.bulk_update(&short, &rewards(&[("a", 0.0), ("b", 1.0)]), None);
        }
        let ranked_long = r.select(&long, &models(&["a", "b"]), None);
        assert_eq!(ranked_long[0].as_str(), "a");
        let ranked_short = r.select(&short, &models(&["a", "b"]), None);
        assert_eq!(ranked_short[0].as_str(), "b");
    }

    #[test]
    fn test_latency_bias_demotes_slow_arm_on_ties() {
        let latency = Arc::new(LatencyMetrics::default());
        latency.record(&ModelId::new("slow"), 10.0);
        let mut r = LinUcbRouter::new(
            LinUcbConfig {
                dim: 2,
                ..LinUcbConfig::default()
            },
            latency,
        );
        let ranked = r.select(&[1.0, 0.5], &models(&["slow", "quick"]), None);
        assert_eq!(ranked[0].as_str(), "quick");
    }

    #[test]
    fn test_decay_inflates_uncertainty() {
        let mut r = router(2);
        let x = vec![1.0, 0.0];
        for _ in 0..10 {
            r.bulk_update(&x, &rewards(&[("a", 0.8)]), None);
        }
        let before = r.state_blob().expect("blob").arms["a"].a_inv[0];
        r.decay(0.5);
        let after = r.state_blob().expect("blob").arms["a"].a_inv[0];
        assert!(after > before, "A_inv diagonal should grow under decay");
    }

    #[test]
    fn test_decay_rejects_invalid_factor() {
        let mut r = router(2);
        r.bulk_update(&[1.0, 0.0], &rewards(&[("a", 0.5)]), None);
        let before = r.state_blob().expect("blob");
        r.decay(0.0);
        r.decay(1.5);
        r.decay(f64::NAN);
        let mut after = r.state_blob().expect("blob");
        after.updated_at = before.updated_at;
        assert_eq!(before, after);
    }

    #[test]
    fn test_prune_deactivates_proven_losers_only() {
        let mut r = router(2);
        let x = vec![1.0, 0.0];
        let winner = ModelId::new("good");
        for _ in 0..20 {
            r.bulk_update(&x, &rewards(&[("good", 0.9), ("bad", 0.05)]), Some(&winner));
        }
        // "fresh" has too few trials to judge; it must survive the prune.
        r.bulk_update(&x, &rewards(&[("fresh", 0.1)]), None);
        r.prune(10, 0.2);

        let ranked = r.select(&x, &models(&["good", "bad", "fresh"]), None);
        let names: Vec<&str> = ranked.iter().map(|m| m.as_str()).collect();
        assert!(names.contains(&"good"));
        assert!(names.contains(&"fresh"));
        assert!(!names.contains(&"bad"));
    }

    #[test]
    fn test_reactivate_restores_pruned_arm() {
        let mut r = router(2);
        let x = vec![1.0, 0.0];
        let winner = ModelId::new("good");
        for _ in 0..20 {
            r.bulk_update(&x, &rewards(&[("good", 0.9), ("bad", 0.0)]), Some(&winner));
        }
        r.prune(10, 0.2);
        assert!(r.reactivate(&ModelId::new("bad")));
        let ranked = r.select(&x, &models(&["good", "bad"]), None);
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_state_blob_restore_roundtrip() {
        let mut r = router(3);
        let x = vec![1.0, 0.7, 0.3];
        r.bulk_update(&x, &rewards(&[("a", 0.6), ("b", 0.3)]), None);
        let blob = r.state_blob().expect("blob");

        let mut restored = router(3);
        restored.restore(blob.clone());
        let mut blob2 = restored.state_blob().expect("blob");
        blob2.updated_at = blob.updated_at;
        assert_eq!(blob, blob2);
    }

    #[test]
    fn test_a_inv_stays_symmetric_psd() {
        let mut r = router(3);
        let contexts = [
            vec![1.0, 0.5, 0.2],
            vec![1.0, 2.0, 1.8],
            vec![1.0, 0.0, 0.0],
        ];
        for (i, x) in contexts.iter().cycle().take(60).enumerate() {
            r.bulk_update(x, &rewards(&[("a", (i % 10) as f64 / 10.0)]), None);
        }
        let blob = r.state_blob().expect("blob");
        let a = &blob.arms["a"].a_inv;
        let d = 3;
        for i in 0..d {
            for j in 0..d {
                assert!(
                    (a[i * d + j] - a[j * d + i]).abs() < 1e-9,
                    "A_inv must remain symmetric"
                );
            }
            assert!(a[i * d + i] > 0.0, "diagonal must stay positive");
        }
        // PSD check via quadratic form on a few probes.
        for x in &contexts {
            let ax = mat_vec(a, d, x);
            assert!(dot(x, &ax) >= -1e-9, "quadratic form went negative");
        }
    }
}
