//! End-to-end race scenarios over scripted backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_model_race::client::{ClientError, TokenStream};
use tokio_model_race::config::Strategy;
use tokio_model_race::judge::StaticJudge;
use tokio_model_race::routing::{LocalFileStore, RouterStateStore, ROUTER_STATE_VERSION};
use tokio_model_race::{
    ModelClient, ModelId, Query, RaceConfig, RaceError, RaceOrchestrator, ScriptedClient,
};

fn config(models: &[&str]) -> RaceConfig {
    RaceConfig {
        candidate_models: models.iter().map(|s| s.to_string()).collect(),
        judge_model: "judge".into(),
        bandit_state: None,
        ..RaceConfig::default()
    }
}

fn client(name: &str, first_token_ms: u64, total_tokens: u64) -> Arc<ScriptedClient> {
    Arc::new(
        ScriptedClient::new(name)
            .with_first_token_delay(Duration::from_millis(first_token_ms))
            .with_batch_delay(Duration::from_millis(1))
            .with_batch_size(10)
            .with_total_tokens(total_tokens),
    )
}

/// Succeeds for the first `ok_calls` streams, then fails transiently.
/// Lets a model preview cleanly but collapse in the full stage.
struct FailsAfter {
    inner: ScriptedClient,
    calls: AtomicUsize,
    ok_calls: usize,
}

impl FailsAfter {
    fn new(name: &str, ok_calls: usize) -> Self {
        Self {
            inner: ScriptedClient::new(name)
                .with_first_token_delay(Duration::from_millis(1))
                .with_batch_delay(Duration::ZERO)
                .with_total_tokens(40),
            calls: AtomicUsize::new(0),
            ok_calls,
        }
    }
}

#[async_trait]
impl ModelClient for FailsAfter {
    fn id(&self) -> &ModelId {
        self.inner.id()
    }

    async fn stream(
        &self,
        prompt: &str,
        token_cap: Option<u64>,
    ) -> Result<TokenStream, ClientError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > self.ok_calls {
            return Err(ClientError::Transient("scripted full-stage failure".into()));
        }
        self.inner.stream(prompt, token_cap).await
    }
}

// ── S1: baseline ordering ───────────────────────────────────────────────

#[tokio::test]
async fn s1_baseline_follows_judge_and_keeps_router_stateless() {
    let cfg = config(&["A", "B", "C"]);
    let orch = RaceOrchestrator::builder(cfg)
        .client(client("A", 1, 40))
        .client(client("B", 1, 40))
        .client(client("C", 1, 40))
        .judge(Arc::new(StaticJudge::from_pairs(&[
            ("A", 0.5),
            ("B", 0.95),
            ("C", 0.4),
        ])))
        .build()
        .await
        .expect("build");

    let result = orch.run(&Query::new("which model wins?")).await.expect("race");
    assert_eq!(result.winner.as_str(), "B");

    // All three previewed.
    assert_eq!(result.summary.models.len(), 3);
    for row in &result.summary.models {
        assert!(row.preview_tokens > 0, "{} did not preview", row.model);
    }

    // Reward for the judged winner beats the others.
    let reward = |name: &str| {
        result
            .summary
            .models
            .iter()
            .find(|r| r.model.as_str() == name)
            .and_then(|r| r.reward)
            .expect("reward present")
    };
    assert!(reward("B") > reward("A"));
    assert!(reward("B") > reward("C"));

    // Baseline router carries no state.
    let router = orch.router();
    assert!(router.lock().await.state_blob().is_none());
}

#[tokio::test]
async fn s1b_fallback_cascade_follows_judge_order() {
    // B ranks first but fails its full attempt; A ranks second and wins.
    let cfg = config(&["A", "B", "C"]);
    let b = Arc::new(FailsAfter::new("B", 1)); // preview ok, full fails
    let orch = RaceOrchestrator::builder(cfg)
        .client(client("A", 1, 40))
        .client(b)
        .client(client("C", 1, 40))
        .judge(Arc::new(StaticJudge::from_pairs(&[
            ("A", 0.6),
            ("B", 0.95),
            ("C", 0.4),
        ])))
        .build()
        .await
        .expect("build");

    let result = orch.run(&Query::new("cascade?")).await.expect("race");
    assert_eq!(result.winner.as_str(), "A");
    assert_eq!(result.summary.fallbacks, 1);

    let b_row = result
        .summary
        .models
        .iter()
        .find(|r| r.model.as_str() == "B")
        .expect("B row");
    assert!(b_row.full_attempted);
    assert_ne!(
        b_row.full_status,
        Some(tokio_model_race::FullStatus::Ok),
        "B's full attempt must be recorded as failed"
    );

    // The fallback penalty shows up in B's reward despite its top score.
    let a_row = result
        .summary
        .models
        .iter()
        .find(|r| r.model.as_str() == "A")
        .expect("A row");
    assert!(b_row.reward.expect("b reward") < 0.95);
    assert!(a_row.reward.expect("a reward") > 0.0);
}

// ── S2: LinUCB first-pick accuracy ──────────────────────────────────────

#[tokio::test]
async fn s2_trained_bandit_picks_the_specialist_deterministically() {
    use std::collections::HashMap;
    use tokio_model_race::latency::LatencyMetrics;
    use tokio_model_race::routing::{LinUcbConfig, Router};
    use tokio_model_race::LinUcbRouter;

    let mut router = LinUcbRouter::new(
        LinUcbConfig {
            dim: 3,
            ..LinUcbConfig::default()
        },
        Arc::new(LatencyMetrics::default()),
    );

    let long_ctx = vec![1.0, 2.0, 1.2]; // 4000 chars against a 2000 threshold, clipped at 2
    let short_ctx = vec![1.0, 0.3, 0.2];
    let reward =
        |pairs: &[(&str, f64)]| -> HashMap<ModelId, f64> {
            pairs.iter().map(|(m, r)| (ModelId::new(*m), *r)).collect()
        };
    for _ in 0..50 {
        router.bulk_update(&long_ctx, &reward(&[("A", 1.0), ("B", 0.0), ("C", 0.0)]), None);
        router.bulk_update(&short_ctx, &reward(&[("A", 0.0), ("B", 1.0), ("C", 0.0)]), None);
    }

    let arms: Vec<ModelId> = ["A", "B", "C"].iter().map(|s| ModelId::new(*s)).collect();
    // Deterministic: repeated selection always puts A first for the long
    // context.
    for _ in 0..10 {
        let ranked = router.select(&long_ctx, &arms, None);
        assert_eq!(ranked[0].as_str(), "A");
    }
}

// ── S3: Sherman–Morrison single-update estimate ─────────────────────────

#[tokio::test]
async fn s3_single_update_yields_expected_posterior_mean() {
    use std::collections::HashMap;
    use tokio_model_race::latency::LatencyMetrics;
    use tokio_model_race::routing::{LinUcbConfig, Router};
    use tokio_model_race::LinUcbRouter;

    let mut router = LinUcbRouter::new(
        LinUcbConfig {
            dim: 4,
            ..LinUcbConfig::default()
        },
        Arc::new(LatencyMetrics::default()),
    );
    let x = vec![1.0, 0.0, 0.0, 0.0];
    let rewards: HashMap<ModelId, f64> = [(ModelId::new("A"), 0.5)].into_iter().collect();
    router.bulk_update(&x, &rewards, None);

    let blob = router.state_blob().expect("blob");
    let arm = &blob.arms["A"];
    let d = 4;
    // theta·x = first component of A_inv·b.
    let theta_x: f64 = (0..d).map(|j| arm.a_inv[j] * arm.b[j]).sum();
    assert!(
        (theta_x - 0.5).abs() < 0.01,
        "posterior mean at x should be ≈ 0.5, got {theta_x}"
    );
}

// ── S4: speculative cancellation ────────────────────────────────────────

#[tokio::test]
async fn s4_speculative_winner_streams_and_loser_is_cancelled() {
    let cfg = RaceConfig {
        speculative_min_query_length: 2000,
        ..config(&["fast", "slow"])
    };
    let fast = client("fast", 100, 400);
    let slow = client("slow", 500, 400);
    let orch = RaceOrchestrator::builder(cfg)
        .client(fast.clone())
        .client(slow.clone())
        .judge(Arc::new(StaticJudge::from_pairs(&[
            ("fast", 0.7),
            ("slow", 0.7),
        ])))
        .build()
        .await
        .expect("build");

    let long_query = Query::new("q ".repeat(2500)); // 5000 chars
    let result = orch.run(&long_query).await.expect("race");
    assert_eq!(result.winner.as_str(), "fast");

    // The loser only ever spent preview tokens (cap = 180 for a long
    // query); its full stream was cancelled before its first batch.
    let preview_cap = 180;
    assert!(
        slow.emitted_tokens() <= preview_cap,
        "loser emitted {} tokens, expected only the preview",
        slow.emitted_tokens()
    );
    // Give any runaway producer a window to betray itself.
    let after = slow.emitted_tokens();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(slow.emitted_tokens(), after, "loser kept streaming after cancellation");

    let slow_row = result
        .summary
        .models
        .iter()
        .find(|r| r.model.as_str() == "slow")
        .expect("slow row");
    assert!(
        !slow_row.full_attempted,
        "a cancelled speculative loser is not a fallback attempt"
    );
}

// ── S5: version-mismatch reset ──────────────────────────────────────────

#[tokio::test]
async fn s5_version_mismatched_state_cold_starts_then_persists_fresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("router_state.json");

    // A blob from the future-past: wrong version, wrong dimension.
    let stale = serde_json::json!({
        "version": 0,
        "d": 7,
        "arms": {
            "A": {"a_inv": vec![0.0; 49], "b": vec![0.0; 7], "trials": 12, "wins": 9}
        },
        "updated_at": "2020-01-01T00:00:00Z"
    });
    std::fs::write(&path, stale.to_string()).expect("seed stale state");

    let cfg = RaceConfig {
        strategy: Strategy::Bandit,
        bandit_state: Some(path.display().to_string()),
        ..config(&["A", "B"])
    };
    let orch = RaceOrchestrator::builder(cfg)
        .client(client("A", 1, 40))
        .client(client("B", 1, 40))
        .judge(Arc::new(StaticJudge::from_pairs(&[("A", 0.8), ("B", 0.3)])))
        .build()
        .await
        .expect("build");

    // Cold start: the stale trials are gone, the race still works.
    orch.run(&Query::new("fresh start")).await.expect("race");

    let store = LocalFileStore::new(&path);
    let blob = store
        .load(3)
        .await
        .expect("load")
        .expect("fresh state persisted");
    assert_eq!(blob.version, ROUTER_STATE_VERSION);
    assert_eq!(blob.d, 3);
    assert_eq!(blob.arms["A"].trials, 1, "fresh state, not the stale 12 trials");
}

// ── S6: budget break ────────────────────────────────────────────────────

#[tokio::test]
async fn s6_token_budget_breach_fails_race_but_still_updates_router() {
    let cfg = RaceConfig {
        strategy: Strategy::Bandit,
        max_total_full_tokens: Some(100),
        ..config(&["big"])
    };
    let big = client("big", 1, 1000);
    let orch = RaceOrchestrator::builder(cfg)
        .client(big.clone())
        .judge(Arc::new(StaticJudge::from_pairs(&[("big", 0.9)])))
        .build()
        .await
        .expect("build");

    let result = orch.run(&Query::new("produce a lot")).await;
    match result {
        Err(RaceError::BudgetExceeded(_)) => {}
        other => panic!("expected budget breach, got {other:?}"),
    }

    // Stream stopped within a batch or two of the ceiling: preview
    // (≤ 91 for this query) plus full (≤ 100 + a 10-token batch, with one
    // more batch of slack for the in-flight channel).
    assert!(
        big.emitted_tokens() <= 250,
        "emitted {} tokens, budget did not bite",
        big.emitted_tokens()
    );

    // The reward update still happened for the participating model.
    let router = orch.router();
    let blob = router.lock().await.state_blob().expect("bandit state");
    assert_eq!(blob.arms["big"].trials, 1);
}

// ── Bandit learning across races ────────────────────────────────────────

#[tokio::test]
async fn bandit_strategy_persists_state_across_orchestrators() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    let cfg = RaceConfig {
        strategy: Strategy::Bandit,
        bandit_state: Some(path.display().to_string()),
        ..config(&["A", "B"])
    };

    let build = || async {
        RaceOrchestrator::builder(cfg.clone())
            .client(client("A", 1, 40))
            .client(client("B", 1, 40))
            .judge(Arc::new(StaticJudge::from_pairs(&[("A", 0.9), ("B", 0.2)])))
            .build()
            .await
            .expect("build")
    };

    let first = build().await;
    first.run(&Query::new("round one")).await.expect("race 1");
    drop(first);

    // A fresh orchestrator restores the persisted arms.
    let second = build().await;
    second.run(&Query::new("round two")).await.expect("race 2");
    let blob = second
        .router()
        .lock()
        .await
        .state_blob()
        .expect("bandit state");
    assert_eq!(blob.arms["A"].trials, 2, "state carried across processes");
}
