//! # Stage: Candidate Routing Intelligence
//!
//! ## Responsibility
//! Decide which candidate backends to engage for a query and in what
//! order, and adapt those decisions over time from observed rewards.
//! Two implementations: a fixed-order baseline (control) and a LinUCB
//! contextual bandit with Sherman–Morrison incremental updates.
//!
//! ## Guarantees
//! - Deterministic: the same state, context, and candidate list always
//!   produce the same ranking.
//! - Dimension-disciplined: contexts of the wrong length are rejected at
//!   the boundary, never fed to matrix code.
//! - Recoverable: persisted state that fails the version/dimension gate
//!   degrades to a cold start, never to a corrupt router.
//!
//! ## NOT Responsible For
//! - Running previews or full answers (that belongs to `race`)
//! - Computing rewards (that belongs to `reward`)
//! - Collecting latency samples (that belongs to `latency`)

pub mod baseline;
pub mod linucb;
pub mod state;

use std::collections::HashMap;

use crate::ModelId;

// Re-exports for convenience
pub use baseline::BaselineRouter;
pub use linucb::{LinUcbConfig, LinUcbRouter};
pub use state::{
    ArmStateBlob, LocalFileStore, NullStateStore, RouterStateBlob, RouterStateStore,
    StateStoreError, TieredStateStore, ROUTER_STATE_VERSION,
};

#[cfg(feature = "redis-backend")]
pub use state::RedisStateStore;

/// Candidate selection and reward feedback for one query.
///
/// Implementations are driven under the orchestrator's router mutex, so
/// methods take `&mut self` and stay synchronous; persistence I/O happens
/// outside through [`RouterStateStore`] using [`Router::state_blob`].
pub trait Router: Send + Sync {
    /// Context dimension this router was configured with.
    fn dim(&self) -> usize;

    /// Rank `candidates` for `context`, best first. `top_k` truncates the
    /// result when given. May return fewer models than asked (e.g.
    /// deactivated arms); an empty result means nothing is selectable.
    fn select(
        &mut self,
        context: &[f64],
        candidates: &[ModelId],
        top_k: Option<usize>,
    ) -> Vec<ModelId>;

    /// Apply one round of rewards. `winner` is the judge's top-ranked
    /// model and feeds the per-arm win counters.
    fn bulk_update(
        &mut self,
        context: &[f64],
        rewards: &HashMap<ModelId, f64>,
        winner: Option<&ModelId>,
    );

    /// Forget stale evidence: scale uncertainty up and responses down by
    /// `factor ∈ (0, 1]`.
    fn decay(&mut self, factor: f64);

    /// Deactivate arms with at least `min_trials` trials and a win rate
    /// below `min_win_rate`.
    fn prune(&mut self, min_trials: u64, min_win_rate: f64);

    /// Operator-driven re-activation of a pruned arm.
    fn reactivate(&mut self, model: &ModelId) -> bool;

    /// Serializable state, or `None` for stateless routers.
    fn state_blob(&self) -> Option<RouterStateBlob>;
}
