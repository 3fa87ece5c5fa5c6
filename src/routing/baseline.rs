//! Fixed-order baseline router.
//!
//! Returns candidates exactly as supplied and learns nothing. Serves as
//! the A/B control for the bandit and as the fallback when bandit state
//! is unavailable.

use std::collections::HashMap;

use super::state::RouterStateBlob;
use super::Router;
use crate::ModelId;

#[derive(Debug, Default)]
pub struct BaselineRouter {
    dim: usize,
}

impl BaselineRouter {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Router for BaselineRouter {
    fn dim(&self) -> usize {
        self.dim
    }

    fn select(
        &mut self,
        _context: &[f64],
        candidates: &[ModelId],
        top_k: Option<usize>,
    ) -> Vec<ModelId> {
        let mut out = candidates.to_vec();
        if let Some(k) = top_k {
            out.truncate(k.max(1));
        }
        out
    }

    fn bulk_update(
        &mut self,
        _context: &[f64],
        _rewards: &HashMap<ModelId, f64>,
        _winner: Option<&ModelId>,
    ) {
    }

    fn decay(&mut self, _factor: f64) {}

    fn prune(&mut self, _min_trials: u64, _min_win_rate: f64) {}

    fn reactivate(&mut self, _model: &ModelId) -> bool {
        false
    }

    fn state_blob(&self) -> Option<RouterStateBlob> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_preserves_order() {
        let mut r = BaselineRouter::new(3);
        let candidates: Vec<ModelId> = ["c", "a", "b"].iter().map(|s| ModelId::new(*s)).collect();
        let ranked = r.select(&[1.0, 0.0, 0.0], &candidates, None);
        assert_eq!(ranked, candidates);
    }

    #[test]
    fn test_baseline_update_is_noop_and_stateless() {
        let mut r = BaselineRouter::new(3);
        let rewards: HashMap<ModelId, f64> = [(ModelId::new("a"), 0.9)].into_iter().collect();
        r.bulk_update(&[1.0, 0.0, 0.0], &rewards, None);
        assert!(r.state_blob().is_none());
    }

    #[test]
    fn test_baseline_top_k() {
        let mut r = BaselineRouter::new(3);
        let candidates: Vec<ModelId> = ["a", "b", "c"].iter().map(|s| ModelId::new(*s)).collect();
        let ranked = r.select(&[1.0, 0.0, 0.0], &candidates, Some(1));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].as_str(), "a");
    }
}
