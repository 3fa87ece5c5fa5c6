//! Per-model preview latency tracking.
//!
//! Each model keeps a bounded FIFO of recent preview wall-clock latencies
//! (default capacity 128). The p95 of that window feeds the router's
//! latency bias and the reward policy's latency term. Losing this state is
//! harmless: p95 reports 0 until samples accumulate again.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;

use crate::ModelId;

/// Default ring capacity per model.
pub const DEFAULT_WINDOW: usize = 128;

#[derive(Debug, Default)]
struct Ring {
    samples: VecDeque<f64>,
}

/// Thread-safe rolling latency windows, keyed by model.
///
/// `record` and `p95` may be called concurrently from any task; per-model
/// entries are guarded by the map's shard locks.
#[derive(Debug)]
pub struct LatencyMetrics {
    rings: DashMap<ModelId, Ring>,
    cache_hits: DashMap<ModelId, u64>,
    capacity: usize,
}

impl Default for LatencyMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl LatencyMetrics {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: DashMap::new(),
            cache_hits: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append one latency sample for `model`, evicting the oldest sample
    /// once the window is full. Non-positive or non-finite samples are
    /// dropped.
    pub fn record(&self, model: &ModelId, latency_seconds: f64) {
        if !latency_seconds.is_finite() || latency_seconds <= 0.0 {
            return;
        }
        let mut ring = self.rings.entry(model.clone()).or_default();
        ring.samples.push_back(latency_seconds);
        while ring.samples.len() > self.capacity {
            ring.samples.pop_front();
        }
    }

    /// 95th percentile of the model's window (linear interpolation), or
    /// 0.0 when no samples exist.
    pub fn p95(&self, model: &ModelId) -> f64 {
        let Some(ring) = self.rings.get(model) else {
            return 0.0;
        };
        percentile(&ring.samples, 0.95)
    }

    /// Number of samples currently held for `model`.
    pub fn sample_count(&self, model: &ModelId) -> usize {
        self.rings.get(model).map_or(0, |r| r.samples.len())
    }

    /// Count a preview served from cache for `model`.
    pub fn record_cache_hit(&self, model: &ModelId) {
        *self.cache_hits.entry(model.clone()).or_insert(0) += 1;
    }

    pub fn cache_hits(&self, model: &ModelId) -> u64 {
        self.cache_hits.get(model).map_or(0, |v| *v)
    }

    /// Snapshot for observability output.
    pub fn snapshot(&self) -> LatencySnapshot {
        let mut models: Vec<ModelLatency> = self
            .rings
            .iter()
            .map(|entry| ModelLatency {
                model: entry.key().clone(),
                p95_seconds: percentile(&entry.value().samples, 0.95),
                samples: entry.value().samples.len(),
                cache_hits: self.cache_hits(entry.key()),
            })
            .collect();
        models.sort_by(|a, b| a.model.cmp(&b.model));
        LatencySnapshot { models }
    }
}

/// Per-model entry in a [`LatencySnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ModelLatency {
    pub model: ModelId,
    pub p95_seconds: f64,
    pub samples: usize,
    pub cache_hits: u64,
}

/// Point-in-time view of every tracked model.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub models: Vec<ModelLatency>,
}

/// Normalize a p95 latency against a reference window that widens with
/// query length: 3 s for empty queries up to 6 s at `length_threshold`.
/// Returns a value in [0, 1].
pub fn latency_norm(query_len: usize, p95_seconds: f64, length_threshold: usize) -> f64 {
    if !p95_seconds.is_finite() || p95_seconds <= 0.0 {
        return 0.0;
    }
    let reference = reference_latency(query_len, length_threshold);
    (p95_seconds / reference).clamp(0.0, 1.0)
}

/// Latency allowance for a query of `query_len` characters.
pub fn reference_latency(query_len: usize, length_threshold: usize) -> f64 {
    let norm_len = (query_len as f64 / length_threshold.max(1) as f64).clamp(0.0, 1.0);
    3.0 + 3.0 * norm_len
}

fn percentile(samples: &VecDeque<f64>, q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> ModelId {
        ModelId::new(s)
    }

    #[test]
    fn test_p95_empty_is_zero() {
        let lm = LatencyMetrics::default();
        assert_eq!(lm.p95(&m("a")), 0.0);
    }

    #[test]
    fn test_p95_single_sample_is_that_sample() {
        let lm = LatencyMetrics::default();
        lm.record(&m("a"), 2.5);
        assert!((lm.p95(&m("a")) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_p95_of_uniform_ramp() {
        let lm = LatencyMetrics::default();
        for i in 1..=100 {
            lm.record(&m("a"), i as f64);
        }
        let p = lm.p95(&m("a"));
        assert!(p > 94.0 && p < 97.0, "p95 of 1..=100 should be ~95, got {p}");
    }

    #[test]
    fn test_window_evicts_oldest() {
        let lm = LatencyMetrics::new(4);
        for i in 1..=10 {
            lm.record(&m("a"), i as f64);
        }
        assert_eq!(lm.sample_count(&m("a")), 4);
        // Only 7..=10 remain, so p95 must exceed 9.
        assert!(lm.p95(&m("a")) > 9.0);
    }

    #[test]
    fn test_record_rejects_nonpositive_and_nan() {
        let lm = LatencyMetrics::default();
        lm.record(&m("a"), 0.0);
        lm.record(&m("a"), -1.0);
        lm.record(&m("a"), f64::NAN);
        assert_eq!(lm.sample_count(&m("a")), 0);
    }

    #[test]
    fn test_cache_hit_counter() {
        let lm = LatencyMetrics::default();
        assert_eq!(lm.cache_hits(&m("a")), 0);
        lm.record_cache_hit(&m("a"));
        lm.record_cache_hit(&m("a"));
        assert_eq!(lm.cache_hits(&m("a")), 2);
    }

    #[test]
    fn test_latency_norm_widens_with_query_length() {
        // Same p95 is penalised less on a longer query.
        let short = latency_norm(0, 4.0, 2000);
        let long = latency_norm(2000, 4.0, 2000);
        assert!(short > long);
        assert!((short - 1.0).abs() < 1e-12, "4s over a 3s window clamps to 1");
        assert!((long - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_latency_norm_zero_when_no_signal() {
        assert_eq!(latency_norm(100, 0.0, 2000), 0.0);
        assert_eq!(latency_norm(100, f64::NAN, 2000), 0.0);
    }

    #[test]
    fn test_snapshot_sorted_by_model() {
        let lm = LatencyMetrics::default();
        lm.record(&m("zeta"), 1.0);
        lm.record(&m("alpha"), 2.0);
        let snap = lm.snapshot();
        assert_eq!(snap.models.len(), 2);
        assert_eq!(snap.models[0].model.as_str(), "alpha");
    }
}
