//! Query → context vector extraction for the bandit router.
//!
//! ## Responsibility
//! Map a [`Query`] deterministically onto a fixed-dimension real vector:
//! a constant bias slot, normalized length and word-count slots, and
//! (optionally) a seeded random projection of an external embedding.
//!
//! ## Guarantees
//! - `compute` always returns a vector of exactly `dim()` elements.
//! - Length/word slots are clipped to `[0, 2]`.
//! - The embedding projection matrix is seeded, so projections are
//!   reproducible across process restarts.
//! - Embedding backend failures are non-fatal: the embedding slots fall
//!   back to zeros and the failure is counted.
//!
//! ## NOT Responsible For
//! - Producing the raw embedding (that is the [`EmbeddingProvider`]'s job)
//! - Deciding how the vector is used (that belongs to `routing`)

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use tracing::warn;

use crate::client::ClientError;
use crate::Query;

/// Default character threshold for length normalization.
pub const DEFAULT_LENGTH_THRESHOLD: usize = 2000;
/// Default word-count threshold.
pub const DEFAULT_WORD_THRESHOLD: usize = 400;
/// Source dimension assumed for raw embeddings before projection.
pub const EMBEDDING_SOURCE_DIM: usize = 1536;
/// Seed for the fixed random projection.
const PROJECTION_SEED: u64 = 42;

/// Maps queries to context vectors of a fixed dimension.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Output dimension; constant for the lifetime of the extractor.
    fn dim(&self) -> usize;

    /// Compute the context vector. Must return exactly `dim()` values.
    async fn compute(&self, query: &Query) -> Vec<f64>;
}

/// Opaque embedding backend. Implementations call out to whatever
/// embedding service the deployment uses.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ClientError>;
}

// ── Length features ─────────────────────────────────────────────────────

/// `[1.0, length_norm, word_count_norm]` with both norms clipped to [0, 2].
#[derive(Debug, Clone)]
pub struct LengthFeatures {
    length_threshold: usize,
    word_threshold: usize,
}

impl Default for LengthFeatures {
    fn default() -> Self {
        Self::new(DEFAULT_LENGTH_THRESHOLD, DEFAULT_WORD_THRESHOLD)
    }
}

impl LengthFeatures {
    pub fn new(length_threshold: usize, word_threshold: usize) -> Self {
        Self {
            length_threshold: length_threshold.max(1),
            word_threshold: word_threshold.max(1),
        }
    }

    fn slots(&self, query: &Query) -> [f64; 3] {
        let length_norm =
            (query.len_chars() as f64 / self.length_threshold as f64).clamp(0.0, 2.0);
        let word_norm = (query.word_count() as f64 / self.word_threshold as f64).clamp(0.0, 2.0);
        [1.0, length_norm, word_norm]
    }
}

#[async_trait]
impl FeatureExtractor for LengthFeatures {
    fn dim(&self) -> usize {
        3
    }

    async fn compute(&self, query: &Query) -> Vec<f64> {
        self.slots(query).to_vec()
    }
}

// ── Embedding features ──────────────────────────────────────────────────

/// Rolling per-slot mean/variance (Welford) for z-score normalization.
#[derive(Debug, Clone)]
struct RollingStats {
    count: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl RollingStats {
    fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    fn update(&mut self, sample: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for (i, &x) in sample.iter().enumerate() {
            let delta = x - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x - self.mean[i]);
        }
    }

    fn normalize(&self, sample: &[f64]) -> Vec<f64> {
        sample
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let var = if self.count > 1 {
                    self.m2[i] / (self.count - 1) as f64
                } else {
                    0.0
                };
                (x - self.mean[i]) / (var.sqrt() + 1e-6)
            })
            .collect()
    }
}

/// Projects an external embedding down to `k` slots through a fixed
/// seeded Gaussian matrix, then z-scores the result against rolling
/// statistics.
pub struct EmbeddingFeatures {
    provider: std::sync::Arc<dyn EmbeddingProvider>,
    projection: Vec<f64>, // k x EMBEDDING_SOURCE_DIM, row-major
    output_dim: usize,
    stats: Mutex<RollingStats>,
    failures: AtomicU64,
}

impl EmbeddingFeatures {
    pub fn new(provider: std::sync::Arc<dyn EmbeddingProvider>, output_dim: usize) -> Self {
        let output_dim = output_dim.max(1);
        let mut rng = StdRng::seed_from_u64(PROJECTION_SEED);
        let scale = 1.0 / (EMBEDDING_SOURCE_DIM as f64).sqrt();
        let projection = (0..output_dim * EMBEDDING_SOURCE_DIM)
            .map(|_| {
                let z: f64 = StandardNormal.sample(&mut rng);
                z * scale
            })
            .collect();
        Self {
            provider,
            projection,
            output_dim,
            stats: Mutex::new(RollingStats::new(output_dim)),
            failures: AtomicU64::new(0),
        }
    }

    /// Number of embedding calls that failed and fell back to zeros.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn project(&self, raw: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.output_dim];
        for (i, slot) in out.iter_mut().enumerate() {
            let row = &self.projection[i * EMBEDDING_SOURCE_DIM..(i + 1) * EMBEDDING_SOURCE_DIM];
            let mut s = 0.0;
            for (w, &x) in row.iter().zip(raw.iter()) {
                s += w * x;
            }
            *slot = s;
        }
        out
    }
}

#[async_trait]
impl FeatureExtractor for EmbeddingFeatures {
    fn dim(&self) -> usize {
        self.output_dim
    }

    async fn compute(&self, query: &Query) -> Vec<f64> {
        let text = query.text.trim();
        if text.is_empty() {
            return vec![0.0; self.output_dim];
        }
        let raw = match self.provider.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "embedding backend failed, using zero slots");
                crate::metrics::inc_error("features", "embedding");
                return vec![0.0; self.output_dim];
            }
        };
        let reduced = self.project(&raw);
        let mut stats = self.stats.lock();
        stats.update(&reduced);
        stats.normalize(&reduced)
    }
}

// ── Combined extractor ──────────────────────────────────────────────────

/// Length slots plus optional embedding slots: `d = 3 + k`.
pub struct CombinedFeatures {
    length: LengthFeatures,
    embedding: Option<EmbeddingFeatures>,
}

impl CombinedFeatures {
    pub fn new(length: LengthFeatures, embedding: Option<EmbeddingFeatures>) -> Self {
        Self { length, embedding }
    }

    pub fn length_only(length_threshold: usize, word_threshold: usize) -> Self {
        Self::new(LengthFeatures::new(length_threshold, word_threshold), None)
    }
}

#[async_trait]
impl FeatureExtractor for CombinedFeatures {
    fn dim(&self) -> usize {
        3 + self.embedding.as_ref().map_or(0, |e| e.dim())
    }

    async fn compute(&self, query: &Query) -> Vec<f64> {
        let mut out = self.length.slots(query).to_vec();
        if let Some(emb) = &self.embedding {
            out.extend(emb.compute(query).await);
        }
        out
    }
}
