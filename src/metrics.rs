//! Prometheus metrics for the race pipeline.
//!
//! Call [`init_metrics`] once at process startup. Every helper is a no-op
//! when metrics were never initialised, so the library always runs —
//! observability degrades gracefully instead of failing the race.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `race_phase_total` | Counter | `phase` |
//! | `race_errors_total` | Counter | `phase`, `err_type` |
//! | `race_phase_duration_seconds` | Histogram | `phase` |
//! | `race_cache_hits_total` | Counter | `model` |
//! | `race_fallbacks_total` | Counter | — |
//! | `race_tokens_total` | Counter | `kind` (`preview` / `full`) |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("metrics init failed: {0}")]
pub struct MetricsError(String);

struct Metrics {
    registry: Registry,
    phase_total: CounterVec,
    errors_total: CounterVec,
    phase_duration: HistogramVec,
    cache_hits: CounterVec,
    fallbacks: IntCounter,
    tokens_total: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C: prometheus::core::Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C, MetricsError> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| MetricsError(e.to_string()))?;
    Ok(collector)
}

/// Initialise all metrics against a private registry. Idempotent: a
/// second call is a no-op returning `Ok`.
pub fn init_metrics() -> Result<(), MetricsError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let phase_total = register(
        &registry,
        CounterVec::new(
            Opts::new("race_phase_total", "Races entering each phase"),
            &["phase"],
        )
        .map_err(|e| MetricsError(e.to_string()))?,
    )?;
    let errors_total = register(
        &registry,
        CounterVec::new(
            Opts::new("race_errors_total", "Errors by phase and type"),
            &["phase", "err_type"],
        )
        .map_err(|e| MetricsError(e.to_string()))?,
    )?;
    let phase_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new("race_phase_duration_seconds", "Wall-clock per phase"),
            &["phase"],
        )
        .map_err(|e| MetricsError(e.to_string()))?,
    )?;
    let cache_hits = register(
        &registry,
        CounterVec::new(
            Opts::new("race_cache_hits_total", "Preview cache hits per model"),
            &["model"],
        )
        .map_err(|e| MetricsError(e.to_string()))?,
    )?;
    let fallbacks = register(
        &registry,
        IntCounter::new("race_fallbacks_total", "Full attempts that fell back")
            .map_err(|e| MetricsError(e.to_string()))?,
    )?;
    let tokens_total = register(
        &registry,
        CounterVec::new(
            Opts::new("race_tokens_total", "Tokens consumed by kind"),
            &["kind"],
        )
        .map_err(|e| MetricsError(e.to_string()))?,
    )?;

    // First initialiser wins; both produce identical descriptors.
    let _ = METRICS.set(Metrics {
        registry,
        phase_total,
        errors_total,
        phase_duration,
        cache_hits,
        fallbacks,
        tokens_total,
    });
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Count a race entering `phase`.
pub fn inc_phase(phase: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.phase_total.get_metric_with_label_values(&[phase]) {
            c.inc();
        }
    }
}

/// Count an error in `phase` of the given type.
pub fn inc_error(phase: &str, err_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .errors_total
            .get_metric_with_label_values(&[phase, err_type])
        {
            c.inc();
        }
    }
}

/// Record wall-clock time spent in `phase`.
pub fn record_phase_duration(phase: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.phase_duration.get_metric_with_label_values(&[phase]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count a preview served from cache for `model`.
pub fn inc_cache_hit(model: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_hits.get_metric_with_label_values(&[model]) {
            c.inc();
        }
    }
}

/// Count one full-stage fallback.
pub fn inc_fallback() {
    if let Some(m) = metrics() {
        m.fallbacks.inc();
    }
}

/// Add consumed tokens of the given kind (`"preview"` or `"full"`).
pub fn add_tokens(kind: &str, tokens: u64) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.tokens_total.get_metric_with_label_values(&[kind]) {
            c.inc_by(tokens as f64);
        }
    }
}

/// Encode all metrics in the Prometheus text exposition format. Empty
/// string when metrics were never initialised.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_before_init_do_not_panic() {
        // The global may already be initialised by another test; either
        // way these must not panic.
        inc_phase("preview");
        inc_error("judge", "timeout");
        record_phase_duration("full", Duration::from_millis(3));
        inc_cache_hit("gpt-a");
        inc_fallback();
        add_tokens("preview", 120);
    }

    #[test]
    fn test_gather_metrics_valid_utf8() {
        let _ = init_metrics();
        inc_phase("select");
        let out = gather_metrics();
        assert!(std::str::from_utf8(out.as_bytes()).is_ok());
        assert!(out.contains("race_phase_total"));
    }
}
