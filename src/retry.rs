//! Exponential backoff for transient backend failures.
//!
//! Used by the preview stage and the judge. Permanent errors are never
//! retried; the predicate passed to [`retry_transient`] decides.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Backoff schedule: exponential growth from `initial_delay`, capped at
/// `max_delay`.
#[derive(Clone, Debug)]
pub struct Backoff {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// Exponential backoff with a 60 s delay cap and 2x growth.
    pub fn exponential(max_attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    /// Delay to sleep after the given 1-based failed attempt.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let ms = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(ms as u64).min(self.max_delay)
    }

    /// Add up to 25% random jitter to a delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        use rand::Rng;
        let quarter = delay.as_millis() / 4;
        if quarter == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..quarter);
        delay + Duration::from_millis(jitter as u64)
    }
}

/// Run `op` until it succeeds, the error is not transient, or attempts are
/// exhausted. Sleeps the backoff delay between attempts.
pub async fn retry_transient<F, Fut, T, E, P>(
    backoff: &Backoff,
    mut op: F,
    mut is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation recovered after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                if !is_transient(&e) {
                    warn!(error = %e, "error is not transient, giving up");
                    return Err(e);
                }
                if attempt >= backoff.max_attempts {
                    warn!(attempts = attempt, error = %e, "retry budget exhausted");
                    return Err(e);
                }
                let delay = backoff.jittered(backoff.delay_for(attempt));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_doubles_each_attempt() {
        let b = Backoff::exponential(4, Duration::from_millis(10));
        assert_eq!(b.delay_for(1), Duration::from_millis(10));
        assert_eq!(b.delay_for(2), Duration::from_millis(20));
        assert_eq!(b.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let mut b = Backoff::exponential(10, Duration::from_millis(100));
        b.max_delay = Duration::from_millis(250);
        assert_eq!(b.delay_for(5), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_retry_recovers_on_transient() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let b = Backoff::exponential(5, Duration::from_millis(1));
        let out = retry_transient(
            &b,
            || {
                let seen = seen.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky")
                    } else {
                        Ok("done")
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(out, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let b = Backoff::exponential(5, Duration::from_millis(1));
        let out: Result<(), &str> = retry_transient(
            &b,
            || {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err("permanent")
                }
            },
            |_| false,
        )
        .await;
        assert!(out.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let b = Backoff::exponential(3, Duration::from_millis(1));
        let out: Result<(), &str> = retry_transient(&b, || async { Err("always") }, |_| true).await;
        assert!(out.is_err());
    }
}
