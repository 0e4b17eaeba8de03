//! Bounded retry with exponential backoff and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Policy for retrying a fallible async operation.
///
/// With `base_delay_ms == max_delay_ms` the delay is effectively fixed,
/// which is how the tunnel and gateway defaults are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        }
    }

    /// Same delay between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self::new(ms, ms, max_attempts)
    }

    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self::new(0, 0, 1)
    }

    /// Calculate the backoff delay for a given attempt (0-based) with jitter.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay_ms = self.raw_delay_ms(attempt);
        let jittered_ms = Self::apply_jitter(delay_ms);
        Duration::from_millis(jittered_ms.min(self.max_delay_ms))
    }

    fn raw_delay_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.min(63);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        delay.min(self.max_delay_ms)
    }

    fn apply_jitter(delay_ms: u64) -> u64 {
        let mut rng = rand::thread_rng();
        let jitter: f64 = rng.gen_range(0.9..=1.1);
        ((delay_ms as f64) * jitter).round().max(0.0) as u64
    }

    /// Run `op` until it succeeds or `max_attempts` is exhausted.
    ///
    /// `op` receives the 0-based attempt index. The error of the last attempt
    /// is returned. A policy with `max_attempts == 0` still runs once.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= attempts => {
                    tracing::warn!(attempt = attempt + 1, "giving up after {} attempts: {}", attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_with_jitter(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn raw_delay_grows_exponentially_with_cap() {
        let policy = RetryPolicy::new(1000, 30_000, 5);
        assert_eq!(policy.raw_delay_ms(0), 1000);
        assert_eq!(policy.raw_delay_ms(1), 2000);
        assert_eq!(policy.raw_delay_ms(2), 4000);
        assert_eq!(policy.raw_delay_ms(3), 8000);
        assert_eq!(policy.raw_delay_ms(4), 16_000);
        assert_eq!(policy.raw_delay_ms(5), 30_000);
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(4, Duration::from_secs(2));
        assert_eq!(policy.raw_delay_ms(0), 2000);
        assert_eq!(policy.raw_delay_ms(3), 2000);
        assert!(policy.delay_with_jitter(3) <= Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::new(1000, 30_000, 6);
        for attempt in 0..6 {
            let base = policy.raw_delay_ms(attempt);
            let min = (base as f64 * 0.9).round() as u64;
            let max = ((base as f64 * 1.1).round() as u64).min(30_000);
            for _ in 0..200 {
                let delay = policy.delay_with_jitter(attempt).as_millis() as u64;
                assert!((min..=max).contains(&delay), "attempt {attempt}: {delay} not in {min}..={max}");
            }
        }
    }

    #[test]
    fn jitter_actually_varies() {
        let policy = RetryPolicy::new(1000, 30_000, 5);
        let samples: std::collections::HashSet<Duration> =
            (0..200).map(|_| policy.delay_with_jitter(3)).collect();
        assert!(samples.len() > 1);
    }

    #[tokio::test]
    async fn run_stops_at_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(4, Duration::from_millis(5));

        let counter = calls.clone();
        let result: Result<u32, String> = policy
            .run(|attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 { Err("not yet".to_string()) } else { Ok(attempt) }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_returns_last_error_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(4, Duration::from_millis(5));

        let counter = calls.clone();
        let result: Result<(), String> = policy
            .run(|attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure {attempt}"))
                }
            })
            .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, 0, 0);
        let result: Result<(), &str> = policy.run(|_| async { Err("nope") }).await;
        assert_eq!(result, Err("nope"));
    }
}
