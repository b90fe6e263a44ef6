//! Bounded retries with exponential backoff and jitter for operations
//! against external resources.
//!
//! Every adapter supplies its own classifier deciding which of its errors
//! are worth replaying; the retrier itself is error-type agnostic. When an
//! operation is bound to a reusable connection handle, the caller passes a
//! reset hook that rebuilds the handle before each replay.

use std::future::Future;
use std::time;

use rand::Rng;
use tracing::{error, warn};

#[derive(Copy, Clone, Debug)]
pub struct Retrier {
    /// Total number of attempts, the first one included.
    max_attempts: u32,
    /// The backoff interval after the first failed attempt.
    base_delay: time::Duration,
    /// The maximum possible backoff between attempts, pre-jitter.
    maximum_delay: time::Duration,
    exponential_backoff: bool,
    jitter: bool,
}

pub struct RetrierBuilder {
    max_attempts: u32,
    base_delay: time::Duration,
    maximum_delay: time::Duration,
    exponential_backoff: bool,
    jitter: bool,
}

impl RetrierBuilder {
    pub fn maximum_delay(mut self, maximum_delay: time::Duration) -> Self {
        self.maximum_delay = maximum_delay;
        self
    }

    pub fn exponential_backoff(mut self, exponential_backoff: bool) -> Self {
        self.exponential_backoff = exponential_backoff;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn provide(self) -> Retrier {
        Retrier {
            max_attempts: self.max_attempts.max(1),
            base_delay: self.base_delay,
            maximum_delay: self.maximum_delay,
            exponential_backoff: self.exponential_backoff,
            jitter: self.jitter,
        }
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Retrier::build(3, time::Duration::from_secs(1)).provide()
    }
}

impl Retrier {
    pub fn build(max_attempts: u32, base_delay: time::Duration) -> RetrierBuilder {
        RetrierBuilder {
            max_attempts,
            base_delay,
            maximum_delay: time::Duration::from_secs(5),
            exponential_backoff: true,
            jitter: true,
        }
    }

    /// Pre-jitter delay slept after the nth failed attempt (1-based):
    /// `min(base * 2^(n-1), max)`, or a flat `base` without backoff.
    pub fn delay(&self, attempt: u32) -> time::Duration {
        let delay = if self.exponential_backoff {
            let exponent = attempt.saturating_sub(1).min(31);
            self.base_delay.saturating_mul(1u32 << exponent)
        } else {
            self.base_delay
        };
        std::cmp::min(delay, self.maximum_delay)
    }

    fn sleep_interval(&self, attempt: u32) -> time::Duration {
        let delay = self.delay(attempt);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            delay
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is exhausted. Non-retryable errors are returned
    /// immediately without sleeping; on exhaustion the last observed error
    /// is returned unchanged.
    pub async fn run<T, E, Op, Fut, Retryable>(
        &self,
        operation: Op,
        is_retryable: Retryable,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        Retryable: Fn(&E) -> bool,
    {
        self.run_with_reset(operation, is_retryable, || std::future::ready(Ok(())))
            .await
    }

    /// Like `run`, but awaits `reset` before every replay so a stale
    /// connection handle can be rebuilt first. A reset failure is fatal for
    /// the wrapped call and is returned as-is.
    pub async fn run_with_reset<T, E, Op, Fut, Retryable, Reset, ResetFut>(
        &self,
        mut operation: Op,
        is_retryable: Retryable,
        mut reset: Reset,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        Retryable: Fn(&E) -> bool,
        Reset: FnMut() -> ResetFut,
        ResetFut: Future<Output = Result<(), E>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if !is_retryable(&err) => {
                    error!("operation failed with a non-retryable error: {}", err);
                    return Err(err);
                }
                Err(err) => {
                    if attempt >= self.max_attempts {
                        error!(
                            "operation failed after {} attempts, giving up: {}",
                            attempt, err
                        );
                        return Err(err);
                    }
                    let interval = self.sleep_interval(attempt);
                    warn!(
                        "operation failed on attempt {}/{}, retrying in {:?}: {}",
                        attempt, self.max_attempts, interval, err
                    );
                    tokio::time::sleep(interval).await;
                    attempt += 1;
                    if let Err(reset_err) = reset().await {
                        error!("failed to rebuild handle before retry: {}", reset_err);
                        return Err(reset_err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retrier(max_attempts: u32) -> Retrier {
        Retrier::build(max_attempts, time::Duration::from_millis(1))
            .maximum_delay(time::Duration::from_millis(4))
            .jitter(false)
            .provide()
    }

    #[tokio::test]
    async fn test_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = fast_retrier(3)
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Ok(42))
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_retrier(5)
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Err("syntax error".to_owned()))
                },
                |_| false,
            )
            .await;
        assert_eq!(result.unwrap_err(), "syntax error");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_retrier(3)
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    std::future::ready(Err(format!("connection reset #{}", n)))
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap_err(), "connection reset #3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, String> = fast_retrier(5)
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        std::future::ready(Err("broken pipe".to_owned()))
                    } else {
                        std::future::ready(Ok("done"))
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reset_runs_before_every_replay() {
        let calls = AtomicU32::new(0);
        let resets = AtomicU32::new(0);
        let result: Result<(), String> = fast_retrier(3)
            .run_with_reset(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Err("connection lost".to_owned()))
                },
                |_| true,
                || {
                    resets.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Ok(()))
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // No reset ahead of the first attempt, one before each replay.
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_failure_is_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_retrier(3)
            .run_with_reset(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Err("connection lost".to_owned()))
                },
                |_| true,
                || std::future::ready(Err("cannot reconnect".to_owned())),
            )
            .await;
        assert_eq!(result.unwrap_err(), "cannot reconnect");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delays_monotone_and_capped() {
        let retrier = Retrier::build(10, time::Duration::from_secs(1))
            .maximum_delay(time::Duration::from_secs(5))
            .jitter(false)
            .provide();

        let delays: Vec<_> = (1..=6).map(|attempt| retrier.delay(attempt)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(delays[0], time::Duration::from_secs(1));
        assert_eq!(delays[1], time::Duration::from_secs(2));
        assert_eq!(delays[2], time::Duration::from_secs(4));
        assert_eq!(delays[3], time::Duration::from_secs(5));
        assert_eq!(delays[5], time::Duration::from_secs(5));
    }

    #[test]
    fn test_flat_delay_without_backoff() {
        let retrier = Retrier::build(10, time::Duration::from_secs(1))
            .exponential_backoff(false)
            .jitter(false)
            .provide();
        for attempt in 1..=5 {
            assert_eq!(retrier.delay(attempt), time::Duration::from_secs(1));
        }
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let retrier = Retrier::build(3, time::Duration::from_secs(2))
            .maximum_delay(time::Duration::from_secs(60))
            .provide();
        let base = retrier.delay(1);
        for _ in 0..200 {
            let jittered = retrier.sleep_interval(1);
            assert!(jittered >= base.mul_f64(0.5));
            assert!(jittered < base.mul_f64(1.5));
        }
    }
}
