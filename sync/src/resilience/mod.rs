//! Retry, rate-limit and circuit-breaker wrapper for remote calls.
//!
//! Every remote call made by the runtime goes through
//! [`ResilienceLayer::execute_with_retry`]. Failures are classified by
//! [`RemoteError::classify`]:
//!
//! - rate limited: sleep until the reported reset (clamped) and try again
//!   without spending an attempt
//! - retryable: exponential backoff with jitter, up to `max_attempts`
//! - non-retryable: returned immediately
//!
//! The breaker counts failed calls, not failed attempts.

mod circuit;
mod stats;

pub use circuit::CircuitStatus;
pub use stats::ResilienceStats;

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::sleep;
use trellis_engine::Timestamp;

use crate::config::ResilienceConfig;
use crate::now_millis;
use crate::remote::{FailureClass, RateLimitStatus, RemoteClient, RemoteError};
use circuit::CircuitBreaker;
use stats::StatsCounters;

/// Why a wrapped call gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: RemoteError },

    #[error("non-retryable remote error: {0}")]
    NonRetryable(RemoteError),

    #[error("rate limit wait budget of {waited:?} exhausted: {last}")]
    RateLimitWaitExceeded { waited: Duration, last: RemoteError },
}

impl ResilienceError {
    /// The remote failure behind this error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::CircuitOpen => None,
            Self::RetriesExhausted { last, .. } | Self::RateLimitWaitExceeded { last, .. } => {
                Some(last)
            }
            Self::NonRetryable(e) => Some(e),
        }
    }
}

/// Chunking for [`ResilienceLayer::execute_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Operations run concurrently per chunk
    pub concurrency: usize,
    pub delay_between_batches: Duration,
}

impl From<&ResilienceConfig> for BatchOptions {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            concurrency: config.batch_concurrency,
            delay_between_batches: config.batch_delay,
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

/// Result of probing the remote quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCheck {
    pub status: RateLimitStatus,
    /// Suggested pause when the quota is at or below the buffer
    pub wait: Option<Duration>,
}

impl RateLimitCheck {
    pub fn should_wait(&self) -> bool {
        self.wait.is_some()
    }
}

/// How a call ended, for the breaker.
enum Verdict {
    Healthy,
    Failed,
    Neutral,
}

/// Wraps remote calls with retry, rate-limit handling and a circuit breaker.
///
/// Breaker state and statistics belong to the instance; share it behind an
/// `Arc` to share them.
#[derive(Debug)]
pub struct ResilienceLayer {
    config: ResilienceConfig,
    circuit: Mutex<CircuitBreaker>,
    stats: StatsCounters,
}

impl ResilienceLayer {
    pub fn new(config: ResilienceConfig) -> Self {
        let circuit = CircuitBreaker::new(config.circuit_threshold, config.circuit_cooldown);
        Self {
            config,
            circuit: Mutex::new(circuit),
            stats: StatsCounters::default(),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Run `operation` until it succeeds or the failure policy gives up.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        if !self.circuit.lock().await.try_acquire() {
            self.stats.circuit_rejection();
            tracing::debug!("Circuit breaker open, failing fast");
            return Err(ResilienceError::CircuitOpen);
        }

        let (result, verdict) = self.run_attempts(&mut operation).await;

        let mut circuit = self.circuit.lock().await;
        match verdict {
            Verdict::Healthy => circuit.record_success(),
            Verdict::Failed => {
                if circuit.record_failure() {
                    self.stats.circuit_trip();
                }
            }
            Verdict::Neutral => circuit.release_trial(),
        }

        if result.is_err() {
            self.stats.failure();
        }
        result
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        operation: &mut F,
    ) -> (Result<T, ResilienceError>, Verdict)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut rate_limit_waited = Duration::ZERO;

        loop {
            self.stats.attempt();
            let error = match operation().await {
                Ok(value) => {
                    self.stats.success(retries);
                    return (Ok(value), Verdict::Healthy);
                }
                Err(e) => e,
            };

            match error.classify() {
                FailureClass::RateLimited { reset_at } => {
                    self.stats.rate_limit_hit();
                    let wait = self.rate_limit_wait(reset_at);
                    if rate_limit_waited + wait > self.config.max_total_rate_limit_wait {
                        tracing::warn!(
                            waited_ms = rate_limit_waited.as_millis() as u64,
                            "Rate limit wait budget exhausted"
                        );
                        return (
                            Err(ResilienceError::RateLimitWaitExceeded {
                                waited: rate_limit_waited,
                                last: error,
                            }),
                            Verdict::Neutral,
                        );
                    }
                    tracing::warn!(
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, waiting for reset"
                    );
                    sleep(wait).await;
                    rate_limit_waited += wait;
                }
                FailureClass::NonRetryable => {
                    tracing::debug!(error = %error, "Non-retryable remote error");
                    return (Err(ResilienceError::NonRetryable(error)), Verdict::Healthy);
                }
                FailureClass::Retryable => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        tracing::warn!(attempts, error = %error, "Remote call failed, giving up");
                        return (
                            Err(ResilienceError::RetriesExhausted {
                                attempts,
                                last: error,
                            }),
                            Verdict::Failed,
                        );
                    }
                    let delay = self.backoff_delay(attempts);
                    tracing::warn!(
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Remote call failed, retrying"
                    );
                    self.stats.retry();
                    retries += 1;
                    sleep(delay).await;
                }
            }
        }
    }

    /// Run operations in chunks of `options.concurrency`, pausing between
    /// chunks. Results are in input order.
    pub async fn execute_batch<T, F, Fut>(
        &self,
        operations: Vec<F>,
        options: BatchOptions,
    ) -> Vec<Result<T, ResilienceError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let concurrency = options.concurrency.max(1);
        let mut results = Vec::with_capacity(operations.len());
        let mut pending = operations.into_iter().peekable();

        while pending.peek().is_some() {
            if !results.is_empty() && !options.delay_between_batches.is_zero() {
                sleep(options.delay_between_batches).await;
            }
            let chunk: Vec<F> = pending.by_ref().take(concurrency).collect();
            let outcomes = join_all(chunk.into_iter().map(|op| self.execute_with_retry(op))).await;
            results.extend(outcomes);
        }

        results
    }

    /// Probe the remote quota and suggest a pause when it is nearly spent.
    pub async fn check_rate_limit<C>(&self, client: &C) -> Result<RateLimitCheck, ResilienceError>
    where
        C: RemoteClient + ?Sized,
    {
        let status = self.execute_with_retry(move || client.rate_limit()).await?;
        let wait = if status.remaining <= self.config.rate_limit_buffer {
            let wait = self.rate_limit_wait(Some(status.reset_at));
            tracing::info!(
                remaining = status.remaining,
                limit = status.limit,
                wait_ms = wait.as_millis() as u64,
                "Remote quota low"
            );
            Some(wait)
        } else {
            None
        };
        Ok(RateLimitCheck { status, wait })
    }

    pub fn stats(&self) -> ResilienceStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub async fn circuit_status(&self) -> CircuitStatus {
        self.circuit.lock().await.status()
    }

    /// `base * 2^(attempt-1)` capped at `max_delay`, plus up to 25% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .config
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_delay);
        let max_jitter = delay.as_millis() as u64 / 4;
        let jitter = if max_jitter > 0 {
            rand::thread_rng().gen_range(0..=max_jitter)
        } else {
            0
        };
        (delay + Duration::from_millis(jitter)).min(self.config.max_delay)
    }

    fn rate_limit_wait(&self, reset_at: Option<Timestamp>) -> Duration {
        let raw = match reset_at {
            Some(reset_at) => Duration::from_millis(reset_at.saturating_sub(now_millis())),
            None => self.config.min_rate_limit_wait,
        };
        raw.clamp(
            self.config.min_rate_limit_wait,
            self.config.max_rate_limit_wait.max(self.config.min_rate_limit_wait),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            min_rate_limit_wait: Duration::from_millis(50),
            max_rate_limit_wait: Duration::from_millis(500),
            max_total_rate_limit_wait: Duration::from_millis(120),
            circuit_threshold: 2,
            circuit_cooldown: Duration::from_secs(10),
            ..ResilienceConfig::default()
        }
    }

    fn unavailable() -> RemoteError {
        RemoteError::Status {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let layer = ResilienceLayer::new(config());
        let calls = &AtomicU32::new(0);

        let result = layer
            .execute_with_retry(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        let stats = layer.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.avg_retries_per_success, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let layer = ResilienceLayer::new(config());
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = layer
            .execute_with_retry(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            })
            .await;

        assert_eq!(
            result,
            Err(ResilienceError::RetriesExhausted {
                attempts: 3,
                last: unavailable()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(layer.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let layer = ResilienceLayer::new(config());
        let calls = AtomicU32::new(0);
        let not_found = RemoteError::Status {
            status: 404,
            message: "missing".into(),
        };

        let result: Result<(), _> = layer
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                let e = not_found.clone();
                async move { Err(e) }
            })
            .await;

        assert_eq!(result, Err(ResilienceError::NonRetryable(not_found)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(layer.circuit_status().await, CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_does_not_spend_attempts() {
        let layer = ResilienceLayer::new(ResilienceConfig {
            max_attempts: 1,
            max_total_rate_limit_wait: Duration::from_secs(60),
            ..config()
        });
        let calls = &AtomicU32::new(0);

        let result = layer
            .execute_with_retry(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::RateLimited { reset_at: None })
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        let stats = layer.stats();
        assert_eq!(stats.rate_limit_hits, 2);
        assert_eq!(stats.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_wait_is_capped() {
        let layer = ResilienceLayer::new(config());

        let result: Result<(), _> = layer
            .execute_with_retry(|| async { Err(RemoteError::RateLimited { reset_at: None }) })
            .await;

        // 50ms waits against a 120ms budget: two waits, then give up
        assert_eq!(
            result,
            Err(ResilienceError::RateLimitWaitExceeded {
                waited: Duration::from_millis(100),
                last: RemoteError::RateLimited { reset_at: None },
            })
        );
        assert_eq!(layer.stats().rate_limit_hits, 3);
        assert_eq!(layer.circuit_status().await, CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_and_fails_fast() {
        let layer = ResilienceLayer::new(ResilienceConfig {
            max_attempts: 1,
            ..config()
        });
        let calls = &AtomicU32::new(0);
        let failing = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(unavailable())
        };

        let _ = layer.execute_with_retry(failing).await;
        let _ = layer.execute_with_retry(failing).await;
        assert_eq!(layer.circuit_status().await, CircuitStatus::Open);

        let rejected = layer.execute_with_retry(failing).await;
        assert_eq!(rejected, Err(ResilienceError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(layer.stats().circuit_trips, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = layer.execute_with_retry(|| async { Ok(()) }).await;
        assert_eq!(trial, Ok(()));
        assert_eq!(layer.circuit_status().await, CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_keeps_input_order() {
        let layer = ResilienceLayer::new(config());
        let operations: Vec<_> = (0..5u32)
            .map(|i| {
                move || async move {
                    if i == 3 {
                        Err(RemoteError::Status {
                            status: 422,
                            message: "bad".into(),
                        })
                    } else {
                        Ok(i * 10)
                    }
                }
            })
            .collect();

        let results = layer
            .execute_batch(
                operations,
                BatchOptions {
                    concurrency: 2,
                    delay_between_batches: Duration::from_millis(10),
                },
            )
            .await;

        assert_eq!(results.len(), 5);
        assert_eq!(results[0], Ok(0));
        assert_eq!(results[2], Ok(20));
        assert!(matches!(results[3], Err(ResilienceError::NonRetryable(_))));
        assert_eq!(results[4], Ok(40));
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let layer = ResilienceLayer::new(config());
        for attempt in 1..=10 {
            let delay = layer.backoff_delay(attempt);
            let floor = Duration::from_millis(100 * 2u64.pow(attempt - 1)).min(Duration::from_secs(1));
            assert!(delay >= floor, "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_secs(1));
        }
    }

    #[test]
    fn rate_limit_wait_is_clamped() {
        let layer = ResilienceLayer::new(config());
        let now = now_millis();
        assert_eq!(layer.rate_limit_wait(None), Duration::from_millis(50));
        assert_eq!(layer.rate_limit_wait(Some(now)), Duration::from_millis(50));
        assert_eq!(
            layer.rate_limit_wait(Some(now + 3_600_000)),
            Duration::from_millis(500)
        );
    }
}
