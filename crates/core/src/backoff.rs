//! Retry with exponential backoff
//!
//! `delay(n) = min(base_delay * 2^(n-1), max_delay)` for the n-th retry.
//! A policy with `max_retries = 3` makes at most four attempts and waits
//! 100ms, 200ms, 400ms between them when `base_delay = 100ms`.
//!
//! Every wait and every in-flight attempt races a [`CancellationToken`];
//! cancellation ends the loop with [`RetryError::Cancelled`], which callers
//! can tell apart from running out of attempts.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-indexed)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Every delay the policy will wait, in order
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|n| self.delay_for_retry(n)).collect()
    }
}

/// Why a retried operation gave up
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The cancellation token fired during an attempt or a wait
    #[error("Cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
    /// Attempts ran out, or the error was not retryable
    #[error("Gave up after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled { attempts } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The last operation error, if attempts ran out
    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Cancelled { .. } => None,
            Self::Exhausted { last_error, .. } => Some(last_error),
        }
    }
}

/// Run `operation` until it succeeds, retrying every failure.
///
/// `operation` receives the 1-indexed attempt number.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(policy, cancel, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but errors for which `should_retry` returns
/// false end the loop immediately.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut operation: F,
    should_retry: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            result = operation(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt > policy.max_retries || !should_retry(&error) {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = policy.delay_for_retry(attempt);
        debug!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempt, error, delay
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

struct TargetState {
    failures: u32,
    retry_at: Option<Instant>,
}

/// Independent retry budgets keyed by target (dial address).
///
/// A storm of failures against one address never delays or exhausts the
/// budget of another.
pub struct AddressBackoff {
    policy: BackoffPolicy,
    targets: DashMap<String, TargetState>,
}

impl AddressBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            targets: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Record a failure. Returns the wait before the next try, or `None`
    /// once the target's budget is spent.
    pub fn record_failure(&self, target: &str) -> Option<Duration> {
        let mut entry = self
            .targets
            .entry(target.to_string())
            .or_insert(TargetState {
                failures: 0,
                retry_at: None,
            });
        entry.failures += 1;
        if entry.failures > self.policy.max_retries {
            entry.retry_at = None;
            return None;
        }
        let delay = self.policy.delay_for_retry(entry.failures);
        entry.retry_at = Some(Instant::now() + delay);
        Some(delay)
    }

    /// Forget a target's failures after a successful dial
    pub fn record_success(&self, target: &str) {
        self.targets.remove(target);
    }

    /// Time left before `target` may be tried again
    pub fn wait_time(&self, target: &str) -> Duration {
        self.targets
            .get(target)
            .and_then(|state| state.retry_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    pub fn is_exhausted(&self, target: &str) -> bool {
        self.targets
            .get(target)
            .map(|state| state.failures > self.policy.max_retries)
            .unwrap_or(false)
    }

    pub fn failures(&self, target: &str) -> u32 {
        self.targets.get(target).map(|s| s.failures).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.targets.clear();
    }
}
