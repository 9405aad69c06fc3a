//! Retry and reconnect backoff computations.

use std::time::{Duration, Instant};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use rustrial_k8s_operator_apis::{RetryConfiguration, WatchBackoffConfiguration};

/// Decides whether and when a failed reconciliation is retried.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// Every transient failure is terminal.
    NoRetry,
    /// Exponential backoff, a multiplier of `1.0` yields fixed intervals.
    Backoff {
        /// Total number of attempts, including the first one.
        max_attempts: u32,
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Option<Duration>,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::NoRetry
    }
}

impl RetryPolicy {
    /// Controllers must opt in to retry, `None` yields [`RetryPolicy::NoRetry`].
    pub fn from_configuration(configuration: Option<&RetryConfiguration>) -> Self {
        match configuration {
            Some(c) => RetryPolicy::Backoff {
                max_attempts: c.max_attempts,
                initial_interval: c.initial_interval(),
                multiplier: c.interval_multiplier,
                max_interval: c.max_interval(),
            },
            None => RetryPolicy::NoRetry,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        RetryPolicy::Backoff {
            max_attempts,
            initial_interval: interval,
            multiplier: 1.0,
            max_interval: None,
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Option<Duration>,
        max_attempts: u32,
    ) -> Self {
        RetryPolicy::Backoff {
            max_attempts,
            initial_interval,
            multiplier,
            max_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::NoRetry => 1,
            RetryPolicy::Backoff { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before the next attempt after `attempt` consecutive failed
    /// attempts (1-based), `None` once the attempts are exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::NoRetry => None,
            RetryPolicy::Backoff {
                max_attempts,
                initial_interval,
                multiplier,
                max_interval,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let millis = initial_interval.as_millis() as f64 * multiplier.powi(exponent);
                let delay = if millis.is_finite() && millis < u64::MAX as f64 {
                    Duration::from_millis(millis as u64)
                } else {
                    Duration::from_millis(u64::MAX)
                };
                Some(match max_interval {
                    Some(max) => delay.min(*max),
                    None => delay,
                })
            }
        }
    }
}

/// Retry bookkeeping of one resource, created on its first transient failure
/// and cleared on success or terminal abandonment.
#[derive(Clone, Debug)]
pub struct RetryState {
    /// Number of consecutive failed attempts.
    pub attempt: u32,
    pub last_error: String,
    pub next_attempt_at: Option<Instant>,
}

/// Retry information handed to reconcile logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryInfo {
    /// The current attempt, starting at 1.
    pub attempt: u32,
    /// No further automatic attempt follows if this one fails.
    pub last_attempt: bool,
}

impl RetryInfo {
    pub(crate) fn new(failed_attempts: u32, policy: &RetryPolicy) -> Self {
        let attempt = failed_attempts + 1;
        Self {
            attempt,
            last_attempt: attempt >= policy.max_attempts(),
        }
    }
}

/// Reconnect backoff of a watch subscription: grows from the initial interval
/// up to the maximum and is reset after a sustained successful period.
pub struct ReconnectBackoff {
    backoff: ExponentialBackoff,
    reset_after: Duration,
}

impl ReconnectBackoff {
    pub fn new(configuration: &WatchBackoffConfiguration) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(configuration.initial_interval())
            .with_multiplier(configuration.multiplier)
            .with_max_interval(configuration.max_interval())
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();
        Self {
            backoff,
            reset_after: configuration.reset_after(),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval)
    }

    /// Resets the backoff if the subscription stayed connected for `connected`.
    pub fn observe_connected(&mut self, connected: Duration) {
        if connected >= self.reset_after {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
    }
}
