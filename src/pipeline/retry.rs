//! Retry and backoff decisions for failed page fetches and commits.
//!
//! - Transient failures: capped exponential backoff, bounded attempts
//! - Rate limits: mandatory wait (platform hint or default, capped), unbounded
//! - Everything else: give up on the source

use std::time::Duration;

use crate::error::FetchError;
use crate::models::RetryConfig;

/// What the worker should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then retry the same request
    Backoff(Duration),
    /// Platform throttling; sleep, then retry the same page
    WaitForRateLimit(Duration),
    /// Stop working on this source
    GiveUp,
}

/// Backoff policy derived from `[retry]` configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide how to react to a failed fetch.
    ///
    /// `attempt` is the number of consecutive transient failures for the
    /// current page, starting at 1.
    pub fn decide(&self, error: &FetchError, attempt: u32) -> RetryDecision {
        match error {
            FetchError::RateLimited { retry_after } => {
                RetryDecision::WaitForRateLimit(self.rate_limit_wait(*retry_after))
            }
            FetchError::Transient(_) => {
                self.backoff_or_give_up(attempt, self.config.max_transient_attempts)
            }
            _ => RetryDecision::GiveUp,
        }
    }

    /// Decide how to react to a failed commit.
    pub fn decide_commit(&self, attempt: u32) -> RetryDecision {
        self.backoff_or_give_up(attempt, self.config.max_commit_attempts)
    }

    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1),
    /// capped at the configured maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .config
            .initial_backoff()
            .saturating_mul(1u32 << exponent);
        delay.min(self.config.max_backoff())
    }

    /// Wait for a rate limit: the hint when given, else the default, never
    /// above the configured ceiling.
    pub fn rate_limit_wait(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or_else(|| self.config.default_rate_limit_wait())
            .min(self.config.max_rate_limit_wait())
    }

    fn backoff_or_give_up(&self, attempt: u32, max_attempts: u32) -> RetryDecision {
        if attempt >= max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Backoff(self.backoff(attempt))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_transient_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            default_rate_limit_wait_ms: 1_000,
            max_rate_limit_wait_ms: 5_000,
            max_commit_attempts: 2,
        })
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_transient_attempts_are_bounded() {
        let p = policy();
        let err = FetchError::transient("connection reset");
        assert_eq!(
            p.decide(&err, 1),
            RetryDecision::Backoff(Duration::from_millis(100))
        );
        assert_eq!(p.decide(&err, 4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_rate_limit_is_never_given_up() {
        let p = policy();
        let err = FetchError::RateLimited { retry_after: None };
        assert_eq!(
            p.decide(&err, 1_000),
            RetryDecision::WaitForRateLimit(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_rate_limit_hint_is_capped() {
        let p = policy();
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(3_600)),
        };
        assert_eq!(
            p.decide(&err, 1),
            RetryDecision::WaitForRateLimit(Duration::from_secs(5))
        );
        assert_eq!(
            p.rate_limit_wait(Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_permanent_errors_give_up() {
        let p = policy();
        assert_eq!(p.decide(&FetchError::Auth("401".into()), 1), RetryDecision::GiveUp);
        assert_eq!(p.decide(&FetchError::protocol("404"), 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_commit_attempts() {
        let p = policy();
        assert!(matches!(p.decide_commit(1), RetryDecision::Backoff(_)));
        assert_eq!(p.decide_commit(2), RetryDecision::GiveUp);
    }
}
