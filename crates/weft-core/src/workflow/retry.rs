//! Retry handling for step execution.
//!
//! A step is attempted `retries + 1` times, where `retries` is the step's own
//! setting or, failing that, the workflow-wide `RetryConfig::attempts`. Only
//! errors trigger another attempt; suspend and bail outcomes end the loop.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use weft_types::config::RetryConfig;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for step failures.
///
/// No internal state; all logic is in associated functions that take the
/// configuration as parameters.
pub struct RetryHandler;

impl RetryHandler {
    /// Total number of attempts for a step (always at least 1).
    pub fn max_attempts(step_retries: Option<u32>, config: &RetryConfig) -> u32 {
        step_retries.unwrap_or(config.attempts).saturating_add(1)
    }

    /// Whether another attempt should follow the failed `attempt` (1-based).
    pub fn should_retry(max_attempts: u32, attempt: u32) -> bool {
        attempt < max_attempts
    }

    /// Pause between attempts.
    pub fn delay(config: &RetryConfig) -> Duration {
        Duration::from_millis(config.delay_ms)
    }

    /// Sleep for the configured delay, returning early if the run is cancelled.
    ///
    /// Returns `false` when cancellation interrupted the wait.
    pub async fn wait_before_retry(config: &RetryConfig, cancel: &CancellationToken) -> bool {
        let delay = Self::delay(config);
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(attempts: u32, delay_ms: u64) -> RetryConfig {
        RetryConfig { attempts, delay_ms }
    }

    #[test]
    fn step_retries_override_workflow_default() {
        assert_eq!(RetryHandler::max_attempts(Some(3), &config(1, 0)), 4);
        assert_eq!(RetryHandler::max_attempts(None, &config(1, 0)), 2);
        assert_eq!(RetryHandler::max_attempts(None, &RetryConfig::default()), 1);
        assert_eq!(RetryHandler::max_attempts(Some(0), &config(5, 0)), 1);
    }

    #[test]
    fn should_retry_until_attempts_exhausted() {
        assert!(RetryHandler::should_retry(3, 1));
        assert!(RetryHandler::should_retry(3, 2));
        assert!(!RetryHandler::should_retry(3, 3));
        assert!(!RetryHandler::should_retry(1, 1));
    }

    #[test]
    fn max_attempts_saturates() {
        assert_eq!(RetryHandler::max_attempts(Some(u32::MAX), &config(0, 0)), u32::MAX);
    }

    #[tokio::test]
    async fn wait_is_interrupted_by_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let waited = RetryHandler::wait_before_retry(&config(1, 60_000), &cancel).await;
        assert!(!waited);
    }

    #[tokio::test]
    async fn wait_sleeps_for_configured_delay() {
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        assert!(RetryHandler::wait_before_retry(&config(1, 20), &cancel).await);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
