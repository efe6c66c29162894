//! Retry eligibility and exponential backoff.

use std::time::Duration;

use crate::error::{ClassifiedError, ErrorKind};

/// Whether a failure of this kind is worth retrying.
///
/// Network and timeout failures are; filesystem failures only when the message
/// points at a transient condition (busy, temporary, try again). Everything else
/// would fail the same way on the next attempt.
pub fn is_retryable(kind: ErrorKind, message: &str) -> bool {
    match kind {
        ErrorKind::Network | ErrorKind::Timeout => true,
        ErrorKind::FileSystem => {
            let lower = message.to_lowercase();
            ["busy", "temporar", "try again", "interrupted"]
                .iter()
                .any(|needle| lower.contains(needle))
        }
        _ => false,
    }
}

/// Bounded exponential backoff: `initial_delay * backoff_factor^attempt`, clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Policy with no waiting between attempts; handy in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// `attempt` counts retries already made.
    pub fn should_retry(&self, err: &ClassifiedError, attempt: u32) -> bool {
        err.retryable && attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(is_retryable(ErrorKind::Network, "connection reset"));
        assert!(is_retryable(ErrorKind::Timeout, ""));
        assert!(is_retryable(ErrorKind::FileSystem, "resource busy"));
        assert!(!is_retryable(ErrorKind::FileSystem, "no such file"));
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Permission,
            ErrorKind::UnsupportedPlatform,
            ErrorKind::InsufficientSpace,
            ErrorKind::VersionExists,
            ErrorKind::VersionNotFound,
            ErrorKind::Corrupted,
        ] {
            assert!(!is_retryable(kind, "busy"), "{kind} must not be retryable");
        }
    }

    #[test]
    fn delay_grows_and_is_clamped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));

        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let d = policy.delay(attempt);
            assert!(d >= previous);
            assert!(d <= policy.max_delay);
            previous = d;
        }
    }

    #[test]
    fn should_retry_respects_limit_and_kind() {
        let policy = RetryPolicy::immediate(2);
        let net = ClassifiedError::new(ErrorKind::Network, "reset");
        let bad = ClassifiedError::new(ErrorKind::Corrupted, "bad");
        assert!(policy.should_retry(&net, 0));
        assert!(policy.should_retry(&net, 1));
        assert!(!policy.should_retry(&net, 2));
        assert!(!policy.should_retry(&bad, 0));
    }
}
