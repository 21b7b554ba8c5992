//! Failure classification and retry policy.
//!
//! A failed dispatch is either worth retrying (network trouble, timeouts,
//! 5xx) or not (4xx, the referenced entity is gone). Recoverable failures
//! are still bounded by [`RetryPolicy::limit`]; once exhausted the operation
//! is dead-lettered like an unrecoverable one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::api::ApiError;

/// Phrases a server uses to say the referenced entity no longer exists.
const GONE_PHRASES: [&str; 3] = ["not found", "no longer exists", "does not exist"];

/// Retryability of a single failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    Unrecoverable,
}

/// Why an operation was moved to the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The server rejected it in a way retrying cannot fix.
    Unrecoverable,
    /// It kept failing recoverably until the retry limit.
    RetryExhausted,
    /// It references a temporary id nothing can resolve any more.
    UnresolvedReference,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unrecoverable => write!(f, "unrecoverable"),
            Self::RetryExhausted => write!(f, "retry_exhausted"),
            Self::UnresolvedReference => write!(f, "unresolved_reference"),
        }
    }
}

/// Classify a dispatch failure.
#[must_use]
pub fn classify(error: &ApiError) -> ErrorClass {
    match error {
        ApiError::Network(_) | ApiError::Timeout | ApiError::InvalidResponse(_) => {
            ErrorClass::Recoverable
        }
        ApiError::NotFound { .. } => ErrorClass::Unrecoverable,
        ApiError::Http { status, message } => {
            if mentions_missing_entity(message) {
                ErrorClass::Unrecoverable
            } else if *status >= 500 || *status == 408 || *status == 429 {
                ErrorClass::Recoverable
            } else if (400..500).contains(status) {
                ErrorClass::Unrecoverable
            } else {
                ErrorClass::Recoverable
            }
        }
        // Cancellation is not a failure of the operation; it stays queued.
        ApiError::Cancelled => ErrorClass::Recoverable,
    }
}

fn mentions_missing_entity(message: &str) -> bool {
    let message = message.to_lowercase();
    GONE_PHRASES.iter().any(|phrase| message.contains(phrase))
}

/// What the flush loop does with a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Keep it at the head with the new retry count; dispatch again after `delay`.
    Retry { retry_count: u32, delay: Duration },
    /// Remove it from the queue and dead-letter it.
    DeadLetter(DeadLetterReason),
}

/// Retry limit and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Recoverable failures tolerated before the operation is exhausted.
    pub limit: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 4,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Decide the fate of an operation that failed with `error` after
    /// `retry_count` earlier recoverable failures.
    #[must_use]
    pub fn decide(&self, error: &ApiError, retry_count: u32) -> FailureAction {
        match classify(error) {
            ErrorClass::Unrecoverable => FailureAction::DeadLetter(DeadLetterReason::Unrecoverable),
            ErrorClass::Recoverable if retry_count >= self.limit => {
                FailureAction::DeadLetter(DeadLetterReason::RetryExhausted)
            }
            ErrorClass::Recoverable => {
                let retry_count = retry_count + 1;
                FailureAction::Retry {
                    retry_count,
                    delay: self.backoff(retry_count),
                }
            }
        }
    }

    /// Delay before attempt number `retry_count` (1-based): exponential from
    /// `backoff_base`, capped at `backoff_max`.
    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}
