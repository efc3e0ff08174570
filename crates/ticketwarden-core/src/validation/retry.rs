use std::time::Duration;

use crate::error::{AuthError, AuthErrorKind};

/// Upper bound on the suggested backoff, in seconds
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub message: String,
    /// Suggested backoff for this attempt number, reported even when no
    /// retry should happen
    pub delay: Duration,
}

/// `min(2^(attempt-1), 30)` seconds; attempt 0 is treated as 1
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let secs = if exponent >= 5 {
        MAX_BACKOFF_SECS
    } else {
        (1u64 << exponent).min(MAX_BACKOFF_SECS)
    };
    Duration::from_secs(secs)
}

/// Decide whether attempt `attempt` (1-based) may be followed by another.
pub fn retry_decision(
    attempt: u32,
    max_attempts: u32,
    last_error: Option<&AuthError>,
) -> RetryDecision {
    let delay = backoff_delay(attempt);

    if attempt >= max_attempts {
        return RetryDecision {
            should_retry: false,
            message: format!("Maximum retry attempts ({}) reached", max_attempts),
            delay,
        };
    }

    if let Some(err) = last_error {
        match err.kind() {
            AuthErrorKind::Security => {
                return RetryDecision {
                    should_retry: false,
                    message: "Security errors are not retried".to_string(),
                    delay,
                };
            }
            AuthErrorKind::Validation => {
                return RetryDecision {
                    should_retry: false,
                    message: "Validation errors are not retried; fix the configuration first"
                        .to_string(),
                    delay,
                };
            }
            AuthErrorKind::Authentication | AuthErrorKind::Timeout => {}
        }
    }

    RetryDecision {
        should_retry: true,
        message: format!(
            "Retrying in {} seconds (attempt {} of {})",
            delay.as_secs(),
            attempt + 1,
            max_attempts
        ),
        delay,
    }
}
