//! Validation, sanitization and retry policy for authentication results.
//!
//! This module provides:
//! - `AuthValidator`: checks results and configuration, builds user-facing
//!   error text, and logs sanitized events
//! - `sanitize`: the redaction rules applied to anything bound for logs
//! - `retry`: which failures may be retried and how long to wait

pub mod retry;
pub mod sanitize;
pub mod validator;

pub use retry::{backoff_delay, retry_decision, RetryDecision};
pub use sanitize::{sanitize_map, sanitize_text};
pub use validator::{AuthValidator, ValidationResult};
