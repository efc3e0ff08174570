//! Authentication against an external credential helper (`mwinit` or
//! `kinit`) plus in-memory session lifecycle management.
//!
//! The three entry points are [`CredentialRefresher`], [`SessionManager`] and
//! [`AuthValidator`], all driven by a shared [`AuthConfig`].

pub mod auth;
pub mod config;
pub mod error;
pub mod utils;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use auth::{CredentialRefresher, SecurityLevel, SessionGuard, SessionManager};
pub use config::{AuthConfig, AuthMethod};
pub use error::{AuthError, AuthErrorKind, Result};
pub use validation::{AuthValidator, RetryDecision, ValidationResult};
