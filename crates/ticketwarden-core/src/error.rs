use serde_json::{Map, Value};
use thiserror::Error;

/// Authentication subsystem errors.
///
/// Callers at the application edge are expected to catch these and show the
/// text from `AuthValidator::create_user_friendly_error` instead of the raw
/// `Display` output.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Generic authentication failure (helper exited non-zero, missing
    /// executable, internal session fault)
    #[error("{message}")]
    Authentication {
        message: String,
        details: Map<String, Value>,
    },

    /// A bounded-time guard expired
    #[error("{message}")]
    Timeout {
        message: String,
        timeout_duration: u64,
        details: Map<String, Value>,
    },

    /// Policy violation: disallowed command, insecure mode flag
    #[error("Security policy violation: {0}")]
    Security(String),

    /// Malformed configuration or input
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },
}

/// Coarse classification of an [`AuthError`], used for retry policy and
/// user-facing message dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    Authentication,
    Timeout,
    Security,
    Validation,
}

pub type Result<T> = std::result::Result<T, AuthError>;

impl AuthError {
    pub fn authentication(message: impl Into<String>) -> Self {
        AuthError::Authentication {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn timeout(timeout_duration: u64) -> Self {
        AuthError::Timeout {
            message: format!("Authentication timed out after {} seconds", timeout_duration),
            timeout_duration,
            details: Map::new(),
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        AuthError::Security(message.into())
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AuthError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Attach a detail entry. No-op for variants that carry no detail map.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        match &mut self {
            AuthError::Authentication { details, .. } | AuthError::Timeout { details, .. } => {
                details.insert(key.to_string(), value.into());
            }
            AuthError::Security(_) | AuthError::Validation { .. } => {}
        }
        self
    }

    pub fn details(&self) -> Option<&Map<String, Value>> {
        match self {
            AuthError::Authentication { details, .. } | AuthError::Timeout { details, .. } => {
                Some(details)
            }
            AuthError::Security(_) | AuthError::Validation { .. } => None,
        }
    }

    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::Authentication { .. } => AuthErrorKind::Authentication,
            AuthError::Timeout { .. } => AuthErrorKind::Timeout,
            AuthError::Security(_) => AuthErrorKind::Security,
            AuthError::Validation { .. } => AuthErrorKind::Validation,
        }
    }

    /// Security and validation failures never benefit from a retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            AuthErrorKind::Authentication | AuthErrorKind::Timeout
        )
    }
}
