//! Validation of authentication results and configuration, user-facing error
//! text, and sanitized event logging.

use std::error::Error as StdError;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, trace, warn, Level};

use super::retry::{retry_decision, RetryDecision};
use super::sanitize::{sanitize_map, sanitize_text};
use crate::config::{AuthConfig, AuthMethod};
use crate::error::AuthError;
use crate::utils::format_age;

const NEAR_EXPIRY_MINUTES: i64 = 15;
const MAX_SESSION_AGE_HOURS: i64 = 24;
const SHORT_TIMEOUT_SECS: u64 = 10;
const LONG_TIMEOUT_SECS: u64 = 120;
const HIGH_RETRY_COUNT: u32 = 5;
const ENHANCED_HIGH_RETRY_COUNT: u64 = 3;
const LONG_SESSION_HOURS: u32 = 12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub details: Map<String, Value>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            details: Map::new(),
        }
    }
}

impl ValidationResult {
    fn add_error(&mut self, message: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(message.into());
    }

    fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn add_detail(&mut self, key: &str, value: impl Into<Value>) {
        self.details.insert(key.to_string(), value.into());
    }

    fn merge(&mut self, other: ValidationResult) {
        self.is_valid &= other.is_valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.details.extend(other.details);
    }

    fn internal_error(message: &str) -> Self {
        let mut result = Self::default();
        result.add_error(format!("Validation error: {}", sanitize_text(message)));
        result
    }
}

/// Stateless apart from the configuration it reports against
#[derive(Debug, Clone)]
pub struct AuthValidator {
    config: Arc<AuthConfig>,
    enhanced: bool,
}

impl AuthValidator {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config: Arc::new(config),
            enhanced: false,
        }
    }

    /// Also flags non-enhanced security levels, disabled credential
    /// protection and retry counts above 3
    pub fn enhanced(config: AuthConfig) -> Self {
        Self {
            config: Arc::new(config),
            enhanced: true,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Check an authentication result map (see
    /// `CredentialRefresher::status_snapshot`). Malformed input is reported as
    /// a single "Validation error" entry rather than propagated.
    pub fn validate_authentication_status(&self, result: &Map<String, Value>) -> ValidationResult {
        match self.check_status(result) {
            Ok(mut validation) => {
                if self.enhanced {
                    validation.merge(enhanced_status_checks(result));
                }
                validation
            }
            Err(message) => {
                warn!(error = %sanitize_text(&message), "Authentication status could not be validated");
                ValidationResult::internal_error(&message)
            }
        }
    }

    fn check_status(&self, result: &Map<String, Value>) -> Result<ValidationResult, String> {
        let mut validation = ValidationResult::default();

        let authenticated = match result.get("authenticated") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => return Err(format!("'authenticated' must be a boolean, got {}", other)),
        };
        validation.add_detail("authenticated", authenticated);
        if !authenticated {
            validation.add_error("Authentication failed");
        }

        match result.get("session_info") {
            None | Some(Value::Null) => {}
            Some(Value::Object(info)) => validate_session_info(info, &mut validation),
            Some(_) => return Err("'session_info' must be an object".to_string()),
        }

        match result.get("timeout_occurred") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => {}
            Some(Value::Bool(true)) => {
                let duration = result.get("timeout_duration").and_then(Value::as_u64);
                match duration {
                    Some(secs) => validation
                        .add_warning(format!("Authentication timed out after {} seconds", secs)),
                    None => validation.add_warning("Authentication timed out"),
                }
                validation.add_detail("timeout_duration", json!(duration));
            }
            Some(_) => return Err("'timeout_occurred' must be a boolean".to_string()),
        }

        match result.get("auth_method") {
            None | Some(Value::Null) => {}
            Some(Value::String(method)) => match method.parse::<AuthMethod>() {
                Ok(method) => validation.add_detail("auth_method", method.as_str()),
                Err(_) => validation.add_warning(format!(
                    "Unknown authentication method: {}",
                    sanitize_text(method)
                )),
            },
            Some(_) => return Err("'auth_method' must be a string".to_string()),
        }

        Ok(validation)
    }

    /// Run the config's own invariant checks and warn on risky but legal
    /// values
    pub fn validate_configuration(&self, config: &AuthConfig) -> ValidationResult {
        let mut validation = ValidationResult::default();

        for (_, message) in config.invariant_violations() {
            validation.add_error(message);
        }

        if config.timeout_seconds < SHORT_TIMEOUT_SECS {
            validation.add_warning(format!(
                "Very short timeout ({}s) may cause spurious authentication failures",
                config.timeout_seconds
            ));
        } else if config.timeout_seconds > LONG_TIMEOUT_SECS {
            validation.add_warning(format!(
                "Very long timeout ({}s) may leave callers blocked",
                config.timeout_seconds
            ));
        }

        if config.max_retry_attempts > HIGH_RETRY_COUNT {
            validation.add_warning(format!(
                "High retry count ({}) delays failure reporting",
                config.max_retry_attempts
            ));
        } else if self.enhanced && u64::from(config.max_retry_attempts) > ENHANCED_HIGH_RETRY_COUNT {
            validation.add_warning(format!(
                "Retry count ({}) is above the enhanced-security limit of {}",
                config.max_retry_attempts, ENHANCED_HIGH_RETRY_COUNT
            ));
        }

        if config.session_duration_hours > LONG_SESSION_HOURS {
            validation.add_warning(format!(
                "Long session duration ({}h) widens the window for a stolen session",
                config.session_duration_hours
            ));
        }

        if let Ok(Value::Object(summary)) = serde_json::to_value(config) {
            validation.details.extend(summary);
        }
        validation
    }

    pub fn sanitize_error_message(&self, text: &str) -> String {
        sanitize_text(text)
    }

    pub fn sanitize_log_data(&self, data: &Map<String, Value>) -> Map<String, Value> {
        sanitize_map(data)
    }

    /// Actionable text for an error. Every piece of interpolated error text
    /// is sanitized first. `AuthError`s are found anywhere in the source
    /// chain.
    pub fn create_user_friendly_error(
        &self,
        error: &(dyn StdError + 'static),
        context: &Map<String, Value>,
    ) -> String {
        let auth_error = std::iter::successors(Some(error), |&e| e.source())
            .find_map(|e| e.downcast_ref::<AuthError>());

        match auth_error {
            Some(AuthError::Timeout {
                timeout_duration,
                details,
                ..
            }) => self.timeout_guidance(*timeout_duration, details, context),
            Some(AuthError::Authentication { message, .. }) => {
                self.authentication_guidance(message, context)
            }
            Some(AuthError::Validation { message, field }) => {
                validation_guidance(message, field.as_deref())
            }
            Some(AuthError::Security(message)) => format!(
                "Security policy violation: {}\n\n\
                 The operation was blocked by policy. Contact your administrator \
                 if you believe this is a mistake.",
                sanitize_text(message)
            ),
            None => format!(
                "Unexpected error: {}\n\n\
                 Troubleshooting:\n  \
                 - Retry the operation\n  \
                 - Run with RUST_LOG=debug for more detail\n  \
                 - Report the problem if it keeps happening",
                sanitize_text(&error.to_string())
            ),
        }
    }

    /// Attempt count comes from the caller's context, else from the error
    fn timeout_guidance(
        &self,
        timeout_duration: u64,
        details: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> String {
        let attempt = context
            .get("attempts")
            .or_else(|| details.get("attempts"))
            .and_then(Value::as_u64);
        let max_attempts = context
            .get("max_attempts")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| u64::from(self.config.max_retry_attempts.max(1)));
        let attempt_text = attempt
            .map(|a| format!(" (attempt {} of {})", a, max_attempts))
            .unwrap_or_default();

        format!(
            "Authentication timed out after {} seconds{}.\n\n\
             Suggestions:\n  \
             - Check your network or VPN connection\n  \
             - Wait a moment and try again\n  \
             - Raise timeout_seconds (currently {}) if the helper is routinely slow",
            timeout_duration, attempt_text, self.config.timeout_seconds
        )
    }

    fn authentication_guidance(&self, message: &str, context: &Map<String, Value>) -> String {
        let method = context
            .get("auth_method")
            .and_then(Value::as_str)
            .and_then(|m| m.parse::<AuthMethod>().ok())
            .unwrap_or(self.config.auth_method);

        let steps: &[&str] = match method {
            AuthMethod::Midway => &[
                "Run `mwinit -o` in a terminal to confirm the helper works",
                "Make sure your security key is plugged in",
                "Check MIDWAY_CONFIG if you use a custom configuration",
            ],
            AuthMethod::Kerberos => &[
                "Run `kinit` in a terminal to obtain a fresh ticket",
                "Check that KRB5_CONFIG points at the right realm configuration",
                "Verify the system clock is in sync with the KDC",
            ],
            AuthMethod::None => &[
                "Authentication is disabled; set auth_method to 'midway' or 'kerberos' if it is required",
            ],
        };

        let mut text = format!(
            "Authentication failed: {}\n\nTroubleshooting ({}):\n",
            sanitize_text(message),
            method
        );
        for step in steps {
            text.push_str("  - ");
            text.push_str(step);
            text.push('\n');
        }

        if let Some(last_success) = context.get("last_success").and_then(Value::as_str) {
            let rendered = match DateTime::parse_from_rfc3339(last_success) {
                Ok(at) => {
                    let at = at.with_timezone(&Utc);
                    format!("{} ({} ago)", at.format("%Y-%m-%d %H:%M UTC"), format_age(Utc::now() - at))
                }
                Err(_) => sanitize_text(last_success),
            };
            text.push_str(&format!("\nLast successful authentication: {}", rendered));
        }
        text.trim_end().to_string()
    }

    pub fn validate_retry_logic(
        &self,
        attempt: u32,
        max_attempts: u32,
        last_error: Option<&AuthError>,
    ) -> RetryDecision {
        retry_decision(attempt, max_attempts, last_error)
    }

    /// Emit an event at `level` with its details sanitized
    pub fn log_authentication_event(
        &self,
        event_type: &str,
        details: &Map<String, Value>,
        level: Level,
    ) {
        let event = sanitize_text(event_type);
        let details = Value::Object(sanitize_map(details)).to_string();
        match level {
            Level::ERROR => error!(event = %event, details = %details, "Authentication event"),
            Level::WARN => warn!(event = %event, details = %details, "Authentication event"),
            Level::INFO => info!(event = %event, details = %details, "Authentication event"),
            Level::DEBUG => debug!(event = %event, details = %details, "Authentication event"),
            _ => trace!(event = %event, details = %details, "Authentication event"),
        }
    }
}

fn validate_session_info(info: &Map<String, Value>, validation: &mut ValidationResult) {
    let now = Utc::now();

    match parse_timestamp(info.get("expiry_time")) {
        Some(Ok(expiry)) => {
            let remaining = expiry - now;
            if remaining <= Duration::zero() {
                validation.add_error("Session has expired");
            } else if remaining <= Duration::minutes(NEAR_EXPIRY_MINUTES) {
                validation.add_warning(format!(
                    "Session expires in {} minutes",
                    remaining.num_minutes()
                ));
            }
            validation.add_detail("minutes_until_expiry", remaining.num_minutes());
        }
        Some(Err(())) => validation.add_warning("Could not parse session expiry time"),
        None => {}
    }

    let start = parse_timestamp(info.get("start_time").or_else(|| info.get("session_start")));
    match start {
        Some(Ok(start)) => {
            let age = now - start;
            if age > Duration::hours(MAX_SESSION_AGE_HOURS) {
                validation.add_warning(format!(
                    "Session is older than {} hours ({})",
                    MAX_SESSION_AGE_HOURS,
                    format_age(age)
                ));
            }
            validation.add_detail("session_age_seconds", age.num_seconds());
        }
        Some(Err(())) => validation.add_warning("Could not parse session start time"),
        None => {}
    }
}

/// `None` when absent or null; `Some(Err)` when present but unusable
fn parse_timestamp(value: Option<&Value>) -> Option<Result<DateTime<Utc>, ()>> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| ()),
        ),
        _ => Some(Err(())),
    }
}

fn enhanced_status_checks(result: &Map<String, Value>) -> ValidationResult {
    let mut validation = ValidationResult::default();

    let level = result
        .get("security_level")
        .or_else(|| {
            result
                .get("session_info")
                .and_then(|info| info.get("security_level"))
        })
        .and_then(Value::as_str)
        .unwrap_or("standard");
    if level != "enhanced" {
        validation.add_warning(format!(
            "Security level is '{}', expected 'enhanced'",
            sanitize_text(level)
        ));
    }

    if result.get("credential_protection") == Some(&Value::Bool(false)) {
        validation.add_warning("Credential protection is disabled");
    }

    // The first attempt is not a retry
    let retries = result.get("retry_count").and_then(Value::as_u64).or_else(|| {
        result
            .get("attempts")
            .and_then(Value::as_u64)
            .map(|a| a.saturating_sub(1))
    });
    if let Some(retries) = retries.filter(|r| *r > ENHANCED_HIGH_RETRY_COUNT) {
        validation.add_warning(format!(
            "High retry count ({}) may indicate credential problems",
            retries
        ));
    }

    validation
}

fn validation_guidance(message: &str, field: Option<&str>) -> String {
    let hint = match field {
        Some("timeout_seconds") => "Set timeout_seconds to a value between 1 and 300.",
        Some("max_retry_attempts") => "Set max_retry_attempts to a value between 0 and 10.",
        Some("check_interval_seconds") => "Set check_interval_seconds to at least 1.",
        Some("session_duration_hours") => "Set session_duration_hours to a value between 1 and 24.",
        Some("auth_method") => {
            "Use auth_method 'midway' or 'kerberos', or turn off require_auth to use 'none'."
        }
        _ => "Review the authentication configuration file.",
    };
    format!(
        "Configuration problem: {}\n\n{}",
        sanitize_text(message),
        hint
    )
}
