//! Drives the external credential helper: one-shot authentication with
//! retries, cached status checks and a session summary for callers.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::command::{
    helper_command, HelperAction, HelperInvocation, HelperRunner, ProcessRunner, RunError,
    STATUS_CHECK_TIMEOUT,
};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::utils::format_age;
use crate::validation::{retry_decision, sanitize_text};

/// Fraction of the session duration after which callers get a warning
const NEAR_EXPIRY_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    NotAuthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

#[derive(Debug, Default)]
struct RefresherState {
    state: AuthState,
    session_start: Option<DateTime<Utc>>,
    last_check: Option<DateTime<Utc>>,
    cached_status: bool,
    /// Timeout of the most recent attempt that timed out, in seconds
    last_timeout: Option<u64>,
    last_attempts: u32,
}

pub struct CredentialRefresher {
    config: Arc<AuthConfig>,
    runner: Arc<dyn HelperRunner>,
    state: Mutex<RefresherState>,
}

impl CredentialRefresher {
    /// Create a refresher that spawns real helper processes
    pub fn new(config: AuthConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(ProcessRunner::new()))
    }

    pub fn with_runner(config: AuthConfig, runner: Arc<dyn HelperRunner>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            runner,
            state: Mutex::new(RefresherState::default()),
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn state(&self) -> AuthState {
        self.state.lock().state
    }

    /// Run the one-shot authenticate helper, retrying generic failures and
    /// timeouts up to `max_retry_attempts` times.
    pub async fn authenticate(&self) -> Result<bool> {
        let method = self.config.auth_method;
        let Some((command, args)) = helper_command(method, HelperAction::Authenticate) else {
            debug!("auth_method is none, no helper to run");
            self.mark_authenticated(0);
            return Ok(true);
        };

        let invocation = match HelperInvocation::new(
            command,
            args,
            StdDuration::from_secs(self.config.timeout_seconds),
            self.config.helper_dir.as_deref(),
        ) {
            Ok(invocation) => invocation,
            Err(e) => {
                error!(error = %e, "Refusing to run authentication helper");
                self.mark_failed(0);
                return Err(e);
            }
        };

        // At least one attempt, even with max_retry_attempts = 0
        let max_attempts = self.config.max_retry_attempts.max(1);
        {
            let mut state = self.state.lock();
            state.state = AuthState::Authenticating;
            state.last_timeout = None;
        }
        info!(
            method = %method,
            helper = %invocation.describe(),
            max_attempts,
            "Starting authentication"
        );

        match self.run_attempts(&invocation, max_attempts).await {
            Ok(attempts) => {
                info!(method = %method, attempts, "Authentication succeeded");
                self.mark_authenticated(attempts);
                Ok(true)
            }
            Err((attempts, e)) => {
                error!(method = %method, attempts, error = %e, "Authentication failed");
                self.mark_failed(attempts);
                Err(e)
            }
        }
    }

    /// Attempt loop. Returns the number of attempts used on success, or the
    /// count alongside the surfaced error.
    async fn run_attempts(
        &self,
        invocation: &HelperInvocation,
        max_attempts: u32,
    ) -> std::result::Result<u32, (u32, AuthError)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.runner.run(invocation).await {
                Ok(output) if output.success() => return Ok(attempt),
                Ok(output) => {
                    let stderr = output.sanitized_stderr();
                    let status = output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    warn!(attempt, exit_status = %status, stderr = %stderr, "Authentication helper failed");
                    AuthError::authentication(format!(
                        "{} exited with status {}",
                        invocation.command, status
                    ))
                    .with_detail("attempts", attempt)
                    .with_detail("stderr", stderr)
                }
                Err(RunError::NotFound(_)) => {
                    let err = AuthError::authentication(format!(
                        "Authentication helper '{}' not found; is it installed and on PATH?",
                        invocation.command
                    ))
                    .with_detail("attempts", attempt)
                    .with_detail("helper", invocation.command.clone());
                    return Err((attempt, err));
                }
                Err(RunError::TimedOut(timeout)) => {
                    let secs = timeout.as_secs();
                    self.state.lock().last_timeout = Some(secs);
                    warn!(attempt, timeout_secs = secs, "Authentication attempt timed out");
                    if attempt >= max_attempts {
                        return Err((attempt, AuthError::timeout(secs).with_detail("attempts", attempt)));
                    }
                    AuthError::timeout(secs).with_detail("attempts", attempt)
                }
                Err(RunError::Cancelled) => {
                    let err = AuthError::authentication("Authentication was cancelled")
                        .with_detail("attempts", attempt);
                    return Err((attempt, err));
                }
                Err(RunError::Io(e)) => {
                    warn!(attempt, error = %e, "Could not run authentication helper");
                    AuthError::authentication(format!(
                        "Failed to run {}: {}",
                        invocation.command,
                        sanitize_text(&e.to_string())
                    ))
                    .with_detail("attempts", attempt)
                }
            };

            let decision = retry_decision(attempt, max_attempts, Some(&err));
            if !decision.should_retry {
                let stderr = err
                    .details()
                    .and_then(|d| d.get("stderr"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let final_err = AuthError::authentication(format!(
                    "Authentication failed after {} attempt(s)",
                    attempt
                ))
                .with_detail("attempts", attempt)
                .with_detail("last_error", sanitize_text(&err.to_string()))
                .with_detail("stderr", stderr);
                return Err((attempt, final_err));
            }

            debug!(attempt, delay_secs = decision.delay.as_secs(), "{}", decision.message);
            tokio::time::sleep(decision.delay).await;
        }
    }

    /// Cached when the last check is within `check_interval_seconds` (and
    /// `cache_credentials` is on); otherwise asks the status helper.
    pub async fn is_authenticated(&self) -> bool {
        let Some((command, args)) = helper_command(self.config.auth_method, HelperAction::Status)
        else {
            return true;
        };

        if self.config.cache_credentials {
            let state = self.state.lock();
            if let Some(last_check) = state.last_check {
                let interval = Duration::seconds(self.config.check_interval_seconds as i64);
                if Utc::now() - last_check < interval {
                    return state.cached_status;
                }
            }
        }

        let timeout = STATUS_CHECK_TIMEOUT.min(StdDuration::from_secs(self.config.timeout_seconds));
        let status = match HelperInvocation::new(command, args, timeout, self.config.helper_dir.as_deref()) {
            Ok(invocation) => match self.runner.run(&invocation).await {
                Ok(output) => {
                    if !output.success() {
                        debug!(stderr = %output.sanitized_stderr(), "Status helper reported no valid credentials");
                    }
                    output.success()
                }
                Err(e) => {
                    warn!(error = %e, "Status check failed");
                    false
                }
            },
            Err(e) => {
                error!(error = %e, "Refusing to run status helper");
                false
            }
        };

        let mut state = self.state.lock();
        state.last_check = Some(Utc::now());
        state.cached_status = status;
        if status {
            state.state = AuthState::Authenticated;
        } else if state.state == AuthState::Authenticated {
            info!("Credentials no longer valid");
            state.state = AuthState::NotAuthenticated;
        }
        status
    }

    pub async fn ensure_authenticated(&self) -> Result<()> {
        if !self.is_authenticated().await {
            self.authenticate().await?;
        }
        Ok(())
    }

    /// Forget the current status so the next check goes to the helper
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.state = AuthState::NotAuthenticated;
        state.session_start = None;
        state.last_check = None;
        state.cached_status = false;
        debug!("Authentication state invalidated");
    }

    /// Summary of the current authentication. Never carries helper output.
    pub fn get_session_info(&self) -> Map<String, Value> {
        let state = self.state.lock();
        let now = Utc::now();
        let duration = Duration::hours(i64::from(self.config.session_duration_hours));

        let mut info = Map::new();
        info.insert(
            "authenticated".into(),
            json!(state.state == AuthState::Authenticated),
        );
        info.insert("state".into(), json!(state.state));
        info.insert("auth_method".into(), json!(self.config.auth_method.as_str()));
        info.insert(
            "session_start".into(),
            json!(state.session_start.map(|t| t.to_rfc3339())),
        );
        info.insert(
            "last_check".into(),
            json!(state.last_check.map(|t| t.to_rfc3339())),
        );

        if let Some(start) = state.session_start {
            let age = now - start;
            info.insert("expiry_time".into(), json!((start + duration).to_rfc3339()));
            info.insert("session_age_seconds".into(), json!(age.num_seconds()));
            info.insert("session_age".into(), json!(format_age(age)));

            let threshold = duration.num_seconds() as f64 * NEAR_EXPIRY_FRACTION;
            if age.num_seconds() as f64 > threshold {
                info.insert(
                    "warning".into(),
                    json!(format!(
                        "Session is {} old and close to the {}h limit; re-authenticate soon",
                        format_age(age),
                        self.config.session_duration_hours
                    )),
                );
            }
        }
        info
    }

    /// Result map in the shape `AuthValidator::validate_authentication_status` expects
    pub fn status_snapshot(&self) -> Map<String, Value> {
        let session_info = self.get_session_info();
        let state = self.state.lock();

        let mut snapshot = Map::new();
        snapshot.insert(
            "authenticated".into(),
            json!(state.state == AuthState::Authenticated),
        );
        snapshot.insert("auth_method".into(), json!(self.config.auth_method.as_str()));
        snapshot.insert("attempts".into(), json!(state.last_attempts));
        snapshot.insert(
            "retry_count".into(),
            json!(state.last_attempts.saturating_sub(1)),
        );
        snapshot.insert("timeout_occurred".into(), json!(state.last_timeout.is_some()));
        if let Some(secs) = state.last_timeout {
            snapshot.insert("timeout_duration".into(), json!(secs));
        }
        snapshot.insert("session_info".into(), Value::Object(session_info));
        snapshot
    }

    fn mark_authenticated(&self, attempts: u32) {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.state = AuthState::Authenticated;
        state.session_start = Some(now);
        state.last_check = Some(now);
        state.cached_status = true;
        state.last_attempts = attempts;
    }

    fn mark_failed(&self, attempts: u32) {
        let mut state = self.state.lock();
        state.state = AuthState::Failed;
        state.cached_status = false;
        state.last_check = None;
        state.last_attempts = attempts;
    }

    #[cfg(test)]
    fn backdate_session_start(&self, by: Duration) {
        let mut state = self.state.lock();
        state.session_start = state.session_start.map(|t| t - by);
    }
}

impl std::fmt::Debug for CredentialRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRefresher")
            .field("auth_method", &self.config.auth_method)
            .field("state", &self.state())
            .finish()
    }
}
