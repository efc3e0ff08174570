//! In-process session lifecycle.
//!
//! A `SessionManager` holds at most one live session. All mutating calls go
//! through one reentrant lock, so `refresh_session` can check validity
//! without releasing it, and cleanup callbacks may read session state while
//! `end_session` runs them.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::ReentrantMutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use super::refresher::CredentialRefresher;
use crate::config::{AuthConfig, AuthMethod};
use crate::error::{AuthError, Result};
use crate::validation::sanitize::{sanitize_map, sanitize_text, KEY_MARKER};

/// Default window for `is_near_expiry`
pub const DEFAULT_NEAR_EXPIRY_MINUTES: i64 = 15;

/// When set to a truthy value, enhanced managers refuse to start sessions
pub const INSECURE_MODE_ENV: &str = "TICKETWARDEN_INSECURE_MODE";

const SESSION_ID_BYTES: usize = 32;

/// Wipe passes over ended session material for enhanced managers
const ENHANCED_WIPE_PASSES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Standard,
    Enhanced,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Standard => "standard",
            SecurityLevel::Enhanced => "enhanced",
        }
    }
}

#[derive(Debug)]
pub struct SessionMetadata {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub auth_method: AuthMethod,
    pub user_info: Map<String, Value>,
    pub security_level: SecurityLevel,
    pub refresh_count: u32,
}

impl SessionMetadata {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expiry_time
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expiry_time - Utc::now()
    }

    fn wipe(&mut self) {
        self.session_id.zeroize();
        for value in self.user_info.values_mut() {
            if let Value::String(s) = value {
                s.zeroize();
            }
        }
        self.user_info.clear();
    }
}

/// Handle returned by `add_cleanup_callback`, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub type CleanupFn = dyn Fn() -> anyhow::Result<()> + Send + Sync;

#[derive(Default)]
struct SessionState {
    session: Option<SessionMetadata>,
    callbacks: Vec<(CallbackId, Arc<CleanupFn>)>,
    next_callback_id: u64,
    /// Set while `end_session` runs callbacks, so a callback that ends the
    /// session again does not recurse
    ending: bool,
}

/// Reads one environment variable; the security-context check goes through it
type EnvLookup = fn(&str) -> Option<String>;

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

pub struct SessionManager {
    config: Arc<AuthConfig>,
    security_level: SecurityLevel,
    env_lookup: EnvLookup,
    inner: ReentrantMutex<RefCell<SessionState>>,
}

impl SessionManager {
    pub fn new(config: AuthConfig) -> Result<Self> {
        Self::with_level(config, SecurityLevel::Standard)
    }

    /// Manager that checks the security context before starting sessions,
    /// wipes session material repeatedly on end, and redacts identity fields
    /// from metadata.
    pub fn enhanced(config: AuthConfig) -> Result<Self> {
        Self::with_level(config, SecurityLevel::Enhanced)
    }

    fn with_level(config: AuthConfig, security_level: SecurityLevel) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            security_level,
            env_lookup: process_env,
            inner: ReentrantMutex::new(RefCell::new(SessionState::default())),
        })
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// Start a fresh session, ending any existing one first. Returns the new
    /// session id.
    pub fn start_session(&self) -> Result<String> {
        let guard = self.inner.lock();

        if self.security_level == SecurityLevel::Enhanced {
            check_security_context(self.env_lookup)?;
        }

        if guard.borrow().session.is_some() {
            debug!("Ending existing session before starting a new one");
            self.end_session();
        }

        let now = Utc::now();
        let expiry_time = self.expiry_from(now)?;
        let session_id = generate_session_id()?;

        guard.borrow_mut().session = Some(SessionMetadata {
            session_id: session_id.clone(),
            start_time: now,
            last_activity: now,
            expiry_time,
            auth_method: self.config.auth_method,
            user_info: Map::new(),
            security_level: self.security_level,
            refresh_count: 0,
        });

        info!(
            method = %self.config.auth_method,
            security_level = self.security_level.as_str(),
            expires_at = %expiry_time.to_rfc3339(),
            "Session started"
        );
        Ok(session_id)
    }

    /// Authenticate through `refresher` if needed, then start a session
    pub async fn start_authenticated_session(
        &self,
        refresher: &CredentialRefresher,
    ) -> Result<String> {
        refresher.ensure_authenticated().await?;
        self.start_session()
    }

    /// Run every cleanup callback, then clear the session. No-op without a
    /// session.
    pub fn end_session(&self) {
        let guard = self.inner.lock();

        let callbacks = {
            let mut state = guard.borrow_mut();
            if state.session.is_none() || state.ending {
                return;
            }
            state.ending = true;
            state.callbacks.clone()
        };

        run_cleanup_callbacks(&callbacks);

        let session = {
            let mut state = guard.borrow_mut();
            state.ending = false;
            state.session.take()
        };

        if let Some(mut session) = session {
            let passes = match self.security_level {
                SecurityLevel::Standard => 1,
                SecurityLevel::Enhanced => ENHANCED_WIPE_PASSES,
            };
            for _ in 0..passes {
                session.wipe();
            }
            info!(refresh_count = session.refresh_count, "Session ended");
        }
    }

    /// False without a session. An expired session is ended and reported
    /// invalid; a live one has its activity time bumped.
    pub fn is_session_valid(&self) -> bool {
        let guard = self.inner.lock();
        {
            let mut state = guard.borrow_mut();
            match state.session.as_mut() {
                None => return false,
                Some(session) if !session.is_expired() => {
                    session.last_activity = Utc::now();
                    return true;
                }
                Some(_) => {}
            }
        }

        info!("Session expired");
        self.end_session();
        false
    }

    /// Extend a live session by `session_duration_hours` from now. Returns
    /// false for an absent or expired session.
    pub fn refresh_session(&self) -> Result<bool> {
        let guard = self.inner.lock();

        // Re-entrant: we already hold the lock
        if !self.is_session_valid() {
            return Ok(false);
        }

        let mut state = guard.borrow_mut();
        let Some(session) = state.session.as_mut() else {
            return Ok(false);
        };

        // Compute everything before touching the session so a failure
        // leaves it intact
        let now = Utc::now();
        let expiry_time = self.expiry_from(now)?;
        let refresh_count = session
            .refresh_count
            .checked_add(1)
            .ok_or_else(|| AuthError::authentication("Session refresh count overflowed"))?;

        session.expiry_time = expiry_time;
        session.refresh_count = refresh_count;
        session.last_activity = now;

        info!(
            refresh_count,
            expires_at = %expiry_time.to_rfc3339(),
            "Session refreshed"
        );
        Ok(true)
    }

    /// Refresh when `auto_refresh` is on and the session is close to expiry.
    /// Returns whether a valid session remains.
    pub fn maintain_session(&self) -> Result<bool> {
        let _guard = self.inner.lock();
        if !self.is_session_valid() {
            return Ok(false);
        }
        if self.config.auto_refresh && self.is_near_expiry(DEFAULT_NEAR_EXPIRY_MINUTES) {
            debug!("Session near expiry, refreshing");
            return self.refresh_session();
        }
        Ok(true)
    }

    pub fn get_session_metadata(&self) -> Map<String, Value> {
        let guard = self.inner.lock();
        let state = guard.borrow();

        let Some(session) = state.session.as_ref() else {
            let mut map = Map::new();
            map.insert("active".into(), json!(false));
            map.insert("message".into(), json!("No active session"));
            return map;
        };

        let enhanced = self.security_level == SecurityLevel::Enhanced;
        let (session_id, user_info) = if enhanced {
            (json!(KEY_MARKER), json!(KEY_MARKER))
        } else {
            (
                json!(session.session_id),
                Value::Object(sanitize_map(&session.user_info)),
            )
        };

        let mut map = Map::new();
        map.insert("active".into(), json!(true));
        map.insert("session_id".into(), session_id);
        map.insert("start_time".into(), json!(session.start_time.to_rfc3339()));
        map.insert("last_activity".into(), json!(session.last_activity.to_rfc3339()));
        map.insert("expiry_time".into(), json!(session.expiry_time.to_rfc3339()));
        map.insert(
            "time_until_expiry_seconds".into(),
            json!(session.time_until_expiry().num_seconds()),
        );
        map.insert("auth_method".into(), json!(session.auth_method.as_str()));
        map.insert("user_info".into(), user_info);
        map.insert("security_level".into(), json!(session.security_level.as_str()));
        map.insert("refresh_count".into(), json!(session.refresh_count));
        map.insert(
            "session_duration_hours".into(),
            json!(self.config.session_duration_hours),
        );
        map.insert("auto_refresh".into(), json!(self.config.auto_refresh));
        map.insert(
            "check_interval_seconds".into(),
            json!(self.config.check_interval_seconds),
        );
        map
    }

    /// Attach an identity field to the live session. Returns false without one.
    pub fn set_user_info(&self, key: &str, value: impl Into<Value>) -> bool {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        match state.session.as_mut() {
            Some(session) => {
                session.user_info.insert(key.to_string(), value.into());
                true
            }
            None => false,
        }
    }

    /// Opaque id of the live session
    pub fn current_session_id(&self) -> Option<String> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        state.session.as_ref().map(|s| s.session_id.clone())
    }

    pub fn add_cleanup_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        let id = CallbackId(state.next_callback_id);
        state.next_callback_id += 1;
        let callback: Arc<CleanupFn> = Arc::new(callback);
        state.callbacks.push((id, callback));
        id
    }

    pub fn remove_cleanup_callback(&self, id: CallbackId) -> bool {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        let before = state.callbacks.len();
        state.callbacks.retain(|(cb_id, _)| *cb_id != id);
        state.callbacks.len() != before
    }

    pub fn get_time_until_expiry(&self) -> Option<Duration> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        state.session.as_ref().map(|s| s.time_until_expiry())
    }

    /// True when a session exists and expires within `threshold_minutes`
    pub fn is_near_expiry(&self, threshold_minutes: i64) -> bool {
        // Thresholds beyond the representable range clamp to its ends
        let threshold = Duration::try_minutes(threshold_minutes).unwrap_or(if threshold_minutes < 0 {
            Duration::MIN
        } else {
            Duration::MAX
        });
        self.get_time_until_expiry()
            .map(|remaining| remaining <= threshold)
            .unwrap_or(false)
    }

    /// Start a session whose end is tied to the returned guard
    pub fn scope(&self) -> Result<SessionGuard<'_>> {
        self.start_session()?;
        Ok(SessionGuard { manager: self })
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        now.checked_add_signed(Duration::hours(i64::from(self.config.session_duration_hours)))
            .ok_or_else(|| AuthError::authentication("Failed to compute session expiry time"))
    }

    #[cfg(test)]
    fn with_env_lookup(mut self, lookup: EnvLookup) -> Self {
        self.env_lookup = lookup;
        self
    }

    #[cfg(test)]
    fn set_expiry(&self, expiry_time: DateTime<Utc>) {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        if let Some(session) = state.session.as_mut() {
            session.expiry_time = expiry_time;
        }
    }

    #[cfg(test)]
    fn expiry_time(&self) -> Option<DateTime<Utc>> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        state.session.as_ref().map(|s| s.expiry_time)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("security_level", &self.security_level)
            .field("auth_method", &self.config.auth_method)
            .finish_non_exhaustive()
    }
}

/// Ends the session when dropped, on every exit path of the scope
#[must_use = "the session ends as soon as the guard is dropped"]
pub struct SessionGuard<'a> {
    manager: &'a SessionManager,
}

impl SessionGuard<'_> {
    pub fn manager(&self) -> &SessionManager {
        self.manager
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.manager.end_session();
    }
}

/// Fails closed when the insecure-mode flag is set
pub fn check_security_context<F>(lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let insecure = lookup(INSECURE_MODE_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if insecure {
        warn!(flag = INSECURE_MODE_ENV, "Insecure mode requested, refusing enhanced session");
        return Err(AuthError::security(format!(
            "insecure mode is enabled via {}",
            INSECURE_MODE_ENV
        )));
    }
    Ok(())
}

fn generate_session_id() -> Result<String> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AuthError::authentication(format!("Failed to generate session id: {}", e)))?;
    let id = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    bytes.zeroize();
    Ok(id)
}

fn run_cleanup_callbacks(callbacks: &[(CallbackId, Arc<CleanupFn>)]) {
    for (id, callback) in callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                callback = id.0,
                error = %sanitize_text(&e.to_string()),
                "Cleanup callback failed"
            ),
            Err(_) => warn!(callback = id.0, "Cleanup callback panicked"),
        }
    }
}
