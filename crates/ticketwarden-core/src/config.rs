//! Authentication configuration.
//!
//! `AuthConfig` is built once by the caller (or loaded from
//! `~/.config/ticketwarden/auth.json`), validated, and then handed by value to
//! the refresher, session manager and validator. Nothing in this crate
//! re-reads the source afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Application name used for the config directory path
const APP_NAME: &str = "ticketwarden";

/// Config file name
const CONFIG_FILE: &str = "auth.json";

pub const TIMEOUT_RANGE: (u64, u64) = (1, 300);
pub const MAX_RETRY_RANGE: (u32, u32) = (0, 10);
pub const SESSION_HOURS_RANGE: (u32, u32) = (1, 24);

/// Which external credential helper backs authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Midway,
    Kerberos,
    None,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Midway => "midway",
            AuthMethod::Kerberos => "kerberos",
            AuthMethod::None => "none",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = AuthError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "midway" => Ok(AuthMethod::Midway),
            "kerberos" => Ok(AuthMethod::Kerberos),
            "none" => Ok(AuthMethod::None),
            other => Err(AuthError::validation(
                "auth_method",
                format!("Unknown authentication method: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Per-attempt bound on the authenticate helper, in seconds
    pub timeout_seconds: u64,
    pub max_retry_attempts: u32,
    /// How long a status check result stays cached
    pub check_interval_seconds: u64,
    pub session_duration_hours: u32,
    pub auto_refresh: bool,
    pub require_auth: bool,
    pub auth_method: AuthMethod,
    pub cache_credentials: bool,
    /// Resolve helpers from this directory instead of `PATH`
    pub helper_dir: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            max_retry_attempts: 3,
            check_interval_seconds: 300,
            session_duration_hours: 8,
            auto_refresh: true,
            require_auth: true,
            auth_method: AuthMethod::Midway,
            cache_credentials: true,
            helper_dir: None,
        }
    }
}

impl AuthConfig {
    /// Every violated invariant, as `(field, message)` pairs
    pub fn invariant_violations(&self) -> Vec<(&'static str, String)> {
        let mut violations = Vec::new();

        if self.timeout_seconds < TIMEOUT_RANGE.0 || self.timeout_seconds > TIMEOUT_RANGE.1 {
            violations.push((
                "timeout_seconds",
                format!(
                    "timeout_seconds must be between {} and {} (got {})",
                    TIMEOUT_RANGE.0, TIMEOUT_RANGE.1, self.timeout_seconds
                ),
            ));
        }
        if self.max_retry_attempts > MAX_RETRY_RANGE.1 {
            violations.push((
                "max_retry_attempts",
                format!(
                    "max_retry_attempts must be between {} and {} (got {})",
                    MAX_RETRY_RANGE.0, MAX_RETRY_RANGE.1, self.max_retry_attempts
                ),
            ));
        }
        if self.check_interval_seconds < 1 {
            violations.push((
                "check_interval_seconds",
                "check_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.session_duration_hours < SESSION_HOURS_RANGE.0
            || self.session_duration_hours > SESSION_HOURS_RANGE.1
        {
            violations.push((
                "session_duration_hours",
                format!(
                    "session_duration_hours must be between {} and {} (got {})",
                    SESSION_HOURS_RANGE.0, SESSION_HOURS_RANGE.1, self.session_duration_hours
                ),
            ));
        }
        if self.require_auth && self.auth_method == AuthMethod::None {
            violations.push((
                "auth_method",
                "auth_method cannot be 'none' when require_auth is enabled".to_string(),
            ));
        }

        violations
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.invariant_violations()
            .into_iter()
            .map(|(_, message)| message)
            .collect()
    }

    /// Fails with the first violated invariant
    pub fn validate(&self) -> crate::Result<()> {
        match self.invariant_violations().into_iter().next() {
            Some((field, message)) => Err(AuthError::validation(field, message)),
            None => Ok(()),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read auth config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse auth config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AuthConfig::default().validate().is_ok());
    }

    #[test]
    fn test_range_violations_are_all_reported() {
        let config = AuthConfig {
            timeout_seconds: 0,
            max_retry_attempts: 11,
            check_interval_seconds: 0,
            session_duration_hours: 25,
            ..AuthConfig::default()
        };
        let fields: Vec<_> = config
            .invariant_violations()
            .into_iter()
            .map(|(field, _)| field)
            .collect();
        assert_eq!(
            fields,
            vec![
                "timeout_seconds",
                "max_retry_attempts",
                "check_interval_seconds",
                "session_duration_hours"
            ]
        );
    }

    #[test]
    fn test_require_auth_with_none_method_rejected() {
        let config = AuthConfig {
            auth_method: AuthMethod::None,
            ..AuthConfig::default()
        };
        match config.validate() {
            Err(AuthError::Validation { field, .. }) => {
                assert_eq!(field.as_deref(), Some("auth_method"))
            }
            other => panic!("expected validation error, got {:?}", other),
        }

        let config = AuthConfig {
            auth_method: AuthMethod::None,
            require_auth: false,
            ..AuthConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_auth_method_parsing() {
        assert_eq!("Midway".parse::<AuthMethod>().ok(), Some(AuthMethod::Midway));
        assert_eq!(" kerberos ".parse::<AuthMethod>().ok(), Some(AuthMethod::Kerberos));
        assert!("saml".parse::<AuthMethod>().is_err());
    }

    #[test]
    fn test_load_from_fills_defaults_and_validates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth.json");

        std::fs::write(&path, r#"{"timeout_seconds": 30, "auth_method": "kerberos"}"#)
            .expect("write config");
        let config = AuthConfig::load_from(&path).expect("valid config");
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.auth_method, AuthMethod::Kerberos);
        assert_eq!(config.max_retry_attempts, 3);

        std::fs::write(&path, r#"{"timeout_seconds": 900}"#).expect("write config");
        assert!(AuthConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_save_to_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("auth.json");
        let config = AuthConfig {
            session_duration_hours: 12,
            cache_credentials: false,
            ..AuthConfig::default()
        };
        config.save_to(&path).expect("save");
        assert_eq!(AuthConfig::load_from(&path).expect("load"), config);
    }
}
