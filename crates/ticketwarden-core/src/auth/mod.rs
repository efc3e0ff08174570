//! Credential refresh and session lifecycle.
//!
//! This module provides:
//! - `CredentialRefresher`: runs the external helper with retries, timeouts
//!   and cached status checks
//! - `SessionManager`: time-bounded sessions with cleanup callbacks
//! - `command`: the allow-listed helper commands and the process runner
//!
//! Sessions live in memory only and are wiped when they end.

pub mod command;
pub mod refresher;
pub mod session;

pub use command::{HelperInvocation, HelperOutput, HelperRunner, ProcessRunner, RunError};
pub use refresher::{AuthState, CredentialRefresher};
pub use session::{CallbackId, SecurityLevel, SessionGuard, SessionManager, SessionMetadata};
