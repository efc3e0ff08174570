//! Subprocess boundary for the external credential helpers.
//!
//! Only the allow-listed helper names can be turned into a
//! [`HelperInvocation`], and every invocation runs with an environment rebuilt
//! from scratch. The per-call timeout applied by [`ProcessRunner`] is the
//! single authoritative deadline for a helper run.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use zeroize::{Zeroize, Zeroizing};

use crate::config::AuthMethod;
use crate::error::{AuthError, Result};
use crate::utils::truncate;
use crate::validation::sanitize_text;

pub const HELPER_COMMAND: &str = "mwinit";
pub const ALT_HELPER_COMMAND: &str = "kinit";
pub const STATUS_HELPER_COMMAND: &str = "klist";

/// The only program names that may cross the subprocess boundary
pub const ALLOWED_COMMANDS: &[&str] = &[HELPER_COMMAND, ALT_HELPER_COMMAND, STATUS_HELPER_COMMAND];

/// Always forwarded (with fallbacks for PATH and LANG)
pub const BASE_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG"];

/// Forwarded only when already set in the caller's environment
pub const AUTH_ENV_VARS: &[&str] = &[
    "KRB5_CONFIG",
    "KRB5CCNAME",
    "MIDWAY_CONFIG",
    "KERBEROS_CONFIG",
    "KRB5_TRACE",
];

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const FALLBACK_LANG: &str = "C.UTF-8";

/// Status checks are non-mutating and get a short fixed bound
pub const STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum characters of captured stderr carried into errors and logs
const MAX_CAPTURED_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperAction {
    /// One-shot authenticate
    Authenticate,
    /// Status-only check
    Status,
}

/// Helper program and arguments for a method. `None` when the method does not
/// use a helper.
pub fn helper_command(
    method: AuthMethod,
    action: HelperAction,
) -> Option<(&'static str, &'static [&'static str])> {
    match (method, action) {
        (AuthMethod::Midway, HelperAction::Authenticate) => Some((HELPER_COMMAND, &["-o"])),
        (AuthMethod::Midway, HelperAction::Status) => Some((HELPER_COMMAND, &["-s"])),
        (AuthMethod::Kerberos, HelperAction::Authenticate) => Some((ALT_HELPER_COMMAND, &["-R"])),
        (AuthMethod::Kerberos, HelperAction::Status) => Some((STATUS_HELPER_COMMAND, &["-s"])),
        (AuthMethod::None, _) => None,
    }
}

/// Fail closed unless `command` is exactly one of the allow-listed names
pub fn ensure_allowed(command: &str) -> Result<()> {
    if command.contains('/') || command.contains('\\') {
        return Err(AuthError::security(format!(
            "helper must be given by name, not path: {}",
            sanitize_text(command)
        )));
    }
    if !ALLOWED_COMMANDS.contains(&command) {
        return Err(AuthError::security(format!(
            "command not in allow-list: {}",
            sanitize_text(command)
        )));
    }
    Ok(())
}

/// Build the child environment from `vars`, keeping only allow-listed names
pub fn minimal_environment<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut vars: HashMap<String, String> = vars.into_iter().collect();
    let mut env = Vec::with_capacity(BASE_ENV_VARS.len() + AUTH_ENV_VARS.len());

    for name in BASE_ENV_VARS {
        let value = match (vars.remove(*name), *name) {
            (Some(value), _) => value,
            (None, "PATH") => FALLBACK_PATH.to_string(),
            (None, "LANG") => FALLBACK_LANG.to_string(),
            (None, _) => continue,
        };
        env.push((name.to_string(), value));
    }
    for name in AUTH_ENV_VARS {
        if let Some(value) = vars.remove(*name) {
            env.push((name.to_string(), value));
        }
    }

    // Whatever is left may hold unrelated secrets
    for value in vars.values_mut() {
        value.zeroize();
    }
    env
}

fn process_environment() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

/// A fully-resolved, allow-listed helper call
#[derive(Debug, Clone)]
pub struct HelperInvocation {
    pub command: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HelperInvocation {
    pub fn new(
        command: &str,
        args: &[&str],
        timeout: Duration,
        helper_dir: Option<&Path>,
    ) -> Result<Self> {
        ensure_allowed(command)?;
        let program = match helper_dir {
            Some(dir) => dir.join(command),
            None => PathBuf::from(command),
        };
        Ok(Self {
            command: command.to_string(),
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
            env: minimal_environment(process_environment()),
            timeout,
        })
    }

    /// Log-safe rendering of the call
    pub fn describe(&self) -> String {
        sanitize_text(&format!("{} {}", self.command, self.args.join(" ")))
    }
}

/// Captured result of a helper that ran to completion
#[derive(Debug)]
pub struct HelperOutput {
    pub exit_code: Option<i32>,
    pub stdout: Zeroizing<String>,
    pub stderr: Zeroizing<String>,
}

impl HelperOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr after redaction and truncation; the only form that may be
    /// logged or attached to an error
    pub fn sanitized_stderr(&self) -> String {
        truncate(&sanitize_text(self.stderr.trim()), MAX_CAPTURED_CHARS)
    }
}

impl From<std::process::Output> for HelperOutput {
    fn from(output: std::process::Output) -> Self {
        let std::process::Output {
            status,
            mut stdout,
            mut stderr,
        } = output;
        let captured = Self {
            exit_code: status.code(),
            stdout: Zeroizing::new(String::from_utf8_lossy(&stdout).into_owned()),
            stderr: Zeroizing::new(String::from_utf8_lossy(&stderr).into_owned()),
        };
        stdout.zeroize();
        stderr.zeroize();
        captured
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("helper executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("helper did not finish within {} seconds", .0.as_secs())]
    TimedOut(Duration),

    #[error("helper run was cancelled")]
    Cancelled,

    #[error("failed to run helper: {0}")]
    Io(#[from] io::Error),
}

/// Executes helper invocations. The production implementation is
/// [`ProcessRunner`]; tests substitute scripted runners.
#[async_trait]
pub trait HelperRunner: Send + Sync {
    async fn run(&self, invocation: &HelperInvocation) -> std::result::Result<HelperOutput, RunError>;
}

/// Spawns the helper as a child process with a cleared environment.
///
/// The invocation's timeout bounds the whole run; on expiry the child is
/// killed. An optional cancellation token lets callers compose their own
/// deadline on top.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    cancel: CancellationToken,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl HelperRunner for ProcessRunner {
    async fn run(&self, invocation: &HelperInvocation) -> std::result::Result<HelperOutput, RunError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .env_clear()
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RunError::NotFound(invocation.program.clone()),
            _ => RunError::Io(e),
        })?;

        tokio::select! {
            result = tokio::time::timeout(invocation.timeout, child.wait_with_output()) => {
                match result {
                    Ok(output) => Ok(HelperOutput::from(output?)),
                    Err(_) => Err(RunError::TimedOut(invocation.timeout)),
                }
            }
            _ = self.cancel.cancelled() => Err(RunError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_allow_list() {
        for name in ALLOWED_COMMANDS {
            assert!(ensure_allowed(name).is_ok());
        }
        for name in ["rm", "mwinit2", "/usr/bin/mwinit", "../kinit", "klist;rm", ""] {
            assert!(
                matches!(ensure_allowed(name), Err(AuthError::Security(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_helper_command_mapping() {
        assert_eq!(
            helper_command(AuthMethod::Midway, HelperAction::Authenticate),
            Some(("mwinit", &["-o"][..]))
        );
        assert_eq!(
            helper_command(AuthMethod::Midway, HelperAction::Status),
            Some(("mwinit", &["-s"][..]))
        );
        assert_eq!(
            helper_command(AuthMethod::Kerberos, HelperAction::Status),
            Some(("klist", &["-s"][..]))
        );
        assert_eq!(helper_command(AuthMethod::None, HelperAction::Status), None);
    }

    #[test]
    fn test_minimal_environment_filters_and_falls_back() {
        let env = minimal_environment(vars(&[
            ("HOME", "/home/alice"),
            ("USER", "alice"),
            ("KRB5CCNAME", "FILE:/tmp/krb5cc_1000"),
            ("AWS_SECRET_ACCESS_KEY", "do-not-forward"),
            ("LD_PRELOAD", "/tmp/evil.so"),
        ]));
        let names: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["PATH", "HOME", "USER", "LANG", "KRB5CCNAME"]);
        assert!(env.contains(&("PATH".to_string(), FALLBACK_PATH.to_string())));
        assert!(env.iter().all(|(_, v)| v != "do-not-forward"));
    }

    #[test]
    fn test_minimal_environment_keeps_caller_values() {
        let env = minimal_environment(vars(&[("PATH", "/opt/bin"), ("LANG", "en_US.UTF-8")]));
        assert_eq!(env, vars(&[("PATH", "/opt/bin"), ("LANG", "en_US.UTF-8")]));
    }

    #[test]
    fn test_invocation_resolves_helper_dir() {
        let inv = HelperInvocation::new(
            "mwinit",
            &["-o"],
            Duration::from_secs(5),
            Some(Path::new("/opt/helpers")),
        )
        .expect("allowed");
        assert_eq!(inv.program, PathBuf::from("/opt/helpers/mwinit"));
        assert_eq!(inv.describe(), "mwinit [ARGS_REDACTED]");

        assert!(HelperInvocation::new("bash", &["-c", "id"], Duration::from_secs(5), None).is_err());
    }

    #[test]
    fn test_sanitized_stderr() {
        let output = HelperOutput {
            exit_code: Some(1),
            stdout: Zeroizing::new(String::new()),
            stderr: Zeroizing::new("  error: token=abcdef expired\n".to_string()),
        };
        assert!(!output.success());
        assert_eq!(output.sanitized_stderr(), "error: [TOKEN_REDACTED] expired");
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::test_support::write_script;

        fn invocation(dir: &Path, name: &str, timeout: Duration) -> HelperInvocation {
            HelperInvocation::new(name, &["-o"], timeout, Some(dir)).expect("allowed")
        }

        #[tokio::test]
        async fn test_runs_helper_and_captures_output() {
            let dir = tempfile::tempdir().expect("tempdir");
            write_script(dir.path(), "mwinit", "echo \"args: $@\"\necho 'oops' >&2\nexit 3");

            let output = ProcessRunner::new()
                .run(&invocation(dir.path(), "mwinit", Duration::from_secs(5)))
                .await
                .expect("ran");
            assert_eq!(output.exit_code, Some(3));
            assert_eq!(output.stdout.trim(), "args: -o");
            assert_eq!(output.sanitized_stderr(), "oops");
        }

        #[tokio::test]
        async fn test_child_sees_only_forwarded_environment() {
            let dir = tempfile::tempdir().expect("tempdir");
            write_script(dir.path(), "klist", "env");

            let inv = HelperInvocation {
                command: "klist".to_string(),
                program: dir.path().join("klist"),
                args: Vec::new(),
                env: vars(&[("PATH", "/usr/bin:/bin"), ("LANG", "C")]),
                timeout: Duration::from_secs(5),
            };
            let output = ProcessRunner::new().run(&inv).await.expect("ran");
            assert!(output.success());
            assert!(output.stdout.contains("LANG=C"));
            assert!(!output.stdout.contains("HOME="));
            assert!(!output.stdout.contains("CARGO"));
        }

        #[tokio::test]
        async fn test_missing_helper_is_not_found() {
            let dir = tempfile::tempdir().expect("tempdir");
            let err = ProcessRunner::new()
                .run(&invocation(dir.path(), "kinit", Duration::from_secs(5)))
                .await
                .expect_err("missing");
            assert!(matches!(err, RunError::NotFound(_)));
        }

        #[tokio::test]
        async fn test_slow_helper_times_out() {
            let dir = tempfile::tempdir().expect("tempdir");
            write_script(dir.path(), "mwinit", "exec sleep 10");

            let started = std::time::Instant::now();
            let err = ProcessRunner::new()
                .run(&invocation(dir.path(), "mwinit", Duration::from_millis(300)))
                .await
                .expect_err("timeout");
            assert!(matches!(err, RunError::TimedOut(d) if d == Duration::from_millis(300)));
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_cancellation_stops_run() {
            let dir = tempfile::tempdir().expect("tempdir");
            write_script(dir.path(), "mwinit", "exec sleep 10");

            let token = CancellationToken::new();
            token.cancel();
            let err = ProcessRunner::with_cancellation(token)
                .run(&invocation(dir.path(), "mwinit", Duration::from_secs(5)))
                .await
                .expect_err("cancelled");
            assert!(matches!(err, RunError::Cancelled));
        }
    }
}
