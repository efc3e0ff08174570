//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::auth::command::{HelperInvocation, HelperOutput, HelperRunner, RunError};

/// Write an executable `/bin/sh` script named `name` into `dir`
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

pub enum Step {
    Exit(i32, &'static str),
    TimeOut,
    NotFound,
}

/// Replays a fixed sequence of helper outcomes and records every call.
/// Once the script is exhausted the last step repeats.
pub struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `command args...` for each call, in order
    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl HelperRunner for ScriptedRunner {
    async fn run(&self, invocation: &HelperInvocation) -> Result<HelperOutput, RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invocations
            .lock()
            .push(format!("{} {}", invocation.command, invocation.args.join(" ")));

        let step = {
            let mut steps = self.steps.lock();
            if steps.len() > 1 {
                steps.pop_front()
            } else {
                steps.front().map(|s| match s {
                    Step::Exit(code, stderr) => Step::Exit(*code, stderr),
                    Step::TimeOut => Step::TimeOut,
                    Step::NotFound => Step::NotFound,
                })
            }
        };

        match step.expect("scripted runner has no steps") {
            Step::Exit(code, stderr) => Ok(HelperOutput {
                exit_code: Some(code),
                stdout: Zeroizing::new(String::new()),
                stderr: Zeroizing::new(stderr.to_string()),
            }),
            Step::TimeOut => Err(RunError::TimedOut(invocation.timeout)),
            Step::NotFound => Err(RunError::NotFound(invocation.program.clone())),
        }
    }
}
