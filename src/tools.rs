//! External tool adapters.
//!
//! Step bodies never spawn processes directly; they describe the call as a
//! [`ToolCommand`] and hand it to a [`CommandRunner`]. The host runner blocks
//! until the process exits. Anything but exit status zero is a [`ToolError`]
//! carrying the captured stderr.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use log::debug;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<OsString>,
    pub env: Vec<(String, OsString)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.env.push((key.into(), value.as_ref().to_os_string()));
        self
    }

    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
#[error("{program} exited with {status}: {stderr}")]
pub struct ToolError {
    pub program: String,
    pub status: String,
    pub stderr: String,
}

pub trait CommandRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput>;
}

/// Runs commands on the host, synchronously.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        debug!("running: {cmd}");
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let output = command
            .output()
            .map_err(|e| anyhow!("failed to start {}: {e}", cmd.program))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(ToolError {
                program: cmd.program.clone(),
                status: output.status.to_string(),
                stderr,
            }
            .into());
        }
        Ok(ToolOutput { stdout, stderr })
    }
}

type Hook = Box<dyn Fn(&ToolCommand) -> Result<()> + Send + Sync>;

/// Deterministic stand-in for [`HostRunner`] used by tests: records every
/// command, can be told to fail a program, and can run a hook to emulate a
/// tool's side effects.
#[derive(Clone, Default)]
pub struct FakeRunner {
    inner: Arc<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    calls: Mutex<Vec<ToolCommand>>,
    failing: Mutex<Vec<String>>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call to `program` fail with exit status 1.
    pub fn fail_on(&self, program: &str) {
        if let Ok(mut failing) = self.inner.failing.lock() {
            failing.push(program.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.inner.failing.lock() {
            failing.clear();
        }
    }

    pub fn on_run(
        &self,
        program: &str,
        hook: impl Fn(&ToolCommand) -> Result<()> + Send + Sync + 'static,
    ) {
        if let Ok(mut hooks) = self.inner.hooks.lock() {
            hooks.push((program.to_string(), Box::new(hook)));
        }
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.inner
            .calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        if let Ok(mut calls) = self.inner.calls.lock() {
            calls.push(cmd.clone());
        }
        let fails = self
            .inner
            .failing
            .lock()
            .map(|f| f.contains(&cmd.program))
            .unwrap_or(false);
        if fails {
            return Err(ToolError {
                program: cmd.program.clone(),
                status: "exit status: 1".to_string(),
                stderr: format!("{} failed (simulated)", cmd.program),
            }
            .into());
        }
        if let Ok(hooks) = self.inner.hooks.lock() {
            for (program, hook) in hooks.iter() {
                if *program == cmd.program {
                    hook(cmd)?;
                }
            }
        }
        Ok(ToolOutput::default())
    }
}
