//! External command execution.
//!
//! `CommandLine` collects a program, typed arguments, environment and
//! working directory, and only materializes the final argument vector at
//! dispatch time. Callers never concatenate flag strings by hand.
//!
//! Every run waits for the child to finish; no zombie processes are left
//! behind on any path.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::BuildError;

/// Outcome of a finished command.
///
/// `status` is zero unless the caller tolerated a nonzero exit. Output
/// buffers are empty unless the command was run captured.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionResult {
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Ordered command-line builder.
#[derive(Debug, Clone)]
pub struct CommandLine {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    cwd: Option<PathBuf>,
    tolerate_nonzero: bool,
}

impl CommandLine {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            tolerate_nonzero: false,
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
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    /// A bare switch, e.g. `--jobs`.
    pub fn flag(self, flag: &str) -> Self {
        self.arg(flag)
    }

    /// A `key=value` option assembled at push time, e.g. `--root=/tmp/x`.
    pub fn option(mut self, key: &str, value: impl AsRef<OsStr>) -> Self {
        let mut token = OsString::from(key);
        token.push("=");
        token.push(value.as_ref());
        self.args.push(token);
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self.env
                .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
        }
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Let a nonzero exit pass through as a result instead of an error.
    pub fn tolerate_nonzero(mut self) -> Self {
        self.tolerate_nonzero = true;
        self
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    /// One-line rendering for diagnostics and debug logging.
    pub fn display(&self) -> String {
        let mut out = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Run with inherited stdio, waiting for completion.
    pub fn run(&self) -> Result<ExecutionResult> {
        let status = match self.command().status() {
            Ok(status) => status,
            Err(err) => return Err(self.spawn_error(err)),
        };
        self.check(status.code(), Vec::new(), Vec::new())
    }

    /// Run with stdout/stderr captured, waiting for completion.
    pub fn run_captured(&self) -> Result<ExecutionResult> {
        let output = match self.command().output() {
            Ok(output) => output,
            Err(err) => return Err(self.spawn_error(err)),
        };
        self.check(output.status.code(), output.stdout, output.stderr)
    }

    fn spawn_error(&self, err: io::Error) -> anyhow::Error {
        let program = self.program.to_string_lossy();
        if err.kind() == io::ErrorKind::NotFound {
            anyhow::anyhow!("command '{}' not found on the host", program)
        } else {
            anyhow::Error::new(err).context(format!("spawning '{}'", self.display()))
        }
    }

    fn check(&self, code: Option<i32>, stdout: Vec<u8>, stderr: Vec<u8>) -> Result<ExecutionResult> {
        let command = self.program.to_string_lossy().into_owned();
        match code {
            // Terminated by a signal: cancelled from outside.
            None => Err(anyhow::Error::new(BuildError::Interrupted { command })),
            Some(status) if status != 0 && !self.tolerate_nonzero => {
                let err = anyhow::Error::new(BuildError::CommandFailed { command, status });
                if stderr.is_empty() {
                    Err(err)
                } else {
                    Err(err.context(String::from_utf8_lossy(&stderr).trim().to_string()))
                }
            }
            Some(status) => Ok(ExecutionResult {
                status,
                stdout,
                stderr,
            }),
        }
    }
}

/// Check that `path` exists, with a labelled error for diagnostics.
pub fn ensure_exists(path: &Path, label: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at: {}", label, path.display());
    }
    Ok(())
}
