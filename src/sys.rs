//! Privileged command execution
//!
//! Every kernel mutation goes through an external tool (`ip`, `ethtool`,
//! `iptables`). Commands are built as [`Cmd`] values, executed by a
//! [`Runner`], and recorded by a per-operation [`Exec`] whose diagnostic
//! output lands in a scoped temporary file.

use crate::error::{Error, Result};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// A single external command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Wrap this command so it runs inside a named network namespace
    ///
    /// Produces `<ip> netns exec <netns> <program> <args...>`.
    pub fn in_netns(self, ip: &str, netns: &str) -> Self {
        Cmd::new(ip)
            .args(["netns", "exec", netns])
            .arg(self.program)
            .args(self.args)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of one external command
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Executes external programs
///
/// `Err` is reserved for spawn failures; a command that ran and exited
/// non-zero is an `Ok(Output)` with `success == false`.
pub trait Runner: Send + Sync {
    fn run(&self, cmd: &Cmd) -> io::Result<Output>;
}

/// Runs commands on the real host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> io::Result<Output> {
        let output = Command::new(&cmd.program).args(&cmd.args).output()?;

        Ok(Output {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Per-operation executor
///
/// Diagnostics from every mutation are appended to a temporary file that
/// lives exactly as long as the `Exec`.
pub struct Exec<'r> {
    runner: &'r dyn Runner,
    diagnostics: NamedTempFile,
}

impl<'r> Exec<'r> {
    pub fn new(runner: &'r dyn Runner) -> Result<Self> {
        let diagnostics = tempfile::Builder::new()
            .prefix("weft-diag-")
            .tempfile()?;

        Ok(Self {
            runner,
            diagnostics,
        })
    }

    /// Run a check whose failure is an answer rather than an error
    pub fn probe(&self, cmd: &Cmd) -> bool {
        debug!("Probing: {}", cmd);
        match self.runner.run(cmd) {
            Ok(output) => output.success,
            Err(e) => {
                debug!("Probe '{}' could not run: {}", cmd, e);
                false
            }
        }
    }

    /// Run a read-only query, returning stdout on success
    pub fn query(&self, cmd: &Cmd) -> Option<String> {
        debug!("Querying: {}", cmd);
        match self.runner.run(cmd) {
            Ok(output) if output.success => Some(output.stdout),
            Ok(_) => None,
            Err(e) => {
                debug!("Query '{}' could not run: {}", cmd, e);
                None
            }
        }
    }

    /// Run a mutation, recording its diagnostics
    pub fn run(&self, cmd: &Cmd) -> Result<()> {
        self.execute(cmd).map(|_| ())
    }

    /// Run a query whose answer a step depends on
    ///
    /// Unlike [`Exec::query`], a failure is recorded and returned.
    pub fn read(&self, cmd: &Cmd) -> Result<String> {
        self.execute(cmd)
    }

    /// Run a mutation, treating a failure whose diagnostics contain
    /// `tolerated` as success
    ///
    /// Returns `false` when the tolerated failure occurred.
    pub fn run_tolerating(&self, cmd: &Cmd, tolerated: &str) -> Result<bool> {
        match self.execute(cmd) {
            Ok(_) => Ok(true),
            Err(Error::CommandFailed { message, .. }) if message.contains(tolerated) => {
                debug!("Tolerated failure of '{}': {}", cmd, message.trim());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn execute(&self, cmd: &Cmd) -> Result<String> {
        debug!("Running: {}", cmd);

        let output = self.runner.run(cmd).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::ToolMissing(cmd.program.clone())
            } else {
                Error::CommandFailed {
                    command: cmd.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let detail = if output.stderr.trim().is_empty() && !output.success {
            output.stdout.as_str()
        } else {
            output.stderr.as_str()
        };
        self.record(detail);

        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::CommandFailed {
                command: cmd.to_string(),
                message: detail.trim().to_string(),
            })
        }
    }

    fn record(&self, detail: &str) {
        if detail.trim().is_empty() {
            return;
        }

        let mut file = self.diagnostics.as_file();
        let written = file
            .write_all(detail.as_bytes())
            .and_then(|()| if detail.ends_with('\n') { Ok(()) } else { file.write_all(b"\n") });
        if let Err(e) = written {
            warn!("Failed to record diagnostics: {}", e);
        }
    }

    /// Everything recorded so far
    pub fn diagnostics(&self) -> String {
        fs::read_to_string(self.diagnostics.path()).unwrap_or_default()
    }

    /// Location of the diagnostic file
    #[cfg(test)]
    pub fn diagnostics_path(&self) -> &std::path::Path {
        self.diagnostics.path()
    }

    /// Collapse a step failure into a configuration failure carrying the
    /// captured diagnostics
    pub fn conclude<T>(&self, target: &str, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            if e.is_step_failure() {
                Error::ConfigurationFailure {
                    target: target.to_string(),
                    diagnostics: self.diagnostics_or(&e),
                }
            } else {
                e
            }
        })
    }

    /// Captured diagnostics, falling back to the error itself when the
    /// failing tool printed nothing
    pub fn diagnostics_or(&self, err: &Error) -> String {
        let captured = self.diagnostics();
        if captured.trim().is_empty() {
            err.to_string()
        } else {
            captured
        }
    }
}

/// Whether `path` is still present on disk
#[cfg(test)]
pub fn path_exists(path: &std::path::Path) -> bool {
    path.symlink_metadata().is_ok()
}
