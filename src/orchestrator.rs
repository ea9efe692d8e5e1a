//! Container orchestrator queries
//!
//! The fabric never creates or starts containers; it only asks the
//! orchestrator which process backs a container reference.

use crate::error::{Error, Result};
use crate::sys::{Cmd, Runner};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Deserialize;
use std::io;
use tracing::debug;

/// What the orchestrator knows about a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    /// The orchestrator has a record of the reference
    pub known: bool,
    /// The container is running
    pub running: bool,
    /// Process backing the container's namespaces (None when stopped)
    pub pid: Option<i32>,
}

impl ContainerState {
    pub fn unknown() -> Self {
        Self {
            known: false,
            running: false,
            pid: None,
        }
    }
}

/// Source of container state
pub trait Orchestrator: Send + Sync {
    /// Look up a container by reference
    fn inspect(&self, container: &str) -> Result<ContainerState>;

    /// Liveness probe: the container still runs under the same pid
    fn still_running(&self, container: &str, pid: i32) -> bool {
        matches!(
            self.inspect(container),
            Ok(state) if state.running && state.pid == Some(pid)
        )
    }
}

/// Docker, queried through its CLI
pub struct Docker<'a> {
    binary: &'a str,
    runner: &'a dyn Runner,
}

impl<'a> Docker<'a> {
    pub fn new(binary: &'a str, runner: &'a dyn Runner) -> Self {
        Self { binary, runner }
    }
}

impl Orchestrator for Docker<'_> {
    fn inspect(&self, container: &str) -> Result<ContainerState> {
        let cmd = Cmd::new(self.binary).args(["inspect", "--type", "container", container]);
        debug!("Inspecting container: {}", cmd);

        let output = self.runner.run(&cmd).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::ToolMissing(self.binary.to_string())
            } else {
                Error::Orchestrator(format!("Failed to run {}: {}", self.binary, e))
            }
        })?;

        if !output.success {
            if output.stderr.contains("No such container") || output.stderr.contains("No such object") {
                return Ok(ContainerState::unknown());
            }
            return Err(Error::Orchestrator(output.stderr.trim().to_string()));
        }

        parse_inspect(&output.stdout)
    }

    fn still_running(&self, container: &str, pid: i32) -> bool {
        if !process_alive(pid) {
            return false;
        }

        matches!(
            self.inspect(container),
            Ok(state) if state.running && state.pid == Some(pid)
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    pid: i32,
}

/// Parse `docker inspect` JSON output
///
/// A pid of 0 is Docker's "no process" sentinel.
pub fn parse_inspect(json: &str) -> Result<ContainerState> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json)
        .map_err(|e| Error::Orchestrator(format!("Unexpected inspect output: {}", e)))?;

    Ok(match entries.first() {
        None => ContainerState::unknown(),
        Some(entry) => ContainerState {
            known: true,
            running: entry.state.running,
            pid: (entry.state.pid > 0).then_some(entry.state.pid),
        },
    })
}

/// Whether a process exists (signal 0 probe)
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists, but owned by someone we may not signal
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
