//! Namespace handles for container network stacks
//!
//! `ip netns exec <name>` looks names up in a well-known directory. Publishing
//! a handle symlinks `<dir>/<pid>` to the container's `/proc/<pid>/ns/net`
//! for the duration of one operation, so namespace-scoped commands can
//! address the container without `nsenter`.

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A container's network namespace, identified by its process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetnsHandle {
    /// Container reference the handle was resolved from
    pub container: String,
    /// Process whose network namespace this is
    pub pid: i32,
}

impl NetnsHandle {
    /// Name under which the handle is published
    pub fn name(&self) -> String {
        self.pid.to_string()
    }
}

/// Resolves, publishes and retracts namespace handles
pub struct NamespaceHandles<'a> {
    dir: &'a Path,
    orchestrator: &'a dyn Orchestrator,
}

impl<'a> NamespaceHandles<'a> {
    pub fn new(dir: &'a Path, orchestrator: &'a dyn Orchestrator) -> Self {
        Self { dir, orchestrator }
    }

    /// Resolve a container reference to its namespace handle
    pub fn resolve(&self, container: &str) -> Result<NetnsHandle> {
        let state = self.orchestrator.inspect(container)?;

        if !state.known {
            return Err(Error::UnknownContainer(container.to_string()));
        }

        match state.pid {
            Some(pid) if state.running => Ok(NetnsHandle {
                container: container.to_string(),
                pid,
            }),
            _ => Err(Error::NotRunning(container.to_string())),
        }
    }

    /// Publish a handle so `ip netns exec` can find it
    ///
    /// Any entry already using the name is removed first: pids get reused,
    /// and a stale link would point at somebody else's namespace.
    pub fn publish(&self, handle: NetnsHandle) -> Result<PublishedHandle> {
        fs::create_dir_all(self.dir).map_err(|e| Error::NamespaceHandle {
            path: self.dir.to_path_buf(),
            source: e,
        })?;

        let path = self.dir.join(handle.name());
        remove_entry(&path)?;

        let target = PathBuf::from(format!("/proc/{}/ns/net", handle.pid));
        symlink(&target, &path).map_err(|e| Error::NamespaceHandle {
            path: path.clone(),
            source: e,
        })?;

        debug!("Published namespace handle {:?} -> {:?}", path, target);

        Ok(PublishedHandle {
            handle,
            path,
            retracted: false,
        })
    }

    /// Classify a failed step
    ///
    /// A container that died mid-operation makes every later command fail
    /// with noise that says nothing about the configuration, so that case is
    /// reported on its own.
    pub fn diagnose(&self, handle: &NetnsHandle, diagnostics: String) -> Error {
        if self.orchestrator.still_running(&handle.container, handle.pid) {
            Error::ConfigurationFailure {
                target: format!("container {}", handle.container),
                diagnostics,
            }
        } else {
            Error::ContainerDied(handle.container.clone())
        }
    }
}

/// A handle visible in the namespace directory
///
/// Retracted explicitly or on drop, whichever comes first.
#[derive(Debug)]
pub struct PublishedHandle {
    handle: NetnsHandle,
    path: PathBuf,
    retracted: bool,
}

impl PublishedHandle {
    pub fn handle(&self) -> &NetnsHandle {
        &self.handle
    }

    /// Namespace name to pass to `ip netns exec` / `ip link set netns`
    pub fn name(&self) -> String {
        self.handle.name()
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the published entry
    pub fn retract(mut self) -> Result<()> {
        self.retracted = true;
        remove_entry(&self.path)
    }
}

impl Drop for PublishedHandle {
    fn drop(&mut self) {
        if self.retracted {
            return;
        }

        if let Err(e) = remove_entry(&self.path) {
            warn!("Failed to retract namespace handle: {}", e);
        }
    }
}

fn remove_entry(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::NamespaceHandle {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
