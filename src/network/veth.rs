//! Veth pair management for container attachment
//!
//! A veth pair is a virtual Ethernet cable. The local end stays in the host
//! namespace and joins the bridge; the guest end moves into the container's
//! namespace and is renamed to the canonical container-facing name.

use crate::error::Result;
use crate::sys::{Cmd, Exec};

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL)
pub const MAX_IFNAME_LEN: usize = libc::IFNAMSIZ - 1;

/// Deterministic names for a container's veth pair
///
/// Names derive only from the container-facing interface name and the
/// namespace pid, so a second attach rediscovers the pair it created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethNames {
    /// Host-side end, enslaved to the bridge
    pub local: String,
    /// Container-side end before it is renamed inside the namespace
    pub guest: String,
}

impl VethNames {
    /// Names for the pair serving `pid`, e.g. `vethwepl4242`/`vethwepg4242`
    pub fn for_pid(container_ifname: &str, pid: i32) -> Self {
        Self {
            local: format!("v{}pl{}", container_ifname, pid),
            guest: format!("v{}pg{}", container_ifname, pid),
        }
    }
}

/// Host-side operations on one veth pair
pub struct VethPair<'a> {
    names: &'a VethNames,
    ip: &'a str,
    mtu: u32,
}

impl<'a> VethPair<'a> {
    pub fn new(names: &'a VethNames, ip: &'a str, mtu: u32) -> Self {
        Self { names, ip, mtu }
    }

    /// Whether the local end exists in the host namespace
    pub fn exists(&self, exec: &Exec) -> bool {
        exec.probe(&self.link(["show", "dev", &self.names.local]))
    }

    /// Create both ends in one call, each carrying the fabric MTU
    pub fn create(&self, exec: &Exec) -> Result<()> {
        let mtu = self.mtu.to_string();
        exec.run(&self.link([
            "add",
            "name",
            &self.names.local,
            "mtu",
            &mtu,
            "type",
            "veth",
            "peer",
            "name",
            &self.names.guest,
            "mtu",
            &mtu,
        ]))
    }

    /// Enslave the local end to `bridge`
    pub fn attach_to_bridge(&self, exec: &Exec, bridge: &str) -> Result<()> {
        exec.run(&self.link(["set", "dev", &self.names.local, "master", bridge]))
    }

    /// Bring the local end up
    pub fn up(&self, exec: &Exec) -> Result<()> {
        exec.run(&self.link(["set", "dev", &self.names.local, "up"]))
    }

    /// Move the guest end into the namespace named `netns`
    pub fn move_to_netns(&self, exec: &Exec, netns: &str) -> Result<()> {
        exec.run(&self.link(["set", "dev", &self.names.guest, "netns", netns]))
    }

    /// Delete the pair
    ///
    /// Deleting the local end makes the kernel remove its peer, wherever
    /// that peer lives.
    pub fn destroy(&self, exec: &Exec) -> Result<()> {
        exec.run(&self.link(["del", "dev", &self.names.local]))
    }

    fn link<const N: usize>(&self, args: [&str; N]) -> Cmd {
        Cmd::new(self.ip).arg("link").args(args)
    }
}
