//! Bridge lifecycle
//!
//! Provides:
//! - Idempotent creation of the fabric bridge, serialized by a file lock
//! - A hardware address that stays stable across re-creation within a boot
//! - MTU raising through a throwaway dummy member
//! - Destruction

use crate::error::{Error, Result};
use crate::manifest::WeftConfig;
use crate::sys::{Cmd, Exec, Runner};
use nix::fcntl::{Flock, FlockArg};
use rand::Rng;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// First octet of generated bridge addresses (locally administered, unicast)
pub const MAC_PREFIX: u8 = 0x7a;

/// The fabric bridge
pub struct Bridge<'a> {
    config: &'a WeftConfig,
    runner: &'a dyn Runner,
}

impl<'a> Bridge<'a> {
    pub fn new(config: &'a WeftConfig, runner: &'a dyn Runner) -> Self {
        Self { config, runner }
    }

    fn name(&self) -> &str {
        &self.config.bridge.name
    }

    /// Create the bridge if needed and bring it up
    ///
    /// Safe to call repeatedly and from concurrent invocations.
    pub fn create(&self) -> Result<()> {
        let exec = Exec::new(self.runner)?;
        let _lock = self.lock()?;

        let result = self.create_locked(&exec);
        exec.conclude(&format!("bridge {}", self.name()), result)
    }

    fn create_locked(&self, exec: &Exec) -> Result<()> {
        let name = self.name();

        if self.exists(exec) {
            debug!("Bridge {} already exists", name);
        } else if exec.run_tolerating(&self.link(["add", "name", name, "type", "bridge"]), "File exists")? {
            info!("Created bridge {}", name);
            // A half-configured bridge would be taken as finished next time
            if let Err(e) = self.configure(exec) {
                warn!("Removing partially configured bridge {}", name);
                if let Err(cleanup) = exec.run(&self.link(["del", "dev", name])) {
                    warn!("Failed to remove {}: {}", name, cleanup);
                }
                return Err(e);
            }
        } else {
            // Another creator that does not take our lock got there first
            debug!("Bridge {} appeared concurrently", name);
        }

        exec.run(&self.link(["set", "dev", name, "up"]))
    }

    fn configure(&self, exec: &Exec) -> Result<()> {
        let mac = self.persisted_mac()?;
        exec.run(&self.link(["set", "dev", self.name(), "address", &mac]))?;

        self.raise_mtu(exec)?;
        self.disable_offload(exec)
    }

    /// A bridge's MTU is the minimum of its members', so it only rises once
    /// a member advertising the target MTU has joined. The bridge keeps that
    /// MTU after the member leaves.
    fn raise_mtu(&self, exec: &Exec) -> Result<()> {
        let dummy = format!("v{}du", self.config.container.interface);
        let mtu = self.config.bridge.mtu.to_string();

        // Leftover from an interrupted creation
        if exec.probe(&self.link(["show", "dev", &dummy])) {
            exec.run(&self.link(["del", "dev", &dummy]))?;
        }

        exec.run(&self.link(["add", "name", &dummy, "mtu", &mtu, "type", "dummy"]))?;
        let enslaved = exec.run(&self.link(["set", "dev", &dummy, "master", self.name()]));
        let removed = exec.run(&self.link(["del", "dev", &dummy]));

        enslaved.and(removed)?;
        debug!("Raised MTU of {} to {}", self.name(), mtu);
        Ok(())
    }

    fn disable_offload(&self, exec: &Exec) -> Result<()> {
        let cmd = Cmd::new(&self.config.tools.ethtool).args(["-K", self.name(), "rx", "off", "tx", "off"]);

        match exec.run(&cmd) {
            Err(Error::ToolMissing(tool)) => {
                warn!("{} not found, leaving offload enabled on {}", tool, self.name());
                Ok(())
            }
            other => other,
        }
    }

    /// Delete the bridge if present
    pub fn destroy(&self) -> Result<()> {
        let exec = Exec::new(self.runner)?;
        let name = self.name();

        let result = if self.exists(&exec) {
            exec.run_tolerating(&self.link(["del", "dev", name]), "Cannot find device")
                .map(|removed| {
                    if removed {
                        info!("Destroyed bridge {}", name);
                    }
                })
        } else {
            debug!("Bridge {} not present", name);
            Ok(())
        };

        exec.conclude(&format!("bridge {}", name), result)
    }

    /// Whether the bridge device exists
    pub fn exists(&self, exec: &Exec) -> bool {
        exec.probe(&self.link(["show", "dev", self.name()]))
    }

    /// File holding the bridge's hardware address
    pub fn mac_path(&self) -> PathBuf {
        self.config
            .paths
            .state_dir
            .join(format!("{}.mac", self.name()))
    }

    fn persisted_mac(&self) -> Result<String> {
        let path = self.mac_path();

        match fs::read_to_string(&path) {
            Ok(content) if is_mac(content.trim()) => return Ok(content.trim().to_string()),
            Ok(_) => warn!("Ignoring malformed MAC address in {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mac = random_mac();
        fs::write(&path, format!("{}\n", mac))?;
        debug!("Generated bridge MAC {} in {:?}", mac, path);

        Ok(mac)
    }

    fn lock(&self) -> Result<Flock<File>> {
        let dir = &self.config.paths.state_dir;
        fs::create_dir_all(dir)?;

        let path = dir.join(format!("{}.lock", self.name()));
        let file = File::options()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        debug!("Acquiring bridge lock {:?}", path);
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| Error::Io(io::Error::from(errno)))
    }

    fn link<const N: usize>(&self, args: [&str; N]) -> Cmd {
        Cmd::new(&self.config.tools.ip).arg("link").args(args)
    }
}

/// Random MAC address carrying [`MAC_PREFIX`]
pub fn random_mac() -> String {
    let mut octets = [0u8; 6];
    rand::rng().fill(&mut octets[1..]);
    octets[0] = MAC_PREFIX;

    octets
        .iter()
        .map(|octet| format!("{:02x}", octet))
        .collect::<Vec<_>>()
        .join(":")
}

fn is_mac(value: &str) -> bool {
    let octets: Vec<&str> = value.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}
