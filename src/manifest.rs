//! Configuration file parsing for weft
//!
//! Parses `weft.toml` configuration files using serde. Every field has a
//! default, so a host without a config file gets the stock fabric.

use crate::error::{Error, Result};
use crate::network::veth::{MAX_IFNAME_LEN, VethNames};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file consulted when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/weft/weft.toml";

/// Highest pid the kernel can hand out (`PID_MAX_LIMIT` on 64-bit)
const PID_MAX_LIMIT: i32 = 4_194_304;

/// iptables rejects chain names longer than this
const MAX_CHAIN_LEN: usize = 28;

/// Load configuration from a file
pub fn load(path: &Path) -> Result<WeftConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: WeftConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Load the configuration for this invocation
///
/// An explicitly requested file must exist. The default location is
/// optional and falls back to built-in defaults.
pub fn load_or_default(explicit: Option<&Path>) -> Result<WeftConfig> {
    match explicit {
        Some(path) => load(path),
        None => {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            if path.exists() {
                load(path)
            } else {
                Ok(WeftConfig::default())
            }
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeftConfig {
    /// Shared bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// In-container interface settings
    #[serde(default)]
    pub container: ContainerConfig,

    /// NAT chain settings
    #[serde(default)]
    pub nat: NatConfig,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// External tool binaries
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl WeftConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ifname("bridge name", &self.bridge.name)?;

        if !(68..=65535).contains(&self.bridge.mtu) {
            return Err(Error::ConfigValidation(format!(
                "MTU {} out of range 68-65535",
                self.bridge.mtu
            )));
        }

        validate_ifname("container interface", &self.container.interface)?;

        // Derived veth names must fit for every possible pid
        let widest = VethNames::for_pid(&self.container.interface, PID_MAX_LIMIT);
        if widest.local.len() > MAX_IFNAME_LEN {
            return Err(Error::ConfigValidation(format!(
                "Container interface '{}' too long: derived veth name '{}' exceeds {} bytes",
                self.container.interface, widest.local, MAX_IFNAME_LEN
            )));
        }

        validate_ifname("offload device", &self.container.offload_device)?;

        let chain = &self.nat.chain;
        if chain.is_empty() || chain.len() > MAX_CHAIN_LEN || chain.contains(char::is_whitespace) {
            return Err(Error::ConfigValidation(format!(
                "Invalid NAT chain name '{}': must be 1-{} bytes without whitespace",
                chain, MAX_CHAIN_LEN
            )));
        }

        for (tool, binary) in [
            ("ip", &self.tools.ip),
            ("iptables", &self.tools.iptables),
            ("ethtool", &self.tools.ethtool),
            ("docker", &self.tools.docker),
        ] {
            if binary.trim().is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "Tool '{}' has an empty binary path",
                    tool
                )));
            }
        }

        Ok(())
    }
}

fn validate_ifname(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(Error::ConfigValidation(format!(
            "Invalid {} '{}': must be 1-{} bytes",
            what, name, MAX_IFNAME_LEN
        )));
    }

    if name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(Error::ConfigValidation(format!(
            "Invalid {} '{}': contains '/', ':' or whitespace",
            what, name
        )));
    }

    Ok(())
}

/// Bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Bridge device name
    #[serde(default = "default_bridge_name")]
    pub name: String,

    /// MTU for the bridge and every veth end
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            mtu: default_mtu(),
        }
    }
}

/// Container-side interface configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    /// Canonical name of the fabric interface inside containers
    #[serde(default = "default_container_interface")]
    pub interface: String,

    /// Device whose tx offload is disabled inside the container
    #[serde(default = "default_offload_device")]
    pub offload_device: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            interface: default_container_interface(),
            offload_device: default_offload_device(),
        }
    }
}

/// NAT configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatConfig {
    /// Dedicated chain in the nat table
    #[serde(default = "default_chain")]
    pub chain: String,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory where `ip netns` looks up named namespaces
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,

    /// Runtime state (bridge MAC, lock file); expected to be cleared on boot
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            netns_dir: default_netns_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// External tool binaries
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_ip")]
    pub ip: String,

    #[serde(default = "default_iptables")]
    pub iptables: String,

    #[serde(default = "default_ethtool")]
    pub ethtool: String,

    #[serde(default = "default_docker")]
    pub docker: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            iptables: default_iptables(),
            ethtool: default_ethtool(),
            docker: default_docker(),
        }
    }
}

fn default_bridge_name() -> String {
    "weave".into()
}

fn default_mtu() -> u32 {
    65535
}

fn default_container_interface() -> String {
    "ethwe".into()
}

fn default_offload_device() -> String {
    "eth0".into()
}

fn default_chain() -> String {
    "WEAVE".into()
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from("/var/run/netns")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/weft")
}

fn default_ip() -> String {
    "ip".into()
}

fn default_iptables() -> String {
    "iptables".into()
}

fn default_ethtool() -> String {
    "ethtool".into()
}

fn default_docker() -> String {
    "docker".into()
}
