//! NAT masquerading for fabric traffic
//!
//! Rules live in a dedicated chain of the `nat` table, reached from
//! `POSTROUTING`, so they can be removed as a unit without touching the
//! host's own rules. iptables appends duplicates happily, so every insertion
//! is preceded by a `-C` check.

use crate::error::Result;
use crate::manifest::WeftConfig;
use crate::network::ip;
use crate::sys::{Cmd, Exec, Runner};
use std::sync::OnceLock;
use tracing::{debug, info};

const NO_CHAIN: &str = "No chain/target/match";

/// Whether iptables accepts `-w`, probed once per process
static IPTABLES_WAIT: OnceLock<bool> = OnceLock::new();

/// Manager for the fabric's masquerade chain
pub struct Masquerade<'a> {
    config: &'a WeftConfig,
    runner: &'a dyn Runner,
    wait: &'a OnceLock<bool>,
}

impl<'a> Masquerade<'a> {
    pub fn new(config: &'a WeftConfig, runner: &'a dyn Runner) -> Self {
        Self {
            config,
            runner,
            wait: &IPTABLES_WAIT,
        }
    }

    /// Answer the `-w` question from `wait` instead of the process cache
    #[cfg(test)]
    fn with_wait_cache(config: &'a WeftConfig, runner: &'a dyn Runner, wait: &'a OnceLock<bool>) -> Self {
        Self { config, runner, wait }
    }

    fn chain(&self) -> &str {
        &self.config.nat.chain
    }

    /// Masquerade traffic between `subnet` and the outside world
    pub fn setup(&self, subnet: &str) -> Result<()> {
        let subnet = ip::parse_subnet(subnet)?.to_string();

        let exec = Exec::new(self.runner)?;
        let result = self.install(&exec, &subnet);
        exec.conclude(&format!("NAT chain {}", self.chain()), result)
    }

    fn install(&self, exec: &Exec, subnet: &str) -> Result<()> {
        let chain = self.chain();
        let bridge: &str = &self.config.bridge.name;

        if exec.run_tolerating(&self.nat(exec, &["-N", chain]), "Chain already exists")? {
            info!("Created NAT chain {}", chain);
        }

        self.ensure_rule(exec, "POSTROUTING", &["-j", chain])?;
        // Inbound from elsewhere onto the fabric
        self.ensure_rule(exec, chain, &["-o", bridge, "!", "-s", subnet, "-j", "MASQUERADE"])?;
        // Outbound from the fabric to elsewhere
        self.ensure_rule(exec, chain, &["-s", subnet, "!", "-o", bridge, "-j", "MASQUERADE"])?;

        info!("Masquerading {} via {}", subnet, bridge);
        Ok(())
    }

    /// Remove the chain and its hook; absent pieces are skipped
    pub fn stop(&self) -> Result<()> {
        let exec = Exec::new(self.runner)?;
        let result = self.remove(&exec);
        exec.conclude(&format!("NAT chain {}", self.chain()), result)
    }

    fn remove(&self, exec: &Exec) -> Result<()> {
        let chain = self.chain();

        exec.run_tolerating(&self.nat(exec, &["-F", chain]), NO_CHAIN)?;

        if exec.probe(&self.nat(exec, &["-C", "POSTROUTING", "-j", chain])) {
            exec.run(&self.nat(exec, &["-D", "POSTROUTING", "-j", chain]))?;
        }

        if exec.run_tolerating(&self.nat(exec, &["-X", chain]), NO_CHAIN)? {
            info!("Removed NAT chain {}", chain);
        }

        Ok(())
    }

    fn ensure_rule(&self, exec: &Exec, chain: &str, rule: &[&str]) -> Result<()> {
        let check = [&["-C", chain][..], rule].concat();
        if exec.probe(&self.nat(exec, &check)) {
            debug!("Rule '{}' already in {}", rule.join(" "), chain);
            return Ok(());
        }

        let append = [&["-A", chain][..], rule].concat();
        exec.run(&self.nat(exec, &append))
    }

    fn supports_wait(&self, exec: &Exec) -> bool {
        *self.wait.get_or_init(|| {
            let supported = exec.probe(&Cmd::new(&self.config.tools.iptables).args(["-w", "-S"]));
            debug!("iptables -w supported: {}", supported);
            supported
        })
    }

    fn nat(&self, exec: &Exec, args: &[&str]) -> Cmd {
        let mut cmd = Cmd::new(&self.config.tools.iptables);
        if self.supports_wait(exec) {
            cmd = cmd.arg("-w");
        }
        cmd.args(["-t", "nat"]).args(args.iter().copied())
    }
}
