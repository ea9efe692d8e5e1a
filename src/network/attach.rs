//! Container attachment
//!
//! Attaching wires a container into the fabric: a veth pair whose host end
//! joins the bridge and whose guest end becomes the container's fabric
//! interface, carrying one or more addresses. Detaching removes addresses
//! and takes the pair down with the last one.
//!
//! Every step is preceded by a check of the current kernel state, so both
//! operations converge when repeated. The per-container link state is
//! tracked by a [`LinkTracker`] that rejects transitions the kernel steps
//! should never produce.

use crate::error::Result;
use crate::manifest::WeftConfig;
use crate::network::ip;
use crate::network::link::LinkTracker;
use crate::network::netns::{NamespaceHandles, PublishedHandle};
use crate::network::veth::{VethNames, VethPair};
use crate::orchestrator::Orchestrator;
use crate::sys::{Cmd, Exec, Runner};
use ipnet::IpNet;
use tracing::{debug, info, warn};

/// Destination of the route that keeps multicast on the fabric
const MULTICAST_ROUTE: &str = "224.0.0.0/4";

/// What an attach did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The address was already present
    AlreadyBound,
    /// The pair existed and gained the address
    AddressAdded,
    /// A new pair was created and configured
    Created,
}

/// What a detach did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The address was not present
    NotBound,
    /// The address was removed, others remain
    AddressRemoved,
    /// The last address was removed along with the pair
    PairRemoved,
}

/// Attaches containers to and detaches them from the fabric
pub struct Attacher<'a> {
    config: &'a WeftConfig,
    runner: &'a dyn Runner,
    orchestrator: &'a dyn Orchestrator,
}

impl<'a> Attacher<'a> {
    pub fn new(config: &'a WeftConfig, runner: &'a dyn Runner, orchestrator: &'a dyn Orchestrator) -> Self {
        Self {
            config,
            runner,
            orchestrator,
        }
    }

    /// Bind `cidr` inside `container`, creating its veth pair if needed
    ///
    /// `offload_device` is the in-container device whose tx offload is
    /// disabled when the pair is first set up.
    pub fn attach(&self, container: &str, cidr: &str, offload_device: &str) -> Result<AttachOutcome> {
        let address = ip::parse_address(cidr)?;

        let outcome = self.with_container_netns(container, |exec, netns| {
            self.attach_in(exec, netns, &address, offload_device)
        })?;

        info!("Attached {} to {}: {:?}", container, address, outcome);
        Ok(outcome)
    }

    /// Remove `cidr` from `container`, and the pair if it was the last address
    pub fn detach(&self, container: &str, cidr: &str) -> Result<DetachOutcome> {
        let address = ip::parse_address(cidr)?;

        let outcome = self.with_container_netns(container, |exec, netns| self.detach_in(exec, netns, &address))?;

        info!("Detached {} from {}: {:?}", address, container, outcome);
        Ok(outcome)
    }

    /// Run `op` with the container's namespace handle published
    ///
    /// The handle and the diagnostic file are removed on every path. A step
    /// failure is classified as a configuration failure or a dead container.
    fn with_container_netns<T>(
        &self,
        container: &str,
        op: impl FnOnce(&Exec, &PublishedHandle) -> Result<T>,
    ) -> Result<T> {
        let handles = NamespaceHandles::new(&self.config.paths.netns_dir, self.orchestrator);
        let handle = handles.resolve(container)?;
        let published = handles.publish(handle)?;
        let exec = Exec::new(self.runner)?;

        let result = match op(&exec, &published) {
            Err(e) if e.is_step_failure() => Err(handles.diagnose(published.handle(), exec.diagnostics_or(&e))),
            other => other,
        };

        match (result, published.retract()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), retracted) => {
                if let Err(cleanup) = retracted {
                    warn!("Failed to retract namespace handle: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn attach_in(
        &self,
        exec: &Exec,
        netns: &PublishedHandle,
        address: &IpNet,
        offload_device: &str,
    ) -> Result<AttachOutcome> {
        let names = VethNames::for_pid(&self.config.container.interface, netns.handle().pid);
        let pair = VethPair::new(&names, &self.config.tools.ip, self.config.bridge.mtu);
        let mut tracker = LinkTracker::new(&names);
        let ns = netns.name();

        if pair.exists(exec) {
            tracker.adopt()?;

            if !self.is_bound(exec, &ns, address) {
                self.bind(exec, &ns, address)?;
                tracker.bind()?;
                return Ok(AttachOutcome::AddressAdded);
            }

            tracker.bind()?;
            debug!("{} already bound on {}", address, names.local);
            return Ok(AttachOutcome::AlreadyBound);
        }

        pair.create(exec)?;
        tracker.create()?;
        info!("Created veth pair {}/{}", names.local, names.guest);

        if let Err(e) = self.plumb(exec, &pair, &names, &ns, address, offload_device, &mut tracker) {
            warn!("Rolling back veth pair {}", names.local);
            if let Err(cleanup) = pair.destroy(exec) {
                warn!("Failed to remove {}: {}", names.local, cleanup);
            }
            if let Err(invalid) = tracker.abort() {
                warn!("{}", invalid);
            }
            return Err(e);
        }

        Ok(AttachOutcome::Created)
    }

    /// Wire a fresh pair into the bridge and the container
    #[allow(clippy::too_many_arguments)]
    fn plumb(
        &self,
        exec: &Exec,
        pair: &VethPair,
        names: &VethNames,
        ns: &str,
        address: &IpNet,
        offload_device: &str,
        tracker: &mut LinkTracker,
    ) -> Result<()> {
        let ifname: &str = &self.config.container.interface;

        pair.attach_to_bridge(exec, &self.config.bridge.name)?;
        pair.up(exec)?;
        pair.move_to_netns(exec, ns)?;

        exec.run(&self.in_container(ns, ["link", "set", "dev", &names.guest, "name", ifname]))?;
        self.bind(exec, ns, address)?;
        exec.run(&self.in_container(ns, ["link", "set", "dev", ifname, "up"]))?;

        self.add_multicast_route(exec, ns);
        self.disable_tx_offload(exec, ns, offload_device);

        tracker.bind()
    }

    fn detach_in(&self, exec: &Exec, netns: &PublishedHandle, address: &IpNet) -> Result<DetachOutcome> {
        let names = VethNames::for_pid(&self.config.container.interface, netns.handle().pid);
        let pair = VethPair::new(&names, &self.config.tools.ip, self.config.bridge.mtu);
        let mut tracker = LinkTracker::new(&names);
        let ns = netns.name();
        let ifname: &str = &self.config.container.interface;

        if !self.is_bound(exec, &ns, address) {
            debug!("{} not bound in namespace {}", address, ns);
            // Left behind by a detach that failed after removing the last address
            if pair.exists(exec) && self.counted_bindings(exec, &ns)? == 0 {
                pair.destroy(exec)?;
                info!("Removed address-less veth pair {}", names.local);
            }
            return Ok(DetachOutcome::NotBound);
        }
        tracker.adopt()?;
        tracker.bind()?;

        let cidr = address.to_string();
        exec.run(&self.in_container(&ns, ["addr", "del", &cidr, "dev", ifname]))?;
        tracker.unbind()?;

        let remaining = self.counted_bindings(exec, &ns)?;
        if remaining > 0 {
            debug!("{} address(es) left on {}", remaining, ifname);
            return Ok(DetachOutcome::AddressRemoved);
        }

        if pair.exists(exec) {
            pair.destroy(exec)?;
            info!("Removed veth pair {}", names.local);
        } else {
            debug!("{} has no host end to remove", ifname);
        }
        tracker.teardown()?;

        Ok(DetachOutcome::PairRemoved)
    }

    fn bind(&self, exec: &Exec, ns: &str, address: &IpNet) -> Result<()> {
        let cidr = address.to_string();
        exec.run(&self.in_container(ns, ["addr", "add", &cidr, "dev", &self.config.container.interface]))
    }

    /// Whether `address` is on the container-facing device
    ///
    /// A missing device simply has nothing bound.
    fn is_bound(&self, exec: &Exec, ns: &str, address: &IpNet) -> bool {
        exec.query(&self.in_container(ns, ["addr", "show", "dev", &self.config.container.interface]))
            .is_some_and(|listing| ip::is_bound(&listing, address))
    }

    /// IPv4 and global IPv6 addresses left on the container-facing device
    ///
    /// Link-local IPv6 addresses belong to the kernel, not to us, and never
    /// keep a pair alive. An unreadable listing is a failed step: the pair
    /// stays until the count is known.
    fn counted_bindings(&self, exec: &Exec, ns: &str) -> Result<usize> {
        let listing = exec.read(&self.in_container(
            ns,
            ["addr", "show", "dev", &self.config.container.interface, "scope", "global"],
        ))?;
        Ok(ip::parse_bindings(&listing).len())
    }

    fn add_multicast_route(&self, exec: &Exec, ns: &str) {
        let present = exec
            .query(&self.in_container(ns, ["route", "show"]))
            .is_some_and(|routes| routes.lines().any(|route| route.starts_with(MULTICAST_ROUTE)));
        if present {
            return;
        }

        let cmd = self.in_container(ns, ["route", "add", MULTICAST_ROUTE, "dev", &self.config.container.interface]);
        if let Err(e) = exec.run(&cmd) {
            warn!("Failed to add multicast route in namespace {}: {}", ns, e);
        }
    }

    fn disable_tx_offload(&self, exec: &Exec, ns: &str, device: &str) {
        let cmd = Cmd::new(&self.config.tools.ethtool)
            .args(["-K", device, "tx", "off"])
            .in_netns(&self.config.tools.ip, ns);

        if let Err(e) = exec.run(&cmd) {
            warn!("Failed to disable tx offload on {} in namespace {}: {}", device, ns, e);
        }
    }

    fn in_container<const N: usize>(&self, ns: &str, args: [&str; N]) -> Cmd {
        let ip: &str = &self.config.tools.ip;
        Cmd::new(ip).args(args).in_netns(ip, ns)
    }
}
