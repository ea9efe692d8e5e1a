//! Simulated host for exercising the fabric without privileges
//!
//! `FakeHost` interprets the `ip`, `ethtool` and `iptables` command lines the
//! fabric issues against in-memory kernel state, and answers orchestrator
//! queries from a table of fake containers. Namespace-scoped commands only
//! reach a container when its handle is really published in the netns
//! directory, so handle publication is exercised too.

use crate::error::Result;
use crate::manifest::WeftConfig;
use crate::orchestrator::{ContainerState, Orchestrator};
use crate::sys::{Cmd, Output, Runner};
use ipnet::IpNet;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key of the host namespace
const HOST: &str = "";

const NO_CHAIN: &str = "iptables: No chain/target/match by that name.";
const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Physical,
    Bridge,
    Dummy,
    Veth,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub id: u32,
    pub kind: LinkKind,
    pub mtu: u32,
    pub address: Option<String>,
    pub master: Option<String>,
    pub up: bool,
    pub offload: bool,
    pub addrs: Vec<IpNet>,
    peer: Option<u32>,
}

impl Link {
    fn new(id: u32, kind: LinkKind, mtu: u32) -> Self {
        Self {
            id,
            kind,
            mtu,
            address: None,
            master: None,
            up: false,
            offload: true,
            addrs: Vec::new(),
            peer: None,
        }
    }
}

#[derive(Debug, Default)]
struct Namespace {
    links: BTreeMap<String, Link>,
    routes: Vec<String>,
}

impl Namespace {
    fn with_devices(devices: &mut impl FnMut() -> u32) -> Self {
        let mut ns = Self::default();
        for name in ["lo", "eth0"] {
            let mut link = Link::new(devices(), LinkKind::Physical, 1500);
            link.up = true;
            ns.links.insert(name.to_string(), link);
        }
        ns
    }
}

#[derive(Debug)]
struct Container {
    pid: i32,
    running: bool,
}

struct Kernel {
    namespaces: HashMap<String, Namespace>,
    chains: BTreeMap<String, Vec<String>>,
    containers: HashMap<String, Container>,
    history: Vec<String>,
    missing_tools: HashSet<String>,
    wait_supported: bool,
    fail_on: Option<(String, String)>,
    kill_on: Option<(String, String)>,
    next_id: u32,
}

fn ok(stdout: impl Into<String>) -> Output {
    Output {
        success: true,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(stderr: impl Into<String>) -> Output {
    Output {
        success: false,
        stdout: String::new(),
        stderr: format!("{}\n", stderr.into()),
    }
}

fn is_link_local(addr: &IpNet) -> bool {
    match addr {
        IpNet::V6(net) => net.addr().segments()[0] & 0xffc0 == 0xfe80,
        IpNet::V4(_) => false,
    }
}

fn jump_target(rule: &str) -> Option<&str> {
    let mut tokens = rule.split_whitespace();
    tokens.find(|t| *t == "-j")?;
    tokens.next()
}

impl Kernel {
    fn new() -> Self {
        let mut next_id = 0;
        let mut devices = || {
            next_id += 1;
            next_id
        };
        let host = Namespace::with_devices(&mut devices);

        let mut namespaces = HashMap::new();
        namespaces.insert(HOST.to_string(), host);

        let mut chains = BTreeMap::new();
        chains.insert("POSTROUTING".to_string(), Vec::new());

        Self {
            namespaces,
            chains,
            containers: HashMap::new(),
            history: Vec::new(),
            missing_tools: HashSet::new(),
            wait_supported: true,
            fail_on: None,
            kill_on: None,
            next_id,
        }
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn find(&self, ns: &str, dev: &str) -> Option<&Link> {
        self.namespaces.get(ns)?.links.get(dev)
    }

    fn find_mut(&mut self, ns: &str, dev: &str) -> Option<&mut Link> {
        self.namespaces.get_mut(ns)?.links.get_mut(dev)
    }

    /// Namespace key for a published handle, if it points at a live container
    fn resolve_netns(&self, netns_dir: &Path, name: &str) -> Option<String> {
        let target = fs::read_link(netns_dir.join(name)).ok()?;
        let pid = target
            .to_str()?
            .strip_prefix("/proc/")?
            .strip_suffix("/ns/net")?
            .to_string();

        let alive = self
            .containers
            .values()
            .any(|c| c.running && c.pid.to_string() == pid);

        (alive && self.namespaces.contains_key(&pid)).then_some(pid)
    }

    fn remove_by_id(&mut self, id: u32) {
        for ns in self.namespaces.values_mut() {
            let gone: Vec<String> = ns
                .links
                .iter()
                .filter(|(_, link)| link.id == id)
                .map(|(name, _)| format!(" dev {} ", name))
                .collect();
            ns.links.retain(|_, link| link.id != id);
            ns.routes.retain(|route| !gone.iter().any(|via| route.contains(via.as_str())));
        }
    }

    fn kill(&mut self, container: &str) {
        let Some(entry) = self.containers.get_mut(container) else {
            return;
        };
        entry.running = false;
        let pid = entry.pid;

        // Destroying a namespace destroys its veth ends, and with them the peers
        if let Some(ns) = self.namespaces.remove(&pid.to_string()) {
            for link in ns.links.values() {
                if let Some(peer) = link.peer {
                    self.remove_by_id(peer);
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        netns_dir: &Path,
        ns: &str,
        program: &str,
        args: &[&str],
    ) -> io::Result<Output> {
        if self.missing_tools.contains(program) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }

        Ok(match program {
            "ip" => self.ip(netns_dir, ns, args),
            "ethtool" => self.ethtool(ns, args),
            "iptables" => self.iptables(args),
            other => fail(format!("{}: command not found", other)),
        })
    }

    fn ip(&mut self, netns_dir: &Path, ns: &str, args: &[&str]) -> Output {
        match args {
            ["netns", "exec", name, program, rest @ ..] => {
                let Some(target) = self.resolve_netns(netns_dir, name) else {
                    return fail(format!(
                        "Cannot open network namespace \"{}\": No such file or directory",
                        name
                    ));
                };
                if self.missing_tools.contains(*program) {
                    return fail(format!(
                        "exec of \"{}\" failed: No such file or directory",
                        program
                    ));
                }
                match self.dispatch(netns_dir, &target, program, rest) {
                    Ok(output) => output,
                    Err(e) => fail(e.to_string()),
                }
            }
            ["link", rest @ ..] => self.link(netns_dir, ns, rest),
            ["addr", rest @ ..] => self.addr(ns, rest),
            ["route", rest @ ..] => self.route(ns, rest),
            _ => fail(format!("Object \"{}\" is unknown", args.join(" "))),
        }
    }

    fn link(&mut self, netns_dir: &Path, ns: &str, args: &[&str]) -> Output {
        match args {
            ["show", "dev", dev] => match self.find(ns, dev) {
                Some(link) => ok(format!(
                    "{}: {}: <BROADCAST,MULTICAST{}> mtu {}\n",
                    link.id,
                    dev,
                    if link.up { ",UP" } else { "" },
                    link.mtu
                )),
                None => fail(format!("Device \"{}\" does not exist.", dev)),
            },
            ["add", "name", name, "type", "bridge"] => self.add_link(ns, name, LinkKind::Bridge, 1500),
            ["add", "name", name, "mtu", mtu, "type", "dummy"] => match mtu.parse() {
                Ok(mtu) => self.add_link(ns, name, LinkKind::Dummy, mtu),
                Err(_) => fail(format!("Error: argument \"{}\" is wrong: Invalid \"mtu\" value", mtu)),
            },
            [
                "add", "name", local, "mtu", mtu, "type", "veth", "peer", "name", guest, "mtu", peer_mtu,
            ] => self.add_veth(ns, local, mtu, guest, peer_mtu),
            ["set", "dev", dev, rest @ ..] => self.set_link(netns_dir, ns, dev, rest),
            ["del", "dev", dev] => self.del_link(ns, dev),
            _ => fail(format!("Command \"link {}\" is unknown", args.join(" "))),
        }
    }

    fn add_link(&mut self, ns: &str, name: &str, kind: LinkKind, mtu: u32) -> Output {
        if self.find(ns, name).is_some() {
            return fail("RTNETLINK answers: File exists");
        }
        let link = Link::new(self.allocate_id(), kind, mtu);
        if let Some(space) = self.namespaces.get_mut(ns) {
            space.links.insert(name.to_string(), link);
        }
        ok("")
    }

    fn add_veth(&mut self, ns: &str, local: &str, mtu: &str, guest: &str, peer_mtu: &str) -> Output {
        if self.find(ns, local).is_some() || self.find(ns, guest).is_some() {
            return fail("RTNETLINK answers: File exists");
        }
        let (Ok(mtu), Ok(peer_mtu)) = (mtu.parse(), peer_mtu.parse()) else {
            return fail("Error: Invalid \"mtu\" value");
        };

        let (a, b) = (self.allocate_id(), self.allocate_id());
        let mut local_link = Link::new(a, LinkKind::Veth, mtu);
        local_link.peer = Some(b);
        let mut guest_link = Link::new(b, LinkKind::Veth, peer_mtu);
        guest_link.peer = Some(a);

        if let Some(space) = self.namespaces.get_mut(ns) {
            space.links.insert(local.to_string(), local_link);
            space.links.insert(guest.to_string(), guest_link);
        }
        ok("")
    }

    fn set_link(&mut self, netns_dir: &Path, ns: &str, dev: &str, args: &[&str]) -> Output {
        if self.find(ns, dev).is_none() {
            return fail(format!("Cannot find device \"{}\"", dev));
        }

        match args {
            ["address", mac] => {
                if let Some(link) = self.find_mut(ns, dev) {
                    link.address = Some(mac.to_string());
                }
            }
            ["mtu", mtu] => {
                let Ok(mtu) = mtu.parse() else {
                    return fail("Error: Invalid \"mtu\" value");
                };
                if let Some(link) = self.find_mut(ns, dev) {
                    link.mtu = mtu;
                }
            }
            ["up"] => {
                if let Some(link) = self.find_mut(ns, dev) {
                    link.up = true;
                    if link.kind == LinkKind::Veth && !link.addrs.iter().any(is_link_local) {
                        if let Ok(addr) = format!("fe80::{:x}/64", link.id).parse::<IpNet>() {
                            link.addrs.push(addr);
                        }
                    }
                }
            }
            ["master", bridge] => {
                if !matches!(self.find(ns, bridge), Some(link) if link.kind == LinkKind::Bridge) {
                    return fail(format!("Cannot find device \"{}\"", bridge));
                }
                if let Some(link) = self.find_mut(ns, dev) {
                    link.master = Some(bridge.to_string());
                }
                self.recompute_bridge_mtu(ns, bridge);
            }
            ["netns", name] => {
                let Some(target) = self.resolve_netns(netns_dir, name) else {
                    return fail(format!("Invalid \"netns\" value \"{}\"", name));
                };
                if self.find(&target, dev).is_some() {
                    return fail("RTNETLINK answers: File exists");
                }
                let Some(mut link) = self.namespaces.get_mut(ns).and_then(|s| s.links.remove(dev)) else {
                    return fail(format!("Cannot find device \"{}\"", dev));
                };
                link.master = None;
                link.up = false;
                link.addrs.clear();
                if let Some(space) = self.namespaces.get_mut(&target) {
                    space.links.insert(dev.to_string(), link);
                }
            }
            ["name", new_name] => {
                if self.find(ns, new_name).is_some() {
                    return fail("RTNETLINK answers: File exists");
                }
                if self.find(ns, dev).is_some_and(|link| link.up) {
                    return fail("RTNETLINK answers: Device or resource busy");
                }
                if let Some(space) = self.namespaces.get_mut(ns) {
                    if let Some(link) = space.links.remove(dev) {
                        space.links.insert(new_name.to_string(), link);
                    }
                }
            }
            _ => return fail(format!("Error: either \"dev\" is duplicate, or \"{}\" is garbage.", args.join(" "))),
        }

        ok("")
    }

    fn recompute_bridge_mtu(&mut self, ns: &str, bridge: &str) {
        let Some(space) = self.namespaces.get_mut(ns) else {
            return;
        };
        let lowest = space
            .links
            .values()
            .filter(|link| link.master.as_deref() == Some(bridge))
            .map(|link| link.mtu)
            .min();
        if let (Some(mtu), Some(link)) = (lowest, space.links.get_mut(bridge)) {
            link.mtu = mtu;
        }
    }

    fn del_link(&mut self, ns: &str, dev: &str) -> Output {
        let Some(space) = self.namespaces.get_mut(ns) else {
            return fail(format!("Cannot find device \"{}\"", dev));
        };
        let Some(link) = space.links.remove(dev) else {
            return fail(format!("Cannot find device \"{}\"", dev));
        };

        let via = format!(" dev {} ", dev);
        space.routes.retain(|route| !route.contains(&via));

        if link.kind == LinkKind::Bridge {
            for member in space.links.values_mut() {
                if member.master.as_deref() == Some(dev) {
                    member.master = None;
                }
            }
        }

        if let Some(peer) = link.peer {
            self.remove_by_id(peer);
        }
        ok("")
    }

    fn addr(&mut self, ns: &str, args: &[&str]) -> Output {
        match args {
            ["show", "dev", dev, filter @ ..] => {
                let global_only = matches!(filter, ["scope", "global"]);
                let Some(link) = self.find(ns, dev) else {
                    return fail(format!("Device \"{}\" does not exist.", dev));
                };

                let mut listing = format!("{}: {}: <BROADCAST,MULTICAST> mtu {}\n", link.id, dev, link.mtu);
                for addr in &link.addrs {
                    let local = is_link_local(addr);
                    if global_only && local {
                        continue;
                    }
                    let family = if matches!(addr, IpNet::V6(_)) { "inet6" } else { "inet" };
                    let scope = if local { "link" } else { "global" };
                    listing.push_str(&format!("    {} {} scope {} {}\n", family, addr, scope, dev));
                    listing.push_str("       valid_lft forever preferred_lft forever\n");
                }
                ok(listing)
            }
            ["add", cidr, "dev", dev] => {
                let Ok(addr) = cidr.parse::<IpNet>() else {
                    return fail(format!("Error: inet prefix is expected rather than \"{}\".", cidr));
                };
                let Some(link) = self.find_mut(ns, dev) else {
                    return fail(format!("Cannot find device \"{}\"", dev));
                };
                if link.addrs.contains(&addr) {
                    return fail("RTNETLINK answers: File exists");
                }
                link.addrs.push(addr);
                ok("")
            }
            ["del", cidr, "dev", dev] => {
                let Ok(addr) = cidr.parse::<IpNet>() else {
                    return fail(format!("Error: inet prefix is expected rather than \"{}\".", cidr));
                };
                let Some(link) = self.find_mut(ns, dev) else {
                    return fail(format!("Cannot find device \"{}\"", dev));
                };
                let before = link.addrs.len();
                link.addrs.retain(|bound| *bound != addr);
                if link.addrs.len() == before {
                    return fail("RTNETLINK answers: Cannot assign requested address");
                }
                ok("")
            }
            _ => fail(format!("Command \"addr {}\" is unknown", args.join(" "))),
        }
    }

    fn route(&mut self, ns: &str, args: &[&str]) -> Output {
        match args {
            ["show"] => {
                let routes = self
                    .namespaces
                    .get(ns)
                    .map(|space| space.routes.iter().map(|r| format!("{}\n", r)).collect::<String>())
                    .unwrap_or_default();
                ok(routes)
            }
            ["add", dest, "dev", dev] => {
                if self.find(ns, dev).is_none() {
                    return fail(format!("Cannot find device \"{}\"", dev));
                }
                let Some(space) = self.namespaces.get_mut(ns) else {
                    return fail(format!("Cannot find device \"{}\"", dev));
                };
                let prefix = format!("{} ", dest);
                if space.routes.iter().any(|route| route.starts_with(&prefix)) {
                    return fail("RTNETLINK answers: File exists");
                }
                space.routes.push(format!("{} dev {} scope link ", dest, dev));
                ok("")
            }
            _ => fail(format!("Command \"route {}\" is unknown", args.join(" "))),
        }
    }

    fn ethtool(&mut self, ns: &str, args: &[&str]) -> Output {
        match args {
            ["-K", dev, ..] => match self.find_mut(ns, dev) {
                Some(link) => {
                    link.offload = false;
                    ok("")
                }
                None => fail("Cannot get device feature names: No such device"),
            },
            _ => fail("ethtool: bad command line argument(s)"),
        }
    }

    fn iptables(&mut self, args: &[&str]) -> Output {
        let args = match args {
            ["-w", rest @ ..] => {
                if !self.wait_supported {
                    return fail("iptables v1.4.7: unknown option \"-w\"");
                }
                rest
            }
            _ => args,
        };

        match args {
            ["-S"] => ok("-P INPUT ACCEPT\n-P FORWARD ACCEPT\n-P OUTPUT ACCEPT\n"),
            ["-t", "nat", op, chain, rule @ ..] => self.nat(op, chain, &rule.join(" ")),
            _ => fail(format!("iptables: unknown arguments \"{}\"", args.join(" "))),
        }
    }

    fn nat(&mut self, op: &str, chain: &str, rule: &str) -> Output {
        match op {
            "-N" => {
                if self.chains.contains_key(chain) {
                    return fail("iptables: Chain already exists.");
                }
                self.chains.insert(chain.to_string(), Vec::new());
                ok("")
            }
            "-C" => match self.chains.get(chain) {
                Some(rules) if rules.iter().any(|r| r == rule) => ok(""),
                Some(_) => fail(BAD_RULE),
                None => fail(NO_CHAIN),
            },
            "-A" => {
                let target_known = match jump_target(rule) {
                    Some("MASQUERADE") | None => true,
                    Some(target) => self.chains.contains_key(target),
                };
                match self.chains.get_mut(chain) {
                    Some(rules) if target_known => {
                        rules.push(rule.to_string());
                        ok("")
                    }
                    _ => fail(NO_CHAIN),
                }
            }
            "-D" => match self.chains.get_mut(chain) {
                Some(rules) => match rules.iter().position(|r| r == rule) {
                    Some(index) => {
                        rules.remove(index);
                        ok("")
                    }
                    None => fail(BAD_RULE),
                },
                None => fail(NO_CHAIN),
            },
            "-F" => match self.chains.get_mut(chain) {
                Some(rules) => {
                    rules.clear();
                    ok("")
                }
                None => fail(NO_CHAIN),
            },
            "-X" => {
                let Some(rules) = self.chains.get(chain) else {
                    return fail(NO_CHAIN);
                };
                if !rules.is_empty() {
                    return fail("iptables: Directory not empty.");
                }
                let referenced = self
                    .chains
                    .values()
                    .flatten()
                    .any(|r| jump_target(r) == Some(chain));
                if referenced {
                    return fail("iptables: Too many links.");
                }
                self.chains.remove(chain);
                ok("")
            }
            _ => fail(format!("iptables: unknown option \"{}\"", op)),
        }
    }
}

/// Default configuration with scratch directories under `root`
pub fn test_config(root: &Path) -> WeftConfig {
    let mut config = WeftConfig::default();
    config.paths.netns_dir = root.join("netns");
    config.paths.state_dir = root.join("state");
    config
}

/// In-memory host: kernel network state plus a container orchestrator
pub struct FakeHost {
    kernel: Mutex<Kernel>,
    netns_dir: PathBuf,
}

impl FakeHost {
    /// `netns_dir` is where namespace-scoped commands look up handles
    pub fn new(netns_dir: &Path) -> Self {
        Self {
            kernel: Mutex::new(Kernel::new()),
            netns_dir: netns_dir.to_path_buf(),
        }
    }

    pub fn add_container(&self, name: &str, pid: i32) {
        let mut kernel = self.kernel.lock().unwrap();
        let ns = Namespace::with_devices(&mut || kernel.allocate_id());
        kernel.namespaces.insert(pid.to_string(), ns);
        kernel
            .containers
            .insert(name.to_string(), Container { pid, running: true });
    }

    pub fn add_stopped_container(&self, name: &str) {
        let mut kernel = self.kernel.lock().unwrap();
        kernel
            .containers
            .insert(name.to_string(), Container { pid: 0, running: false });
    }

    /// Stop a container; its namespace and veth ends disappear
    pub fn kill_container(&self, name: &str) {
        self.kernel.lock().unwrap().kill(name);
    }

    /// Fail the next command containing `needle` with `stderr`
    pub fn fail_on(&self, needle: &str, stderr: &str) {
        self.kernel.lock().unwrap().fail_on = Some((needle.to_string(), stderr.to_string()));
    }

    /// Kill `container` just before the next command containing `needle` runs
    pub fn kill_on(&self, needle: &str, container: &str) {
        self.kernel.lock().unwrap().kill_on = Some((needle.to_string(), container.to_string()));
    }

    pub fn remove_tool(&self, tool: &str) {
        self.kernel.lock().unwrap().missing_tools.insert(tool.to_string());
    }

    /// Behave like an iptables that predates `-w`
    pub fn without_wait_flag(&self) {
        self.kernel.lock().unwrap().wait_supported = false;
    }

    /// A link in the host namespace
    pub fn link(&self, dev: &str) -> Option<Link> {
        self.kernel.lock().unwrap().find(HOST, dev).cloned()
    }

    /// A link inside a running container's namespace
    pub fn container_link(&self, container: &str, dev: &str) -> Option<Link> {
        let kernel = self.kernel.lock().unwrap();
        let pid = kernel.containers.get(container)?.pid.to_string();
        kernel.find(&pid, dev).cloned()
    }

    /// Non-link-local addresses on a container device, in CIDR form
    pub fn addresses(&self, container: &str, dev: &str) -> Vec<String> {
        self.container_link(container, dev)
            .map(|link| {
                link.addrs
                    .iter()
                    .filter(|addr| !is_link_local(addr))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn container_routes(&self, container: &str) -> Vec<String> {
        let kernel = self.kernel.lock().unwrap();
        let Some(entry) = kernel.containers.get(container) else {
            return Vec::new();
        };
        kernel
            .namespaces
            .get(&entry.pid.to_string())
            .map(|ns| ns.routes.iter().map(|r| r.trim_end().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn chain_exists(&self, chain: &str) -> bool {
        self.kernel.lock().unwrap().chains.contains_key(chain)
    }

    pub fn nat_rules(&self, chain: &str) -> Vec<String> {
        self.kernel
            .lock()
            .unwrap()
            .chains
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of commands run so far whose line contains `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.kernel
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    pub fn history(&self) -> Vec<String> {
        self.kernel.lock().unwrap().history.clone()
    }
}

impl Runner for FakeHost {
    fn run(&self, cmd: &Cmd) -> io::Result<Output> {
        let mut kernel = self.kernel.lock().unwrap();
        let line = cmd.to_string();
        kernel.history.push(line.clone());

        if let Some((_, stderr)) = kernel
            .fail_on
            .take_if(|(needle, _)| line.contains(needle.as_str()))
        {
            return Ok(fail(stderr));
        }

        if let Some((_, container)) = kernel
            .kill_on
            .take_if(|(needle, _)| line.contains(needle.as_str()))
        {
            kernel.kill(&container);
        }

        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
        kernel.dispatch(&self.netns_dir, HOST, &cmd.program, &args)
    }
}

impl Orchestrator for FakeHost {
    fn inspect(&self, container: &str) -> Result<ContainerState> {
        let kernel = self.kernel.lock().unwrap();
        Ok(match kernel.containers.get(container) {
            None => ContainerState::unknown(),
            Some(entry) => ContainerState {
                known: true,
                running: entry.running,
                pid: entry.running.then_some(entry.pid),
            },
        })
    }
}
