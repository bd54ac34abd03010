//! Container network specification: parsing and realisation.
//!
//! The textual spec is line-oriented, one request per line:
//!
//! ```text
//! none
//! inherited | host
//! container <name>
//! netns <name>
//! steal <dev>                   (legacy alias: "host <dev>")
//! macvlan <master> <name> [type [mtu [hw]]]
//! ipvlan  <master> <name> [mode [mtu]]
//! veth    <name> <bridge> [mtu [hw]]
//! L3      [name [master]]
//! NAT     [name]
//! MTU     <name> <int>
//! autoconf <name>
//! ```
//!
//! Realisation drives the parent and target namespaces in a fixed order:
//! steal, ipvlan, macvlan, veth, L3/NAT, loopback up, device refresh, IP
//! assignment, gateways. Parent-side peer names are deterministic
//! (`portove-<cid>-<seq>`, `L3-<seq>`) and are exactly the prefixes the
//! device inventory filters out.

use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netlink_packet_route::link::{IpVlanMode, MacVlanMode};
use nix::unistd::gettid;
use tracing::{debug, info, warn};

use crate::addr::NetAddr;
use crate::config::{DeviceGroups, NetworkConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::netns::NetworkNamespace;

/// Parent-side veth end of a container link: `portove-<cid>-<seq>`.
pub const VETH_PREFIX: &str = "portove-";
/// Parent-side end of an L3 link: `L3-<seq>`.
pub const L3_PREFIX: &str = "L3-";
/// Transient names used between creation and `change_ns`.
pub const IPVLAN_TMP_PREFIX: &str = "piv";
pub const MACVLAN_TMP_PREFIX: &str = "pmv";

/// Where the container's network namespace comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsSource {
    /// No networking at all (fresh empty namespace, loopback only).
    None,
    /// Share the parent's namespace.
    Inherited,
    /// A fresh namespace populated with the configured interfaces.
    New,
    /// Share another container's namespace.
    Container(String),
    /// A named namespace bound under `/var/run/netns`.
    Netns(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacVlanRequest {
    pub master: String,
    pub name: String,
    pub mode: MacVlanMode,
    pub mtu: Option<u32>,
    pub hw: Option<[u8; 6]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpVlanRequest {
    pub master: String,
    pub name: String,
    pub mode: IpVlanMode,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethRequest {
    pub name: String,
    pub bridge: String,
    pub mtu: Option<u32>,
    pub hw: Option<[u8; 6]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3Request {
    pub name: String,
    pub master: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfaceRequest {
    Steal(String),
    MacVlan(MacVlanRequest),
    IpVlan(IpVlanRequest),
    Veth(VethRequest),
    L3(L3Request),
    Nat(String),
}

impl IfaceRequest {
    fn name(&self) -> &str {
        match self {
            IfaceRequest::Steal(dev) => dev,
            IfaceRequest::MacVlan(r) => &r.name,
            IfaceRequest::IpVlan(r) => &r.name,
            IfaceRequest::Veth(r) => &r.name,
            IfaceRequest::L3(r) => &r.name,
            IfaceRequest::Nat(name) => name,
        }
    }

    fn set_mtu(&mut self, mtu: u32) -> bool {
        match self {
            IfaceRequest::MacVlan(r) => r.mtu = Some(mtu),
            IfaceRequest::IpVlan(r) => r.mtu = Some(mtu),
            IfaceRequest::Veth(r) => r.mtu = Some(mtu),
            IfaceRequest::Steal(_) | IfaceRequest::L3(_) | IfaceRequest::Nat(_) => return false,
            // L3/NAT mtu comes from gateway discovery, steal keeps its own.
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetConfig {
    pub source: Option<NsSource>,
    pub ifaces: Vec<IfaceRequest>,
    /// Interfaces the child waits on for an autoconfigured IPv6 address.
    pub autoconf: Vec<String>,
    /// `iface -> address` assignments (fed by the `ip` property).
    pub ip: Vec<(String, NetAddr)>,
    /// `iface -> default gateway` assignments (fed by the `default_gw`
    /// property).
    pub gw: Vec<(String, IpAddr)>,
}

impl NetConfig {
    pub fn source(&self) -> NsSource {
        self.source.clone().unwrap_or(NsSource::Inherited)
    }

    /// Parse the network specification text.
    pub fn parse(text: &str) -> Result<NetConfig> {
        let mut cfg = NetConfig::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut words = line.split_whitespace();
            let keyword = words.next().unwrap();
            let args: Vec<&str> = words.collect();
            cfg.parse_line(keyword, &args)?;
        }
        if cfg.source.is_none() && !cfg.ifaces.is_empty() {
            cfg.source = Some(NsSource::New);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_line(&mut self, keyword: &str, args: &[&str]) -> Result<()> {
        match keyword {
            "none" => self.set_source(NsSource::None),
            "inherited" => self.set_source(NsSource::Inherited),
            "host" if args.is_empty() => self.set_source(NsSource::Inherited),
            "host" | "steal" => {
                let dev = one_arg(keyword, args)?;
                self.push_iface(IfaceRequest::Steal(dev.to_string()))
            }
            "container" => {
                let name = one_arg(keyword, args)?;
                self.set_source(NsSource::Container(name.to_string()))
            }
            "netns" => {
                let name = one_arg(keyword, args)?;
                self.set_source(NsSource::Netns(name.to_string()))
            }
            "macvlan" => {
                if args.len() < 2 || args.len() > 5 {
                    return Err(bad_line("macvlan", args));
                }
                let mode = args.get(2).copied().unwrap_or("bridge");
                self.push_iface(IfaceRequest::MacVlan(MacVlanRequest {
                    master: args[0].to_string(),
                    name: args[1].to_string(),
                    mode: parse_macvlan_mode(mode)?,
                    mtu: args.get(3).map(|m| parse_mtu(m)).transpose()?,
                    hw: args.get(4).map(|h| parse_hw(h)).transpose()?,
                }))
            }
            "ipvlan" => {
                if args.len() < 2 || args.len() > 4 {
                    return Err(bad_line("ipvlan", args));
                }
                let mode = args.get(2).copied().unwrap_or("l2");
                self.push_iface(IfaceRequest::IpVlan(IpVlanRequest {
                    master: args[0].to_string(),
                    name: args[1].to_string(),
                    mode: parse_ipvlan_mode(mode)?,
                    mtu: args.get(3).map(|m| parse_mtu(m)).transpose()?,
                }))
            }
            "veth" => {
                if args.len() < 2 || args.len() > 4 {
                    return Err(bad_line("veth", args));
                }
                self.push_iface(IfaceRequest::Veth(VethRequest {
                    name: args[0].to_string(),
                    bridge: args[1].to_string(),
                    mtu: args.get(2).map(|m| parse_mtu(m)).transpose()?,
                    hw: args.get(3).map(|h| parse_hw(h)).transpose()?,
                }))
            }
            "L3" => {
                if args.len() > 2 {
                    return Err(bad_line("L3", args));
                }
                self.push_iface(IfaceRequest::L3(L3Request {
                    name: args.first().unwrap_or(&"eth0").to_string(),
                    master: args.get(1).map(|s| s.to_string()),
                }))
            }
            "NAT" => {
                if args.len() > 1 {
                    return Err(bad_line("NAT", args));
                }
                self.push_iface(IfaceRequest::Nat(
                    args.first().unwrap_or(&"eth0").to_string(),
                ))
            }
            "MTU" => {
                if args.len() != 2 {
                    return Err(bad_line("MTU", args));
                }
                let mtu = parse_mtu(args[1])?;
                let name = args[0];
                let found = self
                    .ifaces
                    .iter_mut()
                    .find(|i| i.name() == name)
                    .map(|i| i.set_mtu(mtu));
                match found {
                    Some(true) => Ok(()),
                    Some(false) => Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("link '{}' does not take an MTU override", name),
                    )),
                    None => Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("MTU for undeclared link '{}'", name),
                    )),
                }
            }
            "autoconf" => {
                let name = one_arg("autoconf", args)?;
                self.autoconf.push(name.to_string());
                Ok(())
            }
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown network spec '{}'", other),
            )),
        }
    }

    fn set_source(&mut self, source: NsSource) -> Result<()> {
        if self.source.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "conflicting namespace sources in network spec",
            ));
        }
        self.source = Some(source);
        Ok(())
    }

    fn push_iface(&mut self, iface: IfaceRequest) -> Result<()> {
        if self
            .ifaces
            .iter()
            .any(|i| i.name() == iface.name())
        {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("duplicate interface '{}'", iface.name()),
            ));
        }
        self.ifaces.push(iface);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(src) = &self.source {
            let exclusive = matches!(
                src,
                NsSource::None | NsSource::Inherited | NsSource::Container(_) | NsSource::Netns(_)
            );
            if exclusive && !self.ifaces.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    "namespace source excludes interface declarations",
                ));
            }
        }
        Ok(())
    }

    /// Parse one `ip <iface> <addr>` assignment.
    pub fn parse_ip(&mut self, line: &str) -> Result<()> {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(iface), Some(addr), None) => {
                let addr = NetAddr::parse(addr)?;
                self.ip.push((iface.to_string(), addr));
                Ok(())
            }
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("bad ip assignment '{}'", line),
            )),
        }
    }

    /// Parse one `default_gw <iface> <addr>` assignment.
    pub fn parse_gw(&mut self, line: &str) -> Result<()> {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(iface), Some(addr), None) => {
                let addr = NetAddr::parse(addr)?;
                self.gw.push((iface.to_string(), addr.ip()));
                Ok(())
            }
            _ => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("bad gateway assignment '{}'", line),
            )),
        }
    }

    fn ips_of(&self, iface: &str) -> Vec<NetAddr> {
        self.ip
            .iter()
            .filter(|(name, _)| name == iface)
            .map(|(_, a)| *a)
            .collect()
    }
}

fn one_arg<'a>(keyword: &str, args: &[&'a str]) -> Result<&'a str> {
    if args.len() != 1 {
        return Err(bad_line(keyword, args));
    }
    Ok(args[0])
}

fn bad_line(keyword: &str, args: &[&str]) -> Error {
    Error::new(
        ErrorKind::InvalidValue,
        format!("bad '{}' network spec: {:?}", keyword, args),
    )
}

fn parse_mtu(s: &str) -> Result<u32> {
    let mtu: u32 = s
        .parse()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad mtu '{}'", s)))?;
    if mtu < 68 || mtu > 65_535 {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("mtu {} out of range", mtu),
        ));
    }
    Ok(mtu)
}

pub fn parse_macvlan_mode(s: &str) -> Result<MacVlanMode> {
    match s {
        "private" => Ok(MacVlanMode::Private),
        "bridge" => Ok(MacVlanMode::Bridge),
        "vepa" => Ok(MacVlanMode::Vepa),
        "passthru" => Ok(MacVlanMode::Passthrough),
        other => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("unknown macvlan type '{}'", other),
        )),
    }
}

pub fn parse_ipvlan_mode(s: &str) -> Result<IpVlanMode> {
    match s {
        "l2" => Ok(IpVlanMode::L2),
        "l3" => Ok(IpVlanMode::L3),
        other => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("unknown ipvlan mode '{}'", other),
        )),
    }
}

/// Parse `XX:XX:XX:XX:XX:XX`.
pub fn parse_hw(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("bad hardware address '{}'", s),
        ));
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("bad hardware address '{}'", s),
            ));
        }
        out[i] = u8::from_str_radix(part, 16).map_err(|_| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("bad hardware address '{}'", s),
            )
        })?;
    }
    Ok(out)
}

/// Deterministic locally-administered MAC for a container interface.
pub fn gen_hw_addr(name: &str, hostname: &str) -> [u8; 6] {
    let n = crc32fast::hash(name.as_bytes());
    let h = crc32fast::hash(hostname.as_bytes());
    [
        0x02,
        (n & 0xff) as u8,
        ((h >> 24) & 0xff) as u8,
        ((h >> 16) & 0xff) as u8,
        ((h >> 8) & 0xff) as u8,
        (h & 0xff) as u8,
    ]
}

/// Find a free `prefix<N>` name among `existing`. Gives up after 100
/// candidates instead of handing out a colliding fallback.
pub fn new_device_name(prefix: &str, existing: &[String]) -> Result<String> {
    for i in 0..100u32 {
        let candidate = format!("{}{}", prefix, i);
        if !existing.iter().any(|n| *n == candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::new(
        ErrorKind::InvalidValue,
        format!("no free device name with prefix '{}'", prefix),
    ))
}

/// Everything realisation created that teardown must undo.
#[derive(Debug, Default)]
pub struct RealisedNet {
    /// NAT pool addresses to give back.
    pub nat_addrs: Vec<NetAddr>,
    /// Proxy-neighbour announcements in the parent: `(ifindex, addr)`.
    pub announced: Vec<(u32, IpAddr)>,
    /// Parent-side links to remove (L3 peers).
    pub parent_links: Vec<String>,
}

/// Realisation context.
pub struct NetEnv<'a> {
    pub container_id: u32,
    pub hostname: Option<String>,
    /// Namespace the virtual devices are created in (usually the host).
    pub parent: Arc<NetworkNamespace>,
    /// The container's namespace.
    pub target: Arc<NetworkNamespace>,
    /// Descriptor of the target namespace, for `change_ns`.
    pub target_fd: RawFd,
    pub cfg: &'a NetworkConfig,
    pub groups: &'a DeviceGroups,
}

impl NetConfig {
    /// Materialise the parsed spec: create and move interfaces, bring up
    /// loopback, refresh the target inventory, assign addresses and
    /// gateways.
    pub async fn realise(&self, env: &NetEnv<'_>) -> Result<RealisedNet> {
        let mut realised = RealisedNet::default();
        let res = self.realise_inner(env, &mut realised).await;
        if let Err(e) = res {
            warn!(error = %e, "network realisation failed, rolling back");
            if let Err(te) = teardown(env, &realised).await {
                warn!(error = %te, "rollback failed");
            }
            return Err(e);
        }
        Ok(realised)
    }

    async fn realise_inner(&self, env: &NetEnv<'_>, realised: &mut RealisedNet) -> Result<()> {
        for iface in &self.ifaces {
            if let IfaceRequest::Steal(dev) = iface {
                self.steal(env, dev).await?;
            }
        }
        for iface in &self.ifaces {
            if let IfaceRequest::IpVlan(req) = iface {
                self.make_ipvlan(env, req).await?;
            }
        }
        for iface in &self.ifaces {
            if let IfaceRequest::MacVlan(req) = iface {
                self.make_macvlan(env, req).await?;
            }
        }
        for iface in &self.ifaces {
            if let IfaceRequest::Veth(req) = iface {
                self.make_veth(env, req).await?;
            }
        }
        for iface in &self.ifaces {
            match iface {
                IfaceRequest::L3(req) => {
                    let ips = self.ips_of(&req.name);
                    self.make_l3(env, &req.name, req.master.as_deref(), &ips, realised)
                        .await?
                }
                IfaceRequest::Nat(name) => {
                    // Slots come from the parent's pool so they are unique
                    // across containers.
                    let ips = env.parent.get_nat_address().await?;
                    realised.nat_addrs.extend(ips.iter().copied());
                    self.make_l3(env, name, None, &ips, realised).await?
                }
                _ => {}
            }
        }

        // Loopback always comes up, even for "none".
        {
            let client = env.target.client().await;
            let lo = client.link_by_name("lo").await?;
            client.up(lo.header.index).await?;
        }

        env.target.refresh_devices(env.cfg, env.groups).await?;

        for (iface, addr) in &self.ip {
            // L3/NAT addresses were already assigned with their routes.
            if self.is_l3(iface) {
                continue;
            }
            let client = env.target.client().await;
            let link = client.link_by_name(iface).await?;
            client.set_ip(link.header.index, addr).await?;
        }

        for (iface, gw) in &self.gw {
            if self.is_l3(iface) {
                continue;
            }
            let client = env.target.client().await;
            let link = client.link_by_name(iface).await?;
            client.set_default_gw(link.header.index, *gw).await?;
        }

        info!(container = env.container_id, "network realised");
        Ok(())
    }

    fn is_l3(&self, iface: &str) -> bool {
        self.ifaces.iter().any(|i| {
            matches!(i, IfaceRequest::L3(r) if r.name == iface)
                || matches!(i, IfaceRequest::Nat(n) if n == iface)
        })
    }

    async fn steal(&self, env: &NetEnv<'_>, dev: &str) -> Result<()> {
        debug!(dev, "moving host device into container");
        let client = env.parent.client().await;
        let link = client.link_by_name(dev).await?;
        client.change_ns(link.header.index, env.target_fd).await
    }

    async fn make_ipvlan(&self, env: &NetEnv<'_>, req: &IpVlanRequest) -> Result<()> {
        let tmp = format!("{}{}", IPVLAN_TMP_PREFIX, gettid());
        {
            let client = env.parent.client().await;
            let master = client.link_by_name(&req.master).await?;
            client
                .add_ipvlan(master.header.index, &tmp, req.mode, req.mtu)
                .await?;
            let link = client.link_by_name(&tmp).await?;
            client.change_ns(link.header.index, env.target_fd).await?;
        }
        let client = env.target.client().await;
        let link = client.link_by_name(&tmp).await?;
        client.set_name(link.header.index, &req.name).await?;
        client.up(link.header.index).await
    }

    async fn make_macvlan(&self, env: &NetEnv<'_>, req: &MacVlanRequest) -> Result<()> {
        let hw = req.hw.or_else(|| {
            env.hostname
                .as_deref()
                .map(|h| gen_hw_addr(&format!("{}{}", req.name, req.master), h))
        });
        let tmp = format!("{}{}", MACVLAN_TMP_PREFIX, gettid());
        {
            let client = env.parent.client().await;
            let master = client.link_by_name(&req.master).await?;
            client
                .add_macvlan(master.header.index, &tmp, req.mode, hw, req.mtu)
                .await?;
            let link = client.link_by_name(&tmp).await?;
            client.change_ns(link.header.index, env.target_fd).await?;
        }
        let client = env.target.client().await;
        let link = client.link_by_name(&tmp).await?;
        client.set_name(link.header.index, &req.name).await?;
        client.up(link.header.index).await
    }

    async fn make_veth(&self, env: &NetEnv<'_>, req: &VethRequest) -> Result<()> {
        let seq = env.parent.next_iface_seq().await;
        let peer = format!("{}{}-{}", VETH_PREFIX, env.container_id, seq);
        let hw = req.hw.or_else(|| {
            env.hostname
                .as_deref()
                .map(|h| gen_hw_addr(&format!("{}{}", req.name, peer), h))
        });
        let client = env.parent.client().await;
        client
            .add_veth(&req.name, &peer, hw, req.mtu, Some(env.target_fd))
            .await?;
        let peer_link = client.link_by_name(&peer).await?;
        if !req.bridge.is_empty() {
            let bridge = client.link_by_name(&req.bridge).await?;
            client
                .set_master(peer_link.header.index, bridge.header.index)
                .await?;
        }
        client.up(peer_link.header.index).await?;
        drop(client);

        let client = env.target.client().await;
        let link = client.link_by_name(&req.name).await?;
        client.up(link.header.index).await
    }

    /// Routed (L3/NAT) interface: a veth pair with host routes, a default
    /// gateway inside, and proxy-neighbour announcements in the parent.
    async fn make_l3(
        &self,
        env: &NetEnv<'_>,
        name: &str,
        _master: Option<&str>,
        ips: &[NetAddr],
        realised: &mut RealisedNet,
    ) -> Result<()> {
        for ip in ips {
            if !ip.is_host() {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("L3 address {} must be a host address", ip),
                ));
            }
        }
        if ips.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("L3 interface '{}' has no addresses", name),
            ));
        }

        let (gate4, gate6, gate_mtu) = env.parent.gate_address(ips).await?;
        for ip in ips {
            if ip.is_v4() && gate4.is_none() {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("no IPv4 gateway for {}", ip),
                ));
            }
            if ip.is_v6() && gate6.is_none() {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("no IPv6 gateway for {}", ip),
                ));
            }
        }

        let seq = env.parent.next_iface_seq().await;
        let peer = format!("{}{}", L3_PREFIX, seq);
        let mtu = if gate_mtu > 0 { Some(gate_mtu) } else { None };

        let parent_ifindex;
        {
            let client = env.parent.client().await;
            client
                .add_veth(name, &peer, None, mtu, Some(env.target_fd))
                .await?;
            let peer_link = client.link_by_name(&peer).await?;
            parent_ifindex = peer_link.header.index;
            client.up(parent_ifindex).await?;
            realised.parent_links.push(peer.clone());

            // The parent answers ARP/ND for the container addresses.
            for ip in ips {
                client.proxy_neighbour(parent_ifindex, ip.ip(), true).await?;
                realised.announced.push((parent_ifindex, ip.ip()));
            }
        }

        let client = env.target.client().await;
        let link = client.link_by_name(name).await?;
        client.up(link.header.index).await?;
        for ip in ips {
            client.set_ip(link.header.index, ip).await?;
        }
        for gate in [gate4.as_ref(), gate6.as_ref()].into_iter().flatten() {
            client.add_direct_route(link.header.index, gate).await?;
            client.set_default_gw(link.header.index, gate.ip()).await?;
        }
        Ok(())
    }
}

/// Undo announcements, parent links and NAT allocations. All steps are
/// attempted; the first error wins.
pub async fn teardown(env: &NetEnv<'_>, realised: &RealisedNet) -> Result<()> {
    let mut first_err: Option<Error> = None;

    {
        let client = env.parent.client().await;
        for (ifindex, addr) in &realised.announced {
            if let Err(e) = client.proxy_neighbour(*ifindex, *addr, false).await {
                warn!(ifindex, %addr, error = %e, "proxy neighbour removal failed");
                first_err.get_or_insert(e);
            }
        }
        for name in &realised.parent_links {
            match client.link_by_name(name).await {
                Ok(link) => {
                    if let Err(e) = client.remove(link.header.index).await {
                        first_err.get_or_insert(e);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
    }

    if !realised.nat_addrs.is_empty() {
        if let Err(e) = env.parent.put_nat_address(&realised.nat_addrs).await {
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------
// Autoconf
// ---------------------------------------------------------------------

/// Wait until `iface` holds a non-tentative global IPv6 address, polling
/// `/proc/net/if_inet6`. Runs in the container, after namespace entry.
pub fn wait_autoconf(iface: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let content = std::fs::read_to_string("/proc/net/if_inet6").unwrap_or_default();
        if iface_has_global_ipv6(&content, iface) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("timeout waiting for autoconf on '{}'", iface),
            ));
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// One `/proc/net/if_inet6` line per address:
/// `<addr> <ifindex> <prefix> <scope> <flags> <name>`; scope 0 is global,
/// flag 0x40 marks a tentative address.
pub fn iface_has_global_ipv6(content: &str, iface: &str) -> bool {
    const IFA_F_TENTATIVE: u32 = 0x40;
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 || fields[5] != iface {
            continue;
        }
        let scope = u32::from_str_radix(fields[3], 16).unwrap_or(u32::MAX);
        let flags = u32::from_str_radix(fields[4], 16).unwrap_or(IFA_F_TENTATIVE);
        if scope == 0 && flags & IFA_F_TENTATIVE == 0 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_macvlan_full() {
        let cfg = NetConfig::parse("macvlan eth0 mv0 bridge 1400 02:aa:bb:cc:dd:ee").unwrap();
        assert_eq!(cfg.source(), NsSource::New);
        assert_eq!(
            cfg.ifaces,
            vec![IfaceRequest::MacVlan(MacVlanRequest {
                master: "eth0".to_string(),
                name: "mv0".to_string(),
                mode: MacVlanMode::Bridge,
                mtu: Some(1400),
                hw: Some([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]),
            })]
        );
    }

    #[test]
    fn parse_macvlan_rejects_bad_type() {
        let err = NetConfig::parse("macvlan eth0 mv0 foo").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn parse_macvlan_defaults() {
        let cfg = NetConfig::parse("macvlan bond0 mv1").unwrap();
        match &cfg.ifaces[0] {
            IfaceRequest::MacVlan(r) => {
                assert_eq!(r.mode, MacVlanMode::Bridge);
                assert_eq!(r.mtu, None);
                assert_eq!(r.hw, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_ipvlan_modes() {
        let cfg = NetConfig::parse("ipvlan eth0 iv0 l3 1450").unwrap();
        match &cfg.ifaces[0] {
            IfaceRequest::IpVlan(r) => {
                assert_eq!(r.mode, IpVlanMode::L3);
                assert_eq!(r.mtu, Some(1450));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(NetConfig::parse("ipvlan eth0 iv0 l9").is_err());
    }

    #[test]
    fn parse_sources() {
        assert_eq!(NetConfig::parse("none").unwrap().source(), NsSource::None);
        assert_eq!(
            NetConfig::parse("inherited").unwrap().source(),
            NsSource::Inherited
        );
        assert_eq!(
            NetConfig::parse("host").unwrap().source(),
            NsSource::Inherited
        );
        assert_eq!(
            NetConfig::parse("container db").unwrap().source(),
            NsSource::Container("db".to_string())
        );
        assert_eq!(
            NetConfig::parse("netns blue").unwrap().source(),
            NsSource::Netns("blue".to_string())
        );
        // Empty spec inherits.
        assert_eq!(NetConfig::parse("").unwrap().source(), NsSource::Inherited);
    }

    #[test]
    fn host_with_arg_is_steal() {
        let cfg = NetConfig::parse("host eth1").unwrap();
        assert_eq!(cfg.ifaces, vec![IfaceRequest::Steal("eth1".to_string())]);
        assert_eq!(cfg.source(), NsSource::New);
    }

    #[test]
    fn exclusive_sources_rejected() {
        assert!(NetConfig::parse("none\nveth eth0 br0").is_err());
        assert!(NetConfig::parse("inherited\nmacvlan eth0 mv0").is_err());
        assert!(NetConfig::parse("container x\nL3 eth0").is_err());
        assert!(NetConfig::parse("none\ninherited").is_err());
    }

    #[test]
    fn mtu_override_applies_to_declared_link() {
        let cfg = NetConfig::parse("veth eth0 br0\nMTU eth0 1400").unwrap();
        match &cfg.ifaces[0] {
            IfaceRequest::Veth(r) => assert_eq!(r.mtu, Some(1400)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(NetConfig::parse("MTU eth0 1400").is_err());
        assert!(NetConfig::parse("veth eth0 br0\nMTU eth0 17").is_err());
    }

    #[test]
    fn duplicate_interfaces_rejected() {
        assert!(NetConfig::parse("veth eth0 br0\nmacvlan em1 eth0").is_err());
    }

    #[test]
    fn l3_and_nat_defaults() {
        let cfg = NetConfig::parse("L3").unwrap();
        assert_eq!(
            cfg.ifaces,
            vec![IfaceRequest::L3(L3Request {
                name: "eth0".to_string(),
                master: None,
            })]
        );
        let cfg = NetConfig::parse("NAT").unwrap();
        assert_eq!(cfg.ifaces, vec![IfaceRequest::Nat("eth0".to_string())]);
    }

    #[test]
    fn autoconf_collects() {
        let cfg = NetConfig::parse("L3 veth0\nautoconf veth0").unwrap();
        assert_eq!(cfg.autoconf, vec!["veth0".to_string()]);
    }

    #[test]
    fn ip_and_gw_assignment() {
        let mut cfg = NetConfig::parse("L3 eth0").unwrap();
        cfg.parse_ip("eth0 10.7.0.2").unwrap();
        cfg.parse_gw("eth0 10.7.0.1").unwrap();
        assert_eq!(cfg.ips_of("eth0"), vec![NetAddr::parse("10.7.0.2").unwrap()]);
        assert_eq!(cfg.gw[0].1.to_string(), "10.7.0.1");
        assert!(cfg.parse_ip("eth0").is_err());
        assert!(cfg.parse_ip("eth0 not-an-ip").is_err());
    }

    #[test]
    fn hw_address_validation() {
        assert_eq!(
            parse_hw("02:aa:bb:cc:dd:ee").unwrap(),
            [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]
        );
        assert!(parse_hw("02:aa:bb:cc:dd").is_err());
        assert!(parse_hw("02:aa:bb:cc:dd:zz").is_err());
        assert!(parse_hw("2:aa:bb:cc:dd:ee").is_err());
    }

    #[test]
    fn generated_hw_matches_crc_formula() {
        let name = "mv0portove-1-0";
        let host = "host";
        let hw = gen_hw_addr(name, host);
        let n = crc32fast::hash(name.as_bytes());
        let h = crc32fast::hash(host.as_bytes());
        assert_eq!(hw[0], 0x02);
        assert_eq!(hw[1], (n & 0xff) as u8);
        assert_eq!(hw[2], ((h >> 24) & 0xff) as u8);
        assert_eq!(hw[3], ((h >> 16) & 0xff) as u8);
        assert_eq!(hw[4], ((h >> 8) & 0xff) as u8);
        assert_eq!(hw[5], (h & 0xff) as u8);
    }

    #[test]
    fn device_name_allocation() {
        let existing: Vec<String> = vec!["tap0".to_string(), "tap1".to_string()];
        assert_eq!(new_device_name("tap", &existing).unwrap(), "tap2");

        let full: Vec<String> = (0..100).map(|i| format!("tap{}", i)).collect();
        assert_eq!(
            new_device_name("tap", &full).unwrap_err().kind,
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn autoconf_address_detection() {
        let content = "\
fe80000000000000021122fffe334455 02 40 20 80     eth0
fd000000000000000000000000000001 02 40 00 40     eth1
20010db8000000000000000000000001 03 40 00 00     eth1
";
        // eth0 only has a link-local address.
        assert!(!iface_has_global_ipv6(content, "eth0"));
        // eth1's first global address is tentative, the second counts.
        assert!(iface_has_global_ipv6(content, "eth1"));
        assert!(!iface_has_global_ipv6(content, "eth2"));
    }
}
