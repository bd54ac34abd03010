//! Route-netlink client.
//!
//! Wraps one rtnetlink connection and exposes the link, address, route,
//! neighbour and traffic-control operations the engine needs. The
//! high-level rtnetlink builders cover links, addresses and routes; HTB
//! qdiscs/classes and the cgroup packet classifier have no typed builder,
//! so those messages are assembled by hand and pushed through the raw
//! request path. Kernel NACKs are translated into [`Error`] with the
//! original errno preserved.
//!
//! The connection is bound to whatever network namespace the calling
//! thread is in at [`NetlinkClient::connect`] time; enter the target netns
//! first (see `netns::NetnsGuard`).

use std::net::IpAddr;
use std::os::fd::RawFd;

use futures::stream::StreamExt;
use futures::TryStreamExt;
use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL,
    NLM_F_REPLACE, NLM_F_REQUEST,
};
use netlink_packet_route::address::AddressMessage;
use netlink_packet_route::link::{
    InfoData, InfoIpVlan, InfoKind, InfoMacVlan, InfoVeth, IpVlanMode, LinkAttribute, LinkFlags,
    LinkInfo, LinkMessage, MacVlanMode,
};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlags, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::route::RouteScope;
use netlink_packet_route::tc::{TcAttribute, TcHandle, TcMessage, TcOption};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use rtnetlink::{Handle, RouteMessageBuilder};
use tracing::debug;

use crate::addr::NetAddr;
use crate::error::{Error, ErrorKind, Result};

/// `ETH_P_ALL` in network byte order, as the classifier filter wants it.
const ETH_P_ALL_BE: u16 = 0x0003u16.to_be();

/// Priority of the cgroup classifier filter.
const CGROUP_FILTER_PRIO: u16 = 10;

pub struct NetlinkClient {
    handle: Handle,
}

impl NetlinkClient {
    /// Open a route-netlink socket in the caller's current network
    /// namespace and spawn its connection task on the runtime.
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(Error::from)?;
        tokio::spawn(connection);
        Ok(NetlinkClient { handle })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Enumerate links. With `all == false` loopback is skipped, and with
    /// `require_running` links that are not `IFF_RUNNING` are skipped too
    /// (host namespace behaviour).
    pub async fn open_links(&self, all: bool, require_running: bool) -> Result<Vec<LinkMessage>> {
        let mut links = self.handle.link().get().execute();
        let mut out = Vec::new();
        while let Some(msg) = links.try_next().await.map_err(Error::from)? {
            let flags = msg.header.flags;
            if !all {
                if flags.contains(LinkFlags::Loopback) {
                    continue;
                }
                if require_running && !flags.contains(LinkFlags::Running) {
                    continue;
                }
            }
            out.push(msg);
        }
        Ok(out)
    }

    pub async fn link_by_name(&self, name: &str) -> Result<LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(Error::with_errno(
                ErrorKind::Unknown,
                libc::ENODEV,
                format!("link '{}' not found", name),
            )),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    Err(Error::with_errno(
                        ErrorKind::Unknown,
                        libc::ENODEV,
                        format!("link '{}' not found", name),
                    ))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Create a veth pair. `name` is the container-side end and may be
    /// created directly inside `netns`; `peer` stays in the caller's
    /// namespace.
    pub async fn add_veth(
        &self,
        name: &str,
        peer: &str,
        hw: Option<[u8; 6]>,
        mtu: Option<u32>,
        netns: Option<RawFd>,
    ) -> Result<()> {
        debug!(name, peer, "creating veth pair");
        let mut peer_msg = LinkMessage::default();
        peer_msg
            .attributes
            .push(LinkAttribute::IfName(peer.to_string()));

        let mut msg = LinkMessage::default();
        msg.attributes
            .push(LinkAttribute::IfName(name.to_string()));
        if let Some(hw) = hw {
            msg.attributes.push(LinkAttribute::Address(hw.to_vec()));
        }
        if let Some(mtu) = mtu {
            msg.attributes.push(LinkAttribute::Mtu(mtu));
        }
        if let Some(fd) = netns {
            msg.attributes.push(LinkAttribute::NetNsFd(fd));
        }
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::Veth),
            LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer_msg))),
        ]));

        self.handle
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(|e| Error::from(e))
    }

    pub async fn add_macvlan(
        &self,
        master: u32,
        name: &str,
        mode: MacVlanMode,
        hw: Option<[u8; 6]>,
        mtu: Option<u32>,
    ) -> Result<()> {
        debug!(name, master, ?mode, "creating macvlan");
        let mut msg = LinkMessage::default();
        msg.attributes
            .push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Link(master));
        if let Some(hw) = hw {
            msg.attributes.push(LinkAttribute::Address(hw.to_vec()));
        }
        if let Some(mtu) = mtu {
            msg.attributes.push(LinkAttribute::Mtu(mtu));
        }
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::MacVlan),
            LinkInfo::Data(InfoData::MacVlan(vec![InfoMacVlan::Mode(mode)])),
        ]));
        self.handle
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(Error::from)
    }

    pub async fn add_ipvlan(
        &self,
        master: u32,
        name: &str,
        mode: IpVlanMode,
        mtu: Option<u32>,
    ) -> Result<()> {
        debug!(name, master, ?mode, "creating ipvlan");
        let mut msg = LinkMessage::default();
        msg.attributes
            .push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Link(master));
        if let Some(mtu) = mtu {
            msg.attributes.push(LinkAttribute::Mtu(mtu));
        }
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::IpVlan),
            LinkInfo::Data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode)])),
        ]));
        self.handle
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(Error::from)
    }

    /// Move a link into another network namespace.
    pub async fn change_ns(&self, index: u32, netns: RawFd) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes.push(LinkAttribute::NetNsFd(netns));
        self.handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(Error::from)
    }

    /// Delete a link; a link that is already gone is not an error.
    pub async fn remove(&self, index: u32) -> Result<()> {
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    pub async fn up(&self, index: u32) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.header.flags |= LinkFlags::Up;
        msg.header.change_mask |= LinkFlags::Up;
        self.handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(Error::from)
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes.push(LinkAttribute::Mtu(mtu));
        self.handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(Error::from)
    }

    /// Enslave `index` to a bridge (or other controller device).
    pub async fn set_master(&self, index: u32, master: u32) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes.push(LinkAttribute::Controller(master));
        self.handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(Error::from)
    }

    pub async fn set_name(&self, index: u32, name: &str) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes
            .push(LinkAttribute::IfName(name.to_string()));
        self.handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(Error::from)
    }

    /// Assign an address; re-assigning the same address is not an error.
    pub async fn set_ip(&self, index: u32, addr: &NetAddr) -> Result<()> {
        match self
            .handle
            .address()
            .add(index, addr.ip(), addr.prefix())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.kernel_class() == crate::error::KernelClass::Exists {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Dump the address cache of this namespace.
    pub async fn addresses(&self) -> Result<Vec<AddressMessage>> {
        let mut addrs = self.handle.address().get().execute();
        let mut out = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(Error::from)? {
            out.push(msg);
        }
        Ok(out)
    }

    pub async fn set_default_gw(&self, index: u32, gw: IpAddr) -> Result<()> {
        let res = match gw {
            IpAddr::V4(gw4) => {
                let msg = RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                    .gateway(gw4)
                    .output_interface(index)
                    .build();
                self.handle.route().add(msg).execute().await
            }
            IpAddr::V6(gw6) => {
                let msg = RouteMessageBuilder::<std::net::Ipv6Addr>::new()
                    .gateway(gw6)
                    .output_interface(index)
                    .build();
                self.handle.route().add(msg).execute().await
            }
        };
        res.map_err(Error::from)
    }

    /// Install a link-scope host route towards `addr` (the L3 gateway
    /// pattern: the gateway must be reachable before the default route).
    pub async fn add_direct_route(&self, index: u32, addr: &NetAddr) -> Result<()> {
        let res = match addr.ip() {
            IpAddr::V4(ip) => {
                let mut msg = RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                    .destination_prefix(ip, addr.prefix())
                    .output_interface(index)
                    .build();
                msg.header.scope = RouteScope::Link;
                self.handle.route().add(msg).execute().await
            }
            IpAddr::V6(ip) => {
                let mut msg = RouteMessageBuilder::<std::net::Ipv6Addr>::new()
                    .destination_prefix(ip, addr.prefix())
                    .output_interface(index)
                    .build();
                msg.header.scope = RouteScope::Link;
                self.handle.route().add(msg).execute().await
            }
        };
        res.map_err(Error::from)
    }

    /// Add or remove a proxy-neighbour entry, so the kernel answers
    /// ARP/ND on `index` on behalf of `addr`.
    pub async fn proxy_neighbour(&self, index: u32, addr: IpAddr, add: bool) -> Result<()> {
        let mut msg = NeighbourMessage::default();
        msg.header.ifindex = index;
        msg.header.family = match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        };
        msg.header.state = NeighbourState::Permanent;
        msg.header.flags = NeighbourFlags::Proxy;
        let dest = match addr {
            IpAddr::V4(ip) => NeighbourAddress::Inet(ip),
            IpAddr::V6(ip) => NeighbourAddress::Inet6(ip),
        };
        msg.attributes.push(NeighbourAttribute::Destination(dest));

        if add {
            self.request_ack(
                RouteNetlinkMessage::NewNeighbour(msg),
                NLM_F_CREATE | NLM_F_REPLACE,
                "proxy neighbour add",
            )
            .await
        } else {
            match self
                .request_ack(RouteNetlinkMessage::DelNeighbour(msg), 0, "proxy neighbour del")
                .await
            {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Traffic control
    // ------------------------------------------------------------------

    /// `attrs` carries the qdisc options: a nested `TCA_OPTIONS` for htb
    /// and fq_codel, a packed struct for the fifo family, nothing for
    /// kinds configured by defaults.
    pub async fn qdisc_add(
        &self,
        ifindex: i32,
        handle: TcHandle,
        parent: TcHandle,
        kind: &str,
        attrs: Vec<TcAttribute>,
        replace: bool,
    ) -> Result<()> {
        let mut msg = TcMessage::with_index(ifindex);
        msg.header.handle = handle;
        msg.header.parent = parent;
        msg.attributes.push(TcAttribute::Kind(kind.to_string()));
        msg.attributes.extend(attrs);
        let flags = if replace {
            NLM_F_CREATE | NLM_F_REPLACE
        } else {
            NLM_F_CREATE | NLM_F_EXCL
        };
        self.request_ack(RouteNetlinkMessage::NewQueueDiscipline(msg), flags, "qdisc add")
            .await
    }

    /// Delete a qdisc; already-gone is fine.
    pub async fn qdisc_del(&self, ifindex: i32, handle: TcHandle, parent: TcHandle) -> Result<()> {
        let mut msg = TcMessage::with_index(ifindex);
        msg.header.handle = handle;
        msg.header.parent = parent;
        match self
            .request_ack(RouteNetlinkMessage::DelQueueDiscipline(msg), 0, "qdisc del")
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Kind and handle of the root qdisc on `ifindex`, if any.
    pub async fn root_qdisc(&self, ifindex: i32) -> Result<Option<(String, TcHandle)>> {
        let dump = self
            .dump_tc(RouteNetlinkMessage::GetQueueDiscipline(TcMessage::default()))
            .await?;
        for tc in dump {
            if tc.header.index != ifindex {
                continue;
            }
            if tc.header.parent != TcHandle::ROOT {
                continue;
            }
            for attr in &tc.attributes {
                if let TcAttribute::Kind(kind) = attr {
                    return Ok(Some((kind.clone(), tc.header.handle)));
                }
            }
        }
        Ok(None)
    }

    pub async fn class_add(
        &self,
        ifindex: i32,
        handle: TcHandle,
        parent: TcHandle,
        kind: &str,
        options: Vec<TcOption>,
    ) -> Result<()> {
        let mut msg = TcMessage::with_index(ifindex);
        msg.header.handle = handle;
        msg.header.parent = parent;
        msg.attributes.push(TcAttribute::Kind(kind.to_string()));
        msg.attributes.push(TcAttribute::Options(options));
        self.request_ack(
            RouteNetlinkMessage::NewTrafficClass(msg),
            NLM_F_CREATE | NLM_F_REPLACE,
            "class add",
        )
        .await
    }

    /// Direct class delete: `EBUSY` propagates so the caller can recurse,
    /// `ENOENT` is swallowed.
    pub async fn class_del(&self, ifindex: i32, handle: TcHandle) -> Result<()> {
        let mut msg = TcMessage::with_index(ifindex);
        msg.header.handle = handle;
        match self
            .request_ack(RouteNetlinkMessage::DelTrafficClass(msg), 0, "class del")
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Dump all classes installed on `ifindex`.
    pub async fn class_dump(&self, ifindex: i32) -> Result<Vec<TcMessage>> {
        self.dump_tc(RouteNetlinkMessage::GetTrafficClass(TcMessage::with_index(
            ifindex,
        )))
        .await
    }

    /// Install or replace the cgroup packet classifier under `parent`.
    pub async fn cgroup_filter_add(&self, ifindex: i32, parent: TcHandle) -> Result<()> {
        let mut msg = TcMessage::with_index(ifindex);
        msg.header.parent = parent;
        msg.header.handle = TcHandle { major: 0, minor: 1 };
        msg.header.info = filter_info(CGROUP_FILTER_PRIO);
        msg.attributes.push(TcAttribute::Kind("cgroup".to_string()));
        self.request_ack(
            RouteNetlinkMessage::NewTrafficFilter(msg),
            NLM_F_CREATE | NLM_F_REPLACE,
            "cgroup filter add",
        )
        .await
    }

    pub async fn cgroup_filter_del(&self, ifindex: i32, parent: TcHandle) -> Result<()> {
        let mut msg = TcMessage::with_index(ifindex);
        msg.header.parent = parent;
        msg.header.handle = TcHandle { major: 0, minor: 1 };
        msg.header.info = filter_info(CGROUP_FILTER_PRIO);
        msg.attributes.push(TcAttribute::Kind("cgroup".to_string()));
        match self
            .request_ack(RouteNetlinkMessage::DelTrafficFilter(msg), 0, "cgroup filter del")
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Raw request plumbing
    // ------------------------------------------------------------------

    async fn request_ack(
        &self,
        msg: RouteNetlinkMessage,
        extra_flags: u16,
        ctx: &str,
    ) -> Result<()> {
        let mut req = NetlinkMessage::from(msg);
        req.header.flags = NLM_F_REQUEST | NLM_F_ACK | extra_flags;
        let mut handle = self.handle.clone();
        let mut response = handle.request(req).map_err(Error::from)?;
        while let Some(reply) = response.next().await {
            if let NetlinkPayload::Error(err) = reply.payload {
                if let Some(code) = err.code {
                    return Err(Error::from_kernel(code.get(), ctx));
                }
            }
        }
        Ok(())
    }

    async fn dump_tc(&self, msg: RouteNetlinkMessage) -> Result<Vec<TcMessage>> {
        let mut req = NetlinkMessage::from(msg);
        req.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        let mut handle = self.handle.clone();
        let mut response = handle.request(req).map_err(Error::from)?;
        let mut out = Vec::new();
        while let Some(reply) = response.next().await {
            match reply.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewQueueDiscipline(tc))
                | NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewTrafficClass(tc)) => {
                    out.push(tc)
                }
                NetlinkPayload::Error(err) => {
                    if let Some(code) = err.code {
                        return Err(Error::from_kernel(code.get(), "tc dump"));
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

/// `tcm_info` packing for filters: priority in the upper 16 bits, protocol
/// (network byte order) in the lower.
fn filter_info(prio: u16) -> u32 {
    ((prio as u32) << 16) | ETH_P_ALL_BE as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_info_packs_priority_and_protocol() {
        let info = filter_info(10);
        assert_eq!(info >> 16, 10);
        assert_eq!((info & 0xffff) as u16, 0x0003u16.to_be());
    }
}
