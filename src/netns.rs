//! Namespace handles and the per-namespace network state.
//!
//! A [`NetworkNamespace`] owns one netlink client, one device inventory
//! and one NAT pool, all behind a single async mutex so refreshes, class
//! updates and stats reads are linearised. Instances are deduplicated by
//! netns inode through [`NetRegistry`], which holds weak references and
//! prunes them opportunistically; the host namespace is the distinguished
//! singleton entry.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};

use netlink_packet_route::address::{AddressAttribute, AddressScope};
use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::addr::NetAddr;
use crate::config::{DeviceGroups, NetworkConfig};
use crate::device::{DeviceInventory, DeviceStatKind};
use crate::error::{Error, ErrorKind, Result};
use crate::nat::NatPool;
use crate::netlink::NetlinkClient;
use crate::tc::{container_class, ClassRequest, ClassStat, TrafficTree};

/// The namespace kinds the launcher can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsKind {
    Net,
    Ipc,
    Uts,
    Pid,
    Mnt,
}

impl NsKind {
    pub fn name(self) -> &'static str {
        match self {
            NsKind::Net => "net",
            NsKind::Ipc => "ipc",
            NsKind::Uts => "uts",
            NsKind::Pid => "pid",
            NsKind::Mnt => "mnt",
        }
    }

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::Net => CloneFlags::CLONE_NEWNET,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::Pid => CloneFlags::CLONE_NEWPID,
            NsKind::Mnt => CloneFlags::CLONE_NEWNS,
        }
    }
}

/// Scoped ownership of one `/proc/<tid>/ns/<kind>` descriptor.
#[derive(Debug)]
pub struct NamespaceHandle {
    file: File,
    kind: NsKind,
}

impl NamespaceHandle {
    /// Open the namespace of `tid` (or the caller with `None`).
    pub fn open(tid: Option<Pid>, kind: NsKind) -> Result<Self> {
        let path = match tid {
            Some(pid) => format!("/proc/{}/ns/{}", pid, kind.name()),
            None => format!("/proc/self/ns/{}", kind.name()),
        };
        Self::open_path(path, kind)
    }

    /// Open a bound namespace file, e.g. `/var/run/netns/<name>`.
    pub fn open_path(path: impl AsRef<Path>, kind: NsKind) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            Error::with_errno(
                ErrorKind::InvalidValue,
                e.raw_os_error().unwrap_or(0),
                format!("cannot open namespace {}: {}", path.as_ref().display(), e),
            )
        })?;
        Ok(NamespaceHandle { file, kind })
    }

    /// Path of a named network namespace.
    pub fn named_netns_path(name: &str) -> PathBuf {
        Path::new("/var/run/netns").join(name)
    }

    pub fn kind(&self) -> NsKind {
        self.kind
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn into_file(self) -> File {
        self.file
    }

    pub fn inode(&self) -> Result<u64> {
        Ok(self.file.metadata().map_err(Error::from)?.ino())
    }

    /// Move the calling thread into this namespace.
    pub fn enter(&self) -> Result<()> {
        setns(&self.file, self.kind.clone_flag()).map_err(|e| {
            Error::from_kernel(e as i32, &format!("setns({})", self.kind.name()))
        })
    }
}

/// Guarded netns entry: enters the target and restores the original
/// namespace on every exit path, including unwinds.
pub struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    pub fn enter(target: &File) -> Result<NetnsGuard> {
        let original = File::open("/proc/self/ns/net").map_err(Error::from)?;
        setns(target, CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::from_kernel(e as i32, "setns(net)"))?;
        Ok(NetnsGuard { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            warn!(error = %e, "failed to restore original network namespace");
        }
    }
}

struct NetnsState {
    client: NetlinkClient,
    inventory: DeviceInventory,
    nat: NatPool,
    iface_seq: u32,
}

/// One network namespace as seen by the engine.
pub struct NetworkNamespace {
    inode: u64,
    host: bool,
    /// Whether the engine manages TC state here at all.
    managed: bool,
    state: Mutex<NetnsState>,
}

impl NetworkNamespace {
    /// Bind to the namespace behind `file`. The netlink socket is opened
    /// while the calling thread briefly enters the namespace; no awaits
    /// happen inside the guarded region.
    fn bind(file: &File, host: bool, managed: bool, cfg: &NetworkConfig) -> Result<Arc<Self>> {
        let inode = file.metadata().map_err(Error::from)?.ino();
        let client = {
            let _guard = NetnsGuard::enter(file)?;
            NetlinkClient::connect()?
        };
        info!(inode, host, managed, "attached network namespace");
        Ok(Arc::new(NetworkNamespace {
            inode,
            host,
            managed,
            state: Mutex::new(NetnsState {
                client,
                inventory: DeviceInventory::default(),
                nat: NatPool::from_config(cfg)?,
                iface_seq: 0,
            }),
        }))
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// Next per-namespace interface sequence number (veth/L3 peer names).
    pub async fn next_iface_seq(&self) -> u32 {
        let mut state = self.state.lock().await;
        let seq = state.iface_seq;
        state.iface_seq += 1;
        seq
    }

    /// Lock the namespace and borrow its netlink client.
    pub(crate) async fn client(&self) -> tokio::sync::MappedMutexGuard<'_, NetlinkClient> {
        tokio::sync::MutexGuard::map(self.state.lock().await, |s| &mut s.client)
    }

    /// Reload the link cache and rebuild missing HTB skeletons
    /// (see `DeviceInventory::refresh`).
    pub async fn refresh_devices(
        &self,
        cfg: &NetworkConfig,
        groups: &DeviceGroups,
    ) -> Result<()> {
        if !self.managed {
            return Ok(());
        }
        let state = &mut *self.state.lock().await;
        state
            .inventory
            .refresh(&state.client, cfg, groups, self.host)
            .await
    }

    /// Names of currently known managed devices.
    pub async fn managed_device_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .inventory
            .managed()
            .map(|d| d.name.clone())
            .collect()
    }

    /// Create the TC class of container `id` on every managed device.
    /// All devices are attempted; the first failure is reported.
    pub async fn create_container_classes(
        &self,
        cfg: &NetworkConfig,
        id: u16,
        req: Option<ClassRequest>,
    ) -> Result<()> {
        let state = &mut *self.state.lock().await;
        let tree = TrafficTree::new(&state.client, cfg, self.host);
        let mut first_err: Option<Error> = None;
        for dev in state.inventory.managed() {
            let req = req.unwrap_or(ClassRequest {
                rate: cfg.container_rate(&dev.name),
                ceil: 0,
                prio: 3,
            });
            if let Err(e) = tree.add_container_class(dev, id, req).await {
                warn!(dev = %dev.name, id, error = %e, "container class add failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove the TC class of container `id` from every managed device,
    /// recursing where the kernel reports children.
    pub async fn destroy_container_classes(&self, cfg: &NetworkConfig, id: u16) -> Result<()> {
        let state = &mut *self.state.lock().await;
        let tree = TrafficTree::new(&state.client, cfg, self.host);
        let mut first_err: Option<Error> = None;
        for dev in state.inventory.managed() {
            if let Err(e) = tree.del_class(dev.index as i32, container_class(id)).await {
                warn!(dev = %dev.name, id, error = %e, "container class del failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn get_nat_address(&self) -> Result<Vec<NetAddr>> {
        self.state.lock().await.nat.get_nat_address()
    }

    pub async fn put_nat_address(&self, addrs: &[NetAddr]) -> Result<()> {
        self.state.lock().await.nat.put_nat_address(addrs)
    }

    /// One device counter by name.
    pub async fn device_stat(&self, name: &str, kind: DeviceStatKind) -> Result<u64> {
        let state = self.state.lock().await;
        let dev = state.inventory.device_by_name(name).ok_or_else(|| {
            Error::with_errno(
                ErrorKind::Unknown,
                libc::ENODEV,
                format!("device '{}' not known", name),
            )
        })?;
        Ok(dev.stats.get(kind))
    }

    /// One TC counter of container `id` on device `name`.
    pub async fn container_class_stat(
        &self,
        cfg: &NetworkConfig,
        name: &str,
        id: u16,
        kind: ClassStat,
    ) -> Result<u64> {
        let state = self.state.lock().await;
        let dev = state.inventory.device_by_name(name).ok_or_else(|| {
            Error::with_errno(
                ErrorKind::Unknown,
                libc::ENODEV,
                format!("device '{}' not known", name),
            )
        })?;
        let tree = TrafficTree::new(&state.client, cfg, self.host);
        tree.class_stat(dev.index as i32, container_class(id), kind)
            .await
    }

    /// Gateway discovery: for each candidate pick the most specific local
    /// non-host-scope address of the same family whose prefix contains it,
    /// falling back to any non-host address of that family. Selected
    /// gateways are host routes; the MTU is the minimum over the links the
    /// gateways live on.
    pub async fn gate_address(
        &self,
        candidates: &[NetAddr],
    ) -> Result<(Option<NetAddr>, Option<NetAddr>, u32)> {
        let state = self.state.lock().await;
        let msgs = state.client.addresses().await?;
        let mut locals = Vec::new();
        for msg in &msgs {
            if msg.header.scope == AddressScope::Host {
                continue;
            }
            let mut ip = None;
            for attr in &msg.attributes {
                match attr {
                    AddressAttribute::Address(a) => ip = Some(*a),
                    AddressAttribute::Local(a) => {
                        if ip.is_none() {
                            ip = Some(*a);
                        }
                    }
                    _ => {}
                }
            }
            let Some(ip) = ip else { continue };
            if let Ok(net) = NetAddr::new(ip, msg.header.prefix_len) {
                locals.push((net, msg.header.index));
            }
        }

        let links = state.client.open_links(true, false).await?;
        let mtu_of = |index: u32| -> Option<u32> {
            links
                .iter()
                .find(|l| l.header.index == index)
                .and_then(|l| {
                    l.attributes.iter().find_map(|a| match a {
                        netlink_packet_route::link::LinkAttribute::Mtu(m) => Some(*m),
                        _ => None,
                    })
                })
        };

        let mut gate4 = None;
        let mut gate6 = None;
        let mut mtu = 0u32;
        for cand in candidates {
            let Some((gate, index)) = select_gateway(&locals, cand) else {
                continue;
            };
            if let Some(link_mtu) = mtu_of(index) {
                if mtu == 0 || link_mtu < mtu {
                    mtu = link_mtu;
                }
            }
            if cand.is_v4() {
                gate4 = Some(gate.as_host());
            } else {
                gate6 = Some(gate.as_host());
            }
        }
        debug!(?gate4, ?gate6, mtu, "gateway discovery");
        Ok((gate4, gate6, mtu))
    }
}

/// Pure gateway selection over `(local address, ifindex)` pairs.
pub fn select_gateway(locals: &[(NetAddr, u32)], candidate: &NetAddr) -> Option<(NetAddr, u32)> {
    let mut best: Option<(NetAddr, u32)> = None;
    for (net, index) in locals {
        if net.is_v4() != candidate.is_v4() {
            continue;
        }
        if net.contains(candidate) {
            match &best {
                Some((b, _)) if b.contains(candidate) && b.prefix() >= net.prefix() => {}
                _ => best = Some((*net, *index)),
            }
        }
    }
    if best.is_some() {
        return best;
    }
    locals
        .iter()
        .find(|(net, _)| net.is_v4() == candidate.is_v4())
        .copied()
}

/// Process-wide registry of live namespaces, keyed by netns inode.
/// Holds weak handles only; dead entries are pruned on every insert.
#[derive(Default)]
pub struct NetRegistry {
    namespaces: StdMutex<HashMap<u64, Weak<NetworkNamespace>>>,
    host: OnceLock<Arc<NetworkNamespace>>,
}

impl NetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct and remember the host namespace singleton.
    pub fn init_host(&self, cfg: &NetworkConfig) -> Result<Arc<NetworkNamespace>> {
        if let Some(host) = self.host.get() {
            return Ok(host.clone());
        }
        let handle = NamespaceHandle::open(None, NsKind::Net)?;
        let ns = NetworkNamespace::bind(handle.file(), true, true, cfg)?;
        self.insert(ns.clone());
        let _ = self.host.set(ns.clone());
        Ok(ns)
    }

    pub fn host(&self) -> Option<Arc<NetworkNamespace>> {
        self.host.get().cloned()
    }

    /// Resolve `file` to a shared namespace, creating it when no live
    /// instance exists for its inode.
    pub fn open_namespace(
        &self,
        file: &File,
        managed: bool,
        cfg: &NetworkConfig,
    ) -> Result<Arc<NetworkNamespace>> {
        let inode = file.metadata().map_err(Error::from)?.ino();
        if let Some(existing) = self.lookup(inode) {
            return Ok(existing);
        }
        let ns = NetworkNamespace::bind(file, false, managed, cfg)?;
        self.insert(ns.clone());
        Ok(ns)
    }

    pub fn lookup(&self, inode: u64) -> Option<Arc<NetworkNamespace>> {
        let map = self.namespaces.lock().unwrap();
        map.get(&inode).and_then(Weak::upgrade)
    }

    fn insert(&self, ns: Arc<NetworkNamespace>) {
        let mut map = self.namespaces.lock().unwrap();
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(ns.inode(), Arc::downgrade(&ns));
    }

    pub fn len(&self) -> usize {
        let map = self.namespaces.lock().unwrap();
        map.values().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(s: &str, index: u32) -> (NetAddr, u32) {
        (NetAddr::parse(s).unwrap(), index)
    }

    #[test]
    fn gateway_prefers_most_specific_containing_prefix() {
        let locals = vec![
            local("10.0.0.1/8", 2),
            local("10.1.0.1/16", 3),
            local("192.168.0.1/24", 4),
        ];
        let cand = NetAddr::parse("10.1.2.3").unwrap();
        let (gate, index) = select_gateway(&locals, &cand).unwrap();
        assert_eq!(gate.ip().to_string(), "10.1.0.1");
        assert_eq!(index, 3);
    }

    #[test]
    fn gateway_falls_back_to_any_same_family() {
        let locals = vec![local("192.168.0.1/24", 2), local("fd00::1/64", 3)];
        let cand = NetAddr::parse("10.9.9.9").unwrap();
        let (gate, index) = select_gateway(&locals, &cand).unwrap();
        assert_eq!(gate.ip().to_string(), "192.168.0.1");
        assert_eq!(index, 2);

        let cand6 = NetAddr::parse("fd99::1").unwrap();
        let (gate6, _) = select_gateway(&locals, &cand6).unwrap();
        assert_eq!(gate6.ip().to_string(), "fd00::1");
    }

    #[test]
    fn gateway_none_when_family_missing() {
        let locals = vec![local("192.168.0.1/24", 2)];
        let cand = NetAddr::parse("fd00::2").unwrap();
        assert!(select_gateway(&locals, &cand).is_none());
    }

    #[test]
    fn ns_kind_flags() {
        assert_eq!(NsKind::Net.clone_flag(), CloneFlags::CLONE_NEWNET);
        assert_eq!(NsKind::Mnt.clone_flag(), CloneFlags::CLONE_NEWNS);
        assert_eq!(NsKind::Pid.name(), "pid");
    }

    #[test]
    fn named_netns_paths() {
        assert_eq!(
            NamespaceHandle::named_netns_path("blue"),
            PathBuf::from("/var/run/netns/blue")
        );
    }
}
