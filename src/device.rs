//! Host link inventory.
//!
//! [`DeviceInventory`] mirrors the kernel link cache into a list of
//! [`NetworkDevice`]s and reconciles it on every refresh: known devices are
//! updated in place, vanished devices are dropped, and managed devices that
//! lost their HTB root are marked for rebuild.

use netlink_packet_route::link::{
    InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage,
};
use tracing::{debug, warn};

use crate::config::{DeviceGroups, NetworkConfig};
use crate::error::{Error, Result};
use crate::netcfg::{L3_PREFIX, VETH_PREFIX};
use crate::netlink::NetlinkClient;
use crate::tc::TrafficTree;

/// Counters kept per device from the last refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatKind {
    RxBytes,
    TxBytes,
    RxPackets,
    TxPackets,
    RxDropped,
    TxDropped,
}

impl DeviceStats {
    pub fn get(&self, kind: DeviceStatKind) -> u64 {
        match kind {
            DeviceStatKind::RxBytes => self.rx_bytes,
            DeviceStatKind::TxBytes => self.tx_bytes,
            DeviceStatKind::RxPackets => self.rx_packets,
            DeviceStatKind::TxPackets => self.tx_packets,
            DeviceStatKind::RxDropped => self.rx_dropped,
            DeviceStatKind::TxDropped => self.tx_dropped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkDevice {
    pub name: String,
    pub kind: String,
    pub index: u32,
    /// `IFLA_LINK`: parent ifindex of stacked devices (macvlan, ipvlan).
    pub link_parent: Option<u32>,
    pub group: u32,
    pub mtu: u32,
    /// Derived once from config at construction.
    pub managed: bool,
    /// True after the HTB tree is installed.
    pub prepared: bool,
    /// Refresh-cycle sweep flag.
    pub missing: bool,
    pub stats: DeviceStats,
}

impl NetworkDevice {
    /// Build a device from a link-cache entry; `None` when the link is one
    /// the inventory must ignore (loopback, non-running host links,
    /// engine-internal veth/L3 parent ends).
    pub fn from_link(
        msg: &LinkMessage,
        cfg: &NetworkConfig,
        groups: &DeviceGroups,
        host: bool,
    ) -> Option<NetworkDevice> {
        let flags = msg.header.flags;
        if flags.contains(LinkFlags::Loopback) {
            return None;
        }
        if host && !flags.contains(LinkFlags::Running) {
            return None;
        }

        let mut name = None;
        let mut mtu = 0;
        let mut group = 0;
        let mut link_parent = None;
        let mut kind = String::from("unknown");
        let mut stats = DeviceStats::default();

        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(n) => name = Some(n.clone()),
                LinkAttribute::Mtu(m) => mtu = *m,
                LinkAttribute::Group(g) => group = *g,
                LinkAttribute::Link(p) => link_parent = Some(*p),
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        if let LinkInfo::Kind(k) = info {
                            kind = kind_name(k);
                        }
                    }
                }
                LinkAttribute::Stats64(s) => {
                    stats = DeviceStats {
                        rx_bytes: s.rx_bytes,
                        tx_bytes: s.tx_bytes,
                        rx_packets: s.rx_packets,
                        tx_packets: s.tx_packets,
                        rx_dropped: s.rx_dropped,
                        tx_dropped: s.tx_dropped,
                    };
                }
                _ => {}
            }
        }

        let name = name?;
        if is_reserved_name(&name) {
            return None;
        }

        // In a container-owned namespace every device is managed; on the
        // host the config decides.
        let managed = !host || !cfg.device_unmanaged(&name, group, groups);

        Some(NetworkDevice {
            name,
            kind,
            index: msg.header.index,
            link_parent,
            group,
            mtu,
            managed,
            prepared: false,
            missing: false,
            stats,
        })
    }
}

/// Engine-generated parent-side interface names are never part of the
/// inventory, regardless of cache order.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with(VETH_PREFIX) || name.starts_with(L3_PREFIX)
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Veth => "veth".to_string(),
        InfoKind::MacVlan => "macvlan".to_string(),
        InfoKind::IpVlan => "ipvlan".to_string(),
        InfoKind::Bridge => "bridge".to_string(),
        InfoKind::Dummy => "dummy".to_string(),
        InfoKind::Vlan => "vlan".to_string(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

#[derive(Debug, Default)]
pub struct DeviceInventory {
    pub devices: Vec<NetworkDevice>,
    /// Set when devices changed so the next class refresh re-applies
    /// container classes.
    pub dirty: bool,
}

impl DeviceInventory {
    pub fn device_by_name(&self, name: &str) -> Option<&NetworkDevice> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn device_by_index(&self, index: u32) -> Option<&NetworkDevice> {
        self.devices.iter().find(|d| d.index == index)
    }

    pub fn managed(&self) -> impl Iterator<Item = &NetworkDevice> {
        self.devices.iter().filter(|d| d.managed)
    }

    /// Reload the link cache and reconcile. Per-device setup failures are
    /// collected; the first error is returned after every device has been
    /// attempted so one bad device does not mask the rest.
    pub async fn refresh(
        &mut self,
        client: &NetlinkClient,
        cfg: &NetworkConfig,
        groups: &DeviceGroups,
        host: bool,
    ) -> Result<()> {
        for dev in &mut self.devices {
            dev.missing = true;
        }

        let links = client.open_links(true, false).await?;
        for msg in &links {
            let Some(fresh) = NetworkDevice::from_link(msg, cfg, groups, host) else {
                continue;
            };
            match self
                .devices
                .iter_mut()
                .find(|d| d.name == fresh.name && d.index == fresh.index)
            {
                Some(existing) => {
                    existing.mtu = fresh.mtu;
                    existing.group = fresh.group;
                    existing.link_parent = fresh.link_parent;
                    existing.stats = fresh.stats;
                    existing.missing = false;
                    if existing.managed {
                        let root = client.root_qdisc(existing.index as i32).await?;
                        let htb = matches!(&root, Some((kind, h)) if kind == "htb" && *h == crate::tc::ROOT_QDISC);
                        if !htb && existing.prepared {
                            warn!(dev = %existing.name, "root qdisc lost, scheduling rebuild");
                            existing.prepared = false;
                        }
                    }
                }
                None => {
                    debug!(dev = %fresh.name, index = fresh.index, managed = fresh.managed, "new device");
                    self.devices.push(fresh);
                    self.dirty = true;
                }
            }
        }

        let before = self.devices.len();
        self.devices.retain(|d| !d.missing);
        if self.devices.len() != before {
            self.dirty = true;
        }

        let tree = TrafficTree::new(client, cfg, host);
        let mut first_err: Option<Error> = None;
        for dev in &mut self.devices {
            if !dev.managed || dev.prepared {
                continue;
            }
            if let Err(e) = tree.setup_queue(dev).await {
                warn!(dev = %dev.name, error = %e, "queue setup failed");
                first_err.get_or_insert(e);
            } else {
                self.dirty = true;
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefixes_are_filtered() {
        assert!(is_reserved_name("portove-12-0"));
        assert!(is_reserved_name("L3-7"));
        assert!(!is_reserved_name("eth0"));
        assert!(!is_reserved_name("l3-7"));
        assert!(!is_reserved_name("veth0"));
    }

    fn link(name: &str, index: u32, flags: LinkFlags) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.header.flags = flags;
        msg.attributes
            .push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Mtu(1500));
        msg
    }

    #[test]
    fn from_link_filters_and_classifies() {
        let cfg = NetworkConfig {
            unmanaged_devices: vec!["extbr*".to_string()],
            ..Default::default()
        };
        let groups = DeviceGroups::default();

        let up = LinkFlags::Up | LinkFlags::Running;

        // Plain running host device is managed.
        let d = NetworkDevice::from_link(&link("eth0", 2, up), &cfg, &groups, true).unwrap();
        assert!(d.managed);
        assert!(!d.prepared);
        assert_eq!(d.mtu, 1500);

        // Unmanaged pattern match.
        let d = NetworkDevice::from_link(&link("extbr0", 3, up), &cfg, &groups, true).unwrap();
        assert!(!d.managed);

        // Loopback is never inventoried.
        assert!(NetworkDevice::from_link(
            &link("lo", 1, LinkFlags::Up | LinkFlags::Loopback | LinkFlags::Running),
            &cfg,
            &groups,
            true
        )
        .is_none());

        // Non-running links are skipped on the host...
        assert!(
            NetworkDevice::from_link(&link("eth1", 4, LinkFlags::Up), &cfg, &groups, true)
                .is_none()
        );
        // ...but kept in a container namespace, where everything is managed.
        let d = NetworkDevice::from_link(&link("eth1", 4, LinkFlags::Up), &cfg, &groups, false)
            .unwrap();
        assert!(d.managed);

        // Engine-internal parent ends never show up.
        assert!(
            NetworkDevice::from_link(&link("portove-3-1", 9, up), &cfg, &groups, true).is_none()
        );
        assert!(NetworkDevice::from_link(&link("L3-2", 10, up), &cfg, &groups, true).is_none());
    }

    #[test]
    fn group_based_unmanaged() {
        let cfg = NetworkConfig {
            unmanaged_groups: vec!["storage".to_string()],
            ..Default::default()
        };
        let groups = DeviceGroups::parse("11 storage\n".as_bytes()).unwrap();
        let mut msg = link("eth2", 5, LinkFlags::Up | LinkFlags::Running);
        msg.attributes.push(LinkAttribute::Group(11));
        let d = NetworkDevice::from_link(&msg, &cfg, &groups, true).unwrap();
        assert!(!d.managed);
        assert_eq!(d.group, 11);
    }
}
