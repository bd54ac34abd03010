//! Hierarchical token bucket management.
//!
//! Every managed device carries the same skeleton installed by
//! [`TrafficTree::setup_queue`]:
//!
//! ```text
//! 1:0  htb root qdisc (default -> 1:2)
//! └─ 1:1  root class            rate = device_rate
//!    ├─ 1:2  default class      unclassified traffic
//!    │   └─ 2:0 leaf qdisc      (host namespace only)
//!    └─ 1:3  porto root class   parent of all containers
//!        └─ 1:<id>  container classes, id >= 4
//! ```
//!
//! The kernel takes HTB parameters as packed `tc_htb_opt`/`tc_htb_glob`
//! structs inside `TCA_OPTIONS`; buffers are in scheduler ticks, converted
//! via `/proc/net/psched` the way iproute2 does it.

use byteorder::{NativeEndian, WriteBytesExt};
use netlink_packet_route::tc::{TcHandle, TcMessage};
use netlink_packet_core::DefaultNla;
use netlink_packet_route::tc::TcAttribute;
use netlink_packet_route::tc::TcOption;
use netlink_packet_route::tc::TcStats2;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::device::NetworkDevice;
use crate::error::{Error, ErrorKind, Result};
use crate::netlink::NetlinkClient;

pub const ROOT_QDISC: TcHandle = TcHandle { major: 1, minor: 0 };
pub const ROOT_CLASS: TcHandle = TcHandle { major: 1, minor: 1 };
pub const DEFAULT_CLASS: TcHandle = TcHandle { major: 1, minor: 2 };
pub const PORTO_ROOT_CLASS: TcHandle = TcHandle { major: 1, minor: 3 };
/// Leaf qdisc attached below [`DEFAULT_CLASS`] on host devices.
pub const DEFAULT_LEAF_QDISC: TcHandle = TcHandle { major: 2, minor: 0 };

/// First minor usable for container classes; 1..=3 are reserved above.
pub const FIRST_CONTAINER_CLASS: u16 = 4;

pub fn container_class(id: u16) -> TcHandle {
    TcHandle { major: 1, minor: id }
}

// tc_htb_* attribute kinds from pkt_sched.h
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
// fq_codel attribute kinds
const TCA_FQ_CODEL_LIMIT: u16 = 2;
const TCA_FQ_CODEL_QUANTUM: u16 = 6;
// Raw-struct TCA_OPTIONS (fifo, sfq take a packed struct, not nested nlas)
const TCA_OPTIONS: u16 = 2;

const TC_HTB_PROTOVER: u32 = 3;
const TC_LINKLAYER_ETHERNET: u8 = 1;
/// rate → quantum divisor of the root qdisc.
const HTB_RATE2QUANTUM: u32 = 10;
/// Default priority of structural classes.
const DEFAULT_PRIO: u32 = 3;

/// Scheduler clock parameters from `/proc/net/psched`.
#[derive(Debug, Clone, Copy)]
pub struct Psched {
    tick_in_usec: f64,
}

impl Psched {
    /// Parse `/proc/net/psched`; modern kernels yield 15.625 ticks/usec,
    /// which also serves as the fallback.
    pub fn read() -> Psched {
        Self::parse(&std::fs::read_to_string("/proc/net/psched").unwrap_or_default())
            .unwrap_or(Psched { tick_in_usec: 15.625 })
    }

    fn parse(content: &str) -> Option<Psched> {
        let mut it = content
            .split_whitespace()
            .map(|f| u32::from_str_radix(f, 16).ok());
        let t2us = it.next()?? as f64;
        let us2t = it.next()?? as f64;
        let clock_res = it.next()?? as f64;
        if us2t == 0.0 || clock_res == 0.0 {
            return None;
        }
        let clock_factor = clock_res / 1_000_000.0;
        Some(Psched {
            tick_in_usec: t2us / us2t * clock_factor,
        })
    }

    /// Ticks needed to transmit `size` bytes at `rate` bytes/s
    /// (iproute2's `tc_calc_xmittime`).
    pub fn xmittime(&self, rate: u64, size: u32) -> u32 {
        if rate == 0 {
            return u32::MAX;
        }
        let usec = 1_000_000.0 * size as f64 / rate as f64;
        (usec * self.tick_in_usec).min(u32::MAX as f64) as u32
    }
}

/// A caller-facing class request, before clamping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassRequest {
    /// Guaranteed rate, bytes/s. 0 means "no guarantee".
    pub rate: u64,
    /// Borrow ceiling, bytes/s. 0 means "up to the device rate".
    pub ceil: u64,
    pub prio: u32,
}

/// Fully derived HTB class parameters as handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtbParams {
    pub rate: u32,
    pub ceil: u32,
    pub prio: u32,
    pub quantum: u32,
    /// rbuffer/cbuffer in bytes; converted to ticks at encode time.
    pub rbuffer: u32,
    pub cbuffer: u32,
    pub mtu: u32,
}

/// Apply the clamping rules: rate 0 maps to 1 (the kernel rejects 0 but
/// "no guarantee" must survive), rates are capped by the configured device
/// rate and `i32::MAX`, and a missing ceiling borrows up to the device.
pub fn derive_class(cfg: &NetworkConfig, dev: &str, mtu: u32, req: ClassRequest) -> HtbParams {
    let dev_max = cfg.device_rate(dev).min(i32::MAX as u64);
    let mut rate = req.rate.min(dev_max);
    if rate == 0 {
        rate = 1;
    }
    let mut ceil = if req.ceil == 0 || req.ceil > dev_max {
        dev_max
    } else {
        req.ceil
    };
    if ceil < rate {
        ceil = rate;
    }
    let mtu = if mtu == 0 { 1500 } else { mtu };
    HtbParams {
        rate: rate as u32,
        ceil: ceil as u32,
        prio: req.prio,
        quantum: cfg.device_quantum.get_or(dev, 2 * mtu),
        rbuffer: cfg.htb_rbuffer.get_or(dev, 10 * mtu),
        cbuffer: cfg.htb_cbuffer.get_or(dev, 10 * mtu),
        mtu,
    }
}

fn write_ratespec(buf: &mut Vec<u8>, rate: u32, mtu: u32) {
    let _ = mtu;
    buf.write_u8(0).unwrap(); // cell_log, kernel recomputes
    buf.write_u8(TC_LINKLAYER_ETHERNET).unwrap();
    buf.write_u16::<NativeEndian>(0).unwrap(); // overhead
    buf.write_i16::<NativeEndian>(0).unwrap(); // cell_align
    buf.write_u16::<NativeEndian>(0).unwrap(); // mpu
    buf.write_u32::<NativeEndian>(rate).unwrap();
}

/// `TCA_OPTIONS` of the root HTB qdisc (`tc_htb_glob`).
pub fn htb_qdisc_options(default_class: u16) -> Vec<TcAttribute> {
    let mut glob = Vec::with_capacity(20);
    glob.write_u32::<NativeEndian>(TC_HTB_PROTOVER).unwrap();
    glob.write_u32::<NativeEndian>(HTB_RATE2QUANTUM).unwrap();
    glob.write_u32::<NativeEndian>(default_class as u32).unwrap();
    glob.write_u32::<NativeEndian>(0).unwrap(); // debug
    glob.write_u32::<NativeEndian>(0).unwrap(); // direct_pkts
    vec![TcAttribute::Options(vec![TcOption::Other(DefaultNla::new(
        TCA_HTB_INIT,
        glob,
    ))])]
}

/// `TCA_OPTIONS` payload of an HTB class (`tc_htb_opt`).
pub fn htb_class_options(psched: &Psched, p: &HtbParams) -> Vec<TcOption> {
    let mut opt = Vec::with_capacity(44);
    write_ratespec(&mut opt, p.rate, p.mtu);
    write_ratespec(&mut opt, p.ceil, p.mtu);
    opt.write_u32::<NativeEndian>(psched.xmittime(p.rate as u64, p.rbuffer))
        .unwrap();
    opt.write_u32::<NativeEndian>(psched.xmittime(p.ceil as u64, p.cbuffer))
        .unwrap();
    opt.write_u32::<NativeEndian>(p.quantum).unwrap();
    opt.write_u32::<NativeEndian>(0).unwrap(); // level
    opt.write_u32::<NativeEndian>(p.prio).unwrap();
    vec![TcOption::Other(DefaultNla::new(TCA_HTB_PARMS, opt))]
}

/// Counter kinds readable from a class or qdisc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassStat {
    Bytes,
    Packets,
    Drops,
    Overlimits,
}

/// Leaf-first deletion order for `target` and its descendants, derived
/// from a `(handle, parent)` class dump. The reversed discovery order of a
/// breadth-first walk is a valid leaf-first topological order.
pub fn recursive_delete_order(classes: &[(u32, u32)], target: u32) -> Vec<u32> {
    let mut discovered = vec![target];
    let mut cursor = 0;
    while cursor < discovered.len() {
        let parent = discovered[cursor];
        cursor += 1;
        for (handle, par) in classes {
            if *par == parent && !discovered.contains(handle) {
                discovered.push(*handle);
            }
        }
    }
    discovered.reverse();
    discovered
}

/// Installs and mutates the per-device HTB hierarchy.
pub struct TrafficTree<'a> {
    client: &'a NetlinkClient,
    cfg: &'a NetworkConfig,
    /// Host namespace devices get the leaf qdisc under the default class.
    host: bool,
    psched: Psched,
}

impl<'a> TrafficTree<'a> {
    pub fn new(client: &'a NetlinkClient, cfg: &'a NetworkConfig, host: bool) -> Self {
        TrafficTree {
            client,
            cfg,
            host,
            psched: Psched::read(),
        }
    }

    /// Bring a device to the well-known skeleton. Idempotent against
    /// kernel state: a root qdisc that already matches is kept.
    pub async fn setup_queue(&self, dev: &mut NetworkDevice) -> Result<()> {
        info!(dev = %dev.name, index = dev.index, "setting up HTB tree");
        let ifindex = dev.index as i32;

        let current = self.client.root_qdisc(ifindex).await?;
        let keep = matches!(&current, Some((kind, handle)) if kind == "htb" && *handle == ROOT_QDISC);
        if !keep {
            if current.is_some() {
                self.client
                    .qdisc_del(ifindex, TcHandle { major: 0, minor: 0 }, TcHandle::ROOT)
                    .await?;
            }
            self.client
                .qdisc_add(
                    ifindex,
                    ROOT_QDISC,
                    TcHandle::ROOT,
                    "htb",
                    htb_qdisc_options(DEFAULT_CLASS.minor),
                    true,
                )
                .await?;
        } else {
            debug!(dev = %dev.name, "root htb qdisc already in place");
        }

        self.client.cgroup_filter_add(ifindex, ROOT_QDISC).await?;

        let device_rate = self.cfg.device_rate(&dev.name);
        let root = derive_class(
            self.cfg,
            &dev.name,
            dev.mtu,
            ClassRequest {
                rate: device_rate,
                ceil: device_rate,
                prio: DEFAULT_PRIO,
            },
        );
        self.client
            .class_add(
                ifindex,
                ROOT_CLASS,
                ROOT_QDISC,
                "htb",
                htb_class_options(&self.psched, &root),
            )
            .await?;

        let default = derive_class(
            self.cfg,
            &dev.name,
            dev.mtu,
            ClassRequest {
                rate: self.cfg.default_rate(&dev.name),
                ceil: device_rate,
                prio: DEFAULT_PRIO,
            },
        );
        self.client
            .class_add(
                ifindex,
                DEFAULT_CLASS,
                ROOT_CLASS,
                "htb",
                htb_class_options(&self.psched, &default),
            )
            .await?;

        if self.host {
            let kind = self.cfg.default_qdisc(&dev.name);
            self.client
                .qdisc_add(
                    ifindex,
                    DEFAULT_LEAF_QDISC,
                    DEFAULT_CLASS,
                    &kind,
                    self.leaf_qdisc_attrs(&kind, &dev.name, dev.mtu),
                    true,
                )
                .await?;
        }

        let porto = derive_class(
            self.cfg,
            &dev.name,
            dev.mtu,
            ClassRequest {
                rate: self.cfg.porto_rate(&dev.name),
                ceil: device_rate,
                prio: DEFAULT_PRIO,
            },
        );
        self.client
            .class_add(
                ifindex,
                PORTO_ROOT_CLASS,
                ROOT_CLASS,
                "htb",
                htb_class_options(&self.psched, &porto),
            )
            .await?;

        dev.prepared = true;
        Ok(())
    }

    /// Attributes of the leaf qdisc below the default class. fq_codel
    /// takes nested limit/quantum options, the fifo family a packed
    /// `tc_fifo_qopt`; anything else runs on kernel defaults.
    fn leaf_qdisc_attrs(&self, kind: &str, dev: &str, mtu: u32) -> Vec<TcAttribute> {
        let mtu = if mtu == 0 { 1500 } else { mtu };
        let limit = self.cfg.default_qdisc_limit.get(dev).copied();
        let quantum = self.cfg.default_qdisc_quantum.get_or(dev, 2 * mtu);
        match kind {
            "fq_codel" => {
                let mut opts = Vec::new();
                if let Some(limit) = limit {
                    let mut buf = Vec::with_capacity(4);
                    buf.write_u32::<NativeEndian>(limit).unwrap();
                    opts.push(TcOption::Other(DefaultNla::new(TCA_FQ_CODEL_LIMIT, buf)));
                }
                let mut buf = Vec::with_capacity(4);
                buf.write_u32::<NativeEndian>(quantum).unwrap();
                opts.push(TcOption::Other(DefaultNla::new(TCA_FQ_CODEL_QUANTUM, buf)));
                vec![TcAttribute::Options(opts)]
            }
            "pfifo" | "bfifo" => match limit {
                Some(limit) => {
                    let mut buf = Vec::with_capacity(4);
                    buf.write_u32::<NativeEndian>(limit).unwrap();
                    vec![TcAttribute::Other(DefaultNla::new(TCA_OPTIONS, buf))]
                }
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Create the class for container `id` on one device.
    pub async fn add_container_class(
        &self,
        dev: &NetworkDevice,
        id: u16,
        req: ClassRequest,
    ) -> Result<()> {
        if id < FIRST_CONTAINER_CLASS {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("container class id {} is reserved", id),
            ));
        }
        let params = derive_class(self.cfg, &dev.name, dev.mtu, req);
        self.client
            .class_add(
                dev.index as i32,
                container_class(id),
                PORTO_ROOT_CLASS,
                "htb",
                htb_class_options(&self.psched, &params),
            )
            .await
    }

    /// Delete `handle`, recursing through its descendants leaf-first when
    /// the kernel answers `EBUSY`. `ENOENT` anywhere is ignored.
    pub async fn del_class(&self, ifindex: i32, handle: TcHandle) -> Result<()> {
        match self.client.class_del(ifindex, handle).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_busy() => {
                debug!(ifindex, handle = ?handle, "class busy, deleting subtree");
            }
            Err(e) => return Err(e),
        }

        let dump = self.client.class_dump(ifindex).await?;
        let classes: Vec<(u32, u32)> = dump
            .iter()
            .map(|tc: &TcMessage| (u32::from(tc.header.handle), u32::from(tc.header.parent)))
            .collect();
        for h in recursive_delete_order(&classes, u32::from(handle)) {
            self.client.class_del(ifindex, TcHandle::from(h)).await?;
        }
        Ok(())
    }

    /// Read one counter of a class.
    pub async fn class_stat(
        &self,
        ifindex: i32,
        handle: TcHandle,
        kind: ClassStat,
    ) -> Result<u64> {
        let dump = self.client.class_dump(ifindex).await?;
        for tc in dump {
            if tc.header.handle != handle {
                continue;
            }
            return Ok(extract_class_stat(&tc, kind));
        }
        Err(Error::with_errno(
            ErrorKind::Unknown,
            libc::ENOENT,
            format!("class {:?} not found on ifindex {}", handle, ifindex),
        ))
    }
}

fn extract_class_stat(tc: &TcMessage, kind: ClassStat) -> u64 {
    for attr in &tc.attributes {
        match attr {
            TcAttribute::Stats2(stats) => {
                for s in stats {
                    match (s, kind) {
                        (TcStats2::Basic(b), ClassStat::Bytes) => return b.bytes,
                        (TcStats2::Basic(b), ClassStat::Packets) => return b.packets as u64,
                        (TcStats2::Queue(q), ClassStat::Drops) => return q.drops as u64,
                        (TcStats2::Queue(q), ClassStat::Overlimits) => {
                            return q.overlimits as u64
                        }
                        _ => {}
                    }
                }
            }
            TcAttribute::Stats(s) => {
                return match kind {
                    ClassStat::Bytes => s.bytes,
                    ClassStat::Packets => s.packets as u64,
                    ClassStat::Drops => s.drops as u64,
                    ClassStat::Overlimits => s.overlimits as u64,
                };
            }
            _ => {}
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternMap;
    use netlink_packet_core::Nla;

    fn cfg_with_device_rate(rate: u64) -> NetworkConfig {
        NetworkConfig {
            device_rate: PatternMap::new(vec![("default".to_string(), rate)]),
            ..Default::default()
        }
    }

    #[test]
    fn rate_clamping() {
        let cfg = cfg_with_device_rate(2_000_000_000);

        // Request above the device rate is capped; zero ceil borrows up to
        // the cap.
        let p = derive_class(
            &cfg,
            "eth0",
            1500,
            ClassRequest {
                rate: 5_000_000_000,
                ceil: 0,
                prio: 4,
            },
        );
        assert_eq!(p.rate, 2_000_000_000);
        assert_eq!(p.ceil, p.rate);

        // Zero rate stays "no guarantee" but the kernel needs >= 1.
        let p = derive_class(&cfg, "eth0", 1500, ClassRequest::default());
        assert_eq!(p.rate, 1);

        // Rates never exceed i32::MAX even with a huge device rate.
        let cfg = cfg_with_device_rate(u64::MAX);
        let p = derive_class(
            &cfg,
            "eth0",
            1500,
            ClassRequest {
                rate: u64::MAX,
                ceil: u64::MAX,
                prio: 0,
            },
        );
        assert_eq!(p.rate, i32::MAX as u32);
        assert_eq!(p.ceil, i32::MAX as u32);
    }

    #[test]
    fn buffer_defaults_follow_mtu() {
        let cfg = cfg_with_device_rate(1_000_000);
        let p = derive_class(
            &cfg,
            "eth0",
            9000,
            ClassRequest {
                rate: 1000,
                ceil: 0,
                prio: 0,
            },
        );
        assert_eq!(p.quantum, 18_000);
        assert_eq!(p.rbuffer, 90_000);
        assert_eq!(p.cbuffer, 90_000);
    }

    #[test]
    fn ceil_never_below_rate() {
        let cfg = cfg_with_device_rate(1_000_000);
        let p = derive_class(
            &cfg,
            "eth0",
            1500,
            ClassRequest {
                rate: 500_000,
                ceil: 100,
                prio: 0,
            },
        );
        assert_eq!(p.ceil, 500_000);
    }

    #[test]
    fn htb_struct_sizes() {
        let attrs = htb_qdisc_options(DEFAULT_CLASS.minor);
        match &attrs[0] {
            TcAttribute::Options(opts) => match &opts[0] {
                TcOption::Other(nla) => {
                    assert_eq!(nla.kind(), TCA_HTB_INIT);
                    assert_eq!(nla.value_len(), 20);
                }
                other => panic!("unexpected option {:?}", other),
            },
            other => panic!("unexpected attribute {:?}", other),
        }

        let psched = Psched { tick_in_usec: 15.625 };
        let params = HtbParams {
            rate: 1_000_000,
            ceil: 2_000_000,
            prio: 4,
            quantum: 3000,
            rbuffer: 15_000,
            cbuffer: 15_000,
            mtu: 1500,
        };
        let opts = htb_class_options(&psched, &params);
        match &opts[0] {
            TcOption::Other(nla) => {
                assert_eq!(nla.kind(), TCA_HTB_PARMS);
                assert_eq!(nla.value_len(), 44);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }

    #[test]
    fn psched_parsing_and_xmittime() {
        let p = Psched::parse("000003e8 00000040 000f4240 3b9aca00").unwrap();
        assert!((p.tick_in_usec - 15.625).abs() < 1e-9);

        // 1500 bytes at 1 MB/s is 1500 usec on the wire.
        let ticks = p.xmittime(1_000_000, 1500);
        assert_eq!(ticks, (1500.0 * 15.625) as u32);

        // Rate 0 must not divide by zero.
        assert_eq!(p.xmittime(0, 1500), u32::MAX);

        assert!(Psched::parse("garbage").is_none());
    }

    #[test]
    fn recursive_delete_is_leaf_first() {
        // 1:3 with children 1:4 and 1:5 (dump order), per the teardown
        // contract: delete 1:5, then 1:4, then 1:3.
        let h = |minor: u16| u32::from(TcHandle { major: 1, minor });
        let classes = vec![(h(3), h(1)), (h(4), h(3)), (h(5), h(3))];
        let order = recursive_delete_order(&classes, h(3));
        assert_eq!(order, vec![h(5), h(4), h(3)]);
    }

    #[test]
    fn recursive_delete_handles_grandchildren() {
        let h = |minor: u16| u32::from(TcHandle { major: 1, minor });
        // 3 -> {4, 5}, 4 -> {6}
        let classes = vec![(h(4), h(3)), (h(5), h(3)), (h(6), h(4))];
        let order = recursive_delete_order(&classes, h(3));
        // Every class must come before its parent.
        let pos = |x: u32| order.iter().position(|v| *v == x).unwrap();
        assert!(pos(h(6)) < pos(h(4)));
        assert!(pos(h(4)) < pos(h(3)));
        assert!(pos(h(5)) < pos(h(3)));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn container_class_handles() {
        assert_eq!(container_class(4), TcHandle { major: 1, minor: 4 });
        assert!(u32::from(container_class(4)) > u32::from(PORTO_ROOT_CLASS));
    }
}
