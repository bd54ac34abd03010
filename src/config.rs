//! Network engine configuration.
//!
//! All per-device knobs are pattern maps: an ordered list of `glob → value`
//! entries where an exact name match wins, then the first matching glob,
//! then the reserved `"default"` key, then a compile-time default. The
//! daemon's config loader (out of scope here) deserializes this from its
//! config file; tests build it by hand.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Ordered `glob → value` map with `"default"` fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternMap<T>(pub Vec<(String, T)>);

impl<T> Default for PatternMap<T> {
    fn default() -> Self {
        PatternMap(Vec::new())
    }
}

impl<T> PatternMap<T> {
    pub fn new(entries: Vec<(String, T)>) -> Self {
        PatternMap(entries)
    }

    /// Resolve `name`: exact match first, then glob, then `"default"`.
    pub fn get(&self, name: &str) -> Option<&T> {
        if let Some((_, v)) = self.0.iter().find(|(k, _)| k == name) {
            return Some(v);
        }
        for (k, v) in &self.0 {
            if k == "default" {
                continue;
            }
            if Pattern::new(k).map(|p| p.matches(name)).unwrap_or(false) {
                return Some(v);
            }
        }
        self.0.iter().find(|(k, _)| k == "default").map(|(_, v)| v)
    }
}

impl<T: Copy> PatternMap<T> {
    pub fn get_or(&self, name: &str, fallback: T) -> T {
        self.get(name).copied().unwrap_or(fallback)
    }
}

/// Uncapped device rate stand-in: effectively "no limit" in bytes/s while
/// still fitting the kernel's u32 rate field after clamping.
pub const DEFAULT_DEVICE_RATE: u64 = i32::MAX as u64;
pub const DEFAULT_PORTO_RATE: u64 = i32::MAX as u64;
pub const DEFAULT_QDISC: &str = "pfifo_fast";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    /// Root qdisc kind per device; only `htb` is managed.
    pub device_qdisc: PatternMap<String>,
    /// Total device rate (bytes/s).
    pub device_rate: PatternMap<u64>,
    /// Rate of the unclassified-traffic class (bytes/s).
    pub default_rate: PatternMap<u64>,
    /// Rate of the parent class of all containers (bytes/s).
    pub porto_rate: PatternMap<u64>,
    /// Default per-container class rate (bytes/s).
    pub container_rate: PatternMap<u64>,
    pub device_quantum: PatternMap<u32>,
    pub htb_rbuffer: PatternMap<u32>,
    pub htb_cbuffer: PatternMap<u32>,
    /// Leaf qdisc under the default class (host namespace only).
    pub default_qdisc: PatternMap<String>,
    pub default_qdisc_limit: PatternMap<u32>,
    pub default_qdisc_quantum: PatternMap<u32>,

    /// Host devices matching any of these globs are left untouched.
    pub unmanaged_devices: Vec<String>,
    /// Host devices whose `/etc/iproute2/group` group is listed here are
    /// left untouched (by group name).
    pub unmanaged_groups: Vec<String>,

    /// First address of the NAT pool; `None` disables that family.
    pub nat_first_ipv4: Option<String>,
    pub nat_first_ipv6: Option<String>,
    pub nat_count: u32,

    pub autoconf_timeout_s: u64,
    pub start_timeout_ms: u64,

    /// `sysctl = value` pairs applied inside a fresh IPC namespace.
    pub ipc_sysctl: Vec<(String, String)>,
}

impl NetworkConfig {
    pub fn device_rate(&self, dev: &str) -> u64 {
        self.device_rate.get_or(dev, DEFAULT_DEVICE_RATE)
    }

    pub fn default_rate(&self, dev: &str) -> u64 {
        self.default_rate.get_or(dev, self.device_rate(dev))
    }

    pub fn porto_rate(&self, dev: &str) -> u64 {
        self.porto_rate.get_or(dev, DEFAULT_PORTO_RATE)
    }

    pub fn container_rate(&self, dev: &str) -> u64 {
        self.container_rate.get_or(dev, 0)
    }

    pub fn device_qdisc(&self, dev: &str) -> String {
        self.device_qdisc
            .get(dev)
            .cloned()
            .unwrap_or_else(|| "htb".to_string())
    }

    pub fn default_qdisc(&self, dev: &str) -> String {
        self.default_qdisc
            .get(dev)
            .cloned()
            .unwrap_or_else(|| DEFAULT_QDISC.to_string())
    }

    pub fn start_timeout_ms(&self) -> u64 {
        if self.start_timeout_ms == 0 {
            300_000
        } else {
            self.start_timeout_ms
        }
    }

    pub fn autoconf_timeout_s(&self) -> u64 {
        if self.autoconf_timeout_s == 0 {
            120
        } else {
            self.autoconf_timeout_s
        }
    }

    /// True when `name`/`group` mark a host device as unmanaged.
    pub fn device_unmanaged(&self, name: &str, group: u32, groups: &DeviceGroups) -> bool {
        for pat in &self.unmanaged_devices {
            if pat == name || Pattern::new(pat).map(|p| p.matches(name)).unwrap_or(false) {
                return true;
            }
        }
        self.unmanaged_groups
            .iter()
            .any(|g| groups.id_of(g) == Some(group))
    }
}

/// Parsed `/etc/iproute2/group`: `<id> <name>` lines, `#` comments.
#[derive(Debug, Clone, Default)]
pub struct DeviceGroups {
    by_name: HashMap<String, u32>,
}

impl DeviceGroups {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| {
            Error::with_errno(
                ErrorKind::Unknown,
                e.raw_os_error().unwrap_or(0),
                format!("cannot read {}: {}", path.as_ref().display(), e),
            )
        })?;
        Self::parse(std::io::BufReader::new(file))
    }

    pub fn parse(reader: impl BufRead) -> Result<Self> {
        let mut by_name = HashMap::new();
        for line in reader.lines() {
            let line = line.map_err(Error::from)?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut it = line.split_whitespace();
            let (id, name) = match (it.next(), it.next()) {
                (Some(id), Some(name)) => (id, name),
                _ => continue,
            };
            let id: u32 = id.parse().map_err(|_| {
                Error::new(
                    ErrorKind::InvalidData,
                    format!("bad group id in iproute2 group file: {}", line),
                )
            })?;
            by_name.insert(name.to_string(), id);
        }
        Ok(DeviceGroups { by_name })
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }
}
