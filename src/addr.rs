//! IP address handling for the network engine.
//!
//! [`NetAddr`] couples an address with a prefix length and supports the
//! arithmetic the NAT pool needs: adding a slot offset to a base address
//! and recovering the offset back from a handed-out address.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddr {
    addr: IpAddr,
    prefix: u8,
}

impl NetAddr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let width = family_width(&addr);
        if prefix > width {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("prefix /{} too long for {}", prefix, addr),
            ));
        }
        Ok(NetAddr { addr, prefix })
    }

    /// Parse `"addr"` or `"addr/prefix"`; a bare address gets the full
    /// family width (a host address).
    pub fn parse(s: &str) -> Result<Self> {
        let net = IpNetwork::from_str(s).map_err(|e| {
            Error::new(ErrorKind::InvalidValue, format!("bad address '{}': {}", s, e))
        })?;
        Ok(NetAddr {
            addr: net.ip(),
            prefix: net.prefix(),
        })
    }

    pub fn ip(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_v6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn family_width(&self) -> u8 {
        family_width(&self.addr)
    }

    /// An address with a full-width prefix names a single host.
    pub fn is_host(&self) -> bool {
        self.prefix == self.family_width()
    }

    pub fn is_empty(&self) -> bool {
        match self.addr {
            IpAddr::V4(a) => a.is_unspecified(),
            IpAddr::V6(a) => a.is_unspecified(),
        }
    }

    /// Force a host prefix (`/32` or `/128`), keeping the address.
    pub fn as_host(&self) -> NetAddr {
        NetAddr {
            addr: self.addr,
            prefix: self.family_width(),
        }
    }

    /// True when `other` falls inside this prefix.
    pub fn contains(&self, other: &NetAddr) -> bool {
        if self.is_v4() != other.is_v4() {
            return false;
        }
        cmp_prefix(&self.addr, &other.addr, self.prefix)
    }

    /// Big-endian add of `offset` to the address bytes. Fails when the
    /// result would wrap past the family range.
    pub fn offset(&self, offset: u128) -> Result<NetAddr> {
        let addr = match self.addr {
            IpAddr::V4(a) => {
                let base = u32::from(a) as u128;
                let sum = base.checked_add(offset).filter(|s| *s <= u32::MAX as u128);
                match sum {
                    Some(s) => IpAddr::V4(Ipv4Addr::from(s as u32)),
                    None => {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("address {} + {} overflows", self, offset),
                        ))
                    }
                }
            }
            IpAddr::V6(a) => {
                let base = u128::from(a);
                match base.checked_add(offset) {
                    Some(s) => IpAddr::V6(Ipv6Addr::from(s)),
                    None => {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("address {} + {} overflows", self, offset),
                        ))
                    }
                }
            }
        };
        Ok(NetAddr {
            addr,
            prefix: self.prefix,
        })
    }

    /// Inverse of [`offset`](Self::offset): `None` when the families differ
    /// or `self` precedes `base`.
    pub fn offset_from(&self, base: &NetAddr) -> Option<u128> {
        match (self.addr, base.addr) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                (u32::from(a) as u128).checked_sub(u32::from(b) as u128)
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => u128::from(a).checked_sub(u128::from(b)),
            _ => None,
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.prefix)
        }
    }
}

fn family_width(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Compare the first `len` bits of two addresses of the same family.
pub fn cmp_prefix(a: &IpAddr, b: &IpAddr, len: u8) -> bool {
    let (a, b) = match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => (a.octets().to_vec(), b.octets().to_vec()),
        (IpAddr::V6(a), IpAddr::V6(b)) => (a.octets().to_vec(), b.octets().to_vec()),
        _ => return false,
    };
    let full = (len / 8) as usize;
    if a[..full] != b[..full] {
        return false;
    }
    let rem = len % 8;
    if rem == 0 {
        return true;
    }
    let mask = !0u8 << (8 - rem);
    (a[full] ^ b[full]) & mask == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let a = NetAddr::parse("10.1.2.3/24").unwrap();
        assert_eq!(a.prefix(), 24);
        assert!(!a.is_host());
        assert_eq!(a.to_string(), "10.1.2.3/24");

        let h = NetAddr::parse("192.168.0.1").unwrap();
        assert!(h.is_host());
        assert_eq!(h.to_string(), "192.168.0.1");

        let v6 = NetAddr::parse("fd00::1/64").unwrap();
        assert!(v6.is_v6());
        assert_eq!(v6.family_width(), 128);

        assert!(NetAddr::parse("not-an-addr").is_err());
    }

    #[test]
    fn offset_round_trips() {
        let base = NetAddr::parse("10.0.0.1").unwrap();
        for n in [0u128, 1, 7, 254, 65_000] {
            let shifted = base.offset(n).unwrap();
            assert_eq!(shifted.offset_from(&base), Some(n));
        }

        let base6 = NetAddr::parse("fd00::1").unwrap();
        for n in [0u128, 1, 1 << 40, 1 << 90] {
            let shifted = base6.offset(n).unwrap();
            assert_eq!(shifted.offset_from(&base6), Some(n));
        }
    }

    #[test]
    fn offset_overflow_detected() {
        let base = NetAddr::parse("255.255.255.250").unwrap();
        assert!(base.offset(10).is_err());
    }

    #[test]
    fn offset_from_mismatched_family() {
        let v4 = NetAddr::parse("10.0.0.5").unwrap();
        let v6 = NetAddr::parse("fd00::5").unwrap();
        assert_eq!(v4.offset_from(&v6), None);
    }

    #[test]
    fn prefix_containment() {
        let net = NetAddr::parse("10.1.0.0/16").unwrap();
        assert!(net.contains(&NetAddr::parse("10.1.200.3").unwrap()));
        assert!(!net.contains(&NetAddr::parse("10.2.0.1").unwrap()));
        assert!(!net.contains(&NetAddr::parse("fd00::1").unwrap()));

        let odd = NetAddr::parse("10.1.2.128/25").unwrap();
        assert!(odd.contains(&NetAddr::parse("10.1.2.200").unwrap()));
        assert!(!odd.contains(&NetAddr::parse("10.1.2.100").unwrap()));
    }

    #[test]
    fn host_forcing() {
        let g = NetAddr::parse("10.0.0.1/8").unwrap();
        assert_eq!(g.as_host().prefix(), 32);
        let g6 = NetAddr::parse("fe80::1/64").unwrap();
        assert_eq!(g6.as_host().prefix(), 128);
    }
}
