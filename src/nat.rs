//! NAT address pool.
//!
//! A namespace hands every NAT container one slot out of
//! `[base, base + nat_count)`; depending on configuration a slot carries an
//! IPv4 address, an IPv6 address, or both at the same offset. Slots are
//! recovered at container teardown by computing the offset back from the
//! address.

use tracing::debug;

use crate::addr::NetAddr;
use crate::bitmap::BitmapAllocator;
use crate::config::NetworkConfig;
use crate::error::{Error, ErrorKind, Result};

#[derive(Debug)]
pub struct NatPool {
    base_v4: Option<NetAddr>,
    base_v6: Option<NetAddr>,
    bitmap: BitmapAllocator,
}

impl NatPool {
    pub fn from_config(cfg: &NetworkConfig) -> Result<Self> {
        let base_v4 = cfg
            .nat_first_ipv4
            .as_deref()
            .map(NetAddr::parse)
            .transpose()?;
        let base_v6 = cfg
            .nat_first_ipv6
            .as_deref()
            .map(NetAddr::parse)
            .transpose()?;
        Ok(NatPool {
            base_v4,
            base_v6,
            bitmap: BitmapAllocator::new(cfg.nat_count),
        })
    }

    pub fn enabled(&self) -> bool {
        self.base_v4.is_some() || self.base_v6.is_some()
    }

    /// Claim the lowest free slot and return its addresses.
    pub fn get_nat_address(&mut self) -> Result<Vec<NetAddr>> {
        if !self.enabled() {
            return Err(Error::new(
                ErrorKind::ResourceNotAvailable,
                "NAT pool is not configured",
            ));
        }
        let slot = self.bitmap.get()?;
        let mut addrs = Vec::with_capacity(2);
        for base in [self.base_v4.as_ref(), self.base_v6.as_ref()].into_iter().flatten() {
            match base.offset(slot as u128) {
                Ok(a) => addrs.push(a),
                Err(e) => {
                    self.bitmap.put(slot).ok();
                    return Err(e);
                }
            }
        }
        debug!(slot, "allocated NAT slot");
        Ok(addrs)
    }

    /// Release the slot owning `addrs`. Addresses of an unconfigured family
    /// are rejected; releasing the same slot twice is an error.
    pub fn put_nat_address(&mut self, addrs: &[NetAddr]) -> Result<()> {
        let mut released: Option<u32> = None;
        for addr in addrs {
            let base = if addr.is_v4() {
                self.base_v4.as_ref()
            } else {
                self.base_v6.as_ref()
            };
            let base = base.ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("{} does not belong to the NAT pool", addr),
                )
            })?;
            let offset = addr.offset_from(base).ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("{} precedes the NAT base {}", addr, base),
                )
            })?;
            if offset >= self.bitmap.capacity() as u128 {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("{} is outside the NAT pool", addr),
                ));
            }
            let slot = offset as u32;
            match released {
                Some(prev) if prev != slot => {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        "NAT addresses map to different slots",
                    ));
                }
                Some(_) => {}
                None => {
                    self.bitmap.put(slot)?;
                    released = Some(slot);
                }
            }
        }
        if let Some(slot) = released {
            debug!(slot, "released NAT slot");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(v4: Option<&str>, v6: Option<&str>, count: u32) -> NatPool {
        let cfg = NetworkConfig {
            nat_first_ipv4: v4.map(String::from),
            nat_first_ipv6: v6.map(String::from),
            nat_count: count,
            ..Default::default()
        };
        NatPool::from_config(&cfg).unwrap()
    }

    #[test]
    fn sequential_allocation_and_reuse() {
        let mut p = pool(Some("10.0.0.1"), None, 3);
        assert_eq!(p.get_nat_address().unwrap()[0].to_string(), "10.0.0.1");
        let second = p.get_nat_address().unwrap();
        assert_eq!(second[0].to_string(), "10.0.0.2");
        assert_eq!(p.get_nat_address().unwrap()[0].to_string(), "10.0.0.3");
        assert_eq!(
            p.get_nat_address().unwrap_err().kind,
            ErrorKind::ResourceNotAvailable
        );

        p.put_nat_address(&second).unwrap();
        assert_eq!(p.get_nat_address().unwrap()[0].to_string(), "10.0.0.2");
    }

    #[test]
    fn dual_family_slots() {
        let mut p = pool(Some("192.168.100.1"), Some("fd00::100"), 4);
        let a = p.get_nat_address().unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].to_string(), "192.168.100.1");
        assert_eq!(a[1].to_string(), "fd00::100");

        let b = p.get_nat_address().unwrap();
        assert_eq!(b[0].to_string(), "192.168.100.2");
        assert_eq!(b[1].to_string(), "fd00::101");

        p.put_nat_address(&a).unwrap();
        assert_eq!(p.get_nat_address().unwrap()[0].to_string(), "192.168.100.1");
    }

    #[test]
    fn put_rejects_foreign_addresses() {
        let mut p = pool(Some("10.0.0.1"), None, 2);
        let got = p.get_nat_address().unwrap();
        // Not from the pool at all.
        let foreign = [NetAddr::parse("172.16.0.1").unwrap()];
        assert!(p.put_nat_address(&foreign).is_err());
        // Wrong family.
        let v6 = [NetAddr::parse("fd00::1").unwrap()];
        assert!(p.put_nat_address(&v6).is_err());
        // Correct one still releases.
        p.put_nat_address(&got).unwrap();
        // Double free is flagged.
        assert!(p.put_nat_address(&got).is_err());
    }

    #[test]
    fn unconfigured_pool() {
        let mut p = pool(None, None, 10);
        assert!(!p.enabled());
        assert_eq!(
            p.get_nat_address().unwrap_err().kind,
            ErrorKind::ResourceNotAvailable
        );
    }
}
