use std::collections::HashMap;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::addr::MacAddr;
use crate::config::ConfigError;

/// A static MAC-to-address binding preferred over dynamic allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Host {
    pub mac: MacAddr,
    pub reserved_addr: Ipv4Addr,
}

impl Host {
    pub fn parse(hw_address: &str, ip_address: &str) -> Result<Self, ConfigError> {
        let mac = hw_address.parse::<MacAddr>()?;
        let reserved_addr = ip_address
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidIp(ip_address.trim().into()))?;
        Ok(Self { mac, reserved_addr })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host with mac {0} already exists")]
    AlreadyExists(MacAddr),
    #[error("host with mac {0} doesn't exist")]
    NotFound(MacAddr),
    #[error("ip {given} doesn't match host ip {stored} for mac {mac}")]
    AddrMismatch {
        mac: MacAddr,
        given: Ipv4Addr,
        stored: Ipv4Addr,
    },
}

/// The reservations of one subnet, keyed by MAC. Lookup by address is a scan;
/// reservations per subnet stay small.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: HashMap<MacAddr, Host>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_mac(&self, mac: MacAddr) -> Option<&Host> {
        self.hosts.get(&mac)
    }

    pub fn get_by_ip(&self, addr: Ipv4Addr) -> Option<&Host> {
        self.hosts.values().find(|host| host.reserved_addr == addr)
    }

    pub fn add(&mut self, host: Host) -> Result<(), HostError> {
        if self.hosts.contains_key(&host.mac) {
            return Err(HostError::AlreadyExists(host.mac));
        }
        self.hosts.insert(host.mac, host);
        Ok(())
    }

    /// Removal requires the caller to name the reservation exactly.
    pub fn remove(&mut self, host: &Host) -> Result<(), HostError> {
        match self.hosts.get(&host.mac) {
            None => Err(HostError::NotFound(host.mac)),
            Some(stored) if stored.reserved_addr != host.reserved_addr => {
                Err(HostError::AddrMismatch {
                    mac: host.mac,
                    given: host.reserved_addr,
                    stored: stored.reserved_addr,
                })
            }
            Some(_) => {
                self.hosts.remove(&host.mac);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_lookup_remove() {
        let mut registry = HostRegistry::new();
        let host = Host::parse("aa:bb:cc:dd:ee:01", "10.0.0.5").unwrap();
        registry.add(host).unwrap();

        assert_eq!(registry.get_by_mac(host.mac), Some(&host));
        assert_eq!(registry.get_by_ip(Ipv4Addr::new(10, 0, 0, 5)), Some(&host));
        assert_eq!(registry.get_by_ip(Ipv4Addr::new(10, 0, 0, 6)), None);

        assert_eq!(registry.add(host), Err(HostError::AlreadyExists(host.mac)));

        let wrong_ip = Host {
            reserved_addr: Ipv4Addr::new(10, 0, 0, 6),
            ..host
        };
        assert!(matches!(
            registry.remove(&wrong_ip),
            Err(HostError::AddrMismatch { .. })
        ));
        registry.remove(&host).unwrap();
        assert_eq!(registry.get_by_mac(host.mac), None);
    }
}
