use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::settings::{Dhcp4Settings, SubnetSettings};
use crate::config::ConfigError;
use crate::host::{Host, HostRegistry};

pub type SubnetId = u32;

pub const DEFAULT_VALID_LIFE_TIME: Duration = Duration::from_secs(4800);
pub const DEFAULT_RENEW_TIME: Duration = Duration::from_secs(4000);
pub const DEFAULT_REBIND_TIME: Duration = Duration::from_secs(4000);

/// A closed range of allocatable addresses, kept as host-order integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    pub start: u32,
    pub end: u32,
}

impl Pool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, ConfigError> {
        if u32::from(start) > u32::from(end) {
            return Err(ConfigError::InvalidRange { start, end });
        }
        Ok(Self {
            start: u32::from(start),
            end: u32::from(end),
        })
    }

    /// Parses the config file's `"start-end"` pool spelling.
    pub fn parse(range: &str) -> Result<Self, ConfigError> {
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| ConfigError::InvalidPoolRange(range.into()))?;
        Self::from_parts(start, end)
    }

    /// Builds a pool out of separate start/end strings, as the admin pool
    /// commands carry them.
    pub fn from_parts(start: &str, end: &str) -> Result<Self, ConfigError> {
        let start = start
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidIp(start.trim().into()))?;
        let end = end
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidIp(end.trim().into()))?;
        Self::new(start, end)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.contains_val(u32::from(addr))
    }

    pub fn contains_val(&self, val: u32) -> bool {
        val >= self.start && val <= self.end
    }

    pub fn capacity(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            Ipv4Addr::from(self.start),
            Ipv4Addr::from(self.end)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: SubnetId,
    pub renew_time: Duration,
    pub rebind_time: Duration,
    pub valid_life_time: Duration,
    pub pools: Vec<Pool>,
    pub reserved_pools: Vec<Pool>,
}

impl Subnet {
    /// A bare subnet as created by the dynamic add-subnet command.
    pub fn empty(id: SubnetId, valid_life_time: Duration) -> Self {
        Self {
            id,
            renew_time: DEFAULT_RENEW_TIME,
            rebind_time: DEFAULT_REBIND_TIME,
            valid_life_time,
            pools: Vec::new(),
            reserved_pools: Vec::new(),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.pools.iter().any(|pool| pool.contains(addr))
    }

    pub fn is_addr_reserved(&self, addr: Ipv4Addr) -> bool {
        self.reserved_pools.iter().any(|pool| pool.contains(addr))
    }

    pub fn capacity(&self) -> u32 {
        self.pools.iter().map(Pool::capacity).sum()
    }
}

fn subnet_from_settings(conf: &SubnetSettings) -> Result<(Subnet, Option<HostRegistry>), ConfigError> {
    let mut pools = Vec::new();
    let mut reserved_pools = Vec::new();
    for pool_conf in &conf.pools {
        let pool = Pool::parse(&pool_conf.pool)?;
        if pool_conf.reserved {
            reserved_pools.push(pool);
        } else {
            pools.push(pool);
        }
    }

    let valid_life_time = conf
        .valid_lifetime
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_VALID_LIFE_TIME);

    let hosts = if conf.reservations.is_empty() {
        None
    } else {
        let mut registry = HostRegistry::new();
        for host_conf in &conf.reservations {
            registry.add(Host::parse(&host_conf.hw_address, &host_conf.ip_address)?)?;
        }
        Some(registry)
    };

    Ok((
        Subnet {
            id: conf.id,
            renew_time: DEFAULT_RENEW_TIME,
            rebind_time: DEFAULT_REBIND_TIME,
            valid_life_time,
            pools,
            reserved_pools,
        },
        hosts,
    ))
}

/// Builds the full subnet set and its host registries out of a parsed config
/// file.
pub fn load_subnets(
    settings: &Dhcp4Settings,
) -> Result<(Vec<Subnet>, HashMap<SubnetId, HostRegistry>), ConfigError> {
    let mut subnets = Vec::with_capacity(settings.subnets.len());
    let mut registries = HashMap::new();
    for conf in &settings.subnets {
        let (subnet, hosts) = subnet_from_settings(conf)?;
        tracing::debug!(subnet = subnet.id, capacity = subnet.capacity(), "loaded subnet");
        if let Some(hosts) = hosts {
            registries.insert(subnet.id, hosts);
        }
        subnets.push(subnet);
    }
    Ok((subnets, registries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_parsing() {
        let pool = Pool::parse("10.0.0.1-10.0.0.10").unwrap();
        assert_eq!(pool.capacity(), 10);
        assert!(pool.contains(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(pool.contains(Ipv4Addr::new(10, 0, 0, 10)));
        assert!(!pool.contains(Ipv4Addr::new(10, 0, 0, 11)));

        // config files may put spaces around the dash
        let spaced = Pool::parse("192.0.0.1 - 192.0.0.5").unwrap();
        assert_eq!(spaced, Pool::parse("192.0.0.1-192.0.0.5").unwrap());

        assert!(Pool::parse("10.0.0.10-10.0.0.1").is_err());
        assert!(Pool::parse("10.0.0.1").is_err());
        assert!(Pool::parse("banana-10.0.0.1").is_err());
    }

    #[test]
    fn subnet_capacity_and_containment() {
        let subnet = Subnet {
            id: 1,
            renew_time: DEFAULT_RENEW_TIME,
            rebind_time: DEFAULT_REBIND_TIME,
            valid_life_time: DEFAULT_VALID_LIFE_TIME,
            pools: vec![
                Pool::parse("10.0.0.1-10.0.0.10").unwrap(),
                Pool::parse("10.0.1.1-10.0.1.5").unwrap(),
            ],
            reserved_pools: vec![Pool::parse("10.0.0.200-10.0.0.210").unwrap()],
        };
        assert_eq!(subnet.capacity(), 15);
        assert!(subnet.contains(Ipv4Addr::new(10, 0, 1, 3)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(subnet.is_addr_reserved(Ipv4Addr::new(10, 0, 0, 205)));
    }
}
