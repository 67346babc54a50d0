use std::collections::HashMap;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::addr::MacAddr;
use crate::lease::{ClientId, Lease};
use crate::subnet::{Pool, SubnetId};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("lease with ip {0} already exists")]
pub struct LeaseExists(pub Ipv4Addr);

/// The authoritative runtime lease table: primary index by address, secondary
/// indices by MAC and client id. The secondary maps hold the owning address,
/// so a stale entry can never shadow a newer lease at another address.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    by_ip: HashMap<Ipv4Addr, Lease>,
    by_mac: HashMap<MacAddr, Ipv4Addr>,
    by_client: HashMap<ClientId, Ipv4Addr>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_ip(&self, addr: Ipv4Addr) -> Option<&Lease> {
        self.by_ip.get(&addr)
    }

    pub fn get_by_mac(&self, mac: MacAddr) -> Option<&Lease> {
        self.by_mac.get(&mac).and_then(|addr| self.by_ip.get(addr))
    }

    pub fn get_by_client(&self, client_id: &[u8]) -> Option<&Lease> {
        self.by_client
            .get(client_id)
            .and_then(|addr| self.by_ip.get(addr))
    }

    pub fn get_by_client_and_mac(&self, client_id: &[u8], mac: MacAddr) -> Option<&Lease> {
        self.get_by_client(client_id)
            .filter(|lease| lease.mac == Some(mac))
    }

    pub fn add(&mut self, lease: Lease) -> Result<(), LeaseExists> {
        if self.by_ip.contains_key(&lease.addr) {
            return Err(LeaseExists(lease.addr));
        }
        if let Some(mac) = lease.mac {
            self.by_mac.insert(mac, lease.addr);
        }
        if !lease.client_id.is_empty() {
            self.by_client.insert(lease.client_id.clone(), lease.addr);
        }
        self.by_ip.insert(lease.addr, lease);
        Ok(())
    }

    /// Delete-then-add, so the MAC or client id may move between addresses.
    pub fn update(&mut self, lease: Lease) -> Result<(), LeaseExists> {
        self.delete(lease.subnet_id, lease.addr);
        self.add(lease)
    }

    /// Removes the lease at `addr` only when it belongs to `subnet_id`.
    /// Secondary entries are cleared only while they still point at `addr`.
    pub fn delete(&mut self, subnet_id: SubnetId, addr: Ipv4Addr) {
        match self.by_ip.get(&addr) {
            Some(lease) if lease.subnet_id == subnet_id => {}
            _ => return,
        }
        if let Some(lease) = self.by_ip.remove(&addr) {
            if let Some(mac) = lease.mac {
                if self.by_mac.get(&mac) == Some(&addr) {
                    self.by_mac.remove(&mac);
                }
            }
            if !lease.client_id.is_empty() && self.by_client.get(&lease.client_id) == Some(&addr) {
                self.by_client.remove(&lease.client_id);
            }
        }
    }

    pub fn delete_subnet(&mut self, subnet_id: SubnetId) {
        let addrs: Vec<Ipv4Addr> = self
            .by_ip
            .values()
            .filter(|lease| lease.subnet_id == subnet_id)
            .map(|lease| lease.addr)
            .collect();
        for addr in addrs {
            self.delete(subnet_id, addr);
        }
    }

    pub fn delete_pool(&mut self, subnet_id: SubnetId, pool: &Pool) {
        for val in pool.start..=pool.end {
            self.delete(subnet_id, Ipv4Addr::from(val));
        }
    }

    /// Full scan; only used by diagnostics.
    pub fn lease_count(&self, subnet_id: SubnetId) -> usize {
        self.by_ip
            .values()
            .filter(|lease| lease.subnet_id == subnet_id)
            .count()
    }
}
