use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::warn;

use super::memory::{LeaseExists, MemoryLeaseStore};
use super::writer::LeaseWriterPool;
use super::LeaseOp;
use crate::addr::MacAddr;
use crate::lease::Lease;
use crate::subnet::{Pool, SubnetId};

/// Two-tier lease store for one subnet: reads are answered from memory,
/// mutations land in memory first and are then queued to the subnet's
/// database writer.
#[derive(Debug)]
pub struct HybridLeaseManager {
    mem: MemoryLeaseStore,
    writer: Arc<LeaseWriterPool>,
}

impl HybridLeaseManager {
    pub fn new(mem: MemoryLeaseStore, writer: Arc<LeaseWriterPool>) -> Self {
        Self { mem, writer }
    }

    pub fn get_by_ip(&self, addr: Ipv4Addr) -> Option<&Lease> {
        self.mem.get_by_ip(addr)
    }

    pub fn get_by_mac(&self, mac: MacAddr) -> Option<&Lease> {
        self.mem.get_by_mac(mac)
    }

    pub fn get_by_client(&self, client_id: &[u8]) -> Option<&Lease> {
        self.mem.get_by_client(client_id)
    }

    pub fn get_by_client_and_mac(&self, client_id: &[u8], mac: MacAddr) -> Option<&Lease> {
        self.mem.get_by_client_and_mac(client_id, mac)
    }

    pub fn lease_count(&self, subnet_id: SubnetId) -> usize {
        self.mem.lease_count(subnet_id)
    }

    pub async fn add(&mut self, lease: Lease) -> Result<(), LeaseExists> {
        self.mem.add(lease.clone())?;
        self.writer.enqueue(LeaseOp::Add(lease)).await;
        Ok(())
    }

    pub async fn update(&mut self, lease: Lease) {
        match self.mem.update(lease.clone()) {
            Ok(()) => self.writer.enqueue(LeaseOp::Update(lease)).await,
            // the address is held by a lease of another subnet
            Err(err) => warn!(%err, "lease update skipped"),
        }
    }

    pub async fn delete(&mut self, subnet_id: SubnetId, addr: Ipv4Addr) {
        self.mem.delete(subnet_id, addr);
        self.writer.enqueue(LeaseOp::Delete { subnet_id, addr }).await;
    }

    pub async fn delete_subnet(&mut self, subnet_id: SubnetId) {
        self.mem.delete_subnet(subnet_id);
        self.writer.enqueue(LeaseOp::DeleteSubnet { subnet_id }).await;
    }

    pub async fn delete_pool(&mut self, subnet_id: SubnetId, pool: &Pool) {
        self.mem.delete_pool(subnet_id, pool);
        self.writer
            .enqueue(LeaseOp::DeletePool {
                subnet_id,
                start: pool.start,
                end: pool.end,
            })
            .await;
    }
}
