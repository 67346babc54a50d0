pub mod picker;

use std::net::Ipv4Addr;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error};

use crate::addr::MacAddr;
use crate::host::{Host, HostRegistry};
use crate::lease::{ClientId, Lease, LeaseState};
use crate::storage::HybridLeaseManager;
use crate::subnet::{Subnet, SubnetId};

use picker::IterativeAllocator;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("all the ip addresses have been allocated")]
    AddressExhausted,
    #[error("requested addr is used by others")]
    AddressInUse,
    #[error("requested addr is reserved")]
    AddressReservedForOther,
    #[error("request without wanted addr")]
    RequestMissingTarget,
    #[error("released lease doesn't belong to current user")]
    ReleaseMismatchOwner,
    #[error("released lease doesn't exist")]
    ReleaseNotFound,
    #[error("declined lease doesn't belong to current user")]
    DeclineMismatchOwner,
    #[error("requested addr differs from the reserved addr")]
    ReservedAddrMismatch,
    #[error("requested addr doesn't belong to this subnet")]
    AddressOutsideSubnet,
    #[error("conflict ip has already been allocated")]
    DeclineConflictAlreadyAllocated,
    #[error("declined lease doesn't exist")]
    DeclineNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Discover,
    Request,
    Release,
    Decline,
    ConflictIp,
}

/// One pre-decoded relay request, as handed to the engines.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_type: RequestType,
    pub subnet_id: SubnetId,
    pub client_id: ClientId,
    pub mac: Option<MacAddr>,
    pub request_addr: Option<Ipv4Addr>,
    pub host_name: String,
}

/// The lease decision state machine for one subnet. Callers hold the
/// per-subnet mutex across every call, so the engine itself is single-file.
#[derive(Debug)]
pub struct SubnetEngine {
    subnet: Subnet,
    hosts: Option<HostRegistry>,
    manager: HybridLeaseManager,
    picker: IterativeAllocator,
}

impl SubnetEngine {
    pub fn new(subnet: Subnet, hosts: Option<HostRegistry>, manager: HybridLeaseManager) -> Self {
        Self {
            subnet,
            hosts,
            manager,
            picker: IterativeAllocator::new(),
        }
    }

    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    pub fn subnet_mut(&mut self) -> &mut Subnet {
        &mut self.subnet
    }

    pub fn set_hosts(&mut self, hosts: HostRegistry) {
        self.hosts = Some(hosts);
    }

    pub fn hosts_mut(&mut self) -> Option<&mut HostRegistry> {
        self.hosts.as_mut()
    }

    pub fn lease_count(&self) -> usize {
        self.manager.lease_count(self.subnet.id)
    }

    /// Answer a DISCOVER: pick the address this client would get, without
    /// touching persistent state.
    pub async fn plan_lease(&mut self, ctx: &RequestContext) -> Result<Lease, AllocError> {
        let old_lease = self.find_old_lease(ctx).cloned();
        let host = self.host_with_mac(ctx.mac).copied();

        if let Some(host) = host {
            if let Some(old) = &old_lease {
                if old.addr == host.reserved_addr {
                    return Ok(self.renew_lease(old.addr, ctx).await);
                }
            }
            if let Ok(lease) = self.allocate_with_addr(host.reserved_addr, ctx).await {
                return Ok(lease);
            }
        }

        if let Some(old) = old_lease {
            return Ok(self.renew_lease(old.addr, ctx).await);
        }

        // the client asking for its last known address
        if let Some(wanted) = ctx.request_addr {
            if self.subnet.contains(wanted) && !self.addr_reserved_for_other(wanted, ctx.mac) {
                if let Ok(lease) = self.allocate_with_addr(wanted, ctx).await {
                    return Ok(lease);
                }
            }
        }

        self.allocate_unreserved(ctx).await
    }

    /// Answer a REQUEST: allocate or renew at the requested address and
    /// persist the outcome.
    pub async fn allocate_lease(&mut self, ctx: &RequestContext) -> Result<Lease, AllocError> {
        let Some(wanted) = ctx.request_addr else {
            return Err(AllocError::RequestMissingTarget);
        };

        if self.addr_reserved_for_other(wanted, ctx.mac) {
            return Err(AllocError::AddressReservedForOther);
        }

        let host = self.host_with_mac(ctx.mac).copied();
        if let Some(host) = &host {
            if host.reserved_addr != wanted {
                // steer the client back to its reserved address unless a
                // live foreign lease is sitting on it
                let holder = self.manager.get_by_ip(host.reserved_addr);
                let held_by_other =
                    matches!(holder, Some(l) if !l.is_expired() && l.mac != ctx.mac);
                if !held_by_other {
                    return Err(AllocError::ReservedAddrMismatch);
                }
            }
        }

        let old_lease = self.find_old_lease(ctx).cloned();
        if let Some(old) = &old_lease {
            if old.addr == wanted {
                return Ok(self.renew_lease(old.addr, ctx).await);
            }
        }

        if host.is_none() && !self.subnet.contains(wanted) {
            return Err(AllocError::AddressOutsideSubnet);
        }

        let allocated = self.allocate_with_addr(wanted, ctx).await;
        if let (Some(old), Ok(new)) = (&old_lease, &allocated) {
            if old.addr != new.addr {
                self.manager.delete(old.subnet_id, old.addr).await;
            }
        }
        allocated
    }

    pub async fn release_lease(&mut self, ctx: &RequestContext) -> Result<(), AllocError> {
        let Some(old) = self.find_old_lease(ctx).cloned() else {
            return Err(AllocError::ReleaseNotFound);
        };
        if ctx.request_addr != Some(old.addr) {
            return Err(AllocError::ReleaseMismatchOwner);
        }
        self.manager.delete(old.subnet_id, old.addr).await;
        Ok(())
    }

    pub async fn decline_lease(&mut self, ctx: &RequestContext) -> Result<(), AllocError> {
        let Some(old) = self.find_old_lease(ctx).cloned() else {
            return Err(AllocError::DeclineNotFound);
        };
        if ctx.request_addr != Some(old.addr) {
            return Err(AllocError::DeclineMismatchOwner);
        }
        self.manager.update(old.decline()).await;
        Ok(())
    }

    /// A slave saw the address in use on the wire: occupy it with a declined
    /// lease so it won't be handed out again.
    pub async fn decline_conflict_ip(&mut self, ctx: &RequestContext) -> Result<(), AllocError> {
        let Some(addr) = ctx.request_addr else {
            return Err(AllocError::RequestMissingTarget);
        };
        match self.manager.get_by_ip(addr).cloned() {
            None => {
                let lease = Lease {
                    addr,
                    subnet_id: ctx.subnet_id,
                    state: LeaseState::Declined,
                    mac: None,
                    client_id: ClientId::new(),
                    host_name: ctx.host_name.clone(),
                    client_last_trans_time: Utc::now(),
                    valid_life_time: self.subnet.valid_life_time,
                    renew_time: self.subnet.renew_time,
                    rebind_time: self.subnet.rebind_time,
                };
                match self.manager.add(lease).await {
                    Ok(()) => {
                        debug!(%addr, "declined conflict ip");
                        Ok(())
                    }
                    Err(err) => {
                        error!(%addr, %err, "declining conflict ip failed");
                        Err(AllocError::DeclineConflictAlreadyAllocated)
                    }
                }
            }
            Some(old) => {
                debug!(%addr, "declining conflict ip over an existing lease");
                self.manager.update(old.decline()).await;
                Ok(())
            }
        }
    }

    /// The lease this client already holds: client id first, MAC second.
    fn find_old_lease(&self, ctx: &RequestContext) -> Option<&Lease> {
        if !ctx.client_id.is_empty() {
            if let Some(lease) = self.manager.get_by_client(&ctx.client_id) {
                return Some(lease);
            }
        }
        ctx.mac.and_then(|mac| self.manager.get_by_mac(mac))
    }

    /// Fresh lease at `addr` for this client, with lifetimes from the current
    /// subnet config. Persisted only on the REQUEST path.
    async fn renew_lease(&mut self, addr: Ipv4Addr, ctx: &RequestContext) -> Lease {
        let lease = Lease {
            addr,
            subnet_id: self.subnet.id,
            state: LeaseState::Normal,
            mac: ctx.mac,
            client_id: ctx.client_id.clone(),
            host_name: ctx.host_name.clone(),
            client_last_trans_time: Utc::now(),
            valid_life_time: self.subnet.valid_life_time,
            renew_time: self.subnet.renew_time,
            rebind_time: self.subnet.rebind_time,
        };
        if ctx.request_type == RequestType::Request {
            self.manager.update(lease.clone()).await;
        }
        lease
    }

    async fn allocate_with_addr(
        &mut self,
        addr: Ipv4Addr,
        ctx: &RequestContext,
    ) -> Result<Lease, AllocError> {
        match self.manager.get_by_ip(addr).cloned() {
            None => {
                let lease = Lease {
                    addr,
                    subnet_id: self.subnet.id,
                    state: LeaseState::Normal,
                    mac: ctx.mac,
                    client_id: ctx.client_id.clone(),
                    host_name: ctx.host_name.clone(),
                    client_last_trans_time: Utc::now(),
                    valid_life_time: self.subnet.valid_life_time,
                    renew_time: self.subnet.renew_time,
                    rebind_time: self.subnet.rebind_time,
                };
                if ctx.request_type == RequestType::Request {
                    if let Err(err) = self.manager.add(lease.clone()).await {
                        debug!(%err, "fresh allocation raced an existing lease");
                    }
                }
                Ok(lease)
            }
            Some(old) if !old.is_expired() => Err(AllocError::AddressInUse),
            Some(old) => Ok(self.renew_lease(old.addr, ctx).await),
        }
    }

    fn addr_reserved_for_other(&self, addr: Ipv4Addr, mac: Option<MacAddr>) -> bool {
        if let Some(hosts) = &self.hosts {
            if let Some(host) = hosts.get_by_ip(addr) {
                return Some(host.mac) != mac;
            }
        }
        self.subnet.is_addr_reserved(addr)
    }

    async fn allocate_unreserved(&mut self, ctx: &RequestContext) -> Result<Lease, AllocError> {
        let capacity = self.subnet.capacity();
        for _ in 0..capacity {
            let Some(addr) = self.picker.pick_addr(&self.subnet) else {
                break;
            };
            if self.addr_reserved_for_other(addr, ctx.mac) {
                continue;
            }
            if let Ok(lease) = self.allocate_with_addr(addr, ctx).await {
                return Ok(lease);
            }
        }
        Err(AllocError::AddressExhausted)
    }

    fn host_with_mac(&self, mac: Option<MacAddr>) -> Option<&Host> {
        let hosts = self.hosts.as_ref()?;
        hosts.get_by_mac(mac?)
    }

    // admin-command hooks; the caller holds the engine mutex

    pub async fn purge_subnet_leases(&mut self) {
        let subnet_id = self.subnet.id;
        self.manager.delete_subnet(subnet_id).await;
    }

    pub async fn purge_pool_leases(&mut self, pool: &crate::subnet::Pool) {
        let subnet_id = self.subnet.id;
        self.manager.delete_pool(subnet_id, pool).await;
    }

    pub async fn delete_lease(&mut self, addr: Ipv4Addr) {
        let subnet_id = self.subnet.id;
        self.manager.delete(subnet_id, addr).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::RecordingBackend;
    use crate::storage::writer::WriterConfig;
    use crate::storage::{LeaseWriterPool, MemoryLeaseStore};
    use crate::subnet::Pool;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_subnet(id: SubnetId) -> Subnet {
        Subnet {
            id,
            renew_time: Duration::from_secs(4000),
            rebind_time: Duration::from_secs(4000),
            valid_life_time: Duration::from_secs(3600),
            pools: vec![Pool::parse("10.0.0.1-10.0.0.10").unwrap()],
            reserved_pools: Vec::new(),
        }
    }

    async fn engine_with_store(
        subnet: Subnet,
        hosts: Option<HostRegistry>,
        store: MemoryLeaseStore,
    ) -> SubnetEngine {
        let backend = Arc::new(RecordingBackend::default());
        let pool = LeaseWriterPool::new(
            backend,
            WriterConfig {
                workers: 1,
                ..WriterConfig::default()
            },
        );
        pool.load_subnets(std::slice::from_ref(&subnet)).await;
        let manager = HybridLeaseManager::new(store, pool);
        SubnetEngine::new(subnet, hosts, manager)
    }

    async fn engine_for(subnet: Subnet, hosts: Option<HostRegistry>) -> SubnetEngine {
        engine_with_store(subnet, hosts, MemoryLeaseStore::new()).await
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn ctx(request_type: RequestType, mac_last: u8, addr: Option<Ipv4Addr>) -> RequestContext {
        RequestContext {
            request_type,
            subnet_id: 1,
            client_id: ClientId::new(),
            mac: Some(mac(mac_last)),
            request_addr: addr,
            host_name: "client".into(),
        }
    }

    fn reservation(mac_last: u8, addr: Ipv4Addr) -> HostRegistry {
        let mut hosts = HostRegistry::new();
        hosts
            .add(Host {
                mac: mac(mac_last),
                reserved_addr: addr,
            })
            .unwrap();
        hosts
    }

    #[tokio::test]
    async fn discover_yields_reservation_without_persisting() {
        let reserved = Ipv4Addr::new(10, 0, 0, 5);
        let mut engine = engine_for(test_subnet(1), Some(reservation(0x01, reserved))).await;

        let lease = engine
            .plan_lease(&ctx(RequestType::Discover, 0x01, None))
            .await
            .unwrap();
        assert_eq!(lease.addr, reserved);
        // nothing persisted
        assert_eq!(engine.lease_count(), 0);
    }

    #[tokio::test]
    async fn discover_scan_skips_addresses_reserved_for_others() {
        let mut engine =
            engine_for(test_subnet(1), Some(reservation(0x02, Ipv4Addr::new(10, 0, 0, 1)))).await;

        let lease = engine
            .plan_lease(&ctx(RequestType::Discover, 0x01, None))
            .await
            .unwrap();
        assert_eq!(lease.addr, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[tokio::test]
    async fn request_at_address_reserved_for_other_fails() {
        let reserved = Ipv4Addr::new(10, 0, 0, 5);
        let mut engine = engine_for(test_subnet(1), Some(reservation(0x02, reserved))).await;

        let err = engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(reserved)))
            .await
            .unwrap_err();
        assert_eq!(err, AllocError::AddressReservedForOther);
        assert_eq!(engine.lease_count(), 0);
    }

    #[tokio::test]
    async fn request_is_steered_back_to_free_reserved_address() {
        let reserved = Ipv4Addr::new(10, 0, 0, 5);
        let mut engine = engine_for(test_subnet(1), Some(reservation(0x01, reserved))).await;

        // the reserved address is free, so asking for a different one is refused
        let err = engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(Ipv4Addr::new(10, 0, 0, 7))))
            .await
            .unwrap_err();
        assert_eq!(err, AllocError::ReservedAddrMismatch);
    }

    #[tokio::test]
    async fn request_may_keep_another_address_while_reservation_is_occupied() {
        let reserved = Ipv4Addr::new(10, 0, 0, 5);
        // a foreign client is squatting on the reserved address, e.g. leased
        // before the reservation was configured
        let mut store = MemoryLeaseStore::new();
        store
            .add(Lease {
                addr: reserved,
                subnet_id: 1,
                state: LeaseState::Normal,
                mac: Some(mac(0x02)),
                client_id: ClientId::new(),
                host_name: String::new(),
                client_last_trans_time: Utc::now(),
                valid_life_time: Duration::from_secs(3600),
                renew_time: Duration::from_secs(4000),
                rebind_time: Duration::from_secs(4000),
            })
            .unwrap();
        let mut engine =
            engine_with_store(test_subnet(1), Some(reservation(0x01, reserved)), store).await;

        let lease = engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(Ipv4Addr::new(10, 0, 0, 7))))
            .await
            .unwrap();
        assert_eq!(lease.addr, Ipv4Addr::new(10, 0, 0, 7));
    }

    #[tokio::test]
    async fn request_without_target_or_outside_subnet_fails() {
        let mut engine = engine_for(test_subnet(1), None).await;

        assert_eq!(
            engine
                .allocate_lease(&ctx(RequestType::Request, 0x01, None))
                .await
                .unwrap_err(),
            AllocError::RequestMissingTarget
        );
        assert_eq!(
            engine
                .allocate_lease(&ctx(RequestType::Request, 0x01, Some(Ipv4Addr::new(172, 16, 0, 1))))
                .await
                .unwrap_err(),
            AllocError::AddressOutsideSubnet
        );
    }

    #[tokio::test]
    async fn request_persists_and_renews() {
        let mut engine = engine_for(test_subnet(1), None).await;
        let wanted = Ipv4Addr::new(10, 0, 0, 3);

        let lease = engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(wanted)))
            .await
            .unwrap();
        assert_eq!(lease.addr, wanted);
        assert_eq!(engine.lease_count(), 1);

        // same client renews in place
        let renewed = engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(wanted)))
            .await
            .unwrap();
        assert_eq!(renewed.addr, wanted);
        assert_eq!(engine.lease_count(), 1);

        // another client can't take it
        assert_eq!(
            engine
                .allocate_lease(&ctx(RequestType::Request, 0x02, Some(wanted)))
                .await
                .unwrap_err(),
            AllocError::AddressInUse
        );
    }

    #[tokio::test]
    async fn request_steals_expired_lease() {
        let mut subnet = test_subnet(1);
        subnet.valid_life_time = Duration::from_secs(1);
        let mut engine = engine_for(subnet, None).await;
        let wanted = Ipv4Addr::new(10, 0, 0, 3);

        engine
            .allocate_lease(&ctx(RequestType::Request, 0x0a, Some(wanted)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stolen = engine
            .allocate_lease(&ctx(RequestType::Request, 0x0b, Some(wanted)))
            .await
            .unwrap();
        assert_eq!(stolen.addr, wanted);
        assert_eq!(stolen.mac, Some(mac(0x0b)));
        assert_eq!(engine.lease_count(), 1);
    }

    #[tokio::test]
    async fn request_moving_address_drops_the_stale_lease() {
        let mut engine = engine_for(test_subnet(1), None).await;
        engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(Ipv4Addr::new(10, 0, 0, 3))))
            .await
            .unwrap();
        let moved = engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(Ipv4Addr::new(10, 0, 0, 4))))
            .await;
        // the prior lease was found by MAC but sits at another address, so
        // allocation proceeds at the new one and the old one is removed
        assert_eq!(moved.unwrap().addr, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(engine.lease_count(), 1);
    }

    #[tokio::test]
    async fn release_checks_owner() {
        let mut engine = engine_for(test_subnet(1), None).await;
        let held = Ipv4Addr::new(10, 0, 0, 7);
        engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(held)))
            .await
            .unwrap();

        assert_eq!(
            engine
                .release_lease(&ctx(RequestType::Release, 0x01, Some(Ipv4Addr::new(10, 0, 0, 8))))
                .await
                .unwrap_err(),
            AllocError::ReleaseMismatchOwner
        );
        assert_eq!(engine.lease_count(), 1);

        assert_eq!(
            engine
                .release_lease(&ctx(RequestType::Release, 0x02, Some(held)))
                .await
                .unwrap_err(),
            AllocError::ReleaseNotFound
        );

        engine
            .release_lease(&ctx(RequestType::Release, 0x01, Some(held)))
            .await
            .unwrap();
        assert_eq!(engine.lease_count(), 0);
    }

    #[tokio::test]
    async fn decline_detaches_the_client_but_occupies_the_address() {
        let mut engine = engine_for(test_subnet(1), None).await;
        let held = Ipv4Addr::new(10, 0, 0, 2);
        engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(held)))
            .await
            .unwrap();

        engine
            .decline_lease(&ctx(RequestType::Decline, 0x01, Some(held)))
            .await
            .unwrap();

        assert_eq!(engine.lease_count(), 1);
        // the declined address can't be handed to the next client
        let next = engine
            .allocate_lease(&ctx(RequestType::Request, 0x02, Some(held)))
            .await
            .unwrap_err();
        assert_eq!(next, AllocError::AddressInUse);
    }

    #[tokio::test]
    async fn conflict_ip_occupies_unleased_address() {
        let mut engine = engine_for(test_subnet(1), None).await;
        let conflicted = Ipv4Addr::new(10, 0, 0, 9);

        engine
            .decline_conflict_ip(&ctx(RequestType::ConflictIp, 0x01, Some(conflicted)))
            .await
            .unwrap();
        assert_eq!(engine.lease_count(), 1);

        // a discover scan must route around it
        let mut seen = Vec::new();
        for _ in 0..9 {
            let lease = engine
                .plan_lease(&RequestContext {
                    mac: None,
                    client_id: vec![seen.len() as u8 + 1],
                    ..ctx(RequestType::Discover, 0, None)
                })
                .await
                .unwrap();
            seen.push(lease.addr);
        }
        assert!(!seen.contains(&conflicted));
    }

    #[tokio::test]
    async fn discover_never_mutates_the_store() {
        let mut engine = engine_for(test_subnet(1), None).await;
        for round in 0..20u8 {
            engine
                .plan_lease(&ctx(RequestType::Discover, round, None))
                .await
                .unwrap();
            assert_eq!(engine.lease_count(), 0);
        }
    }

    #[tokio::test]
    async fn discover_prefers_prior_lease() {
        let mut engine = engine_for(test_subnet(1), None).await;
        let held = Ipv4Addr::new(10, 0, 0, 6);
        engine
            .allocate_lease(&ctx(RequestType::Request, 0x01, Some(held)))
            .await
            .unwrap();

        let planned = engine
            .plan_lease(&ctx(RequestType::Discover, 0x01, None))
            .await
            .unwrap();
        assert_eq!(planned.addr, held);
    }

    #[tokio::test]
    async fn exhausted_subnet_reports_no_address_left() {
        let mut subnet = test_subnet(1);
        subnet.pools = vec![Pool::parse("10.0.0.1-10.0.0.2").unwrap()];
        let mut engine = engine_for(subnet, None).await;

        for (mac_last, addr) in [(1u8, "10.0.0.1"), (2, "10.0.0.2")] {
            engine
                .allocate_lease(&ctx(
                    RequestType::Request,
                    mac_last,
                    Some(addr.parse().unwrap()),
                ))
                .await
                .unwrap();
        }
        let err = engine
            .plan_lease(&ctx(RequestType::Discover, 3, None))
            .await
            .unwrap_err();
        assert_eq!(err, AllocError::AddressExhausted);
    }
}
