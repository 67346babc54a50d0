use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::settings::Dhcp4Settings;
use crate::engine::{RequestContext, RequestType, SubnetEngine};
use crate::host::{Host, HostRegistry};
use crate::lease::LeaseResult;
use crate::shared::SharedNetworks;
use crate::storage::{HybridLeaseManager, LeaseWriterPool, MemoryLeaseStore};
use crate::subnet::{load_subnets, Pool, Subnet, SubnetId};

/// Routes requests to per-subnet engines, falling back across shared
/// networks. Every engine sits behind its own mutex, so requests for
/// different subnets proceed in parallel while one subnet's decisions stay
/// serialized.
pub struct AddrAllocator {
    engines: HashMap<SubnetId, Arc<Mutex<SubnetEngine>>>,
    shared: SharedNetworks,
    writer: Arc<LeaseWriterPool>,
}

impl AddrAllocator {
    pub async fn new(settings: &Dhcp4Settings, writer: Arc<LeaseWriterPool>) -> Result<Self> {
        let mut allocator = Self {
            engines: HashMap::new(),
            shared: SharedNetworks::new(),
            writer,
        };
        allocator.reload(settings).await?;
        Ok(allocator)
    }

    /// Rebuilds the whole engine set from a parsed config. Callers must have
    /// quiesced the request handlers first.
    pub async fn reload(&mut self, settings: &Dhcp4Settings) -> Result<()> {
        let (subnets, mut registries) = load_subnets(settings)?;
        let mut stores = self.writer.load_subnets(&subnets).await;

        let mut engines = HashMap::with_capacity(subnets.len());
        for subnet in subnets {
            let store = stores.remove(&subnet.id).unwrap_or_else(MemoryLeaseStore::new);
            let manager = HybridLeaseManager::new(store, Arc::clone(&self.writer));
            let hosts = registries.remove(&subnet.id);
            engines.insert(subnet.id, Arc::new(Mutex::new(SubnetEngine::new(subnet, hosts, manager))));
        }
        self.engines = engines;
        self.shared = SharedNetworks::from_settings(&settings.shared_networks);
        Ok(())
    }

    pub async fn handle_request(&self, ctx: RequestContext) -> LeaseResult {
        if !self.engines.contains_key(&ctx.subnet_id) {
            warn!(subnet = ctx.subnet_id, "unknown subnet");
            return LeaseResult::failed();
        }
        match ctx.request_type {
            RequestType::Discover => self.plan_lease(ctx).await,
            RequestType::Request => self.allocate_lease(ctx).await,
            RequestType::Release => self.release_lease(ctx).await,
            RequestType::Decline => self.decline_lease(ctx).await,
            RequestType::ConflictIp => self.decline_conflict_ip(ctx).await,
        }
    }

    async fn plan_lease(&self, mut ctx: RequestContext) -> LeaseResult {
        if let Some(engine) = self.engines.get(&ctx.subnet_id) {
            match engine.lock().await.plan_lease(&ctx).await {
                Ok(lease) => {
                    debug!(addr = %lease.addr, mac = ?ctx.mac, subnet = lease.subnet_id, "discover planned");
                    return LeaseResult::with_lease(&lease);
                }
                Err(err) => warn!(subnet = ctx.subnet_id, %err, "discover failed"),
            }
        }

        for shared_id in self.shared.subnets_shared_with(ctx.subnet_id) {
            let Some(engine) = self.engines.get(&shared_id) else {
                continue;
            };
            ctx.subnet_id = shared_id;
            if let Ok(lease) = engine.lock().await.plan_lease(&ctx).await {
                debug!(addr = %lease.addr, subnet = shared_id, "discover planned in shared subnet");
                return LeaseResult::with_lease(&lease);
            }
        }

        debug!(mac = ?ctx.mac, subnet = ctx.subnet_id, "no addr to plan");
        LeaseResult::failed()
    }

    async fn allocate_lease(&self, mut ctx: RequestContext) -> LeaseResult {
        if let Some(engine) = self.engines.get(&ctx.subnet_id) {
            match engine.lock().await.allocate_lease(&ctx).await {
                Ok(lease) => {
                    debug!(addr = %lease.addr, mac = ?ctx.mac, subnet = lease.subnet_id, "lease allocated");
                    return LeaseResult::with_lease(&lease);
                }
                Err(err) => warn!(subnet = ctx.subnet_id, %err, "request failed"),
            }
        }

        let Some(wanted) = ctx.request_addr else {
            return LeaseResult::failed();
        };
        for shared_id in self.shared.subnets_shared_with(ctx.subnet_id) {
            let Some(engine) = self.engines.get(&shared_id) else {
                continue;
            };
            let mut engine = engine.lock().await;
            if !engine.subnet().contains(wanted) {
                continue;
            }
            ctx.subnet_id = shared_id;
            match engine.allocate_lease(&ctx).await {
                Ok(lease) => {
                    debug!(addr = %lease.addr, subnet = shared_id, "lease allocated in shared subnet");
                    return LeaseResult::with_lease(&lease);
                }
                Err(err) => warn!(subnet = shared_id, %err, "request failed in shared subnet"),
            }
        }

        debug!(mac = ?ctx.mac, subnet = ctx.subnet_id, "no addr to allocate");
        LeaseResult::failed()
    }

    async fn release_lease(&self, mut ctx: RequestContext) -> LeaseResult {
        if let Some(engine) = self.engines.get(&ctx.subnet_id) {
            match engine.lock().await.release_lease(&ctx).await {
                Ok(()) => {
                    debug!(addr = ?ctx.request_addr, subnet = ctx.subnet_id, "lease released");
                    return LeaseResult::succeeded();
                }
                Err(err) => {
                    warn!(addr = ?ctx.request_addr, subnet = ctx.subnet_id, %err, "release failed")
                }
            }
        }

        let Some(wanted) = ctx.request_addr else {
            return LeaseResult::failed();
        };
        for shared_id in self.shared.subnets_shared_with(ctx.subnet_id) {
            let Some(engine) = self.engines.get(&shared_id) else {
                continue;
            };
            let mut engine = engine.lock().await;
            if !engine.subnet().contains(wanted) {
                continue;
            }
            ctx.subnet_id = shared_id;
            if engine.release_lease(&ctx).await.is_ok() {
                debug!(subnet = shared_id, "lease released in shared subnet");
                return LeaseResult::succeeded();
            }
        }
        LeaseResult::failed()
    }

    async fn decline_lease(&self, mut ctx: RequestContext) -> LeaseResult {
        if let Some(engine) = self.engines.get(&ctx.subnet_id) {
            match engine.lock().await.decline_lease(&ctx).await {
                Ok(()) => {
                    debug!(subnet = ctx.subnet_id, "lease declined");
                    return LeaseResult::succeeded();
                }
                Err(err) => warn!(subnet = ctx.subnet_id, %err, "decline failed"),
            }
        }

        let Some(wanted) = ctx.request_addr else {
            return LeaseResult::failed();
        };
        for shared_id in self.shared.subnets_shared_with(ctx.subnet_id) {
            let Some(engine) = self.engines.get(&shared_id) else {
                continue;
            };
            let mut engine = engine.lock().await;
            if !engine.subnet().contains(wanted) {
                continue;
            }
            ctx.subnet_id = shared_id;
            if engine.decline_lease(&ctx).await.is_ok() {
                debug!(subnet = shared_id, "lease declined in shared subnet");
                return LeaseResult::succeeded();
            }
        }
        LeaseResult::failed()
    }

    /// Conflicts never fall back: the reporting slave named this subnet.
    async fn decline_conflict_ip(&self, ctx: RequestContext) -> LeaseResult {
        let Some(engine) = self.engines.get(&ctx.subnet_id) else {
            return LeaseResult::failed();
        };
        match engine.lock().await.decline_conflict_ip(&ctx).await {
            Ok(()) => LeaseResult::succeeded(),
            Err(_) => LeaseResult::failed(),
        }
    }

    // dynamic admin mutations; the server's command gate has already stopped
    // the request handlers

    pub async fn add_subnet(&mut self, subnet_id: SubnetId, valid_lifetime_secs: u64) -> Result<()> {
        if self.engines.contains_key(&subnet_id) {
            bail!("add duplicate subnet with id: {subnet_id}");
        }
        let subnet = Subnet::empty(subnet_id, Duration::from_secs(valid_lifetime_secs));
        self.writer.assign_new_subnet(subnet_id).await;
        let manager = HybridLeaseManager::new(MemoryLeaseStore::new(), Arc::clone(&self.writer));
        self.engines.insert(
            subnet_id,
            Arc::new(Mutex::new(SubnetEngine::new(subnet, None, manager))),
        );
        Ok(())
    }

    pub async fn delete_subnet(&mut self, subnet_id: SubnetId) -> Result<()> {
        let engine = self
            .engines
            .remove(&subnet_id)
            .ok_or_else(|| anyhow!("delete non-exist subnet with id: {subnet_id}"))?;
        engine.lock().await.purge_subnet_leases().await;
        Ok(())
    }

    pub async fn update_subnet(&mut self, subnet_id: SubnetId, valid_lifetime_secs: u64) -> Result<()> {
        let engine = self.engine(subnet_id)?;
        engine.lock().await.subnet_mut().valid_life_time =
            Duration::from_secs(valid_lifetime_secs);
        Ok(())
    }

    pub async fn add_pool(&mut self, subnet_id: SubnetId, pool: Pool, reserved: bool) -> Result<()> {
        let engine = self.engine(subnet_id)?;
        let mut engine = engine.lock().await;
        if reserved {
            engine.purge_pool_leases(&pool).await;
            engine.subnet_mut().reserved_pools.push(pool);
        } else {
            engine.subnet_mut().pools.push(pool);
        }
        Ok(())
    }

    pub async fn delete_pool(&mut self, subnet_id: SubnetId, pool: Pool, reserved: bool) -> Result<()> {
        let engine = self.engine(subnet_id)?;
        let mut engine = engine.lock().await;
        let pools = if reserved {
            &mut engine.subnet_mut().reserved_pools
        } else {
            &mut engine.subnet_mut().pools
        };
        let Some(pos) = pools.iter().position(|p| *p == pool) else {
            bail!("no found pool {pool} for subnet-id {subnet_id}");
        };
        pools.remove(pos);
        if !reserved {
            engine.purge_pool_leases(&pool).await;
        }
        Ok(())
    }

    pub async fn add_reservation(&mut self, subnet_id: SubnetId, host: Host) -> Result<()> {
        let engine = self.engine(subnet_id)?;
        let mut engine = engine.lock().await;
        match engine.hosts_mut() {
            Some(hosts) => hosts.add(host)?,
            None => {
                let mut hosts = HostRegistry::new();
                hosts.add(host)?;
                engine.set_hosts(hosts);
            }
        }
        Ok(())
    }

    pub async fn delete_reservation(&mut self, subnet_id: SubnetId, host: Host) -> Result<()> {
        let engine = self.engine(subnet_id)?;
        let mut engine = engine.lock().await;
        engine.delete_lease(host.reserved_addr).await;
        let hosts = engine
            .hosts_mut()
            .ok_or_else(|| anyhow!("operate non-exist host in subnet {subnet_id}"))?;
        hosts.remove(&host)?;
        Ok(())
    }

    pub fn add_shared_network(&mut self, name: &str, subnet_ids: Vec<SubnetId>) {
        self.shared.add(name, subnet_ids);
    }

    pub fn delete_shared_network(&mut self, name: &str) {
        self.shared.remove(name);
    }

    pub fn update_shared_network(&mut self, name: &str, subnet_ids: Vec<SubnetId>) {
        self.shared.update(name, subnet_ids);
    }

    fn engine(&self, subnet_id: SubnetId) -> Result<Arc<Mutex<SubnetEngine>>> {
        self.engines
            .get(&subnet_id)
            .cloned()
            .ok_or_else(|| anyhow!("operate non-exist subnet with id: {subnet_id}"))
    }
}
