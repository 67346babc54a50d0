pub mod hybrid;
pub mod memory;
pub mod postgres;
pub mod writer;

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::lease::Lease;
use crate::subnet::{Subnet, SubnetId};

pub use hybrid::HybridLeaseManager;
pub use memory::MemoryLeaseStore;
pub use postgres::PgLeaseStore;
pub use writer::LeaseWriterPool;

/// One persistent lease mutation, as queued to the writer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOp {
    Add(Lease),
    Update(Lease),
    Delete { subnet_id: SubnetId, addr: Ipv4Addr },
    DeleteSubnet { subnet_id: SubnetId },
    DeletePool { subnet_id: SubnetId, start: u32, end: u32 },
}

impl LeaseOp {
    /// The subnet whose writer must carry this op.
    pub fn subnet_id(&self) -> SubnetId {
        match self {
            LeaseOp::Add(lease) | LeaseOp::Update(lease) => lease.subnet_id,
            LeaseOp::Delete { subnet_id, .. }
            | LeaseOp::DeleteSubnet { subnet_id }
            | LeaseOp::DeletePool { subnet_id, .. } => *subnet_id,
        }
    }
}

/// Durability tier behind the writer pool. The production backend is
/// PostgreSQL; tests swap in a recording double.
#[async_trait]
pub trait LeaseBackend: Send + Sync + 'static {
    /// Applies a batch in one transaction, replaying the ops in order.
    async fn commit(&self, batch: Vec<LeaseOp>) -> anyhow::Result<()>;

    /// Purges rows that fell outside the subnet's current pools, then returns
    /// the remaining rows. A subnet without pools loses all of its rows.
    async fn load_subnet(&self, subnet: &Subnet) -> anyhow::Result<Vec<Lease>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Captures every commit and load for assertions; loads reply with
    /// whatever `seed` holds for the subnet.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingBackend {
        pub(crate) commits: Mutex<Vec<Vec<LeaseOp>>>,
        pub(crate) loads: Mutex<Vec<SubnetId>>,
        pub(crate) seed: Mutex<Vec<Lease>>,
    }

    #[async_trait]
    impl LeaseBackend for RecordingBackend {
        async fn commit(&self, batch: Vec<LeaseOp>) -> anyhow::Result<()> {
            self.commits.lock().await.push(batch);
            Ok(())
        }

        async fn load_subnet(&self, subnet: &Subnet) -> anyhow::Result<Vec<Lease>> {
            self.loads.lock().await.push(subnet.id);
            let seed = self.seed.lock().await;
            Ok(seed
                .iter()
                .filter(|lease| lease.subnet_id == subnet.id)
                .cloned()
                .collect())
        }
    }
}
