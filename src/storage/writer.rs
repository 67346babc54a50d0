use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use super::{LeaseBackend, LeaseOp, MemoryLeaseStore};
use crate::lease::Lease;
use crate::subnet::{Subnet, SubnetId};

pub const DEFAULT_WORKER_COUNT: usize = 8;
const OP_CHANNEL_CAPACITY: usize = 1024;
const BATCH_THRESHOLD: usize = 40;
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    pub batch_threshold: usize,
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNT,
            channel_capacity: OP_CHANNEL_CAPACITY,
            batch_threshold: BATCH_THRESHOLD,
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

enum WriterMsg {
    Op(LeaseOp),
    /// Forces a flush before reading, so the load observes every prior write
    /// for its subnet.
    Load {
        subnet: Subnet,
        reply: oneshot::Sender<Vec<Lease>>,
    },
}

/// Sharded write-behind pool. Every subnet is pinned to one worker, which
/// serializes that subnet's mutations into a single transaction stream.
#[derive(Debug)]
pub struct LeaseWriterPool {
    senders: Mutex<Vec<mpsc::Sender<WriterMsg>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    affinity: Mutex<Affinity>,
    worker_count: usize,
}

#[derive(Debug)]
struct Affinity {
    map: HashMap<SubnetId, usize>,
    rng: StdRng,
}

impl LeaseWriterPool {
    pub fn new(backend: Arc<dyn LeaseBackend>, config: WriterConfig) -> Arc<Self> {
        debug!(workers = config.workers, "starting lease writers");
        let mut senders = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(index, Arc::clone(&backend), rx, config)));
        }
        Arc::new(Self {
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
            affinity: Mutex::new(Affinity {
                map: HashMap::new(),
                rng: StdRng::from_entropy(),
            }),
            worker_count: config.workers,
        })
    }

    pub fn with_defaults(backend: Arc<dyn LeaseBackend>) -> Arc<Self> {
        Self::new(backend, WriterConfig::default())
    }

    /// Queues one mutation on the worker owning its subnet. Backpressures the
    /// caller when that worker's channel is full.
    pub async fn enqueue(&self, op: LeaseOp) {
        let subnet_id = op.subnet_id();
        let index = self.affinity.lock().await.map.get(&subnet_id).copied();
        match index {
            Some(index) => self.send(index, WriterMsg::Op(op)).await,
            None => error!(subnet = subnet_id, "no writer assigned to subnet"),
        }
    }

    async fn send(&self, index: usize, msg: WriterMsg) {
        let sender = self.senders.lock().await.get(index).cloned();
        match sender {
            Some(sender) => {
                if sender.send(msg).await.is_err() {
                    warn!(worker = index, "lease writer is gone, dropping op");
                }
            }
            None => warn!(worker = index, "lease writer is stopped, dropping op"),
        }
    }

    /// Reloads lease state for a fresh subnet set and rebuilds the
    /// subnet→worker assignment. Subnets that already had a writer are read
    /// through it first (so their queued ops land before the read), then the
    /// whole map is rebuilt round-robin: surviving subnets from worker 0,
    /// brand-new subnets appended. Subnets that disappeared get their rows
    /// deleted asynchronously.
    pub async fn load_subnets(&self, subnets: &[Subnet]) -> HashMap<SubnetId, MemoryLeaseStore> {
        let (old, new): (Vec<&Subnet>, Vec<&Subnet>) = {
            let affinity = self.affinity.lock().await;
            subnets
                .iter()
                .partition(|subnet| affinity.map.contains_key(&subnet.id))
        };

        let mut stores = HashMap::new();
        self.load_into(&old, &mut stores).await;

        // rebuild the assignment, remembering where removed subnets lived
        let removed: Vec<(SubnetId, usize)> = {
            let mut affinity = self.affinity.lock().await;
            let mut map = HashMap::with_capacity(subnets.len());
            let mut index = 0;
            for subnet in old.iter().chain(new.iter()) {
                map.insert(subnet.id, index);
                index = (index + 1) % self.worker_count;
            }
            let removed = affinity
                .map
                .iter()
                .filter(|(id, _)| !map.contains_key(*id))
                .map(|(id, index)| (*id, *index))
                .collect();
            affinity.map = map;
            removed
        };
        for (subnet_id, index) in removed {
            debug!(subnet = subnet_id, "subnet no longer configured, deleting its rows");
            self.send(index, WriterMsg::Op(LeaseOp::DeleteSubnet { subnet_id })).await;
        }

        self.load_into(&new, &mut stores).await;
        stores
    }

    async fn load_into(&self, subnets: &[&Subnet], stores: &mut HashMap<SubnetId, MemoryLeaseStore>) {
        let mut pending = Vec::with_capacity(subnets.len());
        for subnet in subnets {
            let index = self.affinity.lock().await.map.get(&subnet.id).copied();
            let Some(index) = index else { continue };
            let (reply, rx) = oneshot::channel();
            self.send(
                index,
                WriterMsg::Load {
                    subnet: (*subnet).clone(),
                    reply,
                },
            )
            .await;
            pending.push((subnet.id, rx));
        }
        for (subnet_id, rx) in pending {
            let mut store = MemoryLeaseStore::new();
            match rx.await {
                Ok(leases) => {
                    for lease in leases {
                        if let Err(err) = store.add(lease) {
                            warn!(subnet = subnet_id, %err, "skipping duplicate lease row");
                        }
                    }
                }
                Err(_) => error!(subnet = subnet_id, "lease load reply lost"),
            }
            stores.insert(subnet_id, store);
        }
    }

    /// Assigns a dynamically added subnet to a uniformly drawn worker.
    pub async fn assign_new_subnet(&self, subnet_id: SubnetId) {
        let mut affinity = self.affinity.lock().await;
        let index = affinity.rng.gen_range(0..self.worker_count);
        affinity.map.insert(subnet_id, index);
    }

    #[cfg(test)]
    pub(crate) async fn worker_for(&self, subnet_id: SubnetId) -> Option<usize> {
        self.affinity.lock().await.map.get(&subnet_id).copied()
    }

    /// Closes every worker channel and waits for the final flushes.
    pub async fn stop(&self) {
        self.senders.lock().await.clear();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                error!(%err, "lease writer exited abnormally");
            }
        }
    }
}

async fn run_worker(
    index: usize,
    backend: Arc<dyn LeaseBackend>,
    mut rx: mpsc::Receiver<WriterMsg>,
    config: WriterConfig,
) {
    let mut flusher = tokio::time::interval(config.flush_interval);
    flusher.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch: Vec<LeaseOp> = Vec::with_capacity(config.batch_threshold);
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WriterMsg::Op(op)) => {
                    batch.push(op);
                    if batch.len() >= config.batch_threshold {
                        flush(&*backend, &mut batch).await;
                    }
                }
                Some(WriterMsg::Load { subnet, reply }) => {
                    flush(&*backend, &mut batch).await;
                    match backend.load_subnet(&subnet).await {
                        Ok(leases) => {
                            let _ = reply.send(leases);
                        }
                        Err(err) => {
                            error!(subnet = subnet.id, %err, "lease load failed");
                            let _ = reply.send(Vec::new());
                        }
                    }
                }
                None => {
                    flush(&*backend, &mut batch).await;
                    break;
                }
            },
            _ = flusher.tick() => flush(&*backend, &mut batch).await,
        }
    }
    debug!(worker = index, "lease writer stopped");
}

async fn flush(backend: &dyn LeaseBackend, batch: &mut Vec<LeaseOp>) {
    if batch.is_empty() {
        return;
    }
    let ops = std::mem::take(batch);
    if let Err(err) = backend.commit(ops).await {
        // losing a committed-to-memory mutation breaks the durability
        // contract; crash-restart recovers from the database
        panic!("lease db transaction failed: {err}");
    }
}
