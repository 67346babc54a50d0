pub mod codec;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use sqlx::PgPool;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::admin::{Command, CmdResult};
use crate::allocator::AddrAllocator;
use crate::config::Settings;
use crate::database;
use crate::host::Host;
use crate::storage::{LeaseWriterPool, PgLeaseStore};
use crate::subnet::Pool;

use codec::RequestCodec;

struct ClientHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The master process: owns the request listener, the connected relay
/// clients, the allocator, and the writer pool. Admin commands run under
/// `cmd_lock` with the reconfigure gate raised, so they never race the
/// request path.
pub struct Server {
    config_path: PathBuf,
    allocator: RwLock<AddrAllocator>,
    writer: Arc<LeaseWriterPool>,
    pg: PgPool,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_client_id: AtomicU64,
    during_reconfig: AtomicBool,
    cmd_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub async fn new(config_path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let config_path = config_path.into();
        let settings = Settings::load(&config_path)?;
        let dhcp4 = &settings.dhcp4;

        let pg = database::init_pool(&dhcp4.lease_database).await?;
        database::ensure_schema(&pg).await?;
        let writer = LeaseWriterPool::with_defaults(Arc::new(PgLeaseStore::new(pg.clone())));
        let allocator = AddrAllocator::new(dhcp4, Arc::clone(&writer)).await?;

        let listener =
            TcpListener::bind(format!("{}:{}", dhcp4.master_ip, dhcp4.master_port)).await?;
        info!(addr = %listener.local_addr()?, "lease request server listening");

        let (shutdown, _) = watch::channel(false);
        let server = Arc::new(Self {
            config_path,
            allocator: RwLock::new(allocator),
            writer,
            pg,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
            during_reconfig: AtomicBool::new(false),
            cmd_lock: Mutex::new(()),
            shutdown,
        });
        tokio::spawn(accept_loop(Arc::clone(&server), listener));
        Ok(server)
    }

    /// Stops accepting, disconnects relays, drains the writer pool and closes
    /// the database.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.stop_clients().await;
        self.writer.stop().await;
        self.pg.close().await;
    }

    async fn stop_clients(&self) {
        let handles: Vec<ClientHandle> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.stop.send(());
            let _ = handle.task.await;
        }
    }

    async fn reload_conf(&self) -> Result<()> {
        let settings = Settings::load(&self.config_path)?;
        self.stop_clients().await;
        self.allocator.write().await.reload(&settings.dhcp4).await
    }

    /// Runs one admin command with the gate raised: no two commands overlap,
    /// and incoming relay connections are refused for the duration.
    pub async fn handle_command(&self, cmd: &Command) -> CmdResult {
        let _guard = self.cmd_lock.lock().await;
        self.during_reconfig.store(true, Ordering::SeqCst);
        let result = self.execute_command(cmd).await;
        self.during_reconfig.store(false, Ordering::SeqCst);
        result
    }

    async fn execute_command(&self, cmd: &Command) -> CmdResult {
        match cmd {
            Command::Reconfig => {
                if let Err(err) = self.reload_conf().await {
                    // the running config must stay valid at all times
                    panic!("reload config file failed: {err}");
                }
                CmdResult::ok()
            }
            Command::GetClientCount => {
                CmdResult::ok_with(json!(self.clients.lock().await.len()))
            }
            Command::Stop => {
                self.stop().await;
                CmdResult::ok()
            }
            Command::AddSubnet(args) => {
                self.stop_clients().await;
                let outcome = self
                    .allocator
                    .write()
                    .await
                    .add_subnet(args.id, args.valid_lifetime)
                    .await;
                report("add subnet", outcome)
            }
            Command::DeleteSubnet(args) => {
                self.stop_clients().await;
                let outcome = self.allocator.write().await.delete_subnet(args.id).await;
                report("delete subnet", outcome)
            }
            Command::UpdateSubnet(args) => {
                self.stop_clients().await;
                let outcome = self
                    .allocator
                    .write()
                    .await
                    .update_subnet(args.id, args.valid_lifetime)
                    .await;
                report("update subnet", outcome)
            }
            Command::AddPool(args) => {
                self.stop_clients().await;
                report("add pool", self.add_pool(args).await)
            }
            Command::DeletePool(args) => {
                self.stop_clients().await;
                report("delete pool", self.delete_pool(args).await)
            }
            Command::AddSharedNetwork(args) => {
                self.stop_clients().await;
                self.allocator
                    .write()
                    .await
                    .add_shared_network(&args.name, args.subnet_ids.clone());
                CmdResult::ok()
            }
            Command::DeleteSharedNetwork(args) => {
                self.stop_clients().await;
                self.allocator.write().await.delete_shared_network(&args.name);
                CmdResult::ok()
            }
            Command::UpdateSharedNetwork(args) => {
                self.stop_clients().await;
                self.allocator
                    .write()
                    .await
                    .update_shared_network(&args.name, args.subnet_ids.clone());
                CmdResult::ok()
            }
        }
    }

    /// `AddPool` carries either an address range or a host reservation; a
    /// non-empty `hw-address` selects the latter.
    async fn add_pool(&self, args: &crate::admin::PoolArgs) -> Result<()> {
        let mut allocator = self.allocator.write().await;
        if args.hw_address.is_empty() {
            let pool = Pool::from_parts(&args.start_ip, &args.end_ip)?;
            allocator.add_pool(args.id, pool, args.reserved).await
        } else {
            let host = Host::parse(&args.hw_address, &args.ip_address)?;
            allocator.add_reservation(args.id, host).await
        }
    }

    async fn delete_pool(&self, args: &crate::admin::PoolArgs) -> Result<()> {
        let mut allocator = self.allocator.write().await;
        if args.hw_address.is_empty() {
            let pool = Pool::from_parts(&args.start_ip, &args.end_ip)?;
            allocator.delete_pool(args.id, pool, args.reserved).await
        } else {
            let host = Host::parse(&args.hw_address, &args.ip_address)?;
            allocator.delete_reservation(args.id, host).await
        }
    }
}

fn report(action: &str, outcome: Result<()>) -> CmdResult {
    match outcome {
        Ok(()) => CmdResult::ok(),
        Err(err) => {
            error!(%err, "{action} failed");
            CmdResult::failed()
        }
    }
}

async fn accept_loop(server: Arc<Server>, listener: TcpListener) {
    let mut shutdown = server.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                if let Err(err) = stream.set_linger(Some(Duration::ZERO)) {
                    debug!(%err, "failed to disable linger");
                }
                // refuse relays while an admin command is mutating the engines
                if server.during_reconfig.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                info!(%peer, "relay connected");
                register_client(&server, stream).await;
            }
        }
    }
}

async fn register_client(server: &Arc<Server>, stream: TcpStream) {
    let id = server.next_client_id.fetch_add(1, Ordering::Relaxed);
    let (stop, stop_rx) = oneshot::channel();
    let task = tokio::spawn(client_loop(Arc::clone(server), stream, id, stop_rx));
    server
        .clients
        .lock()
        .await
        .insert(id, ClientHandle { stop, task });
}

/// One relay connection: read a framed request, decide, write the result.
async fn client_loop(
    server: Arc<Server>,
    stream: TcpStream,
    id: u64,
    mut stop: oneshot::Receiver<()>,
) {
    let peer = stream.peer_addr().ok();
    let mut framed = Framed::new(stream, RequestCodec);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            frame = framed.next() => match frame {
                Some(Ok(ctx)) => {
                    let result = server.allocator.read().await.handle_request(ctx).await;
                    if let Err(err) = framed.send(result).await {
                        error!(%err, "writing lease result failed");
                        break;
                    }
                }
                Some(Err(err)) => {
                    error!(%err, "reading lease request failed");
                    break;
                }
                None => break,
            },
        }
    }
    info!(?peer, "relay disconnected");
    server.clients.lock().await.remove(&id);
}
