use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::server::Server;

const IO_DEADLINE: Duration = Duration::from_secs(3);
const MAX_CMD_LEN: i16 = 10240;

/// Administrative commands, JSON-encoded on the wire with the variant as the
/// outer tag, e.g. `"Reconfig"` or `{"AddSubnet": {"id": 3, ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Reconfig,
    GetClientCount,
    Stop,
    AddSubnet(SubnetArgs),
    DeleteSubnet(SubnetRef),
    UpdateSubnet(SubnetArgs),
    AddPool(PoolArgs),
    DeletePool(PoolArgs),
    AddSharedNetwork(SharedNetworkArgs),
    DeleteSharedNetwork(SharedNetworkRef),
    UpdateSharedNetwork(SharedNetworkArgs),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetArgs {
    pub id: u32,
    #[serde(rename = "default-valid-lifetime", default)]
    pub valid_lifetime: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetRef {
    pub id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolArgs {
    pub id: u32,
    #[serde(rename = "start-ip", default)]
    pub start_ip: String,
    #[serde(rename = "end-ip", default)]
    pub end_ip: String,
    #[serde(rename = "hw-address", default)]
    pub hw_address: String,
    #[serde(rename = "ip-address", default)]
    pub ip_address: String,
    #[serde(rename = "reservated-addr", default)]
    pub reserved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedNetworkArgs {
    pub name: String,
    #[serde(rename = "subnet-ids", default)]
    pub subnet_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedNetworkRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdResult {
    pub succeed: bool,
    pub error_msg: String,
    pub result: Value,
}

impl CmdResult {
    pub fn ok() -> Self {
        Self {
            succeed: true,
            error_msg: String::new(),
            result: Value::Null,
        }
    }

    pub fn ok_with(result: Value) -> Self {
        Self {
            succeed: true,
            error_msg: String::new(),
            result,
        }
    }

    pub fn failed() -> Self {
        Self {
            succeed: false,
            error_msg: String::new(),
            result: Value::Null,
        }
    }

    pub fn unknown() -> Self {
        Self {
            succeed: false,
            error_msg: "unknown cmd".into(),
            result: Value::Null,
        }
    }
}

/// Serves the admin endpoint until a `Stop` command arrives. Each connection
/// runs its own command loop under 3 s per-I/O deadlines.
pub async fn run(server: Arc<Server>, ip: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((ip, port)).await?;
    info!(addr = %listener.local_addr()?, "command server listening");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "command accept failed");
                        continue;
                    }
                };
                info!(%peer, "client connected to command server");
                tokio::spawn(handle_conn(Arc::clone(&server), stream, stop_tx.clone()));
            }
        }
    }
    Ok(())
}

async fn handle_conn(server: Arc<Server>, mut stream: TcpStream, stop_tx: watch::Sender<bool>) {
    let peer = stream.peer_addr().ok();
    let mut got_stop = false;
    loop {
        let cmd = match read_command(&mut stream).await {
            Ok(cmd) => cmd,
            Err(_) => break,
        };
        let result = match &cmd {
            Some(cmd) => {
                debug!(?cmd, ?peer, "received command");
                server.handle_command(cmd).await
            }
            None => CmdResult::unknown(),
        };
        if write_result(&mut stream, &result).await.is_err() {
            break;
        }
        debug!(succeed = result.succeed, ?peer, "sent result");
        if matches!(cmd, Some(Command::Stop)) {
            got_stop = true;
            break;
        }
    }
    info!(?peer, "client disconnected from command server");
    if got_stop {
        let _ = stop_tx.send(true);
    }
}

/// `Ok(None)` means the frame arrived intact but didn't decode to a known
/// command.
async fn read_command(stream: &mut TcpStream) -> io::Result<Option<Command>> {
    let mut len_buf = [0u8; 2];
    with_deadline(stream.read_exact(&mut len_buf)).await?;
    let len = i16::from_be_bytes(len_buf);
    if len <= 0 || len > MAX_CMD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "cmd is too big"));
    }
    let mut buf = vec![0u8; len as usize];
    with_deadline(stream.read_exact(&mut buf)).await?;
    Ok(serde_json::from_slice(&buf).ok())
}

async fn write_result(stream: &mut TcpStream, result: &CmdResult) -> io::Result<()> {
    let payload = serde_json::to_vec(result)?;
    with_deadline(stream.write_all(&(payload.len() as u16).to_be_bytes())).await?;
    with_deadline(stream.write_all(&payload)).await?;
    Ok(())
}

async fn with_deadline<T>(fut: impl std::future::Future<Output = io::Result<T>>) -> io::Result<T> {
    timeout(IO_DEADLINE, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "admin io deadline exceeded"))?
}
