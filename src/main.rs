use anyhow::Result;
use clap::Parser;
use tracing::info;

use kea_master::{admin, config, Server, Settings};

#[derive(Parser, Debug)]
#[command(name = "kea_master")]
#[command(about = "Master node of a distributed DHCPv4 address-allocation service", long_about = None)]
struct Args {
    /// Command service ip
    #[arg(short = 'i', default_value = "127.0.0.1")]
    ip: String,

    /// Command service port
    #[arg(short = 'p', default_value_t = 6001)]
    port: u16,

    /// Config file
    #[arg(short = 'c', default_value = "kea.conf")]
    conf: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = Settings::load(&args.conf)?;
    config::init_tracing(settings.dhcp4.logging.as_ref())?;

    info!("starting kea master");
    let server = Server::new(&args.conf).await?;

    // serves admin commands until a Stop arrives
    admin::run(server, &args.ip, args.port).await?;

    info!("kea master stopped");
    Ok(())
}
