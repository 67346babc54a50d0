pub mod settings;

use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::addr::MacParseError;
use crate::host::HostError;

pub use settings::Settings;

use settings::LoggingSettings;

/// Config-file and admin-command parsing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool ip range {0} isn't valid")]
    InvalidPoolRange(String),
    #[error("start {start} is bigger than end {end}")]
    InvalidRange { start: Ipv4Addr, end: Ipv4Addr },
    #[error("ip address {0} isn't valid")]
    InvalidIp(String),
    #[error(transparent)]
    InvalidMac(#[from] MacParseError),
    #[error(transparent)]
    Host(#[from] HostError),
}

const LOG_FILE_NAME: &str = "kea-master.log";

/// Installs the process-wide tracing subscriber according to the `logging`
/// config section: a log file under `log-file-dir` when enabled, console
/// errors only when explicitly disabled, console debug otherwise.
pub fn init_tracing(logging: Option<&LoggingSettings>) -> Result<()> {
    match logging {
        Some(conf) if conf.enable => {
            if conf.file_dir.is_empty() {
                bail!("log file dir is empty");
            }
            let level = match conf.level.as_str() {
                "debug" | "info" | "warn" | "error" => conf.level.as_str(),
                other => bail!("unknown log level: {other}"),
            };
            let path = Path::new(&conf.file_dir).join(LOG_FILE_NAME);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(format!("kea_master={level}"))),
                )
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        Some(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("error"))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("kea_master=debug")),
                )
                .init();
        }
    }
    Ok(())
}
