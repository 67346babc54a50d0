use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// The JSON config file, rooted at the `dhcp4` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub dhcp4: Dhcp4Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dhcp4Settings {
    /// Endpoint the lease-request RPC listens on.
    #[serde(rename = "kea-master-ip")]
    pub master_ip: String,
    #[serde(rename = "kea-master-port")]
    pub master_port: u16,
    #[serde(rename = "lease-database")]
    pub lease_database: DatabaseSettings,
    #[serde(default)]
    pub logging: Option<LoggingSettings>,
    #[serde(rename = "subnet4", default)]
    pub subnets: Vec<SubnetSettings>,
    #[serde(rename = "shared-network", default)]
    pub shared_networks: Vec<SharedNetworkSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    pub user: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(rename = "log-enable")]
    pub enable: bool,
    #[serde(rename = "log-file-dir", default)]
    pub file_dir: String,
    #[serde(rename = "log-level", default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "debug".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetSettings {
    pub id: u32,
    #[serde(rename = "default-valid-lifetime", default)]
    pub valid_lifetime: Option<u64>,
    #[serde(default)]
    pub pools: Vec<PoolSettings>,
    #[serde(default)]
    pub reservations: Vec<ReservationSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// `"start-end"` address range.
    pub pool: String,
    /// Marks the range as excluded from automatic allocation.
    #[serde(rename = "reservated-addr", default)]
    pub reserved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSettings {
    #[serde(rename = "hw-address")]
    pub hw_address: String,
    #[serde(rename = "ip-address")]
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedNetworkSettings {
    pub name: String,
    #[serde(rename = "subnet-ids", default)]
    pub subnet_ids: Vec<u32>,
}

impl Settings {
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("config file {} isn't valid", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "dhcp4": {
            "kea-master-ip": "0.0.0.0",
            "kea-master-port": 5771,
            "lease-database": {
                "host": "localhost",
                "user": "kea",
                "password": "kea",
                "name": "kea"
            },
            "logging": {
                "log-enable": true,
                "log-file-dir": "/var/log/kea",
                "log-level": "info"
            },
            "subnet4": [
                {
                    "id": 1,
                    "default-valid-lifetime": 3600,
                    "pools": [
                        {"pool": "10.0.0.1-10.0.0.100"},
                        {"pool": "10.0.0.200-10.0.0.210", "reservated-addr": true}
                    ],
                    "reservations": [
                        {"hw-address": "aa:bb:cc:dd:ee:01", "ip-address": "10.0.0.5"}
                    ]
                },
                {"id": 2, "pools": [{"pool": "10.1.0.1-10.1.0.100"}]}
            ],
            "shared-network": [
                {"name": "campus", "subnet-ids": [1, 2]}
            ]
        }
    }"#;

    #[test]
    fn parses_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load(file.path()).unwrap();
        let dhcp4 = &settings.dhcp4;
        assert_eq!(dhcp4.master_port, 5771);
        assert_eq!(dhcp4.lease_database.name, "kea");
        assert_eq!(dhcp4.subnets.len(), 2);
        assert_eq!(dhcp4.subnets[0].valid_lifetime, Some(3600));
        assert!(dhcp4.subnets[0].pools[1].reserved);
        assert_eq!(dhcp4.subnets[1].valid_lifetime, None);
        assert!(dhcp4.subnets[1].reservations.is_empty());
        assert_eq!(dhcp4.shared_networks[0].subnet_ids, vec![1, 2]);
        assert_eq!(dhcp4.logging.as_ref().unwrap().level, "info");
    }

    #[test]
    fn rejects_malformed_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"dhcp4\": {").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }
}
