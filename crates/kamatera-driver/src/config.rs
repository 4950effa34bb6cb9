use std::path::PathBuf;
use std::time::Duration;

use kamatera_api::CommandId;

use crate::retry::{Backoff, RetryPolicy};
use crate::types::{PrivateNetworkRequest, ProvisionRequest};
use crate::{Error, Result};

/// Server options used when the caller does not choose one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Defaults {
    pub datacenter: &'static str,
    pub billing: &'static str,
    pub cpu: &'static str,
    pub ram_mb: u32,
    pub disk_size_gb: u32,
    pub image: &'static str,
}

pub const DEFAULTS: Defaults = Defaults {
    datacenter: "EU",
    billing: "hourly",
    cpu: "1B",
    ram_mb: 1024,
    disk_size_gb: 10,
    image: "ubuntu_server_18.04_64-bit",
};

impl Defaults {
    pub fn request(&self, machine_name: impl Into<String>) -> ProvisionRequest {
        ProvisionRequest {
            machine_name: machine_name.into(),
            datacenter: self.datacenter.into(),
            cpu: self.cpu.into(),
            ram_mb: self.ram_mb,
            disk_size_gb: self.disk_size_gb,
            image: self.image.into(),
            billing: self.billing.into(),
            traffic: None,
            private_network: None,
        }
    }
}

/// Optional features of the driver, switched by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_private_network: bool,
    pub supports_server_removal: bool,
    pub supports_traffic_packages: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_private_network: true,
            supports_server_removal: true,
            supports_traffic_packages: true,
        }
    }
}

/// Every interval, backoff and ceiling the driver waits on.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Catalog fetch: 10 attempts, attempt i waits i × 6 s.
    pub catalog_retry: RetryPolicy,
    /// Create submission: 10 attempts, attempt i waits i × 6 s.
    pub create_retry: RetryPolicy,
    /// Server list, power and terminate calls: 10 attempts, 2 s + i × 3 s.
    pub api_retry: RetryPolicy,
    pub poll_interval: Duration,
    /// Consecutive ambiguous statuses tolerated while polling a command.
    pub max_transient_polls: u32,
    /// Resubmissions of a power operation after a 500 while awaiting it.
    pub max_power_restarts: u32,
    pub guest_ready_timeout: Duration,
    pub ssh_bootstrap_timeout: Duration,
    pub ssh_connect_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        let six_seconds = Backoff::Linear {
            base: Duration::ZERO,
            step: Duration::from_secs(6),
        };
        Self {
            catalog_retry: RetryPolicy::new(10, six_seconds),
            create_retry: RetryPolicy::new(10, six_seconds),
            api_retry: RetryPolicy::new(
                10,
                Backoff::Linear {
                    base: Duration::from_secs(2),
                    step: Duration::from_secs(3),
                },
            ),
            poll_interval: Duration::from_secs(2),
            max_transient_polls: 10,
            max_power_restarts: 3,
            guest_ready_timeout: Duration::from_secs(20 * 60),
            ssh_bootstrap_timeout: Duration::from_secs(10 * 60),
            ssh_connect_timeout: Duration::from_secs(15),
        }
    }
}

impl Timings {
    /// Same attempt caps, no waiting. For tests and dry runs against mocks.
    pub fn immediate() -> Self {
        let none = Backoff::Linear {
            base: Duration::ZERO,
            step: Duration::ZERO,
        };
        Self {
            catalog_retry: RetryPolicy::new(10, none),
            create_retry: RetryPolicy::new(10, none),
            api_retry: RetryPolicy::new(10, none),
            poll_interval: Duration::ZERO,
            ssh_connect_timeout: Duration::from_secs(1),
            guest_ready_timeout: Duration::from_secs(5),
            ssh_bootstrap_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

/// Full configuration of one driver instance.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub api_client_id: String,
    pub api_secret: String,
    pub base_url: String,
    pub request: ProvisionRequest,
    /// Resume tracking this create command instead of submitting a new one.
    pub create_command_id: Option<CommandId>,
    /// Directory holding per-machine files (`<store>/machines/<name>/`).
    pub store_path: PathBuf,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub capabilities: Capabilities,
    pub timings: Timings,
}

impl DriverConfig {
    pub fn new(
        api_client_id: impl Into<String>,
        api_secret: impl Into<String>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            api_client_id: api_client_id.into(),
            api_secret: api_secret.into(),
            base_url: kamatera_api::DEFAULT_BASE_URL.into(),
            request: DEFAULTS.request(machine_name),
            create_command_id: None,
            store_path: PathBuf::from("."),
            ssh_user: "root".into(),
            ssh_port: 22,
            capabilities: Capabilities::default(),
            timings: Timings::default(),
        }
    }

    /// Create from env vars (a `.env` file is honoured):
    ///
    /// - `KAMATERA_API_CLIENT_ID`, `KAMATERA_API_SECRET` (required)
    /// - `KAMATERA_DATACENTER`, `KAMATERA_BILLING`, `KAMATERA_TRAFFIC`,
    ///   `KAMATERA_CPU`, `KAMATERA_RAM`, `KAMATERA_DISK_SIZE`, `KAMATERA_IMAGE`
    /// - `KAMATERA_CREATE_SERVER_COMMAND_ID` (0 or unset: submit a new server)
    /// - `KAMATERA_PRIVATE_NETWORK_NAME`, `KAMATERA_PRIVATE_NETWORK_IP`
    /// - `KAMATERA_API_URL`, `KAMATERA_STORAGE_PATH`
    pub fn from_env(machine_name: &str) -> Result<Self> {
        Self::from_env_with(machine_name, |_| None)
    }

    /// Like [`DriverConfig::from_env`], but `overrides` (command line flags,
    /// keyed by env var name) win over the environment.
    pub fn from_env_with(
        machine_name: &str,
        overrides: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(machine_name, |key| {
            overrides(key).or_else(|| std::env::var(key).ok())
        })
    }

    pub fn from_lookup(
        machine_name: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let client_id = var("KAMATERA_API_CLIENT_ID")
            .ok_or_else(|| Error::MissingConfig("KAMATERA_API_CLIENT_ID".into()))?;
        let secret = var("KAMATERA_API_SECRET")
            .ok_or_else(|| Error::MissingConfig("KAMATERA_API_SECRET".into()))?;

        let mut config = Self::new(client_id, secret, machine_name);
        let request = &mut config.request;

        if let Some(v) = var("KAMATERA_DATACENTER") {
            request.datacenter = v;
        }
        if let Some(v) = var("KAMATERA_BILLING") {
            request.billing = v;
        }
        if let Some(v) = var("KAMATERA_CPU") {
            request.cpu = v;
        }
        if let Some(v) = var("KAMATERA_IMAGE") {
            request.image = v;
        }
        request.traffic = var("KAMATERA_TRAFFIC");
        if let Some(v) = var("KAMATERA_RAM") {
            request.ram_mb = parse_number("KAMATERA_RAM", &v)?;
        }
        if let Some(v) = var("KAMATERA_DISK_SIZE") {
            request.disk_size_gb = parse_number("KAMATERA_DISK_SIZE", &v)?;
        }
        request.private_network = var("KAMATERA_PRIVATE_NETWORK_NAME").map(|name| {
            PrivateNetworkRequest {
                name,
                ip: var("KAMATERA_PRIVATE_NETWORK_IP"),
            }
        });

        if let Some(v) = var("KAMATERA_CREATE_SERVER_COMMAND_ID") {
            let id: i64 = parse_number("KAMATERA_CREATE_SERVER_COMMAND_ID", &v)?;
            config.create_command_id = (id != 0).then_some(CommandId(id));
        }
        if let Some(v) = var("KAMATERA_API_URL") {
            config.base_url = v;
        }
        if let Some(v) = var("KAMATERA_STORAGE_PATH") {
            config.store_path = PathBuf::from(v);
        }

        Ok(config)
    }

    /// Both API credentials must be non-empty.
    pub fn check_credentials(&self) -> Result<()> {
        if self.api_client_id.trim().is_empty() {
            return Err(Error::MissingConfig(
                "kamatera requires --kamatera-api-client-id to be set".into(),
            ));
        }
        if self.api_secret.trim().is_empty() {
            return Err(Error::MissingConfig(
                "kamatera requires --kamatera-api-secret to be set".into(),
            ));
        }
        Ok(())
    }

    pub fn machine_dir(&self) -> PathBuf {
        self.store_path
            .join("machines")
            .join(&self.request.machine_name)
    }

    /// Private key location; the public half sits next to it with `.pub`.
    pub fn ssh_key_path(&self) -> PathBuf {
        self.machine_dir().join("id_rsa")
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = DriverConfig::from_lookup(
            "web",
            lookup(&[("KAMATERA_API_CLIENT_ID", "id"), ("KAMATERA_API_SECRET", "s")]),
        )
        .unwrap();
        assert_eq!(config.request, DEFAULTS.request("web"));
        assert_eq!(config.create_command_id, None);
        assert_eq!(config.ssh_user, "root");
        assert_eq!(config.ssh_key_path(), PathBuf::from("./machines/web/id_rsa"));
    }

    #[test]
    fn missing_credentials_are_reported() {
        let err = DriverConfig::from_lookup("web", lookup(&[("KAMATERA_API_CLIENT_ID", "id")]))
            .unwrap_err();
        assert!(matches!(err, Error::MissingConfig(ref key) if key == "KAMATERA_API_SECRET"));
    }

    #[test]
    fn overrides_and_command_id() {
        let config = DriverConfig::from_lookup(
            "db",
            lookup(&[
                ("KAMATERA_API_CLIENT_ID", "id"),
                ("KAMATERA_API_SECRET", "s"),
                ("KAMATERA_DATACENTER", "US-NY2"),
                ("KAMATERA_RAM", "4096"),
                ("KAMATERA_BILLING", "monthly"),
                ("KAMATERA_TRAFFIC", "t-2"),
                ("KAMATERA_PRIVATE_NETWORK_NAME", "lan-1"),
                ("KAMATERA_CREATE_SERVER_COMMAND_ID", "555"),
            ]),
        )
        .unwrap();
        assert_eq!(config.request.datacenter, "US-NY2");
        assert_eq!(config.request.ram_mb, 4096);
        assert_eq!(config.request.traffic.as_deref(), Some("t-2"));
        assert_eq!(
            config.request.private_network,
            Some(PrivateNetworkRequest {
                name: "lan-1".into(),
                ip: None
            })
        );
        assert_eq!(config.create_command_id, Some(CommandId(555)));
    }

    #[test]
    fn zero_command_id_means_none_and_bad_numbers_fail() {
        let config = DriverConfig::from_lookup(
            "db",
            lookup(&[
                ("KAMATERA_API_CLIENT_ID", "id"),
                ("KAMATERA_API_SECRET", "s"),
                ("KAMATERA_CREATE_SERVER_COMMAND_ID", "0"),
            ]),
        )
        .unwrap();
        assert_eq!(config.create_command_id, None);

        let err = DriverConfig::from_lookup(
            "db",
            lookup(&[
                ("KAMATERA_API_CLIENT_ID", "id"),
                ("KAMATERA_API_SECRET", "s"),
                ("KAMATERA_DISK_SIZE", "big"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
