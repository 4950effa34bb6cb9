//! The create flow: submit the server, follow its command to completion,
//! wait for the guest to boot and install the SSH key.
//!
//! Progress is written into a [`DriverState`] after every step so a caller
//! that persists it can resume an interrupted create from the command id.

use std::path::Path;
use std::sync::LazyLock;

use kamatera_api::{CommandId, CreateServerForm, KamateraClient, NetworkAttachment};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::command::CommandTracker;
use crate::config::Timings;
use crate::credentials::{generate_name_suffix, generate_password, server_name};
use crate::network::AddressPool;
use crate::power::PowerController;
use crate::retry::{Cancellation, with_retry};
use crate::ssh::{BootstrapError, KeyGenerator, SshBootstrapper};
use crate::types::{AddressPlan, DriverState, MachineState, ProvisionState, ResolvedConfig};
use crate::{Error, Result};

/// First dotted quad surrounded by spaces in a command log.
static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r" ([0-9]+\.[0-9]+\.[0-9]+\.[0-9]+) ").expect("address pattern compiles")
});

pub fn extract_address(log: &str) -> Result<String> {
    ADDRESS
        .captures(log)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::Parse("failed to find server ip address in the create command log".into()))
}

pub struct ProvisionOrchestrator<'a> {
    pub client: &'a KamateraClient,
    pub tracker: &'a CommandTracker,
    pub power: &'a PowerController,
    pub keys: &'a dyn KeyGenerator,
    pub bootstrapper: &'a dyn SshBootstrapper,
    pub timings: &'a Timings,
    pub cancel: &'a Cancellation,
    pub ssh_user: &'a str,
    pub ssh_port: u16,
}

impl ProvisionOrchestrator<'_> {
    /// Drive `state` to [`ProvisionState::Done`].
    ///
    /// `resolved` is only needed when `state` holds no create command id
    /// yet. On any failure the state is left at [`ProvisionState::Failed`]
    /// with everything learned so far still recorded.
    pub async fn run(
        &self,
        resolved: Option<&ResolvedConfig>,
        machine_name: &str,
        ssh_key_path: &Path,
        state: &mut DriverState,
    ) -> Result<()> {
        let result = self.drive(resolved, machine_name, ssh_key_path, state).await;
        if let Err(e) = &result {
            error!(machine = machine_name, step = %state.provision, error = %e, "server creation failed");
            state.provision = ProvisionState::Failed;
        }
        result
    }

    async fn drive(
        &self,
        resolved: Option<&ResolvedConfig>,
        machine_name: &str,
        ssh_key_path: &Path,
        state: &mut DriverState,
    ) -> Result<()> {
        let command_id = match state.create_command_id {
            Some(id) => {
                info!(command_id = %id, "resuming from existing create server command");
                id
            }
            None => {
                let resolved = resolved.ok_or_else(|| {
                    Error::MissingConfig("validated server options are required to submit a server".into())
                })?;
                self.submit(resolved, machine_name, state).await?
            }
        };

        state.provision = ProvisionState::AwaitingCommand;
        info!(%command_id, "waiting for create server command to complete");
        let command = self
            .tracker
            .wait_complete("create server", command_id, self.timings.poll_interval, self.cancel)
            .await?;

        if state.server_name.is_none() && !command.server.is_empty() {
            state.server_name = Some(command.server.clone());
        }
        let name = state
            .server_name
            .clone()
            .ok_or_else(|| Error::MissingConfig("server name for the create command".into()))?;

        let ip = extract_address(&command.log)?;
        info!(server = %name, %ip, "server created");
        state.ip_address = Some(ip.clone());
        state.provision = ProvisionState::AddressExtracted;

        let public_key = self.keys.generate(ssh_key_path).await?;

        state.provision = ProvisionState::AwaitingGuestReady;
        self.wait_until_running(&name).await?;

        state.provision = ProvisionState::BootstrappingSsh;
        let password = state
            .password
            .clone()
            .ok_or_else(|| Error::MissingConfig("initial root password for the ssh bootstrap".into()))?;
        self.bootstrap(&ip, &password, &public_key).await?;

        state.password = None;
        state.provision = ProvisionState::Done;
        info!(server = %name, %ip, "server is ready");
        Ok(())
    }

    async fn submit(
        &self,
        resolved: &ResolvedConfig,
        machine_name: &str,
        state: &mut DriverState,
    ) -> Result<CommandId> {
        state.provision = ProvisionState::Submitting;
        let password = state.password.get_or_insert_with(generate_password).clone();

        let (network_name, mut pool) = match &resolved.network {
            AddressPlan::AutoAssign { network, pool } => {
                (Some(network.as_str()), Some(AddressPool::new(pool.iter().cloned())))
            }
            AddressPlan::Explicit { network, .. } => (Some(network.as_str()), None),
            AddressPlan::None => (None, None),
        };
        let auto_assign = pool.is_some();
        let request = &resolved.request;
        let client = self.client;

        // A 200 means the server is queued, so a body that fails to decode
        // is never resubmitted.
        let is_retryable = |e: &Error| e.is_transient() || (auto_assign && e.is_rejected());

        let (command_id, name) = with_retry(
            "create server",
            &self.timings.create_retry,
            self.cancel,
            is_retryable,
            |attempt| {
                let name = server_name(machine_name, &generate_name_suffix());
                let private_network = match (&resolved.network, pool.as_mut()) {
                    (AddressPlan::Explicit { network, ip }, _) => Ok(Some(NetworkAttachment {
                        name: network.clone(),
                        ip: ip.clone(),
                    })),
                    (AddressPlan::AutoAssign { network, .. }, Some(pool)) => match pool.draw() {
                        Some(ip) => {
                            debug!(%ip, remaining = pool.remaining(), "drew private network address");
                            Ok(Some(NetworkAttachment {
                                name: network.clone(),
                                ip,
                            }))
                        }
                        None => Err(Error::Validation(format!(
                            "no available ips left in private network {}",
                            network_name.unwrap_or_default()
                        ))),
                    },
                    _ => Ok(None),
                };
                let form = private_network.map(|private_network| CreateServerForm {
                    datacenter: request.datacenter.clone(),
                    name: name.clone(),
                    password: password.clone(),
                    cpu: request.cpu.clone(),
                    ram_mb: request.ram_mb,
                    billing: request.billing.clone(),
                    traffic: resolved.traffic_id().to_string(),
                    disk_size_gb: request.disk_size_gb,
                    disk_image_id: resolved.disk_image_id.clone(),
                    private_network,
                });

                async move {
                    let form = form?;
                    info!(
                        attempt,
                        server = %form.name,
                        datacenter = %form.datacenter,
                        private_ip = form.private_network.as_ref().map(|n| n.ip.as_str()),
                        "submitting create server request"
                    );
                    let command_id = client.create_server(&form).await?;
                    Ok((command_id, name))
                }
            },
        )
        .await?;

        info!(%command_id, server = %name, "create server command submitted");
        state.create_command_id = Some(command_id);
        state.server_name = Some(name);
        Ok(command_id)
    }

    async fn wait_until_running(&self, server_name: &str) -> Result<()> {
        const OPERATION: &str = "wait for server to start";
        let cancel = self.cancel.clone().with_timeout(self.timings.guest_ready_timeout);

        info!(server = server_name, "waiting for server to start");
        loop {
            match self.power.get_state(Some(server_name), &cancel).await {
                MachineState::Running => return Ok(()),
                other => debug!(server = server_name, state = %other, "server not running yet"),
            }
            cancel.sleep(OPERATION, self.timings.poll_interval).await?;
        }
    }

    async fn bootstrap(&self, ip: &str, password: &str, public_key: &str) -> Result<()> {
        const OPERATION: &str = "ssh bootstrap";
        let cancel = self.cancel.clone().with_timeout(self.timings.ssh_bootstrap_timeout);

        info!(%ip, port = self.ssh_port, "installing ssh key");
        let mut attempt = 0u32;
        loop {
            cancel.check(OPERATION)?;
            attempt += 1;
            match self
                .bootstrapper
                .install_key(ip, self.ssh_port, self.ssh_user, password, public_key)
                .await
            {
                Ok(()) => {
                    info!(%ip, attempt, "ssh key installed");
                    return Ok(());
                }
                Err(BootstrapError::Connect(e)) => {
                    if attempt % 10 == 0 {
                        warn!(%ip, attempt, error = %e, "ssh still not reachable");
                    } else {
                        debug!(%ip, attempt, error = %e, "ssh not reachable yet");
                    }
                }
                Err(BootstrapError::Remote(e)) => return Err(Error::Ssh(e)),
            }
            cancel.sleep(OPERATION, self.timings.poll_interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_first_dotted_quad_between_spaces() {
        let log = "Server created\nIP address 185.53.1.2 on wan, 172.16.0.4 on lan\n";
        assert_eq!(extract_address(log).unwrap(), "185.53.1.2");
    }

    #[test]
    fn address_must_be_space_delimited() {
        assert_eq!(
            extract_address("done: eth0 10.0.0.7 up").unwrap(),
            "10.0.0.7"
        );
        let err = extract_address("ip=10.0.0.7,gw=10.0.0.1").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn pattern_is_reused_across_calls() {
        for i in 1..=5 {
            let log = format!("created, address 198.51.100.{i} assigned");
            assert_eq!(extract_address(&log).unwrap(), format!("198.51.100.{i}"));
        }
    }

    #[test]
    fn log_without_address_is_a_parse_error() {
        let err = extract_address("Server created successfully").unwrap_err();
        assert!(matches!(err, Error::Parse(ref m) if m.contains("ip address")));
        assert!(extract_address("").is_err());
    }
}
