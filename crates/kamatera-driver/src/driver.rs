use async_trait::async_trait;
use kamatera_api::{KamateraClient, Power};
use tracing::{debug, info};

use crate::catalog::CatalogValidator;
use crate::command::CommandTracker;
use crate::config::DriverConfig;
use crate::locator::ServerLocator;
use crate::power::PowerController;
use crate::provision::ProvisionOrchestrator;
use crate::retry::{Cancellation, with_retry};
use crate::ssh::{KeyGenerator, RusshBootstrapper, SshBootstrapper, SshKeygen};
use crate::types::{DriverState, MachineState, ResolvedConfig};
use crate::{Error, MachineDriver, Result};

pub const DRIVER_NAME: &str = "kamatera";

/// Docker daemon port exposed by provisioned machines.
pub const DOCKER_PORT: u16 = 2376;

/// One Kamatera machine, driven through the [`MachineDriver`] verbs.
pub struct KamateraDriver {
    config: DriverConfig,
    client: KamateraClient,
    tracker: CommandTracker,
    power: PowerController,
    locator: ServerLocator,
    keys: Box<dyn KeyGenerator>,
    bootstrapper: Box<dyn SshBootstrapper>,
    cancel: Cancellation,
    resolved: Option<ResolvedConfig>,
    state: DriverState,
}

impl KamateraDriver {
    pub fn new(config: DriverConfig) -> Self {
        let timings = &config.timings;
        let client = KamateraClient::new(&config.api_client_id, &config.api_secret)
            .with_base_url(&config.base_url);
        let tracker = CommandTracker::new(client.clone(), timings.max_transient_polls);
        let power = PowerController::new(
            client.clone(),
            tracker.clone(),
            timings.api_retry,
            timings.poll_interval,
            timings.max_power_restarts,
        );
        let locator = ServerLocator::new(client.clone(), timings.api_retry);
        let bootstrapper = Box::new(RusshBootstrapper::new(timings.ssh_connect_timeout));
        let state = DriverState {
            create_command_id: config.create_command_id,
            ..DriverState::default()
        };

        Self {
            client,
            tracker,
            power,
            locator,
            keys: Box::new(SshKeygen),
            bootstrapper,
            cancel: Cancellation::none(),
            resolved: None,
            state,
            config,
        }
    }

    /// Replace how key pairs are created and installed.
    pub fn with_ssh(
        mut self,
        keys: impl KeyGenerator + 'static,
        bootstrapper: impl SshBootstrapper + 'static,
    ) -> Self {
        self.keys = Box::new(keys);
        self.bootstrapper = Box::new(bootstrapper);
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Continue from state persisted by an earlier run. A create command id
    /// from the configuration takes precedence over a persisted one.
    pub fn with_state(mut self, mut state: DriverState) -> Self {
        if let Some(id) = self.config.create_command_id {
            state.create_command_id = Some(id);
        }
        if let (Some(name), Some(id)) = (&state.server_name, &state.server_id) {
            self.locator.remember(name.clone(), id.clone());
        }
        self.state = state;
        self
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn server_name(&self) -> Result<String> {
        self.state
            .server_name
            .clone()
            .ok_or(Error::NotReady("kamatera server name"))
    }

    async fn switch_power(&mut self, power: Power) -> Result<()> {
        let name = self.server_name()?;
        self.power
            .set_power(&mut self.locator, &name, power, &self.cancel)
            .await?;
        self.remember_server_id(&name);
        Ok(())
    }

    fn remember_server_id(&mut self, name: &str) {
        if self.state.server_id.is_none() {
            self.state.server_id = self.locator.cached(name).map(str::to_string);
        }
    }
}

#[async_trait]
impl MachineDriver for KamateraDriver {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn pre_create_check(&mut self) -> Result<()> {
        if let Some(command_id) = self.state.create_command_id {
            info!(%command_id, "create server command already submitted, skipping server options validation");
            return Ok(());
        }
        self.config.check_credentials()?;

        let validator = CatalogValidator::new(
            self.client.clone(),
            self.config.capabilities,
            self.config.timings.catalog_retry,
        );
        let resolved = validator.validate(&self.config.request, &self.cancel).await?;
        self.resolved = Some(resolved);
        Ok(())
    }

    async fn create(&mut self) -> Result<()> {
        self.config.check_credentials()?;
        if self.state.create_command_id.is_none() && self.resolved.is_none() {
            self.pre_create_check().await?;
        }

        let key_path = self.config.ssh_key_path();
        let orchestrator = ProvisionOrchestrator {
            client: &self.client,
            tracker: &self.tracker,
            power: &self.power,
            keys: self.keys.as_ref(),
            bootstrapper: self.bootstrapper.as_ref(),
            timings: &self.config.timings,
            cancel: &self.cancel,
            ssh_user: &self.config.ssh_user,
            ssh_port: self.config.ssh_port,
        };
        orchestrator
            .run(
                self.resolved.as_ref(),
                &self.config.request.machine_name,
                &key_path,
                &mut self.state,
            )
            .await?;

        let name = self.server_name()?;
        match self.locator.resolve_id(&name, &self.cancel).await {
            Ok(_) => self.remember_server_id(&name),
            Err(e) => debug!(server = %name, error = %e, "server id not resolved after create"),
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.switch_power(Power::On).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.switch_power(Power::Off).await
    }

    async fn restart(&mut self) -> Result<()> {
        self.switch_power(Power::Restart).await
    }

    async fn kill(&mut self) -> Result<()> {
        self.stop().await
    }

    async fn remove(&mut self) -> Result<()> {
        if !self.config.capabilities.supports_server_removal {
            return Err(Error::Unsupported("server removal"));
        }
        let name = self.server_name()?;
        let server_id = self.locator.resolve_id(&name, &self.cancel).await?;
        info!(server = %name, %server_id, "terminating server");

        let client = &self.client;
        let server_id = server_id.as_str();
        let command_id = with_retry(
            "terminate server",
            &self.config.timings.api_retry,
            &self.cancel,
            Error::is_transient,
            |attempt| async move {
                debug!(server_id, attempt, "submitting terminate request");
                Ok(client.terminate_server(server_id).await?)
            },
        )
        .await?;

        info!(server = %name, %command_id, "terminate server command submitted");
        Ok(())
    }

    async fn get_state(&self) -> Result<MachineState> {
        Ok(self
            .power
            .get_state(self.state.server_name.as_deref(), &self.cancel)
            .await)
    }

    async fn get_url(&self) -> Result<String> {
        let ip = self.get_ssh_hostname()?;
        match self.get_state().await? {
            MachineState::Running => Ok(format!("tcp://{ip}:{DOCKER_PORT}")),
            other => Err(Error::NotRunning(other)),
        }
    }

    fn get_ssh_hostname(&self) -> Result<String> {
        self.state
            .ip_address
            .clone()
            .ok_or(Error::NotReady("machine ip address"))
    }
}
