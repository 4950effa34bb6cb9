mod state;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use kamatera_driver::{Cancellation, DriverConfig, KamateraDriver, MachineDriver};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::state::StateFile;

#[derive(Parser)]
#[command(name = "kamatera-machine", version)]
#[command(about = "Create and manage docker hosts on Kamatera cloud servers", long_about = None)]
struct Cli {
    /// Kamatera API client id
    #[arg(long, env = "KAMATERA_API_CLIENT_ID", global = true)]
    kamatera_api_client_id: Option<String>,

    /// Kamatera API secret
    #[arg(long, env = "KAMATERA_API_SECRET", hide_env_values = true, global = true)]
    kamatera_api_secret: Option<String>,

    /// Kamatera API endpoint
    #[arg(long, env = "KAMATERA_API_URL", global = true)]
    kamatera_api_url: Option<String>,

    /// Directory holding per-machine keys and state
    #[arg(long, env = "KAMATERA_STORAGE_PATH", global = true)]
    storage_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a server and install an ssh key on it
    Create {
        /// Machine name; the server is named <name>-<random suffix>
        name: String,

        #[command(flatten)]
        options: CreateOptions,
    },
    /// Power on
    Start(Target),
    /// Power off
    Stop(Target),
    /// Power cycle
    Restart(Target),
    /// Power off (no separate hard stop exists)
    Kill(Target),
    /// Terminate the server
    Remove(Target),
    /// Print the machine state
    State(Target),
    /// Print the docker url of a running machine
    Url(Target),
    /// Print the address to ssh to
    SshHostname(Target),
}

#[derive(Args)]
struct CreateOptions {
    /// Datacenter code [default: EU]
    #[arg(long, env = "KAMATERA_DATACENTER")]
    kamatera_datacenter: Option<String>,

    /// hourly or monthly [default: hourly]
    #[arg(long, env = "KAMATERA_BILLING")]
    kamatera_billing: Option<String>,

    /// Traffic package id, monthly billing only
    #[arg(long, env = "KAMATERA_TRAFFIC")]
    kamatera_traffic: Option<String>,

    /// CPU type and count, e.g. 2B [default: 1B]
    #[arg(long, env = "KAMATERA_CPU")]
    kamatera_cpu: Option<String>,

    /// RAM in MB [default: 1024]
    #[arg(long, env = "KAMATERA_RAM")]
    kamatera_ram: Option<String>,

    /// Disk size in GB [default: 10]
    #[arg(long, env = "KAMATERA_DISK_SIZE")]
    kamatera_disk_size: Option<String>,

    /// Image description [default: ubuntu_server_18.04_64-bit]
    #[arg(long, env = "KAMATERA_IMAGE")]
    kamatera_image: Option<String>,

    /// Continue an interrupted create
    #[arg(long, env = "KAMATERA_CREATE_SERVER_COMMAND_ID")]
    kamatera_create_server_command_id: Option<String>,

    /// Attach a second NIC to this private network
    #[arg(long, env = "KAMATERA_PRIVATE_NETWORK_NAME")]
    kamatera_private_network_name: Option<String>,

    /// Address on the private network, random when unset
    #[arg(long, env = "KAMATERA_PRIVATE_NETWORK_IP")]
    kamatera_private_network_ip: Option<String>,
}

#[derive(Args)]
struct Target {
    /// Machine name given at create
    name: String,

    /// Kamatera server name, overriding the saved state
    #[arg(long)]
    server_name: Option<String>,

    /// Server address, overriding the saved state
    #[arg(long)]
    ip: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Driver(#[from] kamatera_driver::Error),

    #[error(transparent)]
    State(#[from] state::StateError),
}

impl Cli {
    /// Flag values keyed by the env var they override.
    fn flag(&self, key: &str) -> Option<String> {
        let global = match key {
            "KAMATERA_API_CLIENT_ID" => &self.kamatera_api_client_id,
            "KAMATERA_API_SECRET" => &self.kamatera_api_secret,
            "KAMATERA_API_URL" => &self.kamatera_api_url,
            "KAMATERA_STORAGE_PATH" => {
                return self.storage_path.as_ref().map(|p| p.display().to_string());
            }
            _ => match &self.command {
                Commands::Create { options, .. } => return options.flag(key),
                _ => return None,
            },
        };
        global.clone()
    }

    fn target(&self) -> Option<&Target> {
        match &self.command {
            Commands::Create { .. } => None,
            Commands::Start(t)
            | Commands::Stop(t)
            | Commands::Restart(t)
            | Commands::Kill(t)
            | Commands::Remove(t)
            | Commands::State(t)
            | Commands::Url(t)
            | Commands::SshHostname(t) => Some(t),
        }
    }

    fn machine_name(&self) -> &str {
        match &self.command {
            Commands::Create { name, .. } => name,
            _ => self.target().map(|t| t.name.as_str()).unwrap_or_default(),
        }
    }
}

impl CreateOptions {
    fn flag(&self, key: &str) -> Option<String> {
        let value = match key {
            "KAMATERA_DATACENTER" => &self.kamatera_datacenter,
            "KAMATERA_BILLING" => &self.kamatera_billing,
            "KAMATERA_TRAFFIC" => &self.kamatera_traffic,
            "KAMATERA_CPU" => &self.kamatera_cpu,
            "KAMATERA_RAM" => &self.kamatera_ram,
            "KAMATERA_DISK_SIZE" => &self.kamatera_disk_size,
            "KAMATERA_IMAGE" => &self.kamatera_image,
            "KAMATERA_CREATE_SERVER_COMMAND_ID" => &self.kamatera_create_server_command_id,
            "KAMATERA_PRIVATE_NETWORK_NAME" => &self.kamatera_private_network_name,
            "KAMATERA_PRIVATE_NETWORK_IP" => &self.kamatera_private_network_ip,
            _ => return None,
        };
        value.clone()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping at the next wait");
            let _ = shutdown_tx.send(true);
        }
    });

    match run(cli, Cancellation::none().with_shutdown(shutdown_rx)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, cancel: Cancellation) -> Result<(), CliError> {
    let config = DriverConfig::from_env_with(cli.machine_name(), |key| cli.flag(key))?;
    let state_file = StateFile::for_machine(&config.machine_dir());
    let mut saved = state_file.load()?;

    if let Some(target) = cli.target() {
        if let Some(name) = &target.server_name {
            if saved.server_name.as_ref() != Some(name) {
                saved.server_id = None;
            }
            saved.server_name = Some(name.clone());
        }
        if let Some(ip) = &target.ip {
            saved.ip_address = Some(ip.clone());
        }
    }

    let mut driver = KamateraDriver::new(config)
        .with_cancellation(cancel)
        .with_state(saved);

    match &cli.command {
        Commands::Create { .. } => {
            // Saved even on failure so the next run can resume.
            let result = create(&mut driver).await;
            state_file.save(driver.state())?;
            result?;

            let state = driver.state();
            println!(
                "{}\t{}",
                state.server_name.as_deref().unwrap_or_default(),
                state.ip_address.as_deref().unwrap_or_default()
            );
            return Ok(());
        }
        Commands::Start(_) => driver.start().await?,
        Commands::Stop(_) => driver.stop().await?,
        Commands::Restart(_) => driver.restart().await?,
        Commands::Kill(_) => driver.kill().await?,
        Commands::Remove(_) => {
            driver.remove().await?;
            state_file.clear()?;
            return Ok(());
        }
        Commands::State(_) => println!("{}", driver.get_state().await?),
        Commands::Url(_) => println!("{}", driver.get_url().await?),
        Commands::SshHostname(_) => println!("{}", driver.get_ssh_hostname()?),
    }

    state_file.save(driver.state())?;
    Ok(())
}

async fn create(driver: &mut KamateraDriver) -> kamatera_driver::Result<()> {
    driver.pre_create_check().await?;
    driver.create().await
}
