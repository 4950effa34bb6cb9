pub mod catalog;
pub mod command;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod locator;
pub mod network;
pub mod power;
pub mod provision;
pub mod retry;
pub mod ssh;
pub mod types;

use async_trait::async_trait;

pub use config::{Capabilities, DEFAULTS, Defaults, DriverConfig, Timings};
pub use driver::KamateraDriver;
pub use retry::Cancellation;
pub use types::{DriverState, MachineState, ProvisionState};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid server options: {0}")]
    Validation(String),

    #[error(transparent)]
    Api(#[from] kamatera_api::Error),

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last: Box<Error>,
    },

    #[error("kamatera {operation} command {command_id} finished with status {status}: {description}")]
    CommandFailed {
        operation: &'static str,
        command_id: kamatera_api::CommandId,
        status: String,
        description: String,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0} is not supported by this driver configuration")]
    Unsupported(&'static str),

    #[error("ssh bootstrap failed: {0}")]
    Ssh(String),

    #[error("could not generate ssh key: {0}")]
    KeyGeneration(String),

    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },

    #[error("{operation} did not finish before its deadline")]
    DeadlineExceeded { operation: &'static str },

    #[error("kamatera server not found: {0}")]
    ServerNotFound(String),

    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} is not known yet")]
    NotReady(&'static str),

    #[error("machine is not running (state: {0})")]
    NotRunning(MachineState),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Network failures and ambiguous statuses that a bounded retry may fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_transient())
    }

    /// HTTP 500 from the provider.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_rejected())
    }

    /// Last HTTP status observed, looking through retry exhaustion.
    pub fn status(&self) -> Option<kamatera_api::StatusCode> {
        match self {
            Self::Api(e) => e.status(),
            Self::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle verbs a machine-orchestration tool drives a provider through.
///
/// Stateful verbs take `&mut self`: a driver instance handles one machine
/// and memoizes what it learns (server id, address) along the way.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    /// Provider identifier.
    fn driver_name(&self) -> &'static str;

    /// Validate the requested options against the provider's live catalog.
    async fn pre_create_check(&mut self) -> Result<()>;

    /// Create the server and install the SSH key on it.
    async fn create(&mut self) -> Result<()>;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    async fn restart(&mut self) -> Result<()>;

    /// Hard stop. Providers without a separate kill map it to stop.
    async fn kill(&mut self) -> Result<()>;

    /// Destroy the server permanently.
    async fn remove(&mut self) -> Result<()>;

    /// Current state. Lookup failures report `Starting`, never an error.
    async fn get_state(&self) -> Result<MachineState>;

    /// Docker endpoint of a running machine.
    async fn get_url(&self) -> Result<String>;

    fn get_ssh_hostname(&self) -> Result<String>;
}
