use std::fmt;

use kamatera_api::CommandId;
use serde::{Deserialize, Serialize};

/// Server options as requested by the caller, before catalog validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub machine_name: String,
    pub datacenter: String,
    pub cpu: String,
    pub ram_mb: u32,
    pub disk_size_gb: u32,
    /// Image description as listed in the catalog, not the image id.
    pub image: String,
    pub billing: String,
    pub traffic: Option<String>,
    pub private_network: Option<PrivateNetworkRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateNetworkRequest {
    pub name: String,
    /// Explicit address; `None` means draw one from the free pool.
    pub ip: Option<String>,
}

/// How the private NIC gets its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPlan {
    None,
    Explicit { network: String, ip: String },
    AutoAssign { network: String, pool: Vec<String> },
}

/// Monthly traffic package picked from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelection {
    pub id: String,
    pub description: String,
    /// No package was requested and the first listed one was substituted.
    pub defaulted: bool,
}

/// A request whose every catalog reference was found in the latest snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub request: ProvisionRequest,
    pub datacenter_name: String,
    pub disk_image_id: String,
    pub network: AddressPlan,
    pub traffic: Option<TrafficSelection>,
}

impl ResolvedConfig {
    pub fn traffic_id(&self) -> &str {
        self.traffic.as_ref().map(|t| t.id.as_str()).unwrap_or("")
    }
}

/// Generic lifecycle state reported to the orchestration tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Starting,
    Running,
    Stopped,
    Error,
}

impl MachineState {
    /// Map the provider's power string.
    pub fn from_power(power: &str) -> Self {
        match power {
            "on" => Self::Running,
            "off" => Self::Stopped,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps of the create flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    #[default]
    NotStarted,
    Submitting,
    AwaitingCommand,
    AddressExtracted,
    AwaitingGuestReady,
    BootstrappingSsh,
    Done,
    Failed,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Submitting => "submitting",
            Self::AwaitingCommand => "awaiting command",
            Self::AddressExtracted => "address extracted",
            Self::AwaitingGuestReady => "awaiting guest ready",
            Self::BootstrappingSsh => "bootstrapping ssh",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything a driver learns about its machine. Persist it between runs
/// to resume an interrupted create or to skip the server id lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverState {
    #[serde(default)]
    pub provision: ProvisionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_command_id: Option<CommandId>,
    /// Logical server name (`<machine>-<suffix>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Initial root password. Cleared once the SSH key is installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_strings_map_to_states() {
        assert_eq!(MachineState::from_power("on"), MachineState::Running);
        assert_eq!(MachineState::from_power("off"), MachineState::Stopped);
        assert_eq!(MachineState::from_power("suspended"), MachineState::Error);
    }

    #[test]
    fn driver_state_survives_json() {
        let state = DriverState {
            provision: ProvisionState::AwaitingCommand,
            create_command_id: Some(CommandId(77)),
            server_name: Some("web-abcdef".into()),
            server_id: None,
            password: Some("Abcdef123456".into()),
            ip_address: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"awaiting_command\""));
        assert!(!json.contains("server_id"));
        let back: DriverState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn empty_state_document_is_not_started() {
        let state: DriverState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.provision, ProvisionState::NotStarted);
        assert!(state.create_command_id.is_none());
    }
}
