use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

// ── Ids ──────────────────────────────────────────────────────────────

/// Handle of an asynchronous job in the provider's command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub i64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Catalog ──────────────────────────────────────────────────────────

/// The provider's live menu of server options (`GET /service/server`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Datacenter code → display name.
    pub datacenters: HashMap<String, String>,
    pub cpu: Vec<String>,
    pub disk: Vec<u32>,
    pub billing: Vec<String>,
    #[serde(rename = "diskImages")]
    pub disk_images: HashMap<String, Vec<DiskImage>>,
    pub networks: HashMap<String, Vec<PrivateNetwork>>,
    pub traffic: HashMap<String, Vec<TrafficPackage>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiskImage {
    pub description: String,
    #[serde(deserialize_with = "loose_string")]
    pub id: String,
    #[serde(rename = "sizeGB")]
    pub size_gb: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PrivateNetwork {
    pub name: String,
    /// Addresses still free on this network.
    #[serde(deserialize_with = "address_list")]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrafficPackage {
    #[serde(deserialize_with = "loose_string")]
    pub id: String,
    pub info: String,
}

// ── Command queue ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommandInfo {
    #[serde(deserialize_with = "loose_string")]
    pub status: String,
    #[serde(deserialize_with = "loose_string")]
    pub server: String,
    #[serde(deserialize_with = "loose_string")]
    pub description: String,
    #[serde(deserialize_with = "loose_string")]
    pub log: String,
}

impl CommandInfo {
    pub fn command_status(&self) -> CommandStatus {
        CommandStatus::parse(&self.status)
    }
}

/// Status of a queued command. Anything the provider reports that is not
/// one of the terminal words is treated as still pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Pending(String),
    Complete,
    Error,
    Cancelled,
}

impl CommandStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "complete" => Self::Complete,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            other => Self::Pending(other.to_string()),
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(raw) if raw.is_empty() => f.write_str("pending"),
            Self::Pending(raw) => f.write_str(raw),
            Self::Complete => f.write_str("complete"),
            Self::Error => f.write_str("error"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

// ── Servers ──────────────────────────────────────────────────────────

/// One entry of `GET /service/servers`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSummary {
    #[serde(deserialize_with = "loose_string")]
    pub id: String,
    pub datacenter: String,
    pub name: String,
    pub power: String,
}

/// Target of a power operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    On,
    Off,
    Restart,
}

impl Power {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Private network attachment on the second NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub name: String,
    pub ip: String,
}

/// Fields of the form-encoded `POST /service/server` request.
#[derive(Debug, Clone)]
pub struct CreateServerForm {
    pub datacenter: String,
    pub name: String,
    pub password: String,
    pub cpu: String,
    pub ram_mb: u32,
    pub billing: String,
    pub traffic: String,
    pub disk_size_gb: u32,
    pub disk_image_id: String,
    pub private_network: Option<NetworkAttachment>,
}

impl CreateServerForm {
    /// Form fields in the order the console expects them. The first NIC is
    /// always the public `wan` network.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("datacenter", self.datacenter.clone()),
            ("name", self.name.clone()),
            ("password", self.password.clone()),
            ("cpu", self.cpu.clone()),
            ("ram", self.ram_mb.to_string()),
            ("billing", self.billing.clone()),
            ("traffic", self.traffic.clone()),
            ("disk_size_0", self.disk_size_gb.to_string()),
            ("disk_src_0", self.disk_image_id.clone()),
            ("network_name_0", "wan".to_string()),
            ("power", "1".to_string()),
            ("managed", "0".to_string()),
            ("backup", "0".to_string()),
        ];
        if let Some(net) = &self.private_network {
            fields.push(("network_name_1", net.name.clone()));
            fields.push(("network_ip_1", net.ip.clone()));
        }
        fields
    }
}

// ── Lenient field decoding ───────────────────────────────────────────

/// Accept strings, numbers, booleans and null for a string field; the
/// console is not consistent about quoting ids.
fn loose_string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(value_to_string(Value::deserialize(de)?))
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Network address lists arrive either as an array or as an object keyed
/// by address.
fn address_list<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    let ips = match Value::deserialize(de)? {
        Value::Array(items) => items
            .into_iter()
            .map(value_to_string)
            .filter(|ip| !ip.is_empty())
            .collect(),
        Value::Object(map) => map.into_iter().map(|(ip, _)| ip).collect(),
        Value::String(ip) if !ip.is_empty() => vec![ip],
        _ => Vec::new(),
    };
    Ok(ips)
}
