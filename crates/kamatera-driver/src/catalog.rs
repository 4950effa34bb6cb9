use kamatera_api::{KamateraClient, ServerOptions};
use tracing::{debug, info, warn};

use crate::config::Capabilities;
use crate::retry::{Cancellation, RetryPolicy, with_retry};
use crate::types::{AddressPlan, ProvisionRequest, ResolvedConfig, TrafficSelection};
use crate::{Error, Result};

/// The catalog does not list RAM reliably per CPU class, so only a floor
/// is enforced.
pub const MIN_RAM_MB: u32 = 999;

pub const MONTHLY_BILLING: &str = "monthly";

/// Checks a [`ProvisionRequest`] against the provider's live catalog.
pub struct CatalogValidator {
    client: KamateraClient,
    capabilities: Capabilities,
    retry: RetryPolicy,
}

impl CatalogValidator {
    pub fn new(client: KamateraClient, capabilities: Capabilities, retry: RetryPolicy) -> Self {
        Self {
            client,
            capabilities,
            retry,
        }
    }

    /// Fetch a fresh catalog (retrying transient failures) and resolve the
    /// request against it. Validation failures are never retried.
    pub async fn validate(
        &self,
        request: &ProvisionRequest,
        cancel: &Cancellation,
    ) -> Result<ResolvedConfig> {
        let catalog = with_retry(
            "fetch server options",
            &self.retry,
            cancel,
            Error::is_transient,
            |attempt| async move {
                debug!(attempt, "fetching kamatera server options");
                Ok(self.client.server_options().await?)
            },
        )
        .await?;

        let resolved = resolve(request, &catalog, &self.capabilities)?;

        info!(
            datacenter = %resolved.datacenter_name,
            cpu = %request.cpu,
            ram_mb = request.ram_mb,
            disk_size_gb = request.disk_size_gb,
            image = %request.image,
            image_id = %resolved.disk_image_id,
            billing = %request.billing,
            "server options validated"
        );
        Ok(resolved)
    }
}

/// Resolve every catalog reference in `request`. Pure: no I/O.
pub fn resolve(
    request: &ProvisionRequest,
    catalog: &ServerOptions,
    capabilities: &Capabilities,
) -> Result<ResolvedConfig> {
    let datacenter_name = catalog
        .datacenters
        .get(&request.datacenter)
        .filter(|name| !name.is_empty())
        .cloned()
        .ok_or_else(|| Error::Validation(format!("invalid datacenter: {}", request.datacenter)))?;

    if !catalog.cpu.contains(&request.cpu) {
        return Err(Error::Validation(format!("invalid CPU: {}", request.cpu)));
    }

    if request.ram_mb < MIN_RAM_MB {
        return Err(Error::Validation(format!(
            "insufficient RAM ({} MB), please use at least 1GB of RAM",
            request.ram_mb
        )));
    }

    if !catalog.disk.contains(&request.disk_size_gb) {
        return Err(Error::Validation(format!(
            "invalid disk size: {} GB",
            request.disk_size_gb
        )));
    }

    if !catalog.billing.contains(&request.billing) {
        return Err(Error::Validation(format!("invalid billing: {}", request.billing)));
    }

    let disk_image_id = catalog
        .disk_images
        .get(&request.datacenter)
        .into_iter()
        .flatten()
        .find(|image| image.description == request.image)
        .map(|image| image.id.clone())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Validation(format!("invalid disk image: {}", request.image)))?;

    let network = resolve_network(request, catalog, capabilities)?;

    let traffic = if request.billing == MONTHLY_BILLING && capabilities.supports_traffic_packages {
        Some(resolve_traffic(request, catalog)?)
    } else {
        if let Some(ignored) = &request.traffic {
            warn!(
                traffic = %ignored,
                billing = %request.billing,
                "traffic package only applies to monthly billing, ignoring it"
            );
        }
        None
    };

    Ok(ResolvedConfig {
        request: request.clone(),
        datacenter_name,
        disk_image_id,
        network,
        traffic,
    })
}

fn resolve_network(
    request: &ProvisionRequest,
    catalog: &ServerOptions,
    capabilities: &Capabilities,
) -> Result<AddressPlan> {
    let Some(wanted) = &request.private_network else {
        return Ok(AddressPlan::None);
    };

    if !capabilities.supports_private_network {
        return Err(Error::Validation(
            "private networks are disabled for this driver".into(),
        ));
    }

    if let Some(ip) = &wanted.ip {
        return Ok(AddressPlan::Explicit {
            network: wanted.name.clone(),
            ip: ip.clone(),
        });
    }

    let pool = catalog
        .networks
        .get(&request.datacenter)
        .into_iter()
        .flatten()
        .find(|network| network.name == wanted.name)
        .map(|network| network.ips.clone())
        .unwrap_or_default();

    if pool.is_empty() {
        return Err(Error::Validation(format!(
            "invalid private network name or no available IPs: {}",
            wanted.name
        )));
    }

    debug!(network = %wanted.name, available = pool.len(), "private network address will be auto-assigned");
    Ok(AddressPlan::AutoAssign {
        network: wanted.name.clone(),
        pool,
    })
}

fn resolve_traffic(request: &ProvisionRequest, catalog: &ServerOptions) -> Result<TrafficSelection> {
    let packages = catalog
        .traffic
        .get(&request.datacenter)
        .map(Vec::as_slice)
        .unwrap_or_default();

    match &request.traffic {
        Some(wanted) => {
            if let Some(package) = packages.iter().find(|p| &p.id == wanted) {
                return Ok(TrafficSelection {
                    id: package.id.clone(),
                    description: package.info.clone(),
                    defaulted: false,
                });
            }
        }
        None => {
            if let Some(first) = packages.first() {
                warn!(
                    traffic = %first.id,
                    description = %first.info,
                    "no traffic package requested for monthly billing, using the first available"
                );
                return Ok(TrafficSelection {
                    id: first.id.clone(),
                    description: first.info.clone(),
                    defaulted: true,
                });
            }
        }
    }

    let mut options = String::from("available traffic options for monthly billing:\n Traffic | Description\n");
    for package in packages {
        options.push_str(&format!("{:>8} | {}\n", package.id, package.info));
    }
    Err(Error::Validation(format!(
        "traffic package {} is not available; {options}",
        request.traffic.as_deref().unwrap_or("(none)")
    )))
}
