//! Public address resolution for a load balancer
//!
//! Internal services expose the VIP. External services get a floating IP,
//! reusing one already bound to the VIP port, then the caller-requested
//! address, then a freshly allocated one.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::lbaas::{
    ignore_not_found, CreateFloatingIp, FloatingIp, FloatingIpFilter, LoadBalancer, ResourceKind,
};

use super::accessor::{record_mutation, Remote};
use super::desired::ServiceConfig;
use super::naming::ServiceNames;

async fn floating_ips_on(remote: &Remote<'_>, port_id: &str) -> Result<Vec<FloatingIp>> {
    remote
        .net
        .list_floating_ips(&FloatingIpFilter {
            port_id: Some(port_id.to_string()),
            ..Default::default()
        })
        .await
        .map_err(Error::api(ResourceKind::FloatingIp, None))
}

async fn bind(remote: &Remote<'_>, fip: &FloatingIp, port_id: &str) -> Result<FloatingIp> {
    info!(
        "Binding floating IP {} to port {}",
        fip.floating_ip_address, port_id
    );
    let bound = remote
        .net
        .update_floating_ip_port(&fip.id, Some(port_id))
        .await
        .map_err(Error::api(ResourceKind::FloatingIp, Some(fip.id.as_str())))?;
    record_mutation(ResourceKind::FloatingIp, "update");
    Ok(bound)
}

/// Delete a floating IP we allocated, or unbind it when it must be kept
/// or was allocated by someone else
async fn release(remote: &Remote<'_>, names: &ServiceNames, fip: &FloatingIp, keep: bool) -> Result<()> {
    let ours = fip.description == names.floating_ip_description();
    if ours && !keep {
        info!("Deleting floating IP {}", fip.floating_ip_address);
        ignore_not_found(remote.net.delete_floating_ip(&fip.id).await)
            .map_err(Error::api(ResourceKind::FloatingIp, Some(fip.id.as_str())))?;
        record_mutation(ResourceKind::FloatingIp, "delete");
        return Ok(());
    }

    info!("Unbinding floating IP {}", fip.floating_ip_address);
    match remote.net.update_floating_ip_port(&fip.id, None).await {
        Ok(_) => {
            record_mutation(ResourceKind::FloatingIp, "update");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(Error::api(ResourceKind::FloatingIp, Some(fip.id.as_str()))(e)),
    }
}

/// Resolve the address the service is reachable at
pub async fn ensure_address(
    remote: &Remote<'_>,
    names: &ServiceNames,
    lb: &LoadBalancer,
    config: &ServiceConfig,
) -> Result<String> {
    let bound = floating_ips_on(remote, &lb.vip_port_id).await?;

    if config.internal {
        for fip in bound
            .iter()
            .filter(|f| f.description == names.floating_ip_description())
        {
            release(remote, names, fip, config.keep_floating_ip).await?;
        }
        return Ok(lb.vip_address.clone());
    }

    if let Some(fip) = bound.first() {
        if let Some(requested) = &config.requested_address {
            if *requested != fip.floating_ip_address {
                warn!(
                    "Service {} requests {} but {} is already bound to its VIP",
                    names.display(),
                    requested,
                    fip.floating_ip_address
                );
            }
        }
        return Ok(fip.floating_ip_address.clone());
    }

    if let Some(requested) = &config.requested_address {
        if *requested == lb.vip_address {
            return Ok(lb.vip_address.clone());
        }

        let existing = remote
            .net
            .list_floating_ips(&FloatingIpFilter {
                floating_ip_address: Some(requested.clone()),
                ..Default::default()
            })
            .await
            .map_err(Error::api(ResourceKind::FloatingIp, None))?;

        if let Some(fip) = existing.first() {
            return match fip.port_id.as_deref() {
                None => Ok(bind(remote, fip, &lb.vip_port_id).await?.floating_ip_address),
                Some(port) if port == lb.vip_port_id => Ok(fip.floating_ip_address.clone()),
                Some(port) => Err(Error::FloatingIpConflict {
                    address: requested.clone(),
                    port_id: port.to_string(),
                }),
            };
        }

        if config.floating_network_id.is_none() {
            return Err(Error::ConfigError(format!(
                "service {}: requested address {} does not exist and no floating network is configured",
                names.display(),
                requested
            )));
        }
    }

    let Some(network) = &config.floating_network_id else {
        warn!(
            "No floating network configured for {}, exposing VIP {}",
            names.display(),
            lb.vip_address
        );
        return Ok(lb.vip_address.clone());
    };

    let opts = CreateFloatingIp {
        floating_network_id: network.clone(),
        subnet_id: config.floating_subnet_id.clone(),
        floating_ip_address: config.requested_address.clone(),
        port_id: Some(lb.vip_port_id.clone()),
        description: names.floating_ip_description(),
    };
    info!(
        "Allocating floating IP in network {} for {}",
        network,
        names.display()
    );
    let fip = remote
        .net
        .create_floating_ip(&opts)
        .await
        .map_err(Error::api(ResourceKind::FloatingIp, None))?;
    record_mutation(ResourceKind::FloatingIp, "create");
    Ok(fip.floating_ip_address)
}

/// Address currently exposed by `lb`, without changing anything
pub async fn current_address(remote: &Remote<'_>, lb: &LoadBalancer) -> Result<String> {
    let bound = floating_ips_on(remote, &lb.vip_port_id).await?;
    Ok(bound
        .into_iter()
        .next()
        .map(|fip| fip.floating_ip_address)
        .unwrap_or_else(|| lb.vip_address.clone()))
}

/// Release the floating IPs bound to the VIP port ahead of deletion
pub async fn release_address(
    remote: &Remote<'_>,
    names: &ServiceNames,
    lb: &LoadBalancer,
    keep: bool,
) -> Result<()> {
    for fip in floating_ips_on(remote, &lb.vip_port_id).await? {
        release(remote, names, &fip, keep).await?;
    }
    Ok(())
}
