//! Pool, member and health monitor convergence for one listener

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lbaas::{
    CreateHealthMonitor, CreatePool, HealthMonitor, Listener, Member,
    MemberSpec, Pool, ResourceKind, UpdatePool,
};

use super::accessor::{record_mutation, take_pool_for, Remote};
use super::desired::{monitor_type, ListenerSpec, ServiceConfig};
use super::naming;

/// Create the listener's pool, or bring an existing one in line
///
/// A pool whose protocol no longer matches is deleted and recreated since
/// the backend cannot change a pool protocol in place.
#[allow(clippy::too_many_arguments)]
pub async fn ensure_pool(
    remote: &Remote<'_>,
    lb_id: &str,
    lb_name: &str,
    index: usize,
    listener: &Listener,
    spec: &ListenerSpec,
    config: &ServiceConfig,
    pools: &mut Vec<Pool>,
) -> Result<Pool> {
    let mut existing = take_pool_for(pools, listener);

    if let Some(pool) = existing.as_ref() {
        if pool.protocol != spec.pool_protocol {
            info!(
                "Pool {} has protocol {}, recreating as {}",
                pool.id, pool.protocol, spec.pool_protocol
            );
            remote.delete_pool(lb_id, pool).await?;
            existing = None;
        }
    }

    if let Some(pool) = existing {
        if pool.lb_algorithm == config.lb_method
            && pool.session_persistence == config.session_persistence
        {
            debug!("Pool {} is up to date", pool.id);
            return Ok(pool);
        }

        info!("Updating pool {} of listener {}", pool.id, listener.id);
        let update = UpdatePool {
            lb_algorithm: config.lb_method.clone(),
            session_persistence: config.session_persistence.clone(),
        };
        let updated = remote
            .lb
            .update_pool(&pool.id, &update)
            .await
            .map_err(Error::api(ResourceKind::Pool, Some(pool.id.as_str())))?;
        record_mutation(ResourceKind::Pool, "update");
        remote.wait_active(lb_id).await?;
        return Ok(Pool {
            healthmonitor_id: pool.healthmonitor_id,
            ..updated
        });
    }

    let opts = CreatePool {
        name: naming::pool_name(index, lb_name),
        listener_id: listener.id.clone(),
        protocol: spec.pool_protocol,
        lb_algorithm: config.lb_method.clone(),
        session_persistence: config.session_persistence.clone(),
    };
    info!("Creating pool {} for listener {}", opts.name, listener.id);
    let pool = remote
        .lb
        .create_pool(&opts)
        .await
        .map_err(Error::api(ResourceKind::Pool, None))?;
    record_mutation(ResourceKind::Pool, "create");
    remote.wait_active(lb_id).await?;
    Ok(pool)
}

/// Desired members of a pool serving `spec`
pub fn desired_members(spec: &ListenerSpec, config: &ServiceConfig) -> Vec<MemberSpec> {
    let subnet_id = config.member_subnet().map(str::to_string);
    config
        .backends
        .iter()
        .map(|backend| MemberSpec {
            name: backend.name.clone(),
            address: backend.address.clone(),
            protocol_port: spec.node_port,
            subnet_id: subnet_id.clone(),
        })
        .collect()
}

/// Whether the current membership differs from the desired one as a set
pub fn members_differ(current: &[Member], desired: &[MemberSpec]) -> bool {
    let have: HashSet<(&str, i32)> = current
        .iter()
        .map(|m| (m.address.as_str(), m.protocol_port))
        .collect();
    let want: HashSet<(&str, i32)> = desired
        .iter()
        .map(|m| (m.address.as_str(), m.protocol_port))
        .collect();
    have != want
}

/// Make the pool membership equal the backend set with one batch call
///
/// Returns whether an update was issued.
pub async fn ensure_members(
    remote: &Remote<'_>,
    lb_id: &str,
    pool: &Pool,
    spec: &ListenerSpec,
    config: &ServiceConfig,
) -> Result<bool> {
    let desired = desired_members(spec, config);
    let current = remote
        .lb
        .list_members(&pool.id)
        .await
        .map_err(Error::api(ResourceKind::Member, None))?;

    if !members_differ(&current, &desired) {
        debug!("Members of pool {} are up to date", pool.id);
        return Ok(false);
    }

    info!(
        "Updating members of pool {}: {} current, {} desired",
        pool.id,
        current.len(),
        desired.len()
    );
    remote
        .lb
        .batch_update_members(&pool.id, &desired)
        .await
        .map_err(Error::api(ResourceKind::Member, Some(pool.id.as_str())))?;
    record_mutation(ResourceKind::Member, "update");
    remote.wait_active(lb_id).await?;
    Ok(true)
}

/// Whether a monitor's settings differ from the desired ones
///
/// A backend that does not report `max_retries_down` is taken to match.
pub fn monitor_differs(current: &HealthMonitor, desired: &CreateHealthMonitor) -> bool {
    current.type_ != desired.type_
        || current.delay != desired.delay
        || current.timeout != desired.timeout
        || current.max_retries != desired.max_retries
        || current
            .max_retries_down
            .is_some_and(|down| down != desired.max_retries_down)
}

/// Create or delete the pool's health monitor; never updated in place
///
/// A monitor with outdated settings is deleted and created again.
pub async fn ensure_monitor(
    remote: &Remote<'_>,
    lb_id: &str,
    lb_name: &str,
    index: usize,
    pool: &Pool,
    spec: &ListenerSpec,
    config: &ServiceConfig,
) -> Result<()> {
    let Some(settings) = &config.health_monitor else {
        if pool.healthmonitor_id.is_some() {
            remote.delete_monitor(lb_id, pool).await?;
        }
        return Ok(());
    };

    let opts = CreateHealthMonitor {
        name: naming::monitor_name(index, lb_name),
        pool_id: pool.id.clone(),
        type_: monitor_type(spec.pool_protocol).to_string(),
        delay: settings.delay,
        timeout: settings.timeout,
        max_retries: settings.max_retries,
        max_retries_down: settings.max_retries_down,
    };

    if let Some(monitor_id) = &pool.healthmonitor_id {
        let current = match remote.lb.get_health_monitor(monitor_id).await {
            Ok(monitor) => Some(monitor),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                return Err(Error::api(ResourceKind::HealthMonitor, Some(monitor_id.as_str()))(e))
            }
        };
        match current {
            Some(current) if !monitor_differs(&current, &opts) => {
                debug!("Health monitor {} of pool {} is up to date", current.id, pool.id);
                return Ok(());
            }
            Some(current) => {
                info!(
                    "Health monitor {} of pool {} has outdated settings, recreating",
                    current.id, pool.id
                );
                remote.delete_monitor(lb_id, pool).await?;
            }
            None => debug!("Health monitor {} of pool {} is gone", monitor_id, pool.id),
        }
    }

    info!("Creating health monitor {} for pool {}", opts.name, pool.id);
    remote
        .lb
        .create_health_monitor(&opts)
        .await
        .map_err(Error::api(ResourceKind::HealthMonitor, None))?;
    record_mutation(ResourceKind::HealthMonitor, "create");
    remote.wait_active(lb_id).await?;
    Ok(())
}
