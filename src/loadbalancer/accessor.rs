//! Remote resource access shared by the convergence steps
//!
//! Bundles the two remote APIs with the waiter settings of one call, and
//! implements the lookups and teardown sequences that several steps need.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lbaas::{
    ignore_not_found, ApiError, Listener, LoadBalancer, LoadBalancing, Networking, Pool,
    ProvisioningStatus, ResourceKind,
};
use crate::waiter::{wait_until, Backoff, Progress};

/// Remote APIs plus waiter settings for one engine call
#[derive(Clone, Copy)]
pub struct Remote<'a> {
    pub lb: &'a dyn LoadBalancing,
    pub net: &'a dyn Networking,
    pub activation: &'a Backoff,
    pub deletion: &'a Backoff,
    pub cancel: &'a CancellationToken,
}

/// Count a mutating remote call
pub fn record_mutation(kind: ResourceKind, action: &str) {
    debug!("Remote mutation: {} {}", action, kind);
    #[cfg(feature = "metrics")]
    crate::controller::metrics::inc_remote_mutation(kind.label(), action);
}

impl<'a> Remote<'a> {
    /// Find the single live load balancer among the candidate names
    ///
    /// Every candidate is checked; more than one live match across all of
    /// them is an ambiguity the operator must resolve.
    pub async fn find_load_balancer(
        &self,
        candidates: &[String],
        service: &str,
    ) -> Result<Option<LoadBalancer>> {
        let mut live: Vec<LoadBalancer> = Vec::new();
        for name in candidates {
            let found = self
                .lb
                .list_load_balancers(name)
                .await
                .map_err(Error::api(ResourceKind::LoadBalancer, None))?;
            for lb in found {
                if lb.provisioning_status.is_gone() || live.iter().any(|l| l.id == lb.id) {
                    continue;
                }
                debug!("Found load balancer {} ({}) for {}", lb.id, lb.name, service);
                live.push(lb);
            }
        }

        match live.len() {
            0 => Ok(None),
            1 => Ok(live.pop()),
            _ => Err(Error::AmbiguousLoadBalancer {
                service: service.to_string(),
                ids: live.into_iter().map(|lb| lb.id).collect(),
            }),
        }
    }

    /// Poll the load balancer until it is ACTIVE
    pub async fn wait_active(&self, lb_id: &str) -> Result<LoadBalancer> {
        wait_until(
            self.activation,
            self.cancel,
            ResourceKind::LoadBalancer,
            lb_id,
            || async move {
                let lb = self
                    .lb
                    .get_load_balancer(lb_id)
                    .await
                    .map_err(Error::api(ResourceKind::LoadBalancer, Some(lb_id)))?;
                match lb.provisioning_status {
                    ProvisioningStatus::Active => Ok(Progress::Ready(lb)),
                    ProvisioningStatus::Error => Err(Error::ProvisioningFailed {
                        kind: ResourceKind::LoadBalancer,
                        id: lb_id.to_string(),
                    }),
                    status => Ok(Progress::Pending(status.to_string())),
                }
            },
        )
        .await
    }

    /// Poll until the load balancer is gone
    pub async fn wait_deleted(&self, lb_id: &str) -> Result<()> {
        wait_until(
            self.deletion,
            self.cancel,
            ResourceKind::LoadBalancer,
            lb_id,
            || async move {
                match self.lb.get_load_balancer(lb_id).await {
                    Err(ApiError::NotFound) => Ok(Progress::Ready(())),
                    Err(e) => Err(Error::api(ResourceKind::LoadBalancer, Some(lb_id))(e)),
                    Ok(lb) => match lb.provisioning_status {
                        ProvisioningStatus::Deleted => Ok(Progress::Ready(())),
                        ProvisioningStatus::Error => Err(Error::ProvisioningFailed {
                            kind: ResourceKind::LoadBalancer,
                            id: lb_id.to_string(),
                        }),
                        status => Ok(Progress::Pending(status.to_string())),
                    },
                }
            },
        )
        .await
    }

    /// Delete the pool's health monitor, if any, and wait for the load balancer
    pub async fn delete_monitor(&self, lb_id: &str, pool: &Pool) -> Result<()> {
        let Some(monitor_id) = &pool.healthmonitor_id else {
            return Ok(());
        };
        info!("Deleting health monitor {} of pool {}", monitor_id, pool.id);
        ignore_not_found(self.lb.delete_health_monitor(monitor_id).await).map_err(
            Error::api(ResourceKind::HealthMonitor, Some(monitor_id.as_str())),
        )?;
        record_mutation(ResourceKind::HealthMonitor, "delete");
        self.wait_active(lb_id).await?;
        Ok(())
    }

    /// Delete a pool with its monitor; members go with the pool
    pub async fn delete_pool(&self, lb_id: &str, pool: &Pool) -> Result<()> {
        self.delete_monitor(lb_id, pool).await?;
        info!("Deleting pool {} ({})", pool.id, pool.name);
        ignore_not_found(self.lb.delete_pool(&pool.id).await)
            .map_err(Error::api(ResourceKind::Pool, Some(pool.id.as_str())))?;
        record_mutation(ResourceKind::Pool, "delete");
        self.wait_active(lb_id).await?;
        Ok(())
    }

    /// Delete a listener innermost-first: monitor, pool, then the listener
    pub async fn teardown_listener(
        &self,
        lb_id: &str,
        listener: &Listener,
        pool: Option<&Pool>,
    ) -> Result<()> {
        if let Some(pool) = pool {
            self.delete_pool(lb_id, pool).await?;
        }
        info!(
            "Deleting listener {} ({} {})",
            listener.id, listener.protocol, listener.protocol_port
        );
        ignore_not_found(self.lb.delete_listener(&listener.id).await)
            .map_err(Error::api(ResourceKind::Listener, Some(listener.id.as_str())))?;
        record_mutation(ResourceKind::Listener, "delete");
        self.wait_active(lb_id).await?;
        Ok(())
    }

    /// Delete a load balancer and everything below it
    pub async fn delete_tree(&self, lb: &LoadBalancer, cascade: bool) -> Result<()> {
        if lb.provisioning_status.is_pending() {
            self.wait_active(&lb.id).await?;
        }

        if !cascade {
            let listeners = self
                .lb
                .list_listeners(&lb.id)
                .await
                .map_err(Error::api(ResourceKind::Listener, None))?;
            let mut pools = self
                .lb
                .list_pools(&lb.id)
                .await
                .map_err(Error::api(ResourceKind::Pool, None))?;

            for listener in &listeners {
                let pool = take_pool_for(&mut pools, listener);
                self.teardown_listener(&lb.id, listener, pool.as_ref())
                    .await?;
            }
            for pool in &pools {
                self.delete_pool(&lb.id, pool).await?;
            }
        }

        info!("Deleting load balancer {} (cascade: {})", lb.id, cascade);
        ignore_not_found(self.lb.delete_load_balancer(&lb.id, cascade).await)
            .map_err(Error::api(ResourceKind::LoadBalancer, Some(lb.id.as_str())))?;
        record_mutation(ResourceKind::LoadBalancer, "delete");
        self.wait_deleted(&lb.id).await
    }
}

/// Remove and return the pool serving `listener`
pub fn take_pool_for(pools: &mut Vec<Pool>, listener: &Listener) -> Option<Pool> {
    let position = pools.iter().position(|p| {
        listener.default_pool_id.as_deref() == Some(p.id.as_str())
            || p.listeners.iter().any(|l| l.id == listener.id)
    })?;
    Some(pools.remove(position))
}
