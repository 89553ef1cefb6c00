//! Load-balancer reconciliation engine
//!
//! [`LoadBalancerEngine`] converges the remote resource tree of one service
//! (load balancer, listeners, pools, members, health monitors, floating IP
//! and security groups) to the state derived from the service and its
//! backend nodes. Every pass re-reads remote state, so a failed pass is
//! repaired by the next one.

pub mod accessor;
pub mod address;
pub mod desired;
pub mod firewall;
pub mod listener;
pub mod naming;
pub mod pool;


use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::CloudConfig;
use crate::error::{Error, Result};
use crate::lbaas::{
    Capabilities, CreateLoadBalancer, Feature, LoadBalancer, LoadBalancing, Networking, ResourceKind,
};
use crate::waiter::Backoff;

use accessor::{record_mutation, take_pool_for, Remote};
pub use desired::{
    AddressKind, BackendNode, NodeAddress, ServiceConfig, ServicePort, ServiceSpec,
    SessionAffinity,
};
pub use naming::ServiceNames;

/// Shared reconciliation engine; one instance serves every service
pub struct LoadBalancerEngine {
    lb: Arc<dyn LoadBalancing>,
    net: Arc<dyn Networking>,
    cloud: Arc<CloudConfig>,
    caps: Capabilities,
    activation: Backoff,
    deletion: Backoff,
}

fn observe<T>(operation: &str, started: Instant, result: &Result<T>) {
    let elapsed = started.elapsed().as_secs_f64();
    match result {
        Ok(_) => debug!("{} finished in {:.3}s", operation, elapsed),
        Err(e) => warn!("{} failed after {:.3}s: {}", operation, elapsed, e),
    }
    #[cfg(feature = "metrics")]
    {
        crate::controller::metrics::observe_reconcile_duration_seconds(operation, elapsed);
        if let Err(e) = result {
            crate::controller::metrics::inc_reconcile_error(operation, e.metric_label());
        }
    }
}

impl LoadBalancerEngine {
    /// Probe the API version once and resolve the capability set
    pub async fn new(
        lb: Arc<dyn LoadBalancing>,
        net: Arc<dyn Networking>,
        cloud: Arc<CloudConfig>,
    ) -> Result<Self> {
        let version = lb
            .api_version()
            .await
            .map_err(Error::api(ResourceKind::ApiVersion, None))?;
        let opts = &cloud.load_balancer;
        let caps = Capabilities::resolve(version, &opts.lb_provider, opts.cascade_delete);
        info!(
            "Load balancer API {} (provider {}): tags={} timeouts={} flavors={} vip_acl={} availability_zones={} cascade_delete={}",
            caps.version,
            caps.provider,
            caps.tags,
            caps.timeouts,
            caps.flavors,
            caps.vip_acl,
            caps.availability_zones,
            caps.cascade_delete
        );
        Ok(Self::with_capabilities(lb, net, cloud, caps))
    }

    pub fn with_capabilities(
        lb: Arc<dyn LoadBalancing>,
        net: Arc<dyn Networking>,
        cloud: Arc<CloudConfig>,
        caps: Capabilities,
    ) -> Self {
        let activation = cloud.backoff.activation();
        let deletion = cloud.backoff.deletion();
        Self {
            lb,
            net,
            cloud,
            caps,
            activation,
            deletion,
        }
    }

    pub fn cloud_config(&self) -> &CloudConfig {
        &self.cloud
    }

    fn remote<'a>(&'a self, cancel: &'a CancellationToken) -> Remote<'a> {
        Remote {
            lb: self.lb.as_ref(),
            net: self.net.as_ref(),
            activation: &self.activation,
            deletion: &self.deletion,
            cancel,
        }
    }

    /// Converge the whole resource tree and return the exposed address
    #[instrument(skip(self, spec, nodes, cancel), fields(service = %spec.key()))]
    pub async fn ensure(
        &self,
        cluster: &str,
        spec: &ServiceSpec,
        nodes: &[BackendNode],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let started = Instant::now();
        let result = self.ensure_tree(cluster, spec, nodes, cancel).await;
        observe("ensure", started, &result);
        result
    }

    /// Converge membership and firewall rules of an existing load balancer
    #[instrument(skip(self, spec, nodes, cancel), fields(service = %spec.key()))]
    pub async fn update(
        &self,
        cluster: &str,
        spec: &ServiceSpec,
        nodes: &[BackendNode],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.update_members(cluster, spec, nodes, cancel).await;
        observe("update", started, &result);
        result
    }

    /// Delete everything created for the service; already gone is success
    #[instrument(skip(self, spec, cancel), fields(service = %spec.key()))]
    pub async fn ensure_deleted(
        &self,
        cluster: &str,
        spec: &ServiceSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.delete_tree(cluster, spec, cancel).await;
        observe("ensure_deleted", started, &result);
        result
    }

    /// Address of the service's load balancer, if one exists
    pub async fn get_status(&self, cluster: &str, spec: &ServiceSpec) -> Result<Option<String>> {
        let cancel = CancellationToken::new();
        let remote = self.remote(&cancel);
        let names = spec.names(cluster);
        match remote
            .find_load_balancer(&names.candidates(), &names.display())
            .await?
        {
            Some(lb) => Ok(Some(address::current_address(&remote, &lb).await?)),
            None => Ok(None),
        }
    }

    async fn create_load_balancer(
        &self,
        remote: &Remote<'_>,
        names: &ServiceNames,
        config: &ServiceConfig,
    ) -> Result<LoadBalancer> {
        let opts = CreateLoadBalancer {
            name: names.primary(),
            description: names.description(),
            vip_subnet_id: config.vip_subnet_id.clone(),
            vip_network_id: config.vip_network_id.clone(),
            vip_port_id: config.vip_port_id.clone(),
            provider: config.lb_provider.clone(),
            flavor_id: config.flavor_id.clone(),
            availability_zone: config.availability_zone.clone(),
            tags: self.tags(names),
        };
        info!("Creating load balancer {} for {}", opts.name, names.display());
        let lb = remote
            .lb
            .create_load_balancer(&opts)
            .await
            .map_err(Error::api(ResourceKind::LoadBalancer, None))?;
        record_mutation(ResourceKind::LoadBalancer, "create");
        remote.wait_active(&lb.id).await
    }

    fn tags(&self, names: &ServiceNames) -> Vec<String> {
        if self.caps.supports(Feature::Tags) {
            vec![names.primary()]
        } else {
            Vec::new()
        }
    }

    async fn ensure_tree(
        &self,
        cluster: &str,
        spec: &ServiceSpec,
        nodes: &[BackendNode],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let names = spec.names(cluster);
        let remote = self.remote(cancel);
        let config =
            desired::build_config(spec, nodes, &self.cloud, &self.caps, self.net.as_ref()).await?;

        let lb = match remote
            .find_load_balancer(&names.candidates(), &names.display())
            .await?
        {
            Some(lb) => {
                debug!("Reusing load balancer {} ({})", lb.id, lb.name);
                remote.wait_active(&lb.id).await?
            }
            None => self.create_load_balancer(&remote, &names, &config).await?,
        };

        let tags = self.tags(&names);
        let mut listeners = remote
            .lb
            .list_listeners(&lb.id)
            .await
            .map_err(Error::api(ResourceKind::Listener, None))?;
        let mut pools = remote
            .lb
            .list_pools(&lb.id)
            .await
            .map_err(Error::api(ResourceKind::Pool, None))?;

        for (index, port) in config.listeners.iter().enumerate() {
            let listener = listener::ensure_listener(
                &remote,
                &lb.id,
                &lb.name,
                index,
                port,
                &config,
                &tags,
                &mut listeners,
            )
            .await?;
            let pool = pool::ensure_pool(
                &remote, &lb.id, &lb.name, index, &listener, port, &config, &mut pools,
            )
            .await?;
            pool::ensure_members(&remote, &lb.id, &pool, port, &config).await?;
            pool::ensure_monitor(&remote, &lb.id, &lb.name, index, &pool, port, &config).await?;
        }

        for obsolete in &listeners {
            info!(
                "Listener {} ({} {}) is no longer needed",
                obsolete.id, obsolete.protocol, obsolete.protocol_port
            );
            let pool = take_pool_for(&mut pools, obsolete);
            remote
                .teardown_listener(&lb.id, obsolete, pool.as_ref())
                .await?;
        }
        for orphan in pools.iter().filter(|p| p.listeners.is_empty()) {
            info!("Pool {} has no listener", orphan.id);
            remote.delete_pool(&lb.id, orphan).await?;
        }

        let address = address::ensure_address(&remote, &names, &lb, &config).await?;

        if config.manage_security_groups {
            firewall::sync_firewall(&remote, &names, &lb, &config, &self.caps).await?;
        }

        info!(
            "Load balancer {} for {} exposes {}",
            lb.id,
            names.display(),
            address
        );
        Ok(address)
    }

    async fn update_members(
        &self,
        cluster: &str,
        spec: &ServiceSpec,
        nodes: &[BackendNode],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let names = spec.names(cluster);
        let remote = self.remote(cancel);
        let config =
            desired::build_config(spec, nodes, &self.cloud, &self.caps, self.net.as_ref()).await?;

        let found = remote
            .find_load_balancer(&names.candidates(), &names.display())
            .await?
            .ok_or_else(|| Error::LoadBalancerNotFound {
                service: spec.key(),
            })?;
        let lb = remote.wait_active(&found.id).await?;

        let mut listeners = remote
            .lb
            .list_listeners(&lb.id)
            .await
            .map_err(Error::api(ResourceKind::Listener, None))?;
        let mut pools = remote
            .lb
            .list_pools(&lb.id)
            .await
            .map_err(Error::api(ResourceKind::Pool, None))?;

        for port in &config.listeners {
            let listener = listener::take_listener(&mut listeners, port.protocol, port.port)
                .ok_or_else(|| Error::MissingResource {
                    kind: ResourceKind::Listener,
                    key: format!("{} {}", port.protocol, port.port),
                    lb_id: lb.id.clone(),
                })?;
            let pool = take_pool_for(&mut pools, &listener).ok_or_else(|| {
                Error::MissingResource {
                    kind: ResourceKind::Pool,
                    key: format!("listener {}", listener.id),
                    lb_id: lb.id.clone(),
                }
            })?;
            pool::ensure_members(&remote, &lb.id, &pool, port, &config).await?;
        }

        if config.manage_security_groups {
            firewall::sync_firewall(&remote, &names, &lb, &config, &self.caps).await?;
        }
        Ok(())
    }

    async fn delete_tree(
        &self,
        cluster: &str,
        spec: &ServiceSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let names = spec.names(cluster);
        let remote = self.remote(cancel);

        let keep = desired::keep_floating_ip(spec).unwrap_or_else(|e| {
            warn!("{}, keeping the floating IP of {}", e, names.display());
            true
        });

        match remote
            .find_load_balancer(&names.candidates(), &names.display())
            .await?
        {
            Some(lb) => {
                address::release_address(&remote, &names, &lb, keep).await?;
                remote.delete_tree(&lb, self.caps.cascade_delete).await?;
            }
            None => debug!("No load balancer left for {}", names.display()),
        }

        if self.cloud.load_balancer.manage_security_groups {
            firewall::delete_firewall(&remote, &names).await?;
        }
        Ok(())
    }
}
