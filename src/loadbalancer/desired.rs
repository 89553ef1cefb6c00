//! Desired-state builder
//!
//! Turns a service exposure request plus its backend nodes into a normalized
//! [`ServiceConfig`]. Values resolve per-service annotation first, then the
//! selected load balancer class, then the global `[load_balancer]` defaults.
//! All validation happens before the first remote call.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::{debug, warn};

use crate::config::{CloudConfig, LoadBalancerClass, LB_METHODS};
use crate::error::{Error, Result};
use crate::lbaas::{
    Capabilities, Feature, ListenerTimeouts, Networking, PortFilter, Protocol, ResourceKind,
    SessionPersistence,
};

use super::naming::ServiceNames;

pub const ANN_CLASS: &str = "loadbalancer.openstack.org/class";
pub const ANN_FLOATING_NETWORK_ID: &str = "loadbalancer.openstack.org/floating-network-id";
pub const ANN_FLOATING_SUBNET_ID: &str = "loadbalancer.openstack.org/floating-subnet-id";
pub const ANN_SUBNET_ID: &str = "loadbalancer.openstack.org/subnet-id";
pub const ANN_NETWORK_ID: &str = "loadbalancer.openstack.org/network-id";
pub const ANN_MEMBER_SUBNET_ID: &str = "loadbalancer.openstack.org/member-subnet-id";
pub const ANN_PORT_ID: &str = "loadbalancer.openstack.org/port-id";
pub const ANN_CONNECTION_LIMIT: &str = "loadbalancer.openstack.org/connection-limit";
pub const ANN_PROXY_PROTOCOL: &str = "loadbalancer.openstack.org/proxy-protocol";
pub const ANN_X_FORWARDED_FOR: &str = "loadbalancer.openstack.org/x-forwarded-for";
pub const ANN_TIMEOUT_CLIENT_DATA: &str = "loadbalancer.openstack.org/timeout-client-data";
pub const ANN_TIMEOUT_MEMBER_CONNECT: &str = "loadbalancer.openstack.org/timeout-member-connect";
pub const ANN_TIMEOUT_MEMBER_DATA: &str = "loadbalancer.openstack.org/timeout-member-data";
pub const ANN_TIMEOUT_TCP_INSPECT: &str = "loadbalancer.openstack.org/timeout-tcp-inspect";
pub const ANN_ENABLE_HEALTH_MONITOR: &str = "loadbalancer.openstack.org/enable-health-monitor";
pub const ANN_HEALTH_MONITOR_DELAY: &str = "loadbalancer.openstack.org/health-monitor-delay";
pub const ANN_HEALTH_MONITOR_TIMEOUT: &str = "loadbalancer.openstack.org/health-monitor-timeout";
pub const ANN_HEALTH_MONITOR_MAX_RETRIES: &str =
    "loadbalancer.openstack.org/health-monitor-max-retries";
pub const ANN_HEALTH_MONITOR_MAX_RETRIES_DOWN: &str =
    "loadbalancer.openstack.org/health-monitor-max-retries-down";
pub const ANN_FLAVOR_ID: &str = "loadbalancer.openstack.org/flavor-id";
pub const ANN_AVAILABILITY_ZONE: &str = "loadbalancer.openstack.org/availability-zone";
pub const ANN_LB_METHOD: &str = "loadbalancer.openstack.org/lb-method";
pub const ANN_KEEP_FLOATING_IP: &str = "loadbalancer.openstack.org/keep-floatingip";
pub const ANN_INTERNAL: &str = "service.beta.kubernetes.io/openstack-internal-load-balancer";

/// Header injected by HTTP listeners in keep-client-ip mode
pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";

const ANY_IPV4: &str = "0.0.0.0/0";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServicePort {
    pub name: String,
    /// Protocol as written in the service, e.g. `TCP`
    pub protocol: String,
    pub port: i32,
    pub node_port: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionAffinity {
    #[default]
    None,
    ClientIp,
}

/// Service exposure request, immutable for one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ServiceSpec {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub ports: Vec<ServicePort>,
    pub session_affinity: SessionAffinity,
    /// Caller-requested public address
    pub load_balancer_ip: Option<String>,
    pub source_ranges: Vec<String>,
    pub annotations: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn names(&self, cluster: &str) -> ServiceNames {
        ServiceNames::new(cluster, &self.namespace, &self.name, &self.uid)
    }

    /// Stable hash of everything that shapes listeners and pools
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn annotation_string(&self, key: &str) -> Option<String> {
        self.annotation(key).map(str::to_string)
    }

    fn annotation_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.annotation(key) {
            None => Ok(default),
            Some(v) => parse_bool(v).ok_or_else(|| invalid(key, v)),
        }
    }

    fn annotation_int(&self, key: &str) -> Result<Option<i32>> {
        self.annotation(key)
            .map(|v| v.parse::<i32>().map_err(|_| invalid(key, v)))
            .transpose()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::InvalidAnnotation {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    InternalIp,
    ExternalIp,
    Hostname,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub kind: AddressKind,
    pub address: String,
}

/// A node eligible to receive traffic
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendNode {
    pub name: String,
    pub addresses: Vec<NodeAddress>,
    /// Compute instance backing the node
    pub instance_id: Option<String>,
}

impl BackendNode {
    /// Internal IP preferred, external IP as fallback
    pub fn resolve_address(&self) -> Option<&str> {
        let find = |kind| {
            self.addresses
                .iter()
                .find(|a| a.kind == kind)
                .map(|a| a.address.as_str())
        };
        find(AddressKind::InternalIp).or_else(|| find(AddressKind::ExternalIp))
    }
}

/// A backend node resolved to its traffic address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub address: String,
    pub instance_id: Option<String>,
}

/// One listener to converge, derived from a service port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerSpec {
    pub protocol: Protocol,
    pub port: i32,
    pub node_port: i32,
    pub pool_protocol: Protocol,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorSettings {
    pub delay: i32,
    pub timeout: i32,
    pub max_retries: i32,
    pub max_retries_down: i32,
}

/// Normalized, validated configuration for one reconciliation pass
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    pub listeners: Vec<ListenerSpec>,
    pub backends: Vec<Backend>,
    pub internal: bool,
    pub connection_limit: i32,
    pub vip_network_id: Option<String>,
    pub vip_subnet_id: Option<String>,
    pub vip_port_id: Option<String>,
    pub member_subnet_id: Option<String>,
    pub floating_network_id: Option<String>,
    pub floating_subnet_id: Option<String>,
    pub requested_address: Option<String>,
    pub proxy_protocol: bool,
    pub keep_client_ip: bool,
    /// Empty when the backend does not support listener timeouts
    pub timeouts: ListenerTimeouts,
    /// `None` when the backend does not support VIP ACLs
    pub allowed_cidrs: Option<Vec<String>>,
    pub source_ranges: Vec<IpNet>,
    pub flavor_id: Option<String>,
    pub availability_zone: Option<String>,
    pub lb_method: String,
    pub lb_provider: String,
    pub health_monitor: Option<MonitorSettings>,
    pub session_persistence: Option<SessionPersistence>,
    pub keep_floating_ip: bool,
    pub manage_security_groups: bool,
}

impl ServiceConfig {
    pub fn insert_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        if self.keep_client_ip {
            headers.insert(X_FORWARDED_FOR.to_string(), "true".to_string());
        }
        headers
    }

    /// Subnet the pool members live in
    pub fn member_subnet(&self) -> Option<&str> {
        self.member_subnet_id
            .as_deref()
            .or(self.vip_subnet_id.as_deref())
    }
}

/// Health monitor type for a pool protocol
pub fn monitor_type(pool_protocol: Protocol) -> &'static str {
    match pool_protocol {
        Protocol::Udp => "UDP-CONNECT",
        Protocol::Sctp => "SCTP",
        _ => "TCP",
    }
}

/// Whether the floating IP should survive deletion of the service
pub fn keep_floating_ip(spec: &ServiceSpec) -> Result<bool> {
    spec.annotation_bool(ANN_KEEP_FLOATING_IP, false)
}

/// Build and validate the configuration for `spec`
///
/// When neither a network nor a subnet is configured anywhere, the subnet
/// is inferred from the network ports of the first backend node.
pub async fn build_config(
    spec: &ServiceSpec,
    nodes: &[BackendNode],
    cloud: &CloudConfig,
    caps: &Capabilities,
    networking: &dyn Networking,
) -> Result<ServiceConfig> {
    let mut config = resolve(spec, nodes, cloud, caps)?;
    if config.vip_port_id.is_none()
        && config.vip_network_id.is_none()
        && config.vip_subnet_id.is_none()
    {
        let subnet = infer_subnet(&config.backends, networking).await?;
        debug!("Inferred subnet {} for service {}", subnet, spec.key());
        config.vip_subnet_id = Some(subnet);
    }
    Ok(config)
}

/// Validation and priority resolution without any remote call
pub fn resolve(
    spec: &ServiceSpec,
    nodes: &[BackendNode],
    cloud: &CloudConfig,
    caps: &Capabilities,
) -> Result<ServiceConfig> {
    let service = spec.key();
    let opts = &cloud.load_balancer;

    if spec.ports.is_empty() {
        return Err(Error::NoPorts { service });
    }
    if nodes.is_empty() {
        return Err(Error::NoBackends { service });
    }

    let proxy_protocol = spec.annotation_bool(ANN_PROXY_PROTOCOL, false)?;
    let keep_client_ip = spec.annotation_bool(ANN_X_FORWARDED_FOR, false)?;
    if proxy_protocol && keep_client_ip {
        return Err(Error::ConflictingMode {
            service,
            reason: "proxy-protocol and x-forwarded-for cannot be enabled together".to_string(),
        });
    }

    let listeners = spec
        .ports
        .iter()
        .map(|port| listener_spec(&service, port, proxy_protocol, keep_client_ip))
        .collect::<Result<Vec<_>>>()?;

    let class = match spec.annotation(ANN_CLASS) {
        Some(name) => cloud.class(name)?.clone(),
        None => LoadBalancerClass::default(),
    };

    let backends: Vec<Backend> = nodes
        .iter()
        .filter_map(|node| match node.resolve_address() {
            Some(address) => Some(Backend {
                name: node.name.clone(),
                address: address.to_string(),
                instance_id: node.instance_id.clone(),
            }),
            None => {
                warn!("Skipping node {} without a usable address", node.name);
                None
            }
        })
        .collect();
    if backends.is_empty() {
        return Err(Error::NoBackends { service });
    }

    let lb_method = spec
        .annotation_string(ANN_LB_METHOD)
        .map(|m| m.to_ascii_uppercase())
        .unwrap_or_else(|| opts.lb_method.clone());
    if !LB_METHODS.contains(&lb_method.as_str()) {
        return Err(invalid(ANN_LB_METHOD, &lb_method));
    }

    let connection_limit = spec
        .annotation_int(ANN_CONNECTION_LIMIT)?
        .unwrap_or(opts.connection_limit);
    if connection_limit < -1 {
        return Err(invalid(ANN_CONNECTION_LIMIT, &connection_limit.to_string()));
    }

    let timeouts = resolve_timeouts(spec, caps)?;
    let health_monitor = resolve_monitor(spec, cloud)?;
    let source_ranges = resolve_source_ranges(spec)?;
    let allowed_cidrs = if caps.supports(Feature::VipAcl) {
        Some(source_ranges.iter().map(IpNet::to_string).collect())
    } else {
        None
    };

    let requested_address = match spec.load_balancer_ip.as_deref().map(str::trim) {
        Some(ip) if !ip.is_empty() => {
            ip.parse::<IpAddr>().map_err(|_| {
                Error::ConfigError(format!("service {service}: invalid loadBalancerIP {ip:?}"))
            })?;
            Some(ip.to_string())
        }
        _ => None,
    };

    let flavor_id = spec
        .annotation_string(ANN_FLAVOR_ID)
        .or_else(|| opts.flavor_id.clone());
    let flavor_id = gate(flavor_id, caps.supports(Feature::Flavors), "flavor", &service);

    let availability_zone = spec
        .annotation_string(ANN_AVAILABILITY_ZONE)
        .or_else(|| opts.availability_zone.clone());
    let availability_zone = gate(
        availability_zone,
        caps.supports(Feature::AvailabilityZones),
        "availability zone",
        &service,
    );

    let session_persistence = match spec.session_affinity {
        SessionAffinity::ClientIp => Some(SessionPersistence::source_ip()),
        SessionAffinity::None => None,
    };

    Ok(ServiceConfig {
        listeners,
        backends,
        internal: spec.annotation_bool(ANN_INTERNAL, opts.internal_lb)?,
        connection_limit,
        vip_network_id: pick(spec, ANN_NETWORK_ID, &class.network_id, &opts.network_id),
        vip_subnet_id: pick(spec, ANN_SUBNET_ID, &class.subnet_id, &opts.subnet_id),
        vip_port_id: spec.annotation_string(ANN_PORT_ID),
        member_subnet_id: pick(
            spec,
            ANN_MEMBER_SUBNET_ID,
            &class.member_subnet_id,
            &opts.member_subnet_id,
        ),
        floating_network_id: pick(
            spec,
            ANN_FLOATING_NETWORK_ID,
            &class.floating_network_id,
            &opts.floating_network_id,
        ),
        floating_subnet_id: pick(
            spec,
            ANN_FLOATING_SUBNET_ID,
            &class.floating_subnet_id,
            &opts.floating_subnet_id,
        ),
        requested_address,
        proxy_protocol,
        keep_client_ip,
        timeouts,
        allowed_cidrs,
        source_ranges,
        flavor_id,
        availability_zone,
        lb_method,
        lb_provider: opts.lb_provider.clone(),
        health_monitor,
        session_persistence,
        keep_floating_ip: keep_floating_ip(spec)?,
        manage_security_groups: opts.manage_security_groups,
    })
}

fn pick(
    spec: &ServiceSpec,
    annotation: &str,
    class: &Option<String>,
    global: &Option<String>,
) -> Option<String> {
    spec.annotation_string(annotation)
        .or_else(|| class.clone())
        .or_else(|| global.clone())
}

fn gate(value: Option<String>, supported: bool, what: &str, service: &str) -> Option<String> {
    match value {
        Some(v) if !supported => {
            warn!(
                "Ignoring {} {} for service {}: not supported by the load balancer API",
                what, v, service
            );
            None
        }
        other => other,
    }
}

fn listener_spec(
    service: &str,
    port: &ServicePort,
    proxy_protocol: bool,
    keep_client_ip: bool,
) -> Result<ListenerSpec> {
    let unsupported = || Error::UnsupportedProtocol {
        service: service.to_string(),
        protocol: port.protocol.clone(),
        port: port.port,
    };
    let protocol = match port.protocol.parse::<Protocol>() {
        Ok(p @ (Protocol::Tcp | Protocol::Udp | Protocol::Sctp)) => p,
        _ => return Err(unsupported()),
    };
    if port.node_port <= 0 {
        return Err(Error::ConfigError(format!(
            "service {service}: port {} has no node port allocated",
            port.port
        )));
    }

    if (proxy_protocol || keep_client_ip) && protocol != Protocol::Tcp {
        return Err(Error::ConflictingMode {
            service: service.to_string(),
            reason: format!(
                "proxy-protocol and x-forwarded-for require TCP, port {} is {}",
                port.port, protocol
            ),
        });
    }

    let (protocol, pool_protocol) = if keep_client_ip {
        (Protocol::Http, Protocol::Http)
    } else if proxy_protocol {
        (protocol, Protocol::Proxy)
    } else {
        (protocol, protocol)
    };

    Ok(ListenerSpec {
        protocol,
        port: port.port,
        node_port: port.node_port,
        pool_protocol,
    })
}

fn resolve_timeouts(spec: &ServiceSpec, caps: &Capabilities) -> Result<ListenerTimeouts> {
    let timeouts = ListenerTimeouts {
        timeout_client_data: spec.annotation_int(ANN_TIMEOUT_CLIENT_DATA)?,
        timeout_member_connect: spec.annotation_int(ANN_TIMEOUT_MEMBER_CONNECT)?,
        timeout_member_data: spec.annotation_int(ANN_TIMEOUT_MEMBER_DATA)?,
        timeout_tcp_inspect: spec.annotation_int(ANN_TIMEOUT_TCP_INSPECT)?,
    };
    if !timeouts.is_empty() && !caps.supports(Feature::Timeouts) {
        warn!(
            "Ignoring listener timeouts for service {}: not supported by the load balancer API",
            spec.key()
        );
        return Ok(ListenerTimeouts::default());
    }
    Ok(timeouts)
}

fn resolve_monitor(spec: &ServiceSpec, cloud: &CloudConfig) -> Result<Option<MonitorSettings>> {
    let opts = &cloud.load_balancer;
    if !spec.annotation_bool(ANN_ENABLE_HEALTH_MONITOR, opts.create_monitor)? {
        return Ok(None);
    }

    let positive = |key: &str, default: i32| -> Result<i32> {
        let value = spec.annotation_int(key)?.unwrap_or(default);
        if value <= 0 {
            return Err(invalid(key, &value.to_string()));
        }
        Ok(value)
    };

    Ok(Some(MonitorSettings {
        delay: positive(ANN_HEALTH_MONITOR_DELAY, opts.monitor_delay)?,
        timeout: positive(ANN_HEALTH_MONITOR_TIMEOUT, opts.monitor_timeout)?,
        max_retries: positive(ANN_HEALTH_MONITOR_MAX_RETRIES, opts.monitor_max_retries)?,
        max_retries_down: positive(
            ANN_HEALTH_MONITOR_MAX_RETRIES_DOWN,
            opts.monitor_max_retries_down,
        )?,
    }))
}

fn resolve_source_ranges(spec: &ServiceSpec) -> Result<Vec<IpNet>> {
    let mut ranges = Vec::with_capacity(spec.source_ranges.len().max(1));
    for range in &spec.source_ranges {
        let net = range.trim().parse::<IpNet>().map_err(|_| {
            Error::ConfigError(format!(
                "service {}: invalid source range {range:?}",
                spec.key()
            ))
        })?;
        ranges.push(net.trunc());
    }
    if ranges.is_empty() {
        if let Ok(any) = ANY_IPV4.parse() {
            ranges.push(any);
        }
    }
    ranges.sort();
    ranges.dedup();
    Ok(ranges)
}

/// Subnet of the first backend node port carrying the node's address
async fn infer_subnet(backends: &[Backend], networking: &dyn Networking) -> Result<String> {
    for backend in backends {
        let Some(instance_id) = &backend.instance_id else {
            continue;
        };
        let ports = networking
            .list_ports(&PortFilter {
                device_id: Some(instance_id.clone()),
                ..Default::default()
            })
            .await
            .map_err(Error::api(ResourceKind::Port, None))?;

        let matching = ports
            .iter()
            .flat_map(|p| p.fixed_ips.iter())
            .find(|ip| ip.ip_address == backend.address);
        if let Some(ip) = matching {
            return Ok(ip.subnet_id.clone());
        }
    }
    Err(Error::ConfigError(
        "no subnet configured and none could be inferred from the backend nodes".to_string(),
    ))
}
