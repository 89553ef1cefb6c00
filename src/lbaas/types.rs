//! Remote resource model for the load-balancing and networking APIs
//!
//! Field names follow the JSON bodies of the Octavia (`/v2/lbaas`) and
//! Neutron (`/v2.0`) APIs so the HTTP client can (de)serialize them directly.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Provisioning state machine of an asynchronous load-balancer resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    PendingCreate,
    #[default]
    Active,
    PendingUpdate,
    PendingDelete,
    Error,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl ProvisioningStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ProvisioningStatus::PendingCreate
                | ProvisioningStatus::PendingUpdate
                | ProvisioningStatus::PendingDelete
        )
    }

    /// Resources in these states no longer count as live matches
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            ProvisioningStatus::Deleted | ProvisioningStatus::PendingDelete
        )
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningStatus::PendingCreate => "PENDING_CREATE",
            ProvisioningStatus::Active => "ACTIVE",
            ProvisioningStatus::PendingUpdate => "PENDING_UPDATE",
            ProvisioningStatus::PendingDelete => "PENDING_DELETE",
            ProvisioningStatus::Error => "ERROR",
            ProvisioningStatus::Deleted => "DELETED",
            ProvisioningStatus::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Listener and pool protocols
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
    Http,
    Https,
    Proxy,
}

impl Protocol {
    /// Protocol name used in security group rules
    pub fn rule_protocol(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            _ => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Proxy => "PROXY",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            "PROXY" => Ok(Protocol::Proxy),
            other => Err(format!("unknown protocol {other}")),
        }
    }
}

/// Reference to a related resource by id
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IdRef {
    pub id: String,
}

/// API version advertised by the load-balancing endpoint, e.g. `v2.25`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let (major, minor) = trimmed.split_once('.').unwrap_or((trimmed, "0"));
        let major = major
            .parse()
            .map_err(|_| format!("invalid API version {s:?}"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("invalid API version {s:?}"))?;
        Ok(Self { major, minor })
    }
}

/// Treat an explicit JSON `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Load balancing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct LoadBalancer {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub vip_address: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub vip_port_id: String,
    #[serde(default)]
    pub vip_subnet_id: Option<String>,
    #[serde(default)]
    pub vip_network_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub provider: String,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub listeners: Vec<IdRef>,
    #[serde(default)]
    pub pools: Vec<IdRef>,
    #[serde(default)]
    pub flavor_id: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CreateLoadBalancer {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vip_subnet_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vip_network_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vip_port_id: Option<String>,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flavor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Per-listener timeouts in milliseconds
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenerTimeouts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_client_data: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_member_connect: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_member_data: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_tcp_inspect: Option<i32>,
}

impl ListenerTimeouts {
    pub fn is_empty(&self) -> bool {
        self == &ListenerTimeouts::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Listener {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    pub protocol: Protocol,
    pub protocol_port: i32,
    #[serde(default = "unlimited")]
    pub connection_limit: i32,
    #[serde(default)]
    pub default_pool_id: Option<String>,
    #[serde(default)]
    pub loadbalancers: Vec<IdRef>,
    #[serde(flatten)]
    pub timeouts: ListenerTimeouts,
    #[serde(default)]
    pub allowed_cidrs: Option<Vec<String>>,
    #[serde(default)]
    pub insert_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn unlimited() -> i32 {
    -1
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CreateListener {
    pub name: String,
    pub loadbalancer_id: String,
    pub protocol: Protocol,
    pub protocol_port: i32,
    pub connection_limit: i32,
    #[serde(flatten)]
    pub timeouts: ListenerTimeouts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_cidrs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub insert_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Mutable listener fields; `None` leaves a field untouched
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UpdateListener {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_limit: Option<i32>,
    #[serde(flatten)]
    pub timeouts: ListenerTimeouts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_cidrs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_headers: Option<BTreeMap<String, String>>,
}

impl UpdateListener {
    pub fn is_empty(&self) -> bool {
        self == &UpdateListener::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionPersistence {
    #[serde(rename = "type")]
    pub type_: String,
}

impl SessionPersistence {
    pub fn source_ip() -> Self {
        Self {
            type_: "SOURCE_IP".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Pool {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub lb_algorithm: String,
    #[serde(default)]
    pub session_persistence: Option<SessionPersistence>,
    #[serde(default)]
    pub listeners: Vec<IdRef>,
    #[serde(default)]
    pub loadbalancers: Vec<IdRef>,
    #[serde(default)]
    pub members: Vec<IdRef>,
    #[serde(default)]
    pub healthmonitor_id: Option<String>,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CreatePool {
    pub name: String,
    pub listener_id: String,
    pub protocol: Protocol,
    pub lb_algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_persistence: Option<SessionPersistence>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UpdatePool {
    pub lb_algorithm: String,
    /// Serialized as `null` to clear persistence
    pub session_persistence: Option<SessionPersistence>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Member {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    pub address: String,
    pub protocol_port: i32,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
}

/// Desired member entry for a batch membership update
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct MemberSpec {
    pub name: String,
    pub address: String,
    pub protocol_port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct HealthMonitor {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub delay: i32,
    pub timeout: i32,
    pub max_retries: i32,
    #[serde(default)]
    pub max_retries_down: Option<i32>,
    #[serde(default)]
    pub pools: Vec<IdRef>,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CreateHealthMonitor {
    pub name: String,
    pub pool_id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub delay: i32,
    pub timeout: i32,
    pub max_retries: i32,
    pub max_retries_down: i32,
}

// ---------------------------------------------------------------------------
// Networking
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Port {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortFilter {
    pub device_id: Option<String>,
    pub network_id: Option<String>,
    pub security_group_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Subnet {
    pub id: String,
    #[serde(default)]
    pub network_id: String,
    pub cidr: String,
    #[serde(default)]
    pub ip_version: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SecurityGroup {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CreateSecurityGroup {
    pub name: String,
    pub description: String,
}

/// Identity of a security group rule, used both to create rules and to diff
/// existing rules against the desired set
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct SecurityGroupRuleSpec {
    pub security_group_id: String,
    pub direction: String,
    pub ethertype: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub port_range_min: Option<i32>,
    #[serde(default)]
    pub port_range_max: Option<i32>,
    #[serde(default)]
    pub remote_ip_prefix: Option<String>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SecurityGroupRule {
    pub id: String,
    #[serde(flatten)]
    pub spec: SecurityGroupRuleSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub security_group_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
    #[serde(default)]
    pub floating_network_id: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub fixed_ip_address: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FloatingIpFilter {
    pub port_id: Option<String>,
    pub floating_ip_address: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CreateFloatingIp {
    pub floating_network_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub floating_ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    pub description: String,
}
