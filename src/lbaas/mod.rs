//! Outbound surface of the engine: the remote load-balancing and networking APIs
//!
//! Both APIs are modelled as async traits so the reconciliation engine can run
//! against the real HTTP client or an in-memory cloud in tests. Mutations on
//! load-balancer resources return immediately with a `PENDING_*` status; callers
//! poll through [`crate::waiter`].

pub mod capabilities;
pub mod http;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use capabilities::{Capabilities, Feature};
pub use http::OpenStackClient;
pub use types::*;

/// Kind of remote resource, used in logs and error messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    LoadBalancer,
    Listener,
    Pool,
    Member,
    HealthMonitor,
    SecurityGroup,
    SecurityGroupRule,
    FloatingIp,
    Port,
    Subnet,
    ApiVersion,
}

impl ResourceKind {
    /// Metric label value
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::Listener => "listener",
            ResourceKind::Pool => "pool",
            ResourceKind::Member => "member",
            ResourceKind::HealthMonitor => "health_monitor",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::SecurityGroupRule => "security_group_rule",
            ResourceKind::FloatingIp => "floating_ip",
            ResourceKind::Port => "port",
            ResourceKind::Subnet => "subnet",
            ResourceKind::ApiVersion => "api_version",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::LoadBalancer => "load balancer",
            ResourceKind::Listener => "listener",
            ResourceKind::Pool => "pool",
            ResourceKind::Member => "member",
            ResourceKind::HealthMonitor => "health monitor",
            ResourceKind::SecurityGroup => "security group",
            ResourceKind::SecurityGroupRule => "security group rule",
            ResourceKind::FloatingIp => "floating IP",
            ResourceKind::Port => "port",
            ResourceKind::Subnet => "subnet",
            ResourceKind::ApiVersion => "API version",
        };
        write!(f, "{s}")
    }
}

/// Failure reported by a remote API call
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("resource not found")]
    NotFound,

    /// The backend refused the mutation, typically because the parent load
    /// balancer is not ACTIVE yet
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound)
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Conflict(_) => true,
            ApiError::Status { code, .. } => *code >= 500 || *code == 429,
            ApiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::NotFound | ApiError::Decode(_) => false,
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Treat "already gone" as success
pub fn ignore_not_found(result: ApiResult<()>) -> ApiResult<()> {
    match result {
        Err(ApiError::NotFound) => Ok(()),
        other => other,
    }
}

/// Load-balancing API (load balancers, listeners, pools, members, monitors)
#[async_trait]
pub trait LoadBalancing: Send + Sync {
    /// Current API version of the endpoint
    async fn api_version(&self) -> ApiResult<ApiVersion>;

    /// Load balancers with exactly this name
    async fn list_load_balancers(&self, name: &str) -> ApiResult<Vec<LoadBalancer>>;
    async fn get_load_balancer(&self, id: &str) -> ApiResult<LoadBalancer>;
    async fn create_load_balancer(&self, opts: &CreateLoadBalancer) -> ApiResult<LoadBalancer>;
    async fn delete_load_balancer(&self, id: &str, cascade: bool) -> ApiResult<()>;

    async fn list_listeners(&self, lb_id: &str) -> ApiResult<Vec<Listener>>;
    async fn create_listener(&self, opts: &CreateListener) -> ApiResult<Listener>;
    async fn update_listener(&self, id: &str, opts: &UpdateListener) -> ApiResult<Listener>;
    async fn delete_listener(&self, id: &str) -> ApiResult<()>;

    async fn list_pools(&self, lb_id: &str) -> ApiResult<Vec<Pool>>;
    async fn create_pool(&self, opts: &CreatePool) -> ApiResult<Pool>;
    async fn update_pool(&self, id: &str, opts: &UpdatePool) -> ApiResult<Pool>;
    async fn delete_pool(&self, id: &str) -> ApiResult<()>;

    async fn list_members(&self, pool_id: &str) -> ApiResult<Vec<Member>>;
    /// Replace the pool membership with `members`; unchanged members are kept
    async fn batch_update_members(&self, pool_id: &str, members: &[MemberSpec]) -> ApiResult<()>;

    async fn get_health_monitor(&self, id: &str) -> ApiResult<HealthMonitor>;
    async fn create_health_monitor(&self, opts: &CreateHealthMonitor)
        -> ApiResult<HealthMonitor>;
    async fn delete_health_monitor(&self, id: &str) -> ApiResult<()>;
}

/// Networking API (ports, subnets, security groups, floating IPs)
#[async_trait]
pub trait Networking: Send + Sync {
    async fn list_ports(&self, filter: &PortFilter) -> ApiResult<Vec<Port>>;
    async fn get_port(&self, id: &str) -> ApiResult<Port>;
    async fn update_port_security_groups(&self, id: &str, groups: &[String]) -> ApiResult<Port>;

    async fn get_subnet(&self, id: &str) -> ApiResult<Subnet>;

    async fn list_security_groups(&self, name: &str) -> ApiResult<Vec<SecurityGroup>>;
    async fn create_security_group(&self, opts: &CreateSecurityGroup)
        -> ApiResult<SecurityGroup>;
    async fn delete_security_group(&self, id: &str) -> ApiResult<()>;

    async fn list_security_group_rules(
        &self,
        filter: &RuleFilter,
    ) -> ApiResult<Vec<SecurityGroupRule>>;
    async fn create_security_group_rule(
        &self,
        spec: &SecurityGroupRuleSpec,
    ) -> ApiResult<SecurityGroupRule>;
    async fn delete_security_group_rule(&self, id: &str) -> ApiResult<()>;

    async fn list_floating_ips(&self, filter: &FloatingIpFilter) -> ApiResult<Vec<FloatingIp>>;
    async fn create_floating_ip(&self, opts: &CreateFloatingIp) -> ApiResult<FloatingIp>;
    /// Bind the floating IP to `port_id`, or unbind it with `None`
    async fn update_floating_ip_port(
        &self,
        id: &str,
        port_id: Option<&str>,
    ) -> ApiResult<FloatingIp>;
    async fn delete_floating_ip(&self, id: &str) -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Conflict("pending".into()).is_transient());
        assert!(ApiError::Status {
            code: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!ApiError::Status {
            code: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!ApiError::NotFound.is_transient());
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(ApiError::NotFound)).is_ok());
        assert!(ignore_not_found(Err(ApiError::Decode("x".into()))).is_err());
    }
}
