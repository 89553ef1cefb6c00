//! Error types for the load-balancer controller
//!
//! Configuration errors are fatal for the current pass and are surfaced to the
//! caller unchanged. Remote API failures carry the resource kind, its id when
//! known, and the upstream error text.

use thiserror::Error;

use crate::lbaas::{ApiError, ResourceKind};

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// kube-runtime finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    /// Invalid or unreadable controller configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The service exposes no ports
    #[error("service {service} has no ports to expose")]
    NoPorts { service: String },

    /// The backend node set is empty
    #[error("service {service} has no backend nodes")]
    NoBackends { service: String },

    /// Mutually exclusive service modes were requested together
    #[error("service {service}: {reason}")]
    ConflictingMode { service: String, reason: String },

    /// The requested load balancer class is not configured
    #[error("load balancer class {class:?} is not configured")]
    InvalidClass { class: String },

    /// An annotation value could not be parsed
    #[error("invalid value {value:?} for annotation {key}")]
    InvalidAnnotation { key: String, value: String },

    /// A service port uses a protocol the load balancer cannot serve
    #[error("service {service}: unsupported protocol {protocol} on port {port}")]
    UnsupportedProtocol {
        service: String,
        protocol: String,
        port: i32,
    },

    /// More than one live load balancer matched the service identity
    #[error("more than one load balancer matches service {service}: {ids:?}")]
    AmbiguousLoadBalancer { service: String, ids: Vec<String> },

    /// The requested floating IP is bound to a different port
    #[error("floating IP {address} is already bound to port {port_id}")]
    FloatingIpConflict { address: String, port_id: String },

    /// No load balancer exists for a service that should already be converged
    #[error("load balancer for service {service} not found")]
    LoadBalancerNotFound { service: String },

    /// A sub-resource that `ensure` creates is missing during `update`
    #[error("{kind} for {key} not found on load balancer {lb_id}")]
    MissingResource {
        kind: ResourceKind,
        key: String,
        lb_id: String,
    },

    /// The remote resource transitioned to ERROR
    #[error("{kind} {id} went into ERROR provisioning status")]
    ProvisioningFailed { kind: ResourceKind, id: String },

    /// Polling steps were exhausted before a terminal status was reached
    #[error("timed out waiting for {kind} {id}, last status: {status}")]
    Timeout {
        kind: ResourceKind,
        id: String,
        status: String,
    },

    /// Remote load-balancing or networking API failure
    #[error("{kind} {}: {source}", id.as_deref().unwrap_or("<unknown>"))]
    Api {
        kind: ResourceKind,
        id: Option<String>,
        #[source]
        source: ApiError,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Build a mapper from [`ApiError`] for use with `map_err`
    pub fn api(kind: ResourceKind, id: Option<&str>) -> impl FnOnce(ApiError) -> Error {
        let id = id.map(str::to_string);
        move |source| Error::Api { kind, id, source }
    }

    /// True for errors the operator has to fix before a retry can succeed
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigError(_)
                | Error::NoPorts { .. }
                | Error::NoBackends { .. }
                | Error::ConflictingMode { .. }
                | Error::InvalidClass { .. }
                | Error::InvalidAnnotation { .. }
                | Error::UnsupportedProtocol { .. }
                | Error::AmbiguousLoadBalancer { .. }
                | Error::FloatingIpConflict { .. }
        )
    }

    /// True for remote failures that may clear up on their own
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Short label used for the error-kind metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) | Error::FinalizerError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::Api { .. } => "api",
            Error::Timeout { .. } => "timeout",
            Error::ProvisioningFailed { .. } => "provisioning",
            Error::Cancelled => "cancelled",
            Error::LoadBalancerNotFound { .. } | Error::MissingResource { .. } => "missing",
            _ => "config",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_message_names_kind_and_id() {
        let err = Error::api(ResourceKind::Listener, Some("l-1"))(ApiError::NotFound);
        assert_eq!(err.to_string(), "listener l-1: resource not found");

        let err = Error::api(ResourceKind::Pool, None)(ApiError::Conflict("busy".into()));
        assert_eq!(err.to_string(), "pool <unknown>: conflict: busy");
    }

    #[test]
    fn test_classification() {
        let err = Error::NoPorts {
            service: "default/web".into(),
        };
        assert!(err.is_config_error());
        assert!(!err.is_transient());

        let err = Error::api(ResourceKind::LoadBalancer, Some("lb"))(ApiError::Status {
            code: 503,
            body: "unavailable".into(),
        });
        assert!(err.is_transient());
        assert!(!err.is_config_error());
        assert_eq!(err.metric_label(), "api");

        let err = Error::ProvisioningFailed {
            kind: ResourceKind::LoadBalancer,
            id: "lb".into(),
        };
        assert!(!err.is_transient());
    }
}
